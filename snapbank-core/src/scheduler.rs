//! Transfer destination scheduler: cycles through a shuffled permutation of peers,
//! reshuffling only after every peer was picked once.

use rand::seq::SliceRandom;
use rand::Rng;

use crate::protocol::NodeId;

pub struct PeerCycle {
    order: Vec<NodeId>,
    next: usize,
}

impl PeerCycle {
    /// All of `nodes` except `local`, shuffled.
    pub fn new<R: Rng + ?Sized>(local: NodeId, nodes: &[NodeId], rng: &mut R) -> Self {
        let mut order: Vec<NodeId> = nodes.iter().copied().filter(|&n| n != local).collect();
        order.sort_unstable();
        order.dedup();
        order.shuffle(rng);
        Self { order, next: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Next destination, or `None` when there are no peers.
    pub fn next_peer<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Option<NodeId> {
        if self.order.is_empty() {
            return None;
        }
        if self.next == self.order.len() {
            self.order.shuffle(rng);
            self.next = 0;
        }
        let peer = self.order[self.next];
        self.next += 1;
        Some(peer)
    }
}
