//! Deterministic in-memory cluster: NodeCores wired through a network that drops,
//! duplicates and reorders datagrams, with a virtual clock.

use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::branch::BranchConfig;
use crate::core::{NodeConfig, NodeCore, OutboundAction};
use crate::link::LinkConfig;
use crate::protocol::{NodeId, SnapshotId};
use crate::snapshot::{LocalSnapshot, SnapshotError};

const ACK_TIMEOUT: Duration = Duration::from_millis(100);
const TICK: Duration = Duration::from_millis(30);
const MAX_STEPS: usize = 2_000_000;

pub struct Faults {
    pub drop: f64,
    pub duplicate: f64,
}

impl Faults {
    pub const NONE: Faults = Faults {
        drop: 0.0,
        duplicate: 0.0,
    };
    pub const LOSSY: Faults = Faults {
        drop: 0.2,
        duplicate: 0.1,
    };
}

pub struct Cluster {
    pub nodes: Vec<NodeCore>,
    pub reports: Vec<LocalSnapshot>,
    pub initial_balance: i64,
    rng: StdRng,
    in_flight: Vec<(NodeId, Vec<u8>)>,
    now: Instant,
    faults: Faults,
    generating: bool,
}

impl Cluster {
    pub fn new(size: u32, initial_balance: i64, seed: u64, faults: Faults) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let ids: Vec<NodeId> = (0..size).collect();
        let config = NodeConfig {
            link: LinkConfig {
                ack_timeout: ACK_TIMEOUT,
                max_retransmissions: None,
            },
            branch: BranchConfig {
                initial_balance,
                max_transfer: 100,
            },
        };
        let nodes = ids
            .iter()
            .map(|&id| NodeCore::new(id, &ids, config, &mut rng))
            .collect();
        Self {
            nodes,
            reports: Vec::new(),
            initial_balance,
            rng,
            in_flight: Vec::new(),
            now: Instant::now(),
            faults,
            generating: true,
        }
    }

    pub fn expected_total(&self) -> i64 {
        self.initial_balance * self.nodes.len() as i64
    }

    pub fn live_total(&self) -> i64 {
        self.nodes.iter().map(|n| n.balances().total()).sum()
    }

    pub fn stop_transfers(&mut self) {
        self.generating = false;
    }

    pub fn start_snapshot(&mut self, node: NodeId, snapshot_id: SnapshotId) -> Result<(), SnapshotError> {
        let now = self.now;
        let actions = self.nodes[node as usize].start_snapshot(snapshot_id, now)?;
        self.absorb(actions);
        Ok(())
    }

    pub fn send_transfer(&mut self, from: NodeId, to: NodeId, amount: i64) {
        let now = self.now;
        let actions = self.nodes[from as usize]
            .send_transfer(to, amount, now)
            .expect("transfer reservable");
        self.absorb(actions);
    }

    pub fn reports_for(&self, snapshot_id: SnapshotId) -> Vec<LocalSnapshot> {
        self.reports
            .iter()
            .filter(|r| r.snapshot_id == snapshot_id)
            .copied()
            .collect()
    }

    pub fn step(&mut self) {
        let roll: f64 = self.rng.gen();
        if roll < 0.6 && !self.in_flight.is_empty() {
            self.deliver_random();
        } else if roll < 0.8 || !self.generating {
            self.advance_clock();
        } else {
            let node = self.rng.gen_range(0..self.nodes.len());
            let now = self.now;
            let actions = self.nodes[node].send_random_transfer(&mut self.rng, now);
            self.absorb(actions);
        }
    }

    pub fn run(&mut self, steps: usize) {
        for _ in 0..steps {
            self.step();
        }
    }

    /// Step until `done` holds. Panics if it never does.
    pub fn run_until(&mut self, mut done: impl FnMut(&Cluster) -> bool) {
        for _ in 0..MAX_STEPS {
            if done(self) {
                return;
            }
            self.step();
        }
        panic!("cluster did not converge");
    }

    /// Stop generating transfers and let every send resolve.
    pub fn settle(&mut self) {
        self.stop_transfers();
        self.run_until(|c| c.in_flight.is_empty() && c.nodes.iter().all(NodeCore::is_quiescent));
    }

    fn deliver_random(&mut self) {
        let index = self.rng.gen_range(0..self.in_flight.len());
        let (dest, bytes) = self.in_flight.swap_remove(index);
        if self.rng.gen_bool(self.faults.drop) {
            return;
        }
        if self.rng.gen_bool(self.faults.duplicate) {
            self.in_flight.push((dest, bytes.clone()));
        }
        let now = self.now;
        let actions = self.nodes[dest as usize].on_datagram(&bytes, now);
        self.absorb(actions);
    }

    fn advance_clock(&mut self) {
        self.now += TICK;
        let now = self.now;
        for i in 0..self.nodes.len() {
            if self.nodes[i].next_deadline().is_some_and(|d| d <= now) {
                let actions = self.nodes[i].on_timer(now);
                self.absorb(actions);
            }
        }
    }

    fn absorb(&mut self, actions: Vec<OutboundAction>) {
        for action in actions {
            match action {
                OutboundAction::SendDatagram(dest, bytes) => self.in_flight.push((dest, bytes)),
                OutboundAction::SnapshotCompleted(local) => self.reports.push(local),
                OutboundAction::TransferSettled(_) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn global_total(reports: &[LocalSnapshot]) -> i64 {
        reports.iter().map(LocalSnapshot::total).sum()
    }

    #[test]
    fn money_is_conserved_under_loss_duplication_and_reordering() {
        for seed in 0..5 {
            let mut cluster = Cluster::new(4, 1000, seed, Faults::LOSSY);
            cluster.run(5_000);
            cluster.settle();
            assert_eq!(cluster.live_total(), 4000, "seed {seed}");
            for node in &cluster.nodes {
                assert_eq!(node.balances().reserved, 0);
                assert!(node.balances().available >= 0);
            }
        }
    }

    #[test]
    fn snapshot_total_is_exact_for_any_interleaving() {
        for seed in 0..30 {
            let size = 2 + (seed % 4) as u32;
            let faults = if seed % 2 == 0 { Faults::LOSSY } else { Faults::NONE };
            let mut cluster = Cluster::new(size, 1000, seed, faults);
            cluster.run(300);

            let initiator = (seed % u64::from(size)) as NodeId;
            cluster.start_snapshot(initiator, 1).unwrap();
            cluster.run_until(|c| c.reports_for(1).len() == size as usize);

            let reports = cluster.reports_for(1);
            assert_eq!(global_total(&reports), cluster.expected_total(), "seed {seed}");
        }
    }

    #[test]
    fn consecutive_snapshots_each_add_up() {
        let mut cluster = Cluster::new(4, 500, 99, Faults::LOSSY);
        for id in 1..=5 {
            cluster.run(200);
            cluster.start_snapshot((id % 4) as NodeId, id).unwrap();
            cluster.run_until(|c| c.reports_for(id).len() == 4);
            assert_eq!(global_total(&cluster.reports_for(id)), 2000, "snapshot {id}");
        }
    }

    #[test]
    fn transfer_then_snapshot_from_same_node() {
        for seed in 0..20 {
            let mut cluster = Cluster::new(3, 1000, seed, Faults::LOSSY);
            cluster.stop_transfers();
            cluster.send_transfer(0, 1, 50);
            cluster.start_snapshot(0, 1).unwrap();
            cluster.run_until(|c| c.reports_for(1).len() == 3);

            let reports = cluster.reports_for(1);
            assert_eq!(global_total(&reports), 3000, "seed {seed}");
            let a = reports.iter().find(|r| r.node == 0).unwrap();
            assert_eq!(a.recorded_balance, 950);
            let b = reports.iter().find(|r| r.node == 1).unwrap();
            assert_eq!(b.total(), 1050);
        }
    }

    #[test]
    fn rejected_second_snapshot_leaves_first_intact() {
        let mut cluster = Cluster::new(3, 1000, 5, Faults::LOSSY);
        cluster.run(100);
        cluster.start_snapshot(0, 1).unwrap();
        assert_eq!(
            cluster.start_snapshot(0, 2),
            Err(SnapshotError::AlreadyActive {
                active: 1,
                requested: 2
            })
        );
        cluster.run_until(|c| c.reports_for(1).len() == 3);
        assert_eq!(global_total(&cluster.reports_for(1)), 3000);
        assert!(cluster.reports_for(2).is_empty());
    }

    #[test]
    fn single_node_cluster() {
        let mut cluster = Cluster::new(1, 1000, 0, Faults::NONE);
        cluster.run(50);
        cluster.start_snapshot(0, 42).unwrap();
        assert_eq!(
            cluster.reports,
            vec![LocalSnapshot {
                snapshot_id: 42,
                node: 0,
                recorded_balance: 1000,
                incoming_accumulated: 0,
            }]
        );
    }
}
