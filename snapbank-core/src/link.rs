//! Reliable link over an unreliable datagram transport.
//!
//! Host-driven like the rest of the crate: the host feeds datagrams, timer
//! expiries and transport errors in, and drains [`LinkEvent`]s out. The link
//! gives every node:
//!
//! - one outstanding DATA frame at a time; later sends queue behind it, so
//!   frames leave in request order and each channel stays FIFO,
//! - retransmission of the identical frame (same sequence) on ack timeout,
//! - an ACK for every DATA frame received, duplicates included,
//! - at most one upward delivery per `(sender, sequence)`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use crate::protocol::{Ack, LinkFrame, NodeId, Sequence};
use crate::wire;

/// Default wait for an ACK before the pending frame is retransmitted.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_millis(1000);

/// Half of the sequence space; see [`SequenceTracker`].
const SEQUENCE_WINDOW: u32 = 1 << 31;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkConfig {
    pub ack_timeout: Duration,
    /// `None` retries forever. `Some(k)` fails the send after `k` unanswered retransmissions.
    pub max_retransmissions: Option<u32>,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            max_retransmissions: None,
        }
    }
}

/// Completion handle for one `send`. Resolved exactly once by `SendCompleted` or `SendFailed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SendId(u64);

/// Output of the link for the host (or the overlay above it) to act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Put these bytes on the transport towards `dest`.
    Transmit { dest: NodeId, bytes: Vec<u8> },
    /// A new DATA payload from `sender`, delivered exactly once.
    Deliver {
        sender: NodeId,
        sequence: Sequence,
        payload: Vec<u8>,
    },
    SendCompleted { id: SendId, dest: NodeId, ack: Ack },
    SendFailed {
        id: SendId,
        dest: NodeId,
        error: LinkError,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LinkError {
    #[error("node {0} is not in the address table")]
    UnknownDestination(NodeId),
    #[error("cannot send to self")]
    SelfDestination,
    #[error("no ack from node {dest} after {attempts} retransmissions")]
    RetransmissionsExhausted { dest: NodeId, attempts: u32 },
}

/// Highest delivered sequence per sender. Monotonic; compared with serial-number
/// arithmetic so the tracker keeps working after the sender wraps back to 1.
#[derive(Debug, Default)]
pub struct SequenceTracker {
    last_delivered: HashMap<NodeId, Sequence>,
}

impl SequenceTracker {
    /// Record `sequence` from `sender` if it is newer than anything delivered so far.
    /// Returns false for duplicates and stale retransmissions.
    pub fn accept(&mut self, sender: NodeId, sequence: Sequence) -> bool {
        match self.last_delivered.get(&sender) {
            Some(&last) if !is_newer(sequence, last) => false,
            _ => {
                self.last_delivered.insert(sender, sequence);
                true
            }
        }
    }

    #[cfg(test)]
    pub fn last_delivered(&self, sender: NodeId) -> Option<Sequence> {
        self.last_delivered.get(&sender).copied()
    }
}

fn is_newer(sequence: Sequence, last: Sequence) -> bool {
    let distance = sequence.wrapping_sub(last);
    distance != 0 && distance < SEQUENCE_WINDOW
}

fn next_after(sequence: Sequence) -> Sequence {
    if sequence == Sequence::MAX {
        1
    } else {
        sequence + 1
    }
}

struct QueuedSend {
    id: SendId,
    dest: NodeId,
    payload: Vec<u8>,
}

/// The single in-flight frame.
struct PendingSend {
    id: SendId,
    dest: NodeId,
    sequence: Sequence,
    frame: Vec<u8>,
    deadline: Instant,
    retransmissions: u32,
}

pub struct ReliableLink {
    local: NodeId,
    peers: HashSet<NodeId>,
    config: LinkConfig,
    next_sequence: Sequence,
    next_send_id: u64,
    queue: VecDeque<QueuedSend>,
    pending: Option<PendingSend>,
    tracker: SequenceTracker,
    events: Vec<LinkEvent>,
}

impl ReliableLink {
    /// `peers` are the ids this node may talk to; self is ignored if present.
    pub fn new(local: NodeId, peers: impl IntoIterator<Item = NodeId>, config: LinkConfig) -> Self {
        Self {
            local,
            peers: peers.into_iter().filter(|&p| p != local).collect(),
            config,
            next_sequence: 1,
            next_send_id: 0,
            queue: VecDeque::new(),
            pending: None,
            tracker: SequenceTracker::default(),
            events: Vec::new(),
        }
    }

    pub fn local_id(&self) -> NodeId {
        self.local
    }

    /// Queue `payload` for `dest`. Unknown destinations fail right away; everything
    /// else resolves later through `SendCompleted` / `SendFailed`.
    pub fn send(&mut self, dest: NodeId, payload: Vec<u8>, now: Instant) -> Result<SendId, LinkError> {
        if dest == self.local {
            return Err(LinkError::SelfDestination);
        }
        if !self.peers.contains(&dest) {
            return Err(LinkError::UnknownDestination(dest));
        }
        let id = SendId(self.next_send_id);
        self.next_send_id = self.next_send_id.wrapping_add(1);
        self.queue.push_back(QueuedSend { id, dest, payload });
        if self.pending.is_none() {
            self.transmit_next(now);
        }
        Ok(id)
    }

    /// Handle one raw datagram from the transport. Malformed datagrams are dropped.
    pub fn on_datagram(&mut self, bytes: &[u8], now: Instant) {
        let frame = match wire::decode_frame(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(node = self.local, error = %e, "dropping malformed frame");
                return;
            }
        };
        match frame {
            LinkFrame::Data {
                sequence,
                sender,
                payload,
            } => self.on_data(sequence, sender, payload),
            LinkFrame::Ack { sequence, sender } => self.on_ack(sequence, sender, now),
        }
    }

    fn on_data(&mut self, sequence: Sequence, sender: NodeId, payload: Vec<u8>) {
        if !self.peers.contains(&sender) {
            tracing::warn!(node = self.local, sender, "dropping frame from unknown node");
            return;
        }
        // Ack unconditionally: the sender may have lost our previous ack.
        let ack = wire::encode_frame(&LinkFrame::Ack {
            sequence,
            sender: self.local,
        });
        self.events.push(LinkEvent::Transmit {
            dest: sender,
            bytes: ack,
        });
        if self.tracker.accept(sender, sequence) {
            self.events.push(LinkEvent::Deliver {
                sender,
                sequence,
                payload,
            });
        } else {
            tracing::debug!(node = self.local, sender, sequence, "duplicate frame acked again");
        }
    }

    fn on_ack(&mut self, sequence: Sequence, sender: NodeId, now: Instant) {
        let matches = self
            .pending
            .as_ref()
            .is_some_and(|p| p.sequence == sequence && p.dest == sender);
        if !matches {
            tracing::debug!(node = self.local, sender, sequence, "dropping unmatched ack");
            return;
        }
        if let Some(done) = self.pending.take() {
            self.events.push(LinkEvent::SendCompleted {
                id: done.id,
                dest: done.dest,
                ack: Ack {
                    sequence,
                    acked_by: sender,
                },
            });
        }
        self.transmit_next(now);
    }

    /// Retransmit (or give up on) the pending frame if its deadline has passed.
    pub fn on_timer(&mut self, now: Instant) {
        let Some(pending) = &mut self.pending else {
            return;
        };
        if now < pending.deadline {
            return;
        }
        if let Some(max) = self.config.max_retransmissions {
            if pending.retransmissions >= max {
                let attempts = pending.retransmissions;
                if let Some(failed) = self.pending.take() {
                    tracing::warn!(
                        node = self.local,
                        dest = failed.dest,
                        sequence = failed.sequence,
                        attempts,
                        "giving up on frame"
                    );
                    self.events.push(LinkEvent::SendFailed {
                        id: failed.id,
                        dest: failed.dest,
                        error: LinkError::RetransmissionsExhausted {
                            dest: failed.dest,
                            attempts,
                        },
                    });
                }
                self.transmit_next(now);
                return;
            }
        }
        pending.retransmissions += 1;
        pending.deadline = now + self.config.ack_timeout;
        tracing::debug!(
            node = self.local,
            dest = pending.dest,
            sequence = pending.sequence,
            attempt = pending.retransmissions,
            "retransmitting"
        );
        self.events.push(LinkEvent::Transmit {
            dest: pending.dest,
            bytes: pending.frame.clone(),
        });
    }

    /// The transport could not hand a datagram to `dest`. The pending frame keeps its
    /// deadline and is retried by the timer, so the failure only shows up as latency.
    pub fn on_transport_error(&mut self, dest: NodeId) {
        match &self.pending {
            Some(p) if p.dest == dest => {
                tracing::debug!(node = self.local, dest, sequence = p.sequence, "transport error, will retry");
            }
            _ => tracing::debug!(node = self.local, dest, "transport error"),
        }
    }

    /// When the host should call [`on_timer`](Self::on_timer) next.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.as_ref().map(|p| p.deadline)
    }

    /// Drain the events produced since the last call, in order.
    pub fn take_events(&mut self) -> Vec<LinkEvent> {
        std::mem::take(&mut self.events)
    }

    #[cfg(test)]
    pub fn pending_sequence(&self) -> Option<Sequence> {
        self.pending.as_ref().map(|p| p.sequence)
    }

    #[cfg(test)]
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// No frame in flight and nothing queued.
    pub fn is_idle(&self) -> bool {
        self.pending.is_none() && self.queue.is_empty()
    }

    #[cfg(test)]
    pub fn last_delivered(&self, sender: NodeId) -> Option<Sequence> {
        self.tracker.last_delivered(sender)
    }

    fn transmit_next(&mut self, now: Instant) {
        debug_assert!(self.pending.is_none());
        let Some(next) = self.queue.pop_front() else {
            return;
        };
        let sequence = self.next_sequence;
        self.next_sequence = next_after(sequence);
        let frame = wire::encode_frame(&LinkFrame::Data {
            sequence,
            sender: self.local,
            payload: next.payload,
        });
        self.events.push(LinkEvent::Transmit {
            dest: next.dest,
            bytes: frame.clone(),
        });
        self.pending = Some(PendingSend {
            id: next.id,
            dest: next.dest,
            sequence,
            frame,
            deadline: now + self.config.ack_timeout,
            retransmissions: 0,
        });
    }

    #[cfg(test)]
    fn set_next_sequence(&mut self, sequence: Sequence) {
        self.next_sequence = sequence;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Message;

    fn payload(amount: i64) -> Vec<u8> {
        wire::encode_message(&Message::Transfer { amount })
    }

    fn transmits(events: &[LinkEvent]) -> Vec<(NodeId, LinkFrame)> {
        events
            .iter()
            .filter_map(|e| match e {
                LinkEvent::Transmit { dest, bytes } => {
                    Some((*dest, wire::decode_frame(bytes).unwrap()))
                }
                _ => None,
            })
            .collect()
    }

    fn data_bytes(sequence: Sequence, sender: NodeId, amount: i64) -> Vec<u8> {
        wire::encode_frame(&LinkFrame::Data {
            sequence,
            sender,
            payload: payload(amount),
        })
    }

    fn ack_bytes(sequence: Sequence, sender: NodeId) -> Vec<u8> {
        wire::encode_frame(&LinkFrame::Ack { sequence, sender })
    }

    #[test]
    fn sequences_start_at_one_and_sends_are_serialized() {
        let now = Instant::now();
        let mut link = ReliableLink::new(0, [0, 1, 2], LinkConfig::default());
        let first = link.send(1, payload(10), now).unwrap();
        let second = link.send(2, payload(20), now).unwrap();

        let sent = transmits(&link.take_events());
        assert_eq!(sent.len(), 1, "second send must wait for the first ack");
        assert_eq!(sent[0].0, 1);
        assert_eq!(sent[0].1.sequence(), 1);
        assert_eq!(link.queued(), 1);

        link.on_datagram(&ack_bytes(1, 1), now);
        let events = link.take_events();
        assert!(matches!(
            events[0],
            LinkEvent::SendCompleted { id, dest: 1, ack: Ack { sequence: 1, acked_by: 1 } } if id == first
        ));
        let sent = transmits(&events);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, 2);
        assert_eq!(sent[0].1.sequence(), 2);

        link.on_datagram(&ack_bytes(2, 2), now);
        assert!(link
            .take_events()
            .iter()
            .any(|e| matches!(e, LinkEvent::SendCompleted { id, .. } if *id == second)));
        assert!(link.is_idle());
    }

    #[test]
    fn retransmits_identical_frame_until_acked() {
        let start = Instant::now();
        let config = LinkConfig {
            ack_timeout: Duration::from_millis(100),
            max_retransmissions: None,
        };
        let mut link = ReliableLink::new(0, [1], config);
        link.send(1, payload(5), start).unwrap();
        let original = transmits(&link.take_events());

        link.on_timer(start + Duration::from_millis(50));
        assert!(link.take_events().is_empty(), "not due yet");

        for round in 1..=5u64 {
            let now = start + Duration::from_millis(100 * round);
            link.on_timer(now);
            assert_eq!(transmits(&link.take_events()), original);
            assert_eq!(link.next_deadline(), Some(now + Duration::from_millis(100)));
        }

        link.on_datagram(&ack_bytes(1, 1), start);
        assert!(matches!(link.take_events()[0], LinkEvent::SendCompleted { .. }));
        assert_eq!(link.next_deadline(), None);
    }

    #[test]
    fn transport_errors_only_delay_the_pending_frame() {
        let start = Instant::now();
        let config = LinkConfig {
            ack_timeout: Duration::from_millis(100),
            max_retransmissions: None,
        };
        let mut link = ReliableLink::new(0, [1, 2], config);
        let id = link.send(1, payload(9), start).unwrap();
        let original = transmits(&link.take_events());
        let deadline = link.next_deadline();

        for _ in 0..3 {
            link.on_transport_error(1);
        }
        link.on_transport_error(2);
        assert!(link.take_events().is_empty());
        assert_eq!(link.pending_sequence(), Some(1));
        assert_eq!(link.next_deadline(), deadline);

        let later = start + Duration::from_millis(100);
        link.on_timer(later);
        let events = link.take_events();
        assert_eq!(transmits(&events), original);
        assert!(!events
            .iter()
            .any(|e| matches!(e, LinkEvent::SendFailed { .. } | LinkEvent::SendCompleted { .. })));

        link.on_datagram(&ack_bytes(1, 1), later);
        assert!(matches!(
            link.take_events().as_slice(),
            [LinkEvent::SendCompleted { id: done, dest: 1, .. }] if *done == id
        ));
        assert!(link.is_idle());
    }

    #[test]
    fn bounded_retransmission_fails_and_moves_on() {
        let start = Instant::now();
        let config = LinkConfig {
            ack_timeout: Duration::from_millis(10),
            max_retransmissions: Some(2),
        };
        let mut link = ReliableLink::new(0, [1, 2], config);
        let doomed = link.send(1, payload(5), start).unwrap();
        link.send(2, payload(6), start).unwrap();
        link.take_events();

        link.on_timer(start + Duration::from_millis(10));
        link.on_timer(start + Duration::from_millis(20));
        link.take_events();
        link.on_timer(start + Duration::from_millis(30));
        let events = link.take_events();
        assert!(matches!(
            &events[0],
            LinkEvent::SendFailed { id, dest: 1, error: LinkError::RetransmissionsExhausted { attempts: 2, .. } } if *id == doomed
        ));
        let sent = transmits(&events);
        assert_eq!(sent[0].0, 2);
        assert_eq!(sent[0].1.sequence(), 2);
    }

    #[test]
    fn duplicate_data_is_acked_but_delivered_once() {
        let now = Instant::now();
        let mut link = ReliableLink::new(1, [0, 1], LinkConfig::default());
        let frame = data_bytes(4, 0, 30);

        link.on_datagram(&frame, now);
        let first = link.take_events();
        link.on_datagram(&frame, now);
        let second = link.take_events();

        let delivered = |events: &[LinkEvent]| {
            events
                .iter()
                .filter(|e| matches!(e, LinkEvent::Deliver { .. }))
                .count()
        };
        assert_eq!(delivered(&first), 1);
        assert_eq!(delivered(&second), 0);
        for events in [&first, &second] {
            assert_eq!(
                transmits(events),
                vec![(0, LinkFrame::Ack { sequence: 4, sender: 1 })]
            );
        }
        assert_eq!(link.last_delivered(0), Some(4));
    }

    #[test]
    fn stale_frames_after_newer_delivery_are_dropped() {
        let now = Instant::now();
        let mut link = ReliableLink::new(1, [0], LinkConfig::default());
        link.on_datagram(&data_bytes(9, 0, 1), now);
        link.on_datagram(&data_bytes(3, 0, 1), now);
        let events = link.take_events();
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, LinkEvent::Deliver { .. }))
                .count(),
            1
        );
        assert_eq!(link.last_delivered(0), Some(9));
    }

    #[test]
    fn mismatched_ack_is_ignored() {
        let now = Instant::now();
        let mut link = ReliableLink::new(0, [1, 2], LinkConfig::default());
        link.send(1, payload(1), now).unwrap();
        link.take_events();

        link.on_datagram(&ack_bytes(2, 1), now);
        link.on_datagram(&ack_bytes(1, 2), now);
        assert!(link.take_events().is_empty());
        assert_eq!(link.pending_sequence(), Some(1));
    }

    #[test]
    fn malformed_and_unknown_sender_frames_are_dropped() {
        let now = Instant::now();
        let mut link = ReliableLink::new(1, [0], LinkConfig::default());
        link.on_datagram(&[0xff, 0, 0], now);
        link.on_datagram(&data_bytes(1, 7, 1), now);
        assert!(link.take_events().is_empty());
    }

    #[test]
    fn sequence_wraps_to_one() {
        let now = Instant::now();
        let mut link = ReliableLink::new(0, [1], LinkConfig::default());
        link.set_next_sequence(Sequence::MAX);
        link.send(1, payload(1), now).unwrap();
        link.send(1, payload(2), now).unwrap();
        let sent = transmits(&link.take_events());
        assert_eq!(sent[0].1.sequence(), Sequence::MAX);
        link.on_datagram(&ack_bytes(Sequence::MAX, 1), now);
        let sent = transmits(&link.take_events());
        assert_eq!(sent[0].1.sequence(), 1);
    }

    #[test]
    fn tracker_accepts_sequences_across_wrap() {
        let mut tracker = SequenceTracker::default();
        assert!(tracker.accept(3, Sequence::MAX - 1));
        assert!(tracker.accept(3, Sequence::MAX));
        assert!(tracker.accept(3, 1));
        assert!(!tracker.accept(3, Sequence::MAX));
        assert!(tracker.accept(3, 2));
        assert_eq!(tracker.last_delivered(3), Some(2));
        assert_eq!(tracker.last_delivered(4), None);
    }

    #[test]
    fn unknown_destinations_fail_immediately() {
        let now = Instant::now();
        let mut link = ReliableLink::new(0, [1], LinkConfig::default());
        assert_eq!(link.send(0, payload(1), now), Err(LinkError::SelfDestination));
        assert_eq!(
            link.send(5, payload(1), now),
            Err(LinkError::UnknownDestination(5))
        );
        assert!(link.is_idle());
    }
}
