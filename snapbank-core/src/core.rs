//! Host-driven API: NodeCore receives events from the host, returns actions.
//!
//! One NodeCore is one node's whole serialized context: the overlay (and the
//! reliable link below it) plus the branch and its snapshot engine. The host
//! owns the sockets and timers and calls in from a single task.

use std::time::Instant;

use rand::Rng;

use crate::branch::{Balances, Branch, BranchAction, BranchConfig, OutgoingTransfer};
use crate::link::{LinkConfig, LinkError, SendId};
use crate::overlay::{Overlay, OverlayEvent};
use crate::protocol::{Message, NodeId, SnapshotId};
use crate::snapshot::{LocalSnapshot, SnapshotError, SnapshotState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NodeConfig {
    pub link: LinkConfig,
    pub branch: BranchConfig,
}

/// Action for host to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundAction {
    SendDatagram(NodeId, Vec<u8>),
    /// Local snapshot finished; forward to the collector and the report log.
    SnapshotCompleted(LocalSnapshot),
    /// The outstanding transfer resolved; the host schedules the next one.
    TransferSettled(TransferOutcome),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    Delivered { dest: NodeId, amount: i64 },
    /// Reservation already rolled back.
    Failed {
        dest: NodeId,
        amount: i64,
        error: LinkError,
    },
}

/// Main coordinator. Host passes events; core returns actions.
pub struct NodeCore {
    id: NodeId,
    overlay: Overlay,
    branch: Branch,
    transfer_send: Option<SendId>,
}

impl NodeCore {
    /// `nodes` is every id in the address table, `id` included.
    pub fn new<R: Rng + ?Sized>(id: NodeId, nodes: &[NodeId], config: NodeConfig, rng: &mut R) -> Self {
        Self {
            id,
            overlay: Overlay::new(id, nodes.iter().copied(), config.link),
            branch: Branch::new(id, nodes, config.branch, rng),
            transfer_send: None,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn balances(&self) -> Balances {
        self.branch.balances()
    }

    pub fn snapshot_state(&self) -> SnapshotState {
        self.branch.snapshot_state()
    }

    pub fn branch(&self) -> &Branch {
        &self.branch
    }

    #[cfg(test)]
    pub fn overlay(&self) -> &Overlay {
        &self.overlay
    }

    /// Whether a transfer is waiting for its ack.
    pub fn transfer_in_flight(&self) -> bool {
        self.transfer_send.is_some()
    }

    /// Nothing in flight or queued on the link.
    pub fn is_quiescent(&self) -> bool {
        self.overlay.is_idle()
    }

    /// When the host should call [`on_timer`](Self::on_timer) next.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.overlay.next_deadline()
    }

    /// Process a datagram received from the transport.
    pub fn on_datagram(&mut self, bytes: &[u8], now: Instant) -> Vec<OutboundAction> {
        self.overlay.on_datagram(bytes, now);
        self.pump(now)
    }

    /// Retransmission timer fired.
    pub fn on_timer(&mut self, now: Instant) -> Vec<OutboundAction> {
        self.overlay.on_timer(now);
        self.pump(now)
    }

    /// The transport failed to send towards `dest`; retried on the next timeout.
    pub fn on_transport_error(&mut self, dest: NodeId, now: Instant) -> Vec<OutboundAction> {
        self.overlay.on_transport_error(dest);
        self.pump(now)
    }

    /// Reserve and send the next random transfer, if the branch has one to make.
    pub fn send_random_transfer<R: Rng + ?Sized>(&mut self, rng: &mut R, now: Instant) -> Vec<OutboundAction> {
        match self.branch.next_transfer(rng) {
            Some(transfer) => self.dispatch_transfer(transfer, now),
            None => Vec::new(),
        }
    }

    /// Send `amount` to `dest`. Returns `None` if the branch cannot reserve it
    /// (transfer already outstanding, unknown peer, insufficient funds).
    pub fn send_transfer(&mut self, dest: NodeId, amount: i64, now: Instant) -> Option<Vec<OutboundAction>> {
        let transfer = self.branch.reserve_transfer(dest, amount)?;
        Some(self.dispatch_transfer(transfer, now))
    }

    fn dispatch_transfer(&mut self, transfer: OutgoingTransfer, now: Instant) -> Vec<OutboundAction> {
        let mut actions = Vec::new();
        let message = Message::Transfer {
            amount: transfer.amount,
        };
        match self.overlay.send(transfer.dest, message, now) {
            Ok(id) => {
                tracing::trace!(node = self.id, dest = transfer.dest, amount = transfer.amount, "transfer queued");
                self.transfer_send = Some(id);
            }
            Err(error) => {
                tracing::warn!(node = self.id, dest = transfer.dest, %error, "transfer rejected by link");
                self.branch.on_transfer_failed();
                actions.push(OutboundAction::TransferSettled(TransferOutcome::Failed {
                    dest: transfer.dest,
                    amount: transfer.amount,
                    error,
                }));
            }
        }
        actions.extend(self.pump(now));
        actions
    }

    /// Operator request: start snapshot `snapshot_id` on this node.
    pub fn start_snapshot(&mut self, snapshot_id: SnapshotId, now: Instant) -> Result<Vec<OutboundAction>, SnapshotError> {
        let branch_actions = self.branch.start_snapshot(snapshot_id)?;
        let mut actions = Vec::new();
        self.apply(branch_actions, now, &mut actions);
        actions.extend(self.pump(now));
        Ok(actions)
    }

    /// Drain overlay events until the node settles. Delivered messages may queue new
    /// sends, which produce more events.
    fn pump(&mut self, now: Instant) -> Vec<OutboundAction> {
        let mut actions = Vec::new();
        loop {
            let events = self.overlay.take_events();
            if events.is_empty() {
                return actions;
            }
            for event in events {
                match event {
                    OverlayEvent::Transmit { dest, bytes } => {
                        actions.push(OutboundAction::SendDatagram(dest, bytes));
                    }
                    OverlayEvent::Received { sender, message } => {
                        let branch_actions = self.branch.on_message(sender, message);
                        self.apply(branch_actions, now, &mut actions);
                    }
                    OverlayEvent::Sent { id, dest, .. } => self.on_sent(id, dest, &mut actions),
                    OverlayEvent::Failed { id, dest, error } => self.on_failed(id, dest, error, &mut actions),
                }
            }
        }
    }

    fn apply(&mut self, branch_actions: Vec<BranchAction>, now: Instant, actions: &mut Vec<OutboundAction>) {
        for action in branch_actions {
            match action {
                BranchAction::Send { dest, message } => {
                    if let Err(error) = self.overlay.send(dest, message, now) {
                        tracing::warn!(node = self.id, dest, ?message, %error, "cannot send");
                    }
                }
                BranchAction::Report(local) => actions.push(OutboundAction::SnapshotCompleted(local)),
            }
        }
    }

    fn on_sent(&mut self, id: SendId, dest: NodeId, actions: &mut Vec<OutboundAction>) {
        if self.transfer_send != Some(id) {
            return;
        }
        self.transfer_send = None;
        let amount = self.branch.outstanding().map_or(0, |t| t.amount);
        self.branch.on_transfer_sent();
        actions.push(OutboundAction::TransferSettled(TransferOutcome::Delivered { dest, amount }));
    }

    fn on_failed(&mut self, id: SendId, dest: NodeId, error: LinkError, actions: &mut Vec<OutboundAction>) {
        if self.transfer_send != Some(id) {
            tracing::error!(node = self.id, dest, %error, "token send failed, snapshot cannot complete");
            return;
        }
        self.transfer_send = None;
        let amount = self.branch.outstanding().map_or(0, |t| t.amount);
        self.branch.on_transfer_failed();
        tracing::warn!(node = self.id, dest, amount, %error, "transfer failed, reservation rolled back");
        actions.push(OutboundAction::TransferSettled(TransferOutcome::Failed { dest, amount, error }));
    }
}
