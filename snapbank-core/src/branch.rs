//! Branch: balance bookkeeping, random transfer generation and the snapshot
//! engine, all driven from the node's single serialized context.

use rand::Rng;

use crate::protocol::{Message, NodeId, SnapshotId};
use crate::scheduler::PeerCycle;
use crate::snapshot::{LocalSnapshot, SnapshotEffect, SnapshotEngine, SnapshotError, SnapshotState};

/// Default starting balance of every branch.
pub const DEFAULT_INITIAL_BALANCE: i64 = 1_000_000;

/// Default upper bound of a single transfer.
pub const DEFAULT_MAX_TRANSFER: i64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BranchConfig {
    pub initial_balance: i64,
    pub max_transfer: i64,
}

impl Default for BranchConfig {
    fn default() -> Self {
        Self {
            initial_balance: DEFAULT_INITIAL_BALANCE,
            max_transfer: DEFAULT_MAX_TRANSFER,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Balances {
    /// Spendable.
    pub available: i64,
    /// Committed to the outstanding transfer.
    pub reserved: i64,
}

impl Balances {
    pub fn total(&self) -> i64 {
        self.available + self.reserved
    }
}

/// What the branch asks the node to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BranchAction {
    Send { dest: NodeId, message: Message },
    Report(LocalSnapshot),
}

/// A transfer that was reserved and handed to the overlay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutgoingTransfer {
    pub dest: NodeId,
    pub amount: i64,
}

pub struct Branch {
    id: NodeId,
    config: BranchConfig,
    balances: Balances,
    destinations: PeerCycle,
    outstanding: Option<OutgoingTransfer>,
    snapshot: SnapshotEngine,
}

impl Branch {
    /// `nodes` is the whole address table (self included).
    pub fn new<R: Rng + ?Sized>(id: NodeId, nodes: &[NodeId], config: BranchConfig, rng: &mut R) -> Self {
        Self {
            id,
            config,
            balances: Balances {
                available: config.initial_balance,
                reserved: 0,
            },
            destinations: PeerCycle::new(id, nodes, rng),
            outstanding: None,
            snapshot: SnapshotEngine::new(id, nodes.iter().copied()),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn balances(&self) -> Balances {
        self.balances
    }

    pub fn snapshot_state(&self) -> SnapshotState {
        self.snapshot.state()
    }

    pub fn snapshot(&self) -> &SnapshotEngine {
        &self.snapshot
    }

    pub fn outstanding(&self) -> Option<OutgoingTransfer> {
        self.outstanding
    }

    /// False for a single-node table: there is nobody to send money to.
    pub fn has_peers(&self) -> bool {
        !self.destinations.is_empty()
    }

    /// Draw and reserve the next random transfer. `None` if one is already outstanding,
    /// there are no peers, or nothing is available to send.
    pub fn next_transfer<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Option<OutgoingTransfer> {
        if self.outstanding.is_some() || self.balances.available <= 0 {
            return None;
        }
        let max = self.config.max_transfer.min(self.balances.available);
        if max < 1 {
            return None;
        }
        let dest = self.destinations.next_peer(rng)?;
        let amount = rng.gen_range(1..=max);
        self.reserve_transfer(dest, amount)
    }

    /// Reserve a specific transfer. `None` if one is already outstanding, `dest` is not
    /// a peer, or `amount` is not in `1..=available`.
    pub fn reserve_transfer(&mut self, dest: NodeId, amount: i64) -> Option<OutgoingTransfer> {
        if self.outstanding.is_some()
            || dest == self.id
            || !self.snapshot.has_node(dest)
            || amount < 1
            || amount > self.balances.available
        {
            return None;
        }
        self.balances.available -= amount;
        self.balances.reserved += amount;
        let transfer = OutgoingTransfer { dest, amount };
        self.outstanding = Some(transfer);
        Some(transfer)
    }

    /// The outstanding transfer was acknowledged: the money has left this branch.
    pub fn on_transfer_sent(&mut self) {
        if let Some(t) = self.outstanding.take() {
            self.balances.reserved -= t.amount;
        }
    }

    /// The outstanding transfer failed terminally: put the money back.
    pub fn on_transfer_failed(&mut self) {
        if let Some(t) = self.outstanding.take() {
            self.balances.reserved -= t.amount;
            self.balances.available += t.amount;
        }
    }

    /// Handle an application message delivered by the overlay.
    pub fn on_message(&mut self, sender: NodeId, message: Message) -> Vec<BranchAction> {
        match message {
            Message::Transfer { amount } => {
                let credited = if amount > 0 { self.balances.available.checked_add(amount) } else { None };
                let Some(available) = credited else {
                    tracing::error!(node = self.id, sender, amount, "dropping transfer, balance cannot absorb it");
                    return Vec::new();
                };
                self.snapshot.on_transfer(sender, amount);
                self.balances.available = available;
                Vec::new()
            }
            Message::Token { snapshot_id } => {
                let effects = self
                    .snapshot
                    .on_token(snapshot_id, sender, self.balances.available);
                Self::into_actions(effects)
            }
        }
    }

    /// Operator-triggered snapshot. The cut is taken before any token is queued, so
    /// no transfer can slip between the recorded balance and the broadcast.
    pub fn start_snapshot(&mut self, snapshot_id: SnapshotId) -> Result<Vec<BranchAction>, SnapshotError> {
        let effects = self.snapshot.start(snapshot_id, self.balances.available)?;
        Ok(Self::into_actions(effects))
    }

    fn into_actions(effects: Vec<SnapshotEffect>) -> Vec<BranchAction> {
        let mut actions = Vec::new();
        for effect in effects {
            match effect {
                SnapshotEffect::BroadcastToken {
                    snapshot_id,
                    targets,
                } => actions.extend(targets.into_iter().map(|dest| BranchAction::Send {
                    dest,
                    message: Message::Token { snapshot_id },
                })),
                SnapshotEffect::Completed(local) => actions.push(BranchAction::Report(local)),
            }
        }
        actions
    }
}
