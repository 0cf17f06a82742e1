//! Chandy–Lamport snapshot engine for one node.
//!
//! Relies on FIFO channels: a transfer from `from` that arrives while we are
//! recording and before `from`'s token was sent before `from` took its own cut,
//! so it belongs to the channel state and is added to `incoming_accumulated`.

use std::collections::BTreeSet;

use crate::protocol::{NodeId, SnapshotId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotState {
    Idle,
    Recording(SnapshotId),
}

/// State captured while recording.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRecord {
    pub snapshot_id: SnapshotId,
    pub recorded_balance: i64,
    pub incoming_accumulated: i64,
    pub tokens_received: BTreeSet<NodeId>,
}

/// Completed local snapshot, reported to the collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalSnapshot {
    pub snapshot_id: SnapshotId,
    pub node: NodeId,
    pub recorded_balance: i64,
    pub incoming_accumulated: i64,
}

impl LocalSnapshot {
    /// This node's contribution to the global total.
    pub fn total(&self) -> i64 {
        self.recorded_balance.saturating_add(self.incoming_accumulated)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotEffect {
    /// Send `Token(snapshot_id)` to each target.
    BroadcastToken {
        snapshot_id: SnapshotId,
        targets: Vec<NodeId>,
    },
    Completed(LocalSnapshot),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SnapshotError {
    #[error("snapshot {active} still in progress, rejected snapshot {requested}")]
    AlreadyActive {
        active: SnapshotId,
        requested: SnapshotId,
    },
}

pub struct SnapshotEngine {
    local: NodeId,
    nodes: BTreeSet<NodeId>,
    record: Option<SnapshotRecord>,
}

impl SnapshotEngine {
    /// `nodes` is every node in the system; self is added if missing.
    pub fn new(local: NodeId, nodes: impl IntoIterator<Item = NodeId>) -> Self {
        let mut nodes: BTreeSet<NodeId> = nodes.into_iter().collect();
        nodes.insert(local);
        Self {
            local,
            nodes,
            record: None,
        }
    }

    pub fn state(&self) -> SnapshotState {
        match &self.record {
            Some(r) => SnapshotState::Recording(r.snapshot_id),
            None => SnapshotState::Idle,
        }
    }

    pub fn record(&self) -> Option<&SnapshotRecord> {
        self.record.as_ref()
    }

    pub fn has_node(&self, node: NodeId) -> bool {
        self.nodes.contains(&node)
    }

    /// Local start request: take the cut now with `balance` as recorded state.
    pub fn start(&mut self, snapshot_id: SnapshotId, balance: i64) -> Result<Vec<SnapshotEffect>, SnapshotError> {
        if let Some(active) = &self.record {
            tracing::warn!(
                node = self.local,
                active = active.snapshot_id,
                requested = snapshot_id,
                "rejecting snapshot start"
            );
            return Err(SnapshotError::AlreadyActive {
                active: active.snapshot_id,
                requested: snapshot_id,
            });
        }
        tracing::info!(node = self.local, snapshot_id, balance, "starting snapshot");
        let mut effects = self.begin(snapshot_id, balance);
        effects.extend(self.complete_if_done());
        Ok(effects)
    }

    /// Token `snapshot_id` arrived from `from`. `balance` is the current balance, used
    /// only if this token starts the local recording.
    pub fn on_token(&mut self, snapshot_id: SnapshotId, from: NodeId, balance: i64) -> Vec<SnapshotEffect> {
        if !self.nodes.contains(&from) || from == self.local {
            tracing::warn!(node = self.local, from, snapshot_id, "token from unexpected node");
            return Vec::new();
        }
        let mut effects = Vec::new();
        if self.record.is_none() {
            effects = self.begin(snapshot_id, balance);
        }
        if let Some(record) = &mut self.record {
            if record.snapshot_id != snapshot_id {
                tracing::warn!(
                    node = self.local,
                    from,
                    active = record.snapshot_id,
                    token = snapshot_id,
                    "dropping token for another snapshot"
                );
                return effects;
            }
            if !record.tokens_received.insert(from) {
                tracing::warn!(node = self.local, from, snapshot_id, "token already received");
                return effects;
            }
        }
        effects.extend(self.complete_if_done());
        effects
    }

    /// Account an incoming transfer. Returns true if it was counted as channel state.
    pub fn on_transfer(&mut self, from: NodeId, amount: i64) -> bool {
        match &mut self.record {
            Some(record) if !record.tokens_received.contains(&from) => {
                match record.incoming_accumulated.checked_add(amount) {
                    Some(incoming) => {
                        record.incoming_accumulated = incoming;
                        true
                    }
                    None => {
                        tracing::error!(node = self.local, from, amount, "incoming channel state overflow");
                        false
                    }
                }
            }
            _ => false,
        }
    }

    fn begin(&mut self, snapshot_id: SnapshotId, balance: i64) -> Vec<SnapshotEffect> {
        self.record = Some(SnapshotRecord {
            snapshot_id,
            recorded_balance: balance,
            incoming_accumulated: 0,
            tokens_received: BTreeSet::from([self.local]),
        });
        // Includes the channel back to the node whose token started this recording.
        let targets: Vec<NodeId> = self.nodes.iter().copied().filter(|&n| n != self.local).collect();
        if targets.is_empty() {
            return Vec::new();
        }
        vec![SnapshotEffect::BroadcastToken {
            snapshot_id,
            targets,
        }]
    }

    fn complete_if_done(&mut self) -> Option<SnapshotEffect> {
        let done = self
            .record
            .as_ref()
            .is_some_and(|r| r.tokens_received.len() == self.nodes.len());
        if !done {
            return None;
        }
        let record = self.record.take()?;
        let local = LocalSnapshot {
            snapshot_id: record.snapshot_id,
            node: self.local,
            recorded_balance: record.recorded_balance,
            incoming_accumulated: record.incoming_accumulated,
        };
        tracing::info!(
            node = self.local,
            snapshot_id = local.snapshot_id,
            balance = local.recorded_balance,
            incoming = local.incoming_accumulated,
            "local snapshot complete"
        );
        Some(SnapshotEffect::Completed(local))
    }
}
