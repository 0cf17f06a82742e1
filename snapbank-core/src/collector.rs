//! Snapshot collector bookkeeping: sums local reports per snapshot id until the
//! expected number of nodes has reported.

use std::collections::{BTreeSet, HashMap};

use crate::protocol::{NodeId, SnapshotId};
use crate::snapshot::LocalSnapshot;

/// Aggregated result for one snapshot id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlobalSnapshot {
    pub snapshot_id: SnapshotId,
    pub total: i64,
    pub reports: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CollectorError {
    #[error("snapshot {0} is already being collected")]
    AlreadyInitialized(SnapshotId),
    #[error("snapshot {0} must expect at least one report")]
    NoReportsExpected(SnapshotId),
    #[error("node {node} already reported snapshot {snapshot_id}")]
    DuplicateReport {
        snapshot_id: SnapshotId,
        node: NodeId,
    },
    #[error("total of snapshot {snapshot_id} overflows with the report of node {node}")]
    TotalOverflow {
        snapshot_id: SnapshotId,
        node: NodeId,
    },
}

#[derive(Default)]
struct Collection {
    /// Unknown until `init_snapshot`; reports may arrive first.
    expected: Option<usize>,
    reported: BTreeSet<NodeId>,
    total: i64,
}

impl Collection {
    fn finished(&self, snapshot_id: SnapshotId) -> Option<GlobalSnapshot> {
        let expected = self.expected?;
        (self.reported.len() >= expected).then_some(GlobalSnapshot {
            snapshot_id,
            total: self.total,
            reports: self.reported.len(),
        })
    }
}

#[derive(Default)]
pub struct Collector {
    collections: HashMap<SnapshotId, Collection>,
}

impl Collector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start collecting `snapshot_id`. Returns the result right away if enough
    /// reports already arrived.
    pub fn init_snapshot(
        &mut self,
        snapshot_id: SnapshotId,
        expected_reports: usize,
    ) -> Result<Option<GlobalSnapshot>, CollectorError> {
        if expected_reports == 0 {
            return Err(CollectorError::NoReportsExpected(snapshot_id));
        }
        let collection = self.collections.entry(snapshot_id).or_default();
        if collection.expected.is_some() {
            return Err(CollectorError::AlreadyInitialized(snapshot_id));
        }
        collection.expected = Some(expected_reports);
        Ok(self.take_if_finished(snapshot_id))
    }

    /// Record one node's local snapshot. Returns the global result once the last
    /// expected report arrived.
    pub fn report_local_snapshot(&mut self, report: &LocalSnapshot) -> Result<Option<GlobalSnapshot>, CollectorError> {
        let collection = self.collections.entry(report.snapshot_id).or_default();
        if collection.reported.contains(&report.node) {
            return Err(CollectorError::DuplicateReport {
                snapshot_id: report.snapshot_id,
                node: report.node,
            });
        }
        let total = report
            .recorded_balance
            .checked_add(report.incoming_accumulated)
            .and_then(|local| collection.total.checked_add(local))
            .ok_or(CollectorError::TotalOverflow {
                snapshot_id: report.snapshot_id,
                node: report.node,
            })?;
        collection.reported.insert(report.node);
        collection.total = total;
        tracing::info!(
            snapshot_id = report.snapshot_id,
            node = report.node,
            total = report.total(),
            balance = report.recorded_balance,
            incoming = report.incoming_accumulated,
            "reported local snapshot"
        );
        Ok(self.take_if_finished(report.snapshot_id))
    }

    /// Forget a snapshot that will never complete (e.g. its start was rejected).
    pub fn abandon(&mut self, snapshot_id: SnapshotId) {
        self.collections.remove(&snapshot_id);
    }

    #[cfg(test)]
    pub fn is_collecting(&self, snapshot_id: SnapshotId) -> bool {
        self.collections.contains_key(&snapshot_id)
    }

    fn take_if_finished(&mut self, snapshot_id: SnapshotId) -> Option<GlobalSnapshot> {
        let result = self.collections.get(&snapshot_id)?.finished(snapshot_id)?;
        self.collections.remove(&snapshot_id);
        Some(result)
    }
}
