//! In-process collector shared by every hosted node. The operator waits on a oneshot
//! for the global result; nodes push their local snapshots as they complete.

use std::collections::HashMap;
use std::sync::Arc;

use snapbank_core::{Collector, CollectorError, GlobalSnapshot, LocalSnapshot, SnapshotId};
use tokio::sync::{oneshot, Mutex};

#[derive(Default)]
struct Inner {
    collector: Collector,
    waiters: HashMap<SnapshotId, oneshot::Sender<GlobalSnapshot>>,
}

#[derive(Clone, Default)]
pub struct SharedCollector {
    inner: Arc<Mutex<Inner>>,
}

impl SharedCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expect `expected_reports` local snapshots for `snapshot_id`; the receiver
    /// resolves once they are all in.
    pub async fn init_snapshot(
        &self,
        snapshot_id: SnapshotId,
        expected_reports: usize,
    ) -> Result<oneshot::Receiver<GlobalSnapshot>, CollectorError> {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock().await;
        match inner.collector.init_snapshot(snapshot_id, expected_reports)? {
            Some(done) => {
                let _ = tx.send(done);
            }
            None => {
                inner.waiters.insert(snapshot_id, tx);
            }
        }
        Ok(rx)
    }

    pub async fn report(&self, local: &LocalSnapshot) {
        let mut inner = self.inner.lock().await;
        match inner.collector.report_local_snapshot(local) {
            Ok(Some(done)) => match inner.waiters.remove(&done.snapshot_id) {
                Some(waiter) => {
                    let _ = waiter.send(done);
                }
                None => tracing::info!(snapshot_id = done.snapshot_id, total = done.total, "snapshot complete"),
            },
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "local snapshot report dropped"),
        }
    }

    pub async fn abandon(&self, snapshot_id: SnapshotId) {
        let mut inner = self.inner.lock().await;
        inner.collector.abandon(snapshot_id);
        inner.waiters.remove(&snapshot_id);
    }
}
