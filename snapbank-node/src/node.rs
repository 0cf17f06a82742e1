//! Branch actor: owns a `NodeCore`, drives its retransmission timer and the random
//! transfer generator, and serves snapshot and balance requests from the operator.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;
use snapbank_core::{
    Balances, NodeConfig, NodeCore, NodeId, OutboundAction, SnapshotError, SnapshotId, TransferOutcome,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::collector::SharedCollector;
use crate::report_log::ReportLog;
use crate::transport::Datagram;

#[derive(Debug)]
pub enum NodeEvent {
    Datagram(Vec<u8>),
    TransportError {
        dest: NodeId,
    },
    StartSnapshot {
        snapshot_id: SnapshotId,
        reply: oneshot::Sender<Result<(), SnapshotError>>,
    },
    Balances {
        reply: oneshot::Sender<Balances>,
    },
    Shutdown,
}

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("node {0} has stopped")]
    Stopped(NodeId),
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}

#[derive(Debug, Clone)]
pub struct NodeSettings {
    pub transfer_interval: Duration,
    pub report_log: Option<ReportLog>,
}

#[derive(Debug, Clone)]
pub struct NodeHandle {
    id: NodeId,
    events: mpsc::UnboundedSender<NodeEvent>,
}

impl NodeHandle {
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Inbox sender for the transport.
    pub fn sender(&self) -> mpsc::UnboundedSender<NodeEvent> {
        self.events.clone()
    }

    pub async fn start_snapshot(&self, snapshot_id: SnapshotId) -> Result<(), NodeError> {
        let (reply, rx) = oneshot::channel();
        self.request(NodeEvent::StartSnapshot { snapshot_id, reply })?;
        rx.await.map_err(|_| NodeError::Stopped(self.id))??;
        Ok(())
    }

    pub async fn balances(&self) -> Result<Balances, NodeError> {
        let (reply, rx) = oneshot::channel();
        self.request(NodeEvent::Balances { reply })?;
        rx.await.map_err(|_| NodeError::Stopped(self.id))
    }

    pub fn shutdown(&self) {
        let _ = self.events.send(NodeEvent::Shutdown);
    }

    fn request(&self, event: NodeEvent) -> Result<(), NodeError> {
        self.events.send(event).map_err(|_| NodeError::Stopped(self.id))
    }
}

/// Spawn the actor for node `id`. `nodes` is the whole address table.
pub fn spawn(
    id: NodeId,
    nodes: &[NodeId],
    config: NodeConfig,
    settings: NodeSettings,
    collector: SharedCollector,
    outbound: mpsc::UnboundedSender<Datagram>,
) -> (NodeHandle, JoinHandle<()>) {
    let (events_tx, events) = mpsc::unbounded_channel();
    let mut rng = StdRng::from_entropy();
    let core = NodeCore::new(id, nodes, config, &mut rng);
    let node = Node {
        core,
        rng,
        events,
        outbound,
        collector,
        report_log: settings.report_log,
        transfer_interval: settings.transfer_interval,
        next_transfer: None,
    };
    let task = tokio::spawn(node.run());
    (NodeHandle { id, events: events_tx }, task)
}

struct Node {
    core: NodeCore,
    rng: StdRng,
    events: mpsc::UnboundedReceiver<NodeEvent>,
    outbound: mpsc::UnboundedSender<Datagram>,
    collector: SharedCollector,
    report_log: Option<ReportLog>,
    transfer_interval: Duration,
    next_transfer: Option<Instant>,
}

impl Node {
    async fn run(mut self) {
        let id = self.core.id();
        let balances = self.core.balances();
        tracing::info!(node = id, balance = balances.available, "branch started");
        if self.core.branch().has_peers() {
            self.next_transfer = Some(Instant::now());
        }
        loop {
            let retransmit = self.core.next_deadline().map(Instant::from_std);
            tokio::select! {
                event = self.events.recv() => match event {
                    Some(NodeEvent::Shutdown) | None => break,
                    Some(event) => self.handle(event).await,
                },
                () = sleep_until(retransmit) => {
                    let actions = self.core.on_timer(std::time::Instant::now());
                    self.perform(actions).await;
                }
                () = sleep_until(self.next_transfer) => self.transfer().await,
            }
        }
        tracing::info!(node = id, "branch stopped");
    }

    async fn handle(&mut self, event: NodeEvent) {
        let now = std::time::Instant::now();
        match event {
            NodeEvent::Datagram(bytes) => {
                let actions = self.core.on_datagram(&bytes, now);
                self.perform(actions).await;
            }
            NodeEvent::TransportError { dest } => {
                let actions = self.core.on_transport_error(dest, now);
                self.perform(actions).await;
            }
            NodeEvent::StartSnapshot { snapshot_id, reply } => match self.core.start_snapshot(snapshot_id, now) {
                Ok(actions) => {
                    let _ = reply.send(Ok(()));
                    self.perform(actions).await;
                }
                Err(e) => {
                    tracing::warn!(node = self.core.id(), error = %e, "snapshot start rejected");
                    let _ = reply.send(Err(e));
                }
            },
            NodeEvent::Balances { reply } => {
                let _ = reply.send(self.core.balances());
            }
            NodeEvent::Shutdown => {}
        }
    }

    /// One generator step. Rescheduled when the transfer settles, or after an interval
    /// if nothing could be sent.
    async fn transfer(&mut self) {
        self.next_transfer = None;
        let actions = self.core.send_random_transfer(&mut self.rng, std::time::Instant::now());
        self.perform(actions).await;
        if !self.core.transfer_in_flight() && self.next_transfer.is_none() {
            self.next_transfer = Some(Instant::now() + self.transfer_interval);
        }
    }

    async fn perform(&mut self, actions: Vec<OutboundAction>) {
        for action in actions {
            match action {
                OutboundAction::SendDatagram(dest, bytes) => {
                    if self.outbound.send(Datagram { dest, bytes }).is_err() {
                        tracing::warn!(node = self.core.id(), dest, "transport closed, datagram dropped");
                    }
                }
                OutboundAction::SnapshotCompleted(local) => {
                    if let Some(log) = &self.report_log {
                        if let Err(e) = log.append(&local).await {
                            tracing::warn!(path = %log.path().display(), error = %e, "cannot write report");
                        }
                    }
                    self.collector.report(&local).await;
                }
                OutboundAction::TransferSettled(outcome) => {
                    self.next_transfer = Some(match outcome {
                        TransferOutcome::Delivered { .. } => Instant::now() + self.transfer_interval,
                        TransferOutcome::Failed { .. } => Instant::now(),
                    });
                }
            }
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use snapbank_core::{BranchConfig, GlobalSnapshot, LinkConfig};

    /// Routes datagrams between in-process nodes, dropping and duplicating some.
    struct Cluster {
        handles: Vec<NodeHandle>,
        tasks: Vec<JoinHandle<()>>,
        collector: SharedCollector,
    }

    fn config() -> NodeConfig {
        NodeConfig {
            link: LinkConfig {
                ack_timeout: Duration::from_millis(20),
                max_retransmissions: None,
            },
            branch: BranchConfig {
                initial_balance: 1000,
                max_transfer: 100,
            },
        }
    }

    fn cluster(size: u32, drop: f64, duplicate: f64) -> Cluster {
        let ids: Vec<NodeId> = (0..size).collect();
        let collector = SharedCollector::new();
        let mut handles = Vec::new();
        let mut tasks = Vec::new();
        let mut queues = Vec::new();
        for &id in &ids {
            let (out_tx, out_rx) = mpsc::unbounded_channel();
            let settings = NodeSettings {
                transfer_interval: Duration::from_millis(2),
                report_log: None,
            };
            let (handle, task) = spawn(id, &ids, config(), settings, collector.clone(), out_tx);
            handles.push(handle);
            tasks.push(task);
            queues.push(out_rx);
        }
        let inboxes: Vec<_> = handles.iter().map(NodeHandle::sender).collect();
        for (seed, mut queue) in queues.into_iter().enumerate() {
            let inboxes = inboxes.clone();
            tokio::spawn(async move {
                let mut rng = StdRng::seed_from_u64(seed as u64);
                while let Some(datagram) = queue.recv().await {
                    if rng.gen_bool(drop) {
                        continue;
                    }
                    let inbox = &inboxes[datagram.dest as usize];
                    if rng.gen_bool(duplicate) {
                        let _ = inbox.send(NodeEvent::Datagram(datagram.bytes.clone()));
                    }
                    let _ = inbox.send(NodeEvent::Datagram(datagram.bytes));
                }
            });
        }
        Cluster {
            handles,
            tasks,
            collector,
        }
    }

    impl Cluster {
        async fn snapshot(&self, initiator: usize, snapshot_id: SnapshotId) -> GlobalSnapshot {
            let done = self
                .collector
                .init_snapshot(snapshot_id, self.handles.len())
                .await
                .unwrap();
            self.handles[initiator].start_snapshot(snapshot_id).await.unwrap();
            tokio::time::timeout(Duration::from_secs(20), done)
                .await
                .expect("snapshot completes")
                .unwrap()
        }

        async fn shutdown(self) {
            for handle in &self.handles {
                handle.shutdown();
            }
            for task in self.tasks {
                task.await.unwrap();
            }
        }
    }

    #[tokio::test]
    async fn snapshots_add_up_while_money_moves() {
        let cluster = cluster(3, 0.2, 0.1);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(cluster.snapshot(0, 1).await.total, 3000);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(cluster.snapshot(2, 2).await.total, 3000);
        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn balances_stay_non_negative() {
        let cluster = cluster(2, 0.0, 0.0);
        tokio::time::sleep(Duration::from_millis(50)).await;
        for handle in &cluster.handles {
            let balances = handle.balances().await.unwrap();
            assert!(balances.available >= 0);
            assert!(balances.reserved >= 0);
            assert!(balances.total() <= 2000);
        }
        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn single_node_snapshot_is_its_balance() {
        let cluster = cluster(1, 0.0, 0.0);
        let global = cluster.snapshot(0, 7).await;
        assert_eq!(global.total, 1000);
        assert_eq!(global.reports, 1);
        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn second_start_is_rejected_while_recording() {
        // Every datagram is lost, so the first snapshot can never finish.
        let cluster = cluster(2, 1.0, 0.0);
        cluster.handles[0].start_snapshot(1).await.unwrap();
        let err = cluster.handles[0].start_snapshot(2).await.unwrap_err();
        assert!(matches!(
            err,
            NodeError::Snapshot(SnapshotError::AlreadyActive {
                active: 1,
                requested: 2
            })
        ));
        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn stopped_node_refuses_requests() {
        let cluster = cluster(1, 0.0, 0.0);
        let handle = cluster.handles[0].clone();
        cluster.shutdown().await;
        assert!(matches!(handle.balances().await, Err(NodeError::Stopped(0))));
    }
}
