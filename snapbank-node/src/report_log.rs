//! Per-node report file: one `snapshot_id balance incoming` line per completed snapshot,
//! appended to `<report_dir>/<node_id>.log`.

use std::path::{Path, PathBuf};

use snapbank_core::{LocalSnapshot, NodeId};
use tokio::io::AsyncWriteExt;

#[derive(Debug, Clone)]
pub struct ReportLog {
    path: PathBuf,
}

impl ReportLog {
    pub fn new(dir: &Path, node: NodeId) -> Self {
        Self {
            path: dir.join(format!("{node}.log")),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, local: &LocalSnapshot) -> std::io::Result<()> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(format_line(local).as_bytes()).await?;
        file.flush().await
    }
}

fn format_line(local: &LocalSnapshot) -> String {
    format!(
        "{} {} {}\n",
        local.snapshot_id, local.recorded_balance, local.incoming_accumulated
    )
}
