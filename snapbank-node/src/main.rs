// Snapbank branch daemon: hosts one or more branches of the address table, moves money
// between them at random, and takes global snapshots on operator request.

mod collector;
mod config;
mod node;
mod report_log;
mod transport;

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use snapbank_core::{GlobalSnapshot, NodeId, SnapshotId};
use tokio::sync::mpsc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::collector::SharedCollector;
use crate::node::{NodeHandle, NodeSettings};
use crate::report_log::ReportLog;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    /// Config file (default: ~/.config/snapbank/config.toml, then /etc/snapbank/config.toml)
    #[clap(short, long)]
    config: Option<PathBuf>,

    /// Node id to host in this process; repeat for several. Default: every node in the table.
    #[clap(long = "id")]
    ids: Vec<NodeId>,

    /// Verbosity (-v debug, -vv trace). RUST_LOG applies when absent.
    #[clap(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let cfg = config::load(cli.config.as_deref())?;
    let book = Arc::new(cfg.address_book()?);
    let all: Vec<NodeId> = book.ids().collect();
    let hosted = if cli.ids.is_empty() {
        all.clone()
    } else {
        for id in &cli.ids {
            if book.get(*id).is_none() {
                anyhow::bail!("node {id} is not in the address table ({} nodes)", book.len());
            }
        }
        cli.ids.clone()
    };
    if hosted.len() < all.len() {
        tracing::warn!(
            hosted = hosted.len(),
            total = all.len(),
            "collector only counts reports from nodes hosted in this process"
        );
    }

    let collector = SharedCollector::new();
    let mut handles = Vec::new();
    let mut tasks = Vec::new();
    for &id in &hosted {
        let addr = book
            .get(id)
            .with_context(|| format!("node {id} has no address"))?;
        let socket = transport::bind(addr)
            .await
            .with_context(|| format!("node {id}: cannot bind {addr}"))?;
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let settings = NodeSettings {
            transfer_interval: cfg.transfer_interval(),
            report_log: Some(ReportLog::new(&cfg.report_dir, id)),
        };
        let (handle, task) = node::spawn(id, &all, cfg.node_config(), settings, collector.clone(), outbound_tx);
        transport::spawn(id, socket, book.clone(), handle.sender(), outbound_rx);
        tracing::info!(node = id, %addr, "listening");
        handles.push(handle);
        tasks.push(task);
    }
    let operator_node = handles
        .first()
        .context("no nodes to host")?
        .clone();

    tokio::select! {
        res = operator(&operator_node, &collector, hosted.len()) => res?,
        res = shutdown_signal() => res?,
    }

    println!();
    tracing::info!("shutting down branch activities");
    for handle in &handles {
        handle.shutdown();
    }
    for task in tasks {
        let _ = task.await;
    }
    Ok(())
}

fn init_logging(verbose: u8) {
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        1 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Read snapshot ids from stdin until EOF and print each global total.
async fn operator(node: &NodeHandle, collector: &SharedCollector, expected: usize) -> anyhow::Result<()> {
    let mut lines = stdin_lines();
    loop {
        print!("Enter new snapshot ID [Ctrl+D to quit]: ");
        std::io::stdout().flush()?;
        let Some(line) = lines.recv().await else {
            return Ok(());
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let snapshot_id: SnapshotId = match line.parse() {
            Ok(id) => id,
            Err(_) => {
                eprintln!("invalid snapshot id {line:?}");
                continue;
            }
        };
        match take_snapshot(node, collector, snapshot_id, expected).await {
            Ok(global) => println!(
                "Snapshot {}: total {} across {} branches",
                global.snapshot_id, global.total, global.reports
            ),
            Err(e) => eprintln!("snapshot {snapshot_id}: {e:#}"),
        }
    }
}

/// Stdin is read on its own thread so a pending read never holds up shutdown.
fn stdin_lines() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

async fn take_snapshot(
    node: &NodeHandle,
    collector: &SharedCollector,
    snapshot_id: SnapshotId,
    expected: usize,
) -> anyhow::Result<GlobalSnapshot> {
    let done = collector.init_snapshot(snapshot_id, expected).await?;
    if let Err(e) = node.start_snapshot(snapshot_id).await {
        collector.abandon(snapshot_id).await;
        return Err(e).with_context(|| format!("node {} did not start it", node.id()));
    }
    done.await.context("collector dropped the snapshot")
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
