//! Load config from file and environment.

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context};
use serde::Deserialize;
use snapbank_core::{BranchConfig, LinkConfig, NodeConfig, NodeId};

use crate::transport::AddressBook;

/// Node configuration. File: ~/.config/snapbank/config.toml or /etc/snapbank/config.toml
/// unless a path is given. Env overrides: SNAPBANK_INITIAL_BALANCE, SNAPBANK_MAX_TRANSFER,
/// SNAPBANK_TRANSFER_INTERVAL_MS, SNAPBANK_ACK_TIMEOUT_MS, SNAPBANK_MAX_RETRANSMISSIONS,
/// SNAPBANK_REPORT_DIR.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Address table, `host:port` per node; the index is the node id.
    #[serde(default)]
    pub nodes: Vec<String>,
    #[serde(default = "default_initial_balance")]
    pub initial_balance: i64,
    #[serde(default = "default_max_transfer")]
    pub max_transfer: i64,
    /// Pause after a delivered transfer before the next one.
    #[serde(default = "default_transfer_interval_ms")]
    pub transfer_interval_ms: u64,
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
    /// Unset retries forever.
    #[serde(default)]
    pub max_retransmissions: Option<u32>,
    /// Where `<node_id>.log` report files go.
    #[serde(default = "default_report_dir")]
    pub report_dir: PathBuf,
}

fn default_initial_balance() -> i64 {
    snapbank_core::DEFAULT_INITIAL_BALANCE
}
fn default_max_transfer() -> i64 {
    snapbank_core::DEFAULT_MAX_TRANSFER
}
fn default_transfer_interval_ms() -> u64 {
    200
}
fn default_ack_timeout_ms() -> u64 {
    snapbank_core::DEFAULT_ACK_TIMEOUT.as_millis() as u64
}
fn default_report_dir() -> PathBuf {
    PathBuf::from(".")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            initial_balance: default_initial_balance(),
            max_transfer: default_max_transfer(),
            transfer_interval_ms: default_transfer_interval_ms(),
            ack_timeout_ms: default_ack_timeout_ms(),
            max_retransmissions: None,
            report_dir: default_report_dir(),
        }
    }
}

impl Config {
    pub fn node_config(&self) -> NodeConfig {
        NodeConfig {
            link: LinkConfig {
                ack_timeout: Duration::from_millis(self.ack_timeout_ms),
                max_retransmissions: self.max_retransmissions,
            },
            branch: BranchConfig {
                initial_balance: self.initial_balance,
                max_transfer: self.max_transfer,
            },
        }
    }

    pub fn transfer_interval(&self) -> Duration {
        Duration::from_millis(self.transfer_interval_ms)
    }

    /// Resolve every `host:port` in the table. Node ids are table indices.
    pub fn address_book(&self) -> anyhow::Result<AddressBook> {
        let mut book = AddressBook::default();
        for (index, entry) in self.nodes.iter().enumerate() {
            let id = NodeId::try_from(index).context("too many nodes")?;
            let addr: SocketAddr = entry
                .to_socket_addrs()
                .with_context(|| format!("node {id}: invalid address {entry:?}"))?
                .next()
                .with_context(|| format!("node {id}: {entry:?} did not resolve"))?;
            book.insert(id, addr);
        }
        Ok(book)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.nodes.is_empty() {
            bail!("config lists no nodes");
        }
        if self.initial_balance < 0 {
            bail!("initial_balance must not be negative");
        }
        if self.max_transfer < 1 {
            bail!("max_transfer must be at least 1");
        }
        if self.ack_timeout_ms == 0 {
            bail!("ack_timeout_ms must be positive");
        }
        Ok(())
    }
}

/// Load config: default, then config file (explicit path, or the first default path
/// that exists), then env vars.
pub fn load(path: Option<&Path>) -> anyhow::Result<Config> {
    let mut c = match path {
        Some(p) => load_file(p)?,
        None => match config_paths().into_iter().find(|p| p.exists()) {
            Some(p) => load_file(&p)?,
            None => Config::default(),
        },
    };
    apply_overrides(&mut c, |name| std::env::var(name).ok());
    c.validate()?;
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/snapbank/config.toml"));
    }
    out.push(PathBuf::from("/etc/snapbank/config.toml"));
    out
}

fn load_file(path: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read {}", path.display()))?;
    parse(&s).with_context(|| format!("invalid config {}", path.display()))
}

fn parse(s: &str) -> anyhow::Result<Config> {
    Ok(toml::from_str(s)?)
}

fn apply_overrides(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    override_from(&var, "SNAPBANK_INITIAL_BALANCE", &mut c.initial_balance);
    override_from(&var, "SNAPBANK_MAX_TRANSFER", &mut c.max_transfer);
    override_from(&var, "SNAPBANK_TRANSFER_INTERVAL_MS", &mut c.transfer_interval_ms);
    override_from(&var, "SNAPBANK_ACK_TIMEOUT_MS", &mut c.ack_timeout_ms);
    if let Some(n) = parse_override(&var, "SNAPBANK_MAX_RETRANSMISSIONS") {
        c.max_retransmissions = Some(n);
    }
    if let Some(s) = var("SNAPBANK_REPORT_DIR") {
        c.report_dir = PathBuf::from(s);
    }
}

fn override_from<T: FromStr>(var: &impl Fn(&str) -> Option<String>, name: &str, slot: &mut T) {
    if let Some(v) = parse_override(var, name) {
        *slot = v;
    }
}

fn parse_override<T: FromStr>(var: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T> {
    let s = var(name)?;
    match s.parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(name, value = %s, "ignoring unparsable override");
            None
        }
    }
}
