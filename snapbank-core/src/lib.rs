//! Snapbank protocol reference implementation: branches exchanging money over a
//! reliable link, with Chandy–Lamport global snapshots.
//! Host-driven: no I/O; host passes events and receives actions.

pub mod branch;
pub mod collector;
pub mod core;
pub mod link;
pub mod overlay;
pub mod protocol;
pub mod scheduler;
pub mod snapshot;
pub mod wire;

#[cfg(test)]
mod sim;

pub use branch::{Balances, Branch, BranchConfig, DEFAULT_INITIAL_BALANCE, DEFAULT_MAX_TRANSFER};
pub use collector::{Collector, CollectorError, GlobalSnapshot};
pub use crate::core::{NodeConfig, NodeCore, OutboundAction, TransferOutcome};
pub use link::{LinkConfig, LinkError, ReliableLink, DEFAULT_ACK_TIMEOUT};
pub use protocol::{Message, NodeId, Sequence, SnapshotId};
pub use snapshot::{LocalSnapshot, SnapshotError, SnapshotState};
pub use wire::{decode_frame, encode_frame, FrameDecodeError};
