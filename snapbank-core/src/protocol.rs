//! Snapbank wire protocol: node ids, application messages and link frames.

/// Integer node id; index into the static address table.
pub type NodeId = u32;

/// Per-sender link sequence number. 0 means "unassigned" and never goes on the wire.
pub type Sequence = u32;

/// Snapshot identifier chosen by the operator.
pub type SnapshotId = i64;

/// Application messages exchanged between branches. Encoding is the payload of a DATA frame (see wire module).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Message {
    /// Money moved from the sender to the receiver.
    Transfer { amount: i64 },
    /// Snapshot marker: splits the sender's channel into pre-cut and post-cut traffic.
    Token { snapshot_id: SnapshotId },
}

/// Link layer frame. DATA carries an opaque payload; ACK confirms one DATA sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkFrame {
    Data {
        sequence: Sequence,
        sender: NodeId,
        payload: Vec<u8>,
    },
    /// `sender` is the node that received the DATA frame and is acknowledging it.
    Ack { sequence: Sequence, sender: NodeId },
}

#[cfg(test)]
impl LinkFrame {
    pub fn sequence(&self) -> Sequence {
        match self {
            LinkFrame::Data { sequence, .. } | LinkFrame::Ack { sequence, .. } => *sequence,
        }
    }
}

/// Acknowledgment observed for a completed send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub sequence: Sequence,
    pub acked_by: NodeId,
}
