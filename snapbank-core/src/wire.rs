//! Framing: `[frame_type:1][sequence:4][sender:4][payload?]`, big-endian.
//! DATA payload is `[kind:1][fields]`; ACK frames carry no payload.

use bytes::{Buf, BufMut};

use crate::protocol::{LinkFrame, Message};

pub const FRAME_DATA: u8 = 0x01;
pub const FRAME_ACK: u8 = 0x02;

pub const KIND_TRANSFER: u8 = 0x01;
pub const KIND_TOKEN: u8 = 0x02;

/// frame type + sequence + sender
pub const HEADER_LEN: usize = 1 + 4 + 4;
/// kind + one i64 field
pub const MESSAGE_LEN: usize = 1 + 8;

/// Largest datagram a node ever produces; receivers size their buffers from it.
pub const MAX_DATAGRAM_LEN: usize = HEADER_LEN + MESSAGE_LEN;

/// Encode a link frame into a datagram.
pub fn encode_frame(frame: &LinkFrame) -> Vec<u8> {
    match frame {
        LinkFrame::Data {
            sequence,
            sender,
            payload,
        } => {
            let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
            out.put_u8(FRAME_DATA);
            out.put_u32(*sequence);
            out.put_u32(*sender);
            out.put_slice(payload);
            out
        }
        LinkFrame::Ack { sequence, sender } => {
            let mut out = Vec::with_capacity(HEADER_LEN);
            out.put_u8(FRAME_ACK);
            out.put_u32(*sequence);
            out.put_u32(*sender);
            out
        }
    }
}

/// Decode one whole datagram. Datagrams are never split, so a short buffer is an error, not "need more".
pub fn decode_frame(mut bytes: &[u8]) -> Result<LinkFrame, FrameDecodeError> {
    if bytes.len() < HEADER_LEN {
        return Err(FrameDecodeError::Truncated {
            expected: HEADER_LEN,
            actual: bytes.len(),
        });
    }
    let frame_type = bytes.get_u8();
    let sequence = bytes.get_u32();
    let sender = bytes.get_u32();
    if sequence == 0 {
        return Err(FrameDecodeError::UnassignedSequence);
    }
    match frame_type {
        FRAME_DATA => {
            if bytes.is_empty() {
                return Err(FrameDecodeError::EmptyPayload);
            }
            Ok(LinkFrame::Data {
                sequence,
                sender,
                payload: bytes.to_vec(),
            })
        }
        FRAME_ACK => {
            if !bytes.is_empty() {
                return Err(FrameDecodeError::TrailingBytes(bytes.len()));
            }
            Ok(LinkFrame::Ack { sequence, sender })
        }
        other => Err(FrameDecodeError::UnknownFrameType(other)),
    }
}

/// Encode an application message as a DATA payload.
pub fn encode_message(msg: &Message) -> Vec<u8> {
    let mut out = Vec::with_capacity(MESSAGE_LEN);
    match msg {
        Message::Transfer { amount } => {
            out.put_u8(KIND_TRANSFER);
            out.put_i64(*amount);
        }
        Message::Token { snapshot_id } => {
            out.put_u8(KIND_TOKEN);
            out.put_i64(*snapshot_id);
        }
    }
    out
}

/// Decode a DATA payload into an application message.
pub fn decode_message(mut bytes: &[u8]) -> Result<Message, FrameDecodeError> {
    if bytes.len() < MESSAGE_LEN {
        return Err(FrameDecodeError::Truncated {
            expected: MESSAGE_LEN,
            actual: bytes.len(),
        });
    }
    let kind = bytes.get_u8();
    let value = bytes.get_i64();
    if !bytes.is_empty() {
        return Err(FrameDecodeError::TrailingBytes(bytes.len()));
    }
    match kind {
        KIND_TRANSFER if value < 1 => Err(FrameDecodeError::NonPositiveAmount(value)),
        KIND_TRANSFER => Ok(Message::Transfer { amount: value }),
        KIND_TOKEN => Ok(Message::Token { snapshot_id: value }),
        other => Err(FrameDecodeError::UnknownMessageKind(other)),
    }
}

/// Error decoding a datagram or its payload. Always a protocol error: the frame is dropped.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("truncated: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("unknown frame type {0:#04x}")]
    UnknownFrameType(u8),
    #[error("unknown message kind {0:#04x}")]
    UnknownMessageKind(u8),
    #[error("{0} trailing bytes")]
    TrailingBytes(usize),
    #[error("sequence 0 is reserved")]
    UnassignedSequence,
    #[error("data frame without payload")]
    EmptyPayload,
    #[error("transfer amount {0} is not positive")]
    NonPositiveAmount(i64),
}
