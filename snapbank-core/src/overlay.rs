//! Typed messaging on top of [`ReliableLink`]: encodes `Message`s into DATA payloads
//! and decodes delivered payloads back, dropping the ones that do not parse.

use std::time::Instant;

use crate::link::{LinkConfig, LinkError, LinkEvent, ReliableLink, SendId};
use crate::protocol::{Ack, Message, NodeId};
use crate::wire;

/// What the overlay hands to the node logic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OverlayEvent {
    Transmit { dest: NodeId, bytes: Vec<u8> },
    Received { sender: NodeId, message: Message },
    Sent { id: SendId, dest: NodeId, ack: Ack },
    Failed {
        id: SendId,
        dest: NodeId,
        error: LinkError,
    },
}

pub struct Overlay {
    link: ReliableLink,
}

impl Overlay {
    pub fn new(local: NodeId, peers: impl IntoIterator<Item = NodeId>, config: LinkConfig) -> Self {
        Self {
            link: ReliableLink::new(local, peers, config),
        }
    }

    pub fn send(&mut self, dest: NodeId, message: Message, now: Instant) -> Result<SendId, LinkError> {
        self.link.send(dest, wire::encode_message(&message), now)
    }

    pub fn on_datagram(&mut self, bytes: &[u8], now: Instant) {
        self.link.on_datagram(bytes, now);
    }

    pub fn on_timer(&mut self, now: Instant) {
        self.link.on_timer(now);
    }

    pub fn on_transport_error(&mut self, dest: NodeId) {
        self.link.on_transport_error(dest);
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.link.next_deadline()
    }

    pub fn is_idle(&self) -> bool {
        self.link.is_idle()
    }

    #[cfg(test)]
    pub fn link(&self) -> &ReliableLink {
        &self.link
    }

    /// Drain pending events, decoding delivered payloads. Undecodable payloads were
    /// already acked by the link; they are logged and skipped here.
    pub fn take_events(&mut self) -> Vec<OverlayEvent> {
        let local = self.link.local_id();
        self.link
            .take_events()
            .into_iter()
            .filter_map(|event| match event {
                LinkEvent::Transmit { dest, bytes } => Some(OverlayEvent::Transmit { dest, bytes }),
                LinkEvent::Deliver {
                    sender,
                    sequence,
                    payload,
                } => match wire::decode_message(&payload) {
                    Ok(message) => Some(OverlayEvent::Received { sender, message }),
                    Err(e) => {
                        tracing::warn!(node = local, sender, sequence, error = %e, "dropping undecodable message");
                        None
                    }
                },
                LinkEvent::SendCompleted { id, dest, ack } => Some(OverlayEvent::Sent { id, dest, ack }),
                LinkEvent::SendFailed { id, dest, error } => {
                    Some(OverlayEvent::Failed { id, dest, error })
                }
            })
            .collect()
    }
}
