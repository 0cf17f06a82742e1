//! UDP transport: one socket per hosted node, a receive loop feeding the node's
//! inbox and a send loop draining its outbound queue.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use snapbank_core::wire::MAX_DATAGRAM_LEN;
use snapbank_core::NodeId;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::node::NodeEvent;

const RECV_BUFFER_LEN: usize = MAX_DATAGRAM_LEN + 64;

/// Node id to socket address, in address-table order.
#[derive(Debug, Clone, Default)]
pub struct AddressBook {
    addrs: BTreeMap<NodeId, SocketAddr>,
}

impl AddressBook {
    pub fn insert(&mut self, id: NodeId, addr: SocketAddr) {
        self.addrs.insert(id, addr);
    }

    pub fn get(&self, id: NodeId) -> Option<SocketAddr> {
        self.addrs.get(&id).copied()
    }

    pub fn ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.addrs.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.addrs.len()
    }
}

/// An encoded frame bound for `dest`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub dest: NodeId,
    pub bytes: Vec<u8>,
}

pub async fn bind(addr: SocketAddr) -> std::io::Result<UdpSocket> {
    UdpSocket::bind(addr).await
}

/// Start the receive and send loops for one node. Both end once the node's inbox closes
/// or its outbound queue is dropped.
pub fn spawn(
    node: NodeId,
    socket: UdpSocket,
    book: Arc<AddressBook>,
    events: mpsc::UnboundedSender<NodeEvent>,
    outbound: mpsc::UnboundedReceiver<Datagram>,
) -> (JoinHandle<()>, JoinHandle<()>) {
    let socket = Arc::new(socket);
    let recv_task = tokio::spawn(recv_loop(node, socket.clone(), events.clone()));
    let send_task = tokio::spawn(send_loop(node, socket, book, events, outbound));
    (recv_task, send_task)
}

async fn recv_loop(node: NodeId, socket: Arc<UdpSocket>, events: mpsc::UnboundedSender<NodeEvent>) {
    let mut buf = vec![0u8; RECV_BUFFER_LEN];
    loop {
        tokio::select! {
            received = socket.recv_from(&mut buf) => match received {
                Ok((n, from)) => {
                    tracing::trace!(node, %from, len = n, "datagram received");
                    if events.send(NodeEvent::Datagram(buf[..n].to_vec())).is_err() {
                        break;
                    }
                }
                // Linux reports ICMP port unreachable from an earlier send here.
                Err(e) => tracing::debug!(node, error = %e, "recv failed"),
            },
            () = events.closed() => break,
        }
    }
}

async fn send_loop(
    node: NodeId,
    socket: Arc<UdpSocket>,
    book: Arc<AddressBook>,
    events: mpsc::UnboundedSender<NodeEvent>,
    mut outbound: mpsc::UnboundedReceiver<Datagram>,
) {
    while let Some(datagram) = outbound.recv().await {
        let dest = datagram.dest;
        let sent = match book.get(dest) {
            Some(addr) => socket.send_to(&datagram.bytes, addr).await.map(|_| ()),
            None => Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "destination not in address book",
            )),
        };
        if let Err(e) = sent {
            tracing::debug!(node, dest, error = %e, "send failed");
            if events.send(NodeEvent::TransportError { dest }).is_err() {
                break;
            }
        }
    }
}
