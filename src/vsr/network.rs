//! In-process transport between replicas.
//!
//! Every replica has one inbox. Links are directional and can be cut to model
//! partitions and crashed peers: a message sent over a cut link is dropped
//! without an error, as on a lossy network.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::trace;

use super::message::VsrMessage;

type Envelope = (u32, VsrMessage);

/// `size * size` link flags, row = sender, column = receiver.
#[derive(Debug)]
struct LinkMatrix {
    size: u32,
    up: Vec<AtomicBool>,
}

impl LinkMatrix {
    fn new(size: u32) -> Self {
        let up = (0..size * size).map(|_| AtomicBool::new(true)).collect();
        LinkMatrix { size, up }
    }

    fn slot(&self, from: u32, to: u32) -> Option<&AtomicBool> {
        if from >= self.size || to >= self.size || from == to {
            return None;
        }
        self.up.get((from * self.size + to) as usize)
    }

    fn is_up(&self, from: u32, to: u32) -> bool {
        self.slot(from, to).map_or(false, |f| f.load(Ordering::SeqCst))
    }

    fn set_replica(&self, replica: u32, up: bool) {
        for other in 0..self.size {
            for slot in [self.slot(replica, other), self.slot(other, replica)].into_iter().flatten() {
                slot.store(up, Ordering::SeqCst);
            }
        }
    }
}

/// A replica's attachment to the network.
pub struct NetworkEndpoint {
    node_id: u32,
    inbox: Receiver<Envelope>,
    /// Indexed by replica id; `None` at our own position.
    outboxes: Vec<Option<Sender<Envelope>>>,
    links: Arc<LinkMatrix>,
}

impl NetworkEndpoint {
    pub fn node_id(&self) -> u32 {
        self.node_id
    }

    /// Returns false if the message was dropped.
    pub fn send_to(&self, target: u32, msg: VsrMessage) -> bool {
        if !self.links.is_up(self.node_id, target) {
            trace!(from = self.node_id, to = target, kind = msg.kind(), "link down, dropped");
            return false;
        }
        match self.outboxes.get(target as usize) {
            Some(Some(tx)) => tx.send((self.node_id, msg)).is_ok(),
            _ => false,
        }
    }

    /// Send to every other replica; returns how many copies left.
    pub fn broadcast(&self, msg: VsrMessage) -> usize {
        (0..self.outboxes.len() as u32)
            .filter(|&peer| peer != self.node_id)
            .filter(|&peer| self.send_to(peer, msg.clone()))
            .count()
    }

    pub fn try_recv(&self) -> Option<Envelope> {
        self.inbox.try_recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<Envelope> {
        self.inbox.recv_timeout(timeout).ok()
    }
}

/// The fabric connecting a fixed set of replicas.
pub struct MockNetwork {
    senders: Vec<Sender<Envelope>>,
    /// Inboxes not yet handed to an endpoint.
    unclaimed: Vec<Option<Receiver<Envelope>>>,
    links: Arc<LinkMatrix>,
}

impl MockNetwork {
    pub fn new(cluster_size: u32) -> Self {
        let (senders, unclaimed) = (0..cluster_size)
            .map(|_| {
                let (tx, rx) = unbounded();
                (tx, Some(rx))
            })
            .unzip();
        MockNetwork {
            senders,
            unclaimed,
            links: Arc::new(LinkMatrix::new(cluster_size)),
        }
    }

    pub fn cluster_size(&self) -> u32 {
        self.senders.len() as u32
    }

    /// Claim the inbox of `node_id`. `None` if it is out of range or already
    /// claimed.
    pub fn create_endpoint(&mut self, node_id: u32) -> Option<NetworkEndpoint> {
        let inbox = self.unclaimed.get_mut(node_id as usize)?.take()?;
        let outboxes = self
            .senders
            .iter()
            .enumerate()
            .map(|(peer, tx)| (peer as u32 != node_id).then(|| tx.clone()))
            .collect();
        Some(NetworkEndpoint {
            node_id,
            inbox,
            outboxes,
            links: self.links.clone(),
        })
    }

    /// Cut every link to and from `node_id`.
    pub fn disconnect(&self, node_id: u32) {
        self.links.set_replica(node_id, false);
    }

    pub fn reconnect(&self, node_id: u32) {
        self.links.set_replica(node_id, true);
    }

    pub fn is_connected(&self, from: u32, to: u32) -> bool {
        self.links.is_up(from, to)
    }
}
