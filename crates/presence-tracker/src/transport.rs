//! Transport seam between tracker nodes.
//!
//! The tracker only needs best-effort, at-least-once delivery of opaque
//! payloads: `send(node, bytes)` outbound, and [`Tracker::receive`] called by
//! whoever owns the inbound side. Connection handling, framing and
//! reconnection belong to the implementation.
//!
//! [`MemoryNetwork`] is an in-process implementation with controllable
//! partitions, used by the test suite and handy for local experiments.
//!
//! [`Tracker::receive`]: crate::server::Tracker::receive

use crate::clock::NodeId;
use crate::error::TransportError;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Outbound side of the inter-node transport.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// The node this transport sends from.
    fn local_node(&self) -> &NodeId;

    /// Other nodes currently known to be part of the cluster.
    fn members(&self) -> Vec<NodeId>;

    /// Deliver `payload` to `to`.
    async fn send(&self, to: &NodeId, payload: Vec<u8>) -> Result<(), TransportError>;
}

/// In-process network connecting any number of [`MemoryTransport`]s.
#[derive(Default)]
pub struct MemoryNetwork {
    /// Inbound queue of every joined node.
    nodes: DashMap<NodeId, mpsc::UnboundedSender<Vec<u8>>>,
    /// Directed links that currently drop traffic, as (from, to).
    blocked: RwLock<HashSet<(NodeId, NodeId)>>,
}

impl MemoryNetwork {
    /// Create an empty network.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach a node. Returns its transport and its inbound payload queue.
    ///
    /// Joining again under the same id replaces the previous inbound queue.
    pub fn join(
        self: &Arc<Self>,
        node: impl Into<NodeId>,
    ) -> (Arc<MemoryTransport>, mpsc::UnboundedReceiver<Vec<u8>>) {
        let node = node.into();
        let (tx, rx) = mpsc::unbounded_channel();
        self.nodes.insert(node.clone(), tx);

        tracing::debug!(node = %node, "node joined memory network");

        let transport = Arc::new(MemoryTransport {
            node,
            network: Arc::clone(self),
        });
        (transport, rx)
    }

    /// Detach a node. Sends to it fail with `UnknownNode`.
    pub fn leave(&self, node: &NodeId) {
        self.nodes.remove(node);
        tracing::debug!(node = %node, "node left memory network");
    }

    /// Cut every link between `left` and `right`, in both directions.
    pub fn partition(&self, left: &[NodeId], right: &[NodeId]) {
        let mut blocked = self.blocked.write();
        for a in left {
            for b in right {
                blocked.insert((a.clone(), b.clone()));
                blocked.insert((b.clone(), a.clone()));
            }
        }
    }

    /// Cut a single link in one direction.
    pub fn block(&self, from: &NodeId, to: &NodeId) {
        self.blocked.write().insert((from.clone(), to.clone()));
    }

    /// Restore every link.
    pub fn heal(&self) {
        self.blocked.write().clear();
    }

    /// Whether traffic from `from` to `to` is currently dropped.
    pub fn is_blocked(&self, from: &NodeId, to: &NodeId) -> bool {
        self.blocked.read().contains(&(from.clone(), to.clone()))
    }

    /// Every joined node.
    pub fn nodes(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self.nodes.iter().map(|e| e.key().clone()).collect();
        nodes.sort();
        nodes
    }

    fn deliver(&self, from: &NodeId, to: &NodeId, payload: Vec<u8>) -> Result<(), TransportError> {
        if self.is_blocked(from, to) {
            return Err(TransportError::LinkDown(to.clone()));
        }
        let Some(inbound) = self.nodes.get(to) else {
            return Err(TransportError::UnknownNode(to.clone()));
        };
        inbound.send(payload).map_err(|_| TransportError::Closed)
    }
}

/// One node's handle on a [`MemoryNetwork`].
pub struct MemoryTransport {
    node: NodeId,
    network: Arc<MemoryNetwork>,
}

impl MemoryTransport {
    /// The network this transport belongs to.
    pub fn network(&self) -> &Arc<MemoryNetwork> {
        &self.network
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn local_node(&self) -> &NodeId {
        &self.node
    }

    fn members(&self) -> Vec<NodeId> {
        self.network
            .nodes()
            .into_iter()
            .filter(|n| *n != self.node)
            .collect()
    }

    async fn send(&self, to: &NodeId, payload: Vec<u8>) -> Result<(), TransportError> {
        self.network.deliver(&self.node, to, payload)
    }
}
