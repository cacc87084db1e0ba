// src/core/transport.rs

//! The transport collaborator: delivers typed messages to remote nodes,
//! either unordered or ordered per (topic, node).

use crate::core::atomic::messages::CacheMessage;
use crate::core::cluster::node::NodeId;
use crate::core::errors::OpalDBError;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{trace, warn};

/// Per-node inbox capacity of the in-memory mesh.
const MESH_INBOX_CAPACITY: usize = 4096;

/// A received message together with the id of the node that sent it.
pub type MessageEnvelope = (NodeId, CacheMessage);

/// The narrow send interface the pipeline consumes.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends a message with no ordering guarantee relative to other sends.
    async fn send(&self, target: &NodeId, message: CacheMessage) -> Result<(), OpalDBError>;

    /// Sends a message ordered relative to earlier `send_ordered` calls for
    /// the same (topic, target) pair.
    async fn send_ordered(
        &self,
        target: &NodeId,
        topic: &str,
        message: CacheMessage,
        timeout: Duration,
    ) -> Result<(), OpalDBError>;
}

/// An in-process transport mesh connecting every engine of a simulated
/// cluster.
///
/// Messages are round-tripped through the wire codec on every send, so the
/// in-memory path exercises exactly what a socket transport would carry.
#[derive(Debug, Default)]
pub struct InMemoryMesh {
    inboxes: DashMap<NodeId, mpsc::Sender<MessageEnvelope>>,
}

impl InMemoryMesh {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attaches a node to the mesh, returning the receiving half of its inbox.
    pub fn register(&self, node: NodeId) -> mpsc::Receiver<MessageEnvelope> {
        let (tx, rx) = mpsc::channel(MESH_INBOX_CAPACITY);
        self.inboxes.insert(node, tx);
        rx
    }

    /// Detaches a node; subsequent sends to it fail with a topology error.
    pub fn unregister(&self, node: &NodeId) {
        self.inboxes.remove(node);
    }

    async fn deliver(
        &self,
        source: &NodeId,
        target: &NodeId,
        message: CacheMessage,
    ) -> Result<(), OpalDBError> {
        // Round-trip through the codec so in-process delivery carries the
        // same bytes a socket would.
        let raw = message.encode()?;
        let decoded = CacheMessage::decode(&raw)?;

        let Some(inbox) = self.inboxes.get(target).map(|tx| tx.value().clone()) else {
            return Err(OpalDBError::Topology(format!(
                "node {} is not reachable",
                target.short()
            )));
        };
        inbox
            .send((source.clone(), decoded))
            .await
            .map_err(|_| OpalDBError::Topology(format!("node {} stopped", target.short())))
    }
}

/// The per-node [`Transport`] handle onto a shared [`InMemoryMesh`].
#[derive(Clone)]
pub struct MeshTransport {
    mesh: Arc<InMemoryMesh>,
    local: NodeId,
}

impl MeshTransport {
    pub fn new(mesh: Arc<InMemoryMesh>, local: NodeId) -> Self {
        Self { mesh, local }
    }
}

#[async_trait]
impl Transport for MeshTransport {
    async fn send(&self, target: &NodeId, message: CacheMessage) -> Result<(), OpalDBError> {
        self.mesh.deliver(&self.local, target, message).await
    }

    async fn send_ordered(
        &self,
        target: &NodeId,
        topic: &str,
        message: CacheMessage,
        timeout: Duration,
    ) -> Result<(), OpalDBError> {
        trace!("Ordered send on topic '{topic}' to {}", target.short());
        // A single mpsc inbox per node already preserves per-sender order.
        match tokio::time::timeout(timeout, self.mesh.deliver(&self.local, target, message)).await
        {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    "Ordered send on topic '{topic}' to {} timed out",
                    target.short()
                );
                Err(OpalDBError::Timeout(timeout))
            }
        }
    }
}
