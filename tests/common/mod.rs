// tests/common/mod.rs

//! Shared harness for multi-node integration tests: an in-process cluster
//! over the in-memory transport mesh and the static discovery directory.

use bytes::Bytes;
use opaldb::config::CacheConfig;
use opaldb::core::cluster::{ClusterDirectory, ClusterNode, NodeId, StaticDiscovery};
use opaldb::core::state::CacheNode;
use opaldb::core::store::{CacheStore, MemoryStore};
use opaldb::core::transport::{InMemoryMesh, MeshTransport, MessageEnvelope};
use opaldb::core::version::CacheVersion;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub struct TestCluster {
    pub mesh: Arc<InMemoryMesh>,
    pub directory: Arc<ClusterDirectory>,
}

impl TestCluster {
    pub fn new() -> Self {
        Self {
            mesh: InMemoryMesh::new(),
            directory: Arc::new(ClusterDirectory::new()),
        }
    }

    /// Starts a node without a persistence store.
    pub fn add_node(&self, config: CacheConfig) -> Arc<CacheNode> {
        self.add_node_with_store(config, None)
    }

    /// Starts a node backed by the given store.
    pub fn add_node_with_store(
        &self,
        config: CacheConfig,
        store: Option<Arc<MemoryStore>>,
    ) -> Arc<CacheNode> {
        let id = NodeId::random();
        let message_rx = self.mesh.register(id.clone());
        let transport = Arc::new(MeshTransport::new(self.mesh.clone(), id.clone()));
        let discovery = Arc::new(StaticDiscovery::new(self.directory.clone()));
        let local = ClusterNode::new(id, config.node_name.clone(), config.data_center_id);
        let node = CacheNode::start(
            config,
            local.clone(),
            discovery,
            transport,
            store.map(|s| s as Arc<dyn CacheStore>),
            message_rx,
        )
        .expect("node must start");
        self.directory.join(local);
        node
    }

    /// Registers a directory member with a test-held inbox and no engine
    /// behind it. Used to observe or silently swallow pipeline messages.
    pub fn add_scripted_node(&self) -> (NodeId, mpsc::Receiver<MessageEnvelope>) {
        let id = NodeId::random();
        let rx = self.mesh.register(id.clone());
        self.directory
            .join(ClusterNode::new(id.clone(), Some("scripted".into()), 0));
        (id, rx)
    }

    /// A raw mesh endpoint that is not a cluster member; lets a test drive
    /// wire messages directly against an engine.
    pub fn add_probe(&self) -> (NodeId, MeshTransport, mpsc::Receiver<MessageEnvelope>) {
        let id = NodeId::random();
        let rx = self.mesh.register(id.clone());
        let transport = MeshTransport::new(self.mesh.clone(), id.clone());
        (id, transport, rx)
    }

    /// Declares a node failed and detaches it from the mesh.
    pub fn fail_node(&self, id: &NodeId) {
        self.mesh.unregister(id);
        self.directory.fail(id);
    }

    /// Waits until every given node has installed at least the given
    /// topology version.
    pub async fn await_topology(&self, nodes: &[&Arc<CacheNode>], version: u64) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if nodes.iter().all(|n| n.topology.version() >= version) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("topology must settle");
    }
}

impl Default for TestCluster {
    fn default() -> Self {
        Self::new()
    }
}

/// A small cluster-mode config tuned for fast tests.
pub fn test_config() -> CacheConfig {
    CacheConfig {
        partitions: 64,
        network_timeout: Duration::from_secs(2),
        ..CacheConfig::default()
    }
}

/// Searches for a key whose primary owner is the given node.
pub fn key_owned_by(node: &Arc<CacheNode>, prefix: &str) -> Bytes {
    key_with_primary(node, &node.id().clone(), prefix)
}

/// Searches for a key whose primary, as seen from `view`, is `primary`.
pub fn key_with_primary(view: &Arc<CacheNode>, primary: &NodeId, prefix: &str) -> Bytes {
    let snapshot = view.topology.snapshot();
    for i in 0..1_000_000u64 {
        let key = Bytes::from(format!("{prefix}-{i}"));
        let partition = view.data.partition_of(&key);
        if snapshot.primary(partition) == Some(primary) {
            return key;
        }
    }
    panic!("no key found with {prefix:?} whose primary is {primary}");
}

/// Reads the raw version and value stored for a key on one node, bypassing
/// ownership checks.
pub async fn raw_entry(node: &Arc<CacheNode>, key: &Bytes) -> Option<(CacheVersion, Option<Bytes>)> {
    let entry = node.data.partition_for_key(key).peek(key)?;
    let guard = entry.state().lock_owned().await;
    Some((guard.version(), guard.raw_value().cloned()))
}
