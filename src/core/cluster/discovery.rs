// src/core/cluster/discovery.rs

//! The discovery collaborator: publishes the current membership list and
//! raises node-join / node-left / node-failed events.

use crate::core::cluster::node::{ClusterNode, NodeId};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

/// The capacity of the membership event channel. Membership changes are rare;
/// a small buffer is enough as long as listeners drain promptly.
const MEMBERSHIP_BUS_CAPACITY: usize = 64;

/// A membership change raised by discovery. Every event carries the topology
/// version it advanced the cluster to, so all nodes agree on versions without
/// further coordination.
#[derive(Debug, Clone)]
pub struct MembershipEvent {
    pub topology_version: u64,
    pub kind: MembershipEventKind,
}

#[derive(Debug, Clone)]
pub enum MembershipEventKind {
    Joined(ClusterNode),
    Left(NodeId),
    Failed(NodeId),
}

/// The narrow interface the update pipeline consumes from the discovery
/// service.
pub trait Discovery: Send + Sync {
    /// The current topology version together with the membership list,
    /// sorted by node id.
    fn topology(&self) -> (u64, Vec<ClusterNode>);

    /// Subscribes to membership change events.
    fn subscribe(&self) -> broadcast::Receiver<MembershipEvent>;
}

#[derive(Debug, Default)]
struct DirectoryState {
    topology_version: u64,
    nodes: Vec<ClusterNode>,
}

/// An in-process discovery implementation backed by a shared directory.
///
/// All engines of a simulated cluster hold the same [`ClusterDirectory`];
/// joining or removing a node advances the topology version and fans the
/// event out to every subscriber.
#[derive(Debug)]
pub struct ClusterDirectory {
    state: Mutex<DirectoryState>,
    events: broadcast::Sender<MembershipEvent>,
}

impl Default for ClusterDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl ClusterDirectory {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(MEMBERSHIP_BUS_CAPACITY);
        Self {
            state: Mutex::new(DirectoryState::default()),
            events,
        }
    }

    /// Registers a node and announces it to all subscribers.
    pub fn join(&self, node: ClusterNode) {
        let version = {
            let mut state = self.state.lock();
            state.nodes.retain(|n| n.id != node.id);
            state.nodes.push(node.clone());
            state.nodes.sort_by(|a, b| a.id.cmp(&b.id));
            state.topology_version += 1;
            state.topology_version
        };
        info!(
            "Node {} joined the cluster at topology version {}",
            node.id.short(),
            version
        );
        let _ = self.events.send(MembershipEvent {
            topology_version: version,
            kind: MembershipEventKind::Joined(node),
        });
    }

    /// Removes a node that stopped gracefully.
    pub fn leave(&self, id: &NodeId) {
        if let Some(version) = self.remove(id) {
            info!("Node {} left the cluster at topology version {}", id.short(), version);
            let _ = self.events.send(MembershipEvent {
                topology_version: version,
                kind: MembershipEventKind::Left(id.clone()),
            });
        }
    }

    /// Removes a node that was declared failed.
    pub fn fail(&self, id: &NodeId) {
        if let Some(version) = self.remove(id) {
            info!(
                "Node {} declared failed at topology version {}",
                id.short(),
                version
            );
            let _ = self.events.send(MembershipEvent {
                topology_version: version,
                kind: MembershipEventKind::Failed(id.clone()),
            });
        }
    }

    fn remove(&self, id: &NodeId) -> Option<u64> {
        let mut state = self.state.lock();
        let before = state.nodes.len();
        state.nodes.retain(|n| &n.id != id);
        if state.nodes.len() == before {
            return None;
        }
        state.topology_version += 1;
        Some(state.topology_version)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.state.lock().nodes.iter().any(|n| &n.id == id)
    }
}

/// The [`Discovery`] handle a single engine holds onto a shared directory.
#[derive(Clone)]
pub struct StaticDiscovery {
    directory: Arc<ClusterDirectory>,
}

impl StaticDiscovery {
    pub fn new(directory: Arc<ClusterDirectory>) -> Self {
        Self { directory }
    }

    pub fn directory(&self) -> &Arc<ClusterDirectory> {
        &self.directory
    }
}

impl Discovery for StaticDiscovery {
    fn topology(&self) -> (u64, Vec<ClusterNode>) {
        let state = self.directory.state.lock();
        (state.topology_version, state.nodes.clone())
    }

    fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.directory.events.subscribe()
    }
}
