// src/core/cluster/topology.rs

//! Tracks partition ownership per topology version.
//!
//! Every membership change produces a fresh immutable [`TopologySnapshot`]
//! under the topology write lock; update paths take the read lock, clone the
//! `Arc`, and work against a consistent view for the rest of the request.

use crate::core::cluster::affinity;
use crate::core::cluster::node::{ClusterNode, NodeId};
use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;
use tracing::{debug, info};

/// An immutable view of partition ownership at one topology version.
#[derive(Debug)]
pub struct TopologySnapshot {
    /// Monotonic version advanced by every membership change.
    pub version: u64,
    /// The membership at this version, sorted by node id. A node's position
    /// in this list is its `node_order`.
    pub nodes: Vec<ClusterNode>,
    owners: Vec<Vec<NodeId>>,
}

impl TopologySnapshot {
    /// The ordered owner list of a partition; position 0 is the primary.
    pub fn owners(&self, partition: u32) -> &[NodeId] {
        &self.owners[partition as usize]
    }

    /// The primary owner of a partition, if the partition has any owner.
    pub fn primary(&self, partition: u32) -> Option<&NodeId> {
        self.owners[partition as usize].first()
    }

    /// Whether `node` owns `partition` in any role at this version.
    pub fn is_owner(&self, partition: u32, node: &NodeId) -> bool {
        self.owners[partition as usize].iter().any(|id| id == node)
    }

    /// The ordinal of `node` in the membership at this version.
    pub fn node_order(&self, node: &NodeId) -> Option<u32> {
        self.nodes
            .iter()
            .position(|n| &n.id == node)
            .map(|idx| idx as u32)
    }

    pub fn contains(&self, node: &NodeId) -> bool {
        self.nodes.iter().any(|n| &n.id == node)
    }
}

/// The rebalance gate of a single partition. While a partition is moving,
/// update requests against it suspend until the preloader finishes.
#[derive(Debug, Default)]
struct PartitionGate {
    moving: AtomicBool,
    notify: Notify,
}

/// `PartitionTopology` owns the current snapshot and the per-partition
/// rebalance gates.
#[derive(Debug)]
pub struct PartitionTopology {
    partitions: u32,
    backups: usize,
    snapshot: RwLock<Arc<TopologySnapshot>>,
    gates: Vec<PartitionGate>,
    changed: Notify,
}

impl PartitionTopology {
    pub fn new(partitions: u32, backups: usize) -> Self {
        let initial = Arc::new(TopologySnapshot {
            version: 0,
            nodes: Vec::new(),
            owners: vec![Vec::new(); partitions as usize],
        });
        Self {
            partitions,
            backups,
            snapshot: RwLock::new(initial),
            gates: (0..partitions).map(|_| PartitionGate::default()).collect(),
            changed: Notify::new(),
        }
    }

    pub fn partitions(&self) -> u32 {
        self.partitions
    }

    /// The current snapshot. Taken under the read lock; the returned `Arc`
    /// stays valid for the whole request even if the topology moves on.
    pub fn snapshot(&self) -> Arc<TopologySnapshot> {
        self.snapshot.read().clone()
    }

    pub fn version(&self) -> u64 {
        self.snapshot.read().version
    }

    /// Applies a membership list observed at the given topology version and
    /// recomputes the owner assignment. Holds the write lock only for the
    /// snapshot swap. Stale applications (version not above the current one)
    /// are ignored, so replayed events cannot move the topology backwards.
    pub fn apply_membership(&self, version: u64, nodes: Vec<ClusterNode>) -> Arc<TopologySnapshot> {
        let owners = affinity::assign_owners(&nodes, self.partitions, self.backups);
        let mut guard = self.snapshot.write();
        if version <= guard.version {
            return guard.clone();
        }
        let next = Arc::new(TopologySnapshot {
            version,
            nodes,
            owners,
        });
        *guard = next.clone();
        drop(guard);
        self.changed.notify_waiters();
        info!(
            "Topology advanced to version {} with {} nodes",
            next.version,
            next.nodes.len()
        );
        next
    }

    /// Suspends until the topology version exceeds `version`. Used by the
    /// near coordinator to re-map remapped keys against a newer topology
    /// instead of spinning on the stale one.
    pub async fn await_version_above(&self, version: u64) {
        loop {
            let notified = self.changed.notified();
            if self.version() > version {
                return;
            }
            notified.await;
        }
    }

    /// Marks a partition as being rebalanced. Update requests will suspend in
    /// [`PartitionTopology::await_ready`] until the move finishes.
    pub fn begin_rebalance(&self, partition: u32) {
        debug!("Partition {partition} entering MOVING state");
        self.gates[partition as usize]
            .moving
            .store(true, Ordering::Release);
    }

    /// Marks a rebalance as finished and wakes every suspended request.
    pub fn finish_rebalance(&self, partition: u32) {
        let gate = &self.gates[partition as usize];
        gate.moving.store(false, Ordering::Release);
        gate.notify.notify_waiters();
        debug!("Partition {partition} back to OWNING state");
    }

    pub fn is_moving(&self, partition: u32) -> bool {
        self.gates[partition as usize].moving.load(Ordering::Acquire)
    }

    /// Suspends until the partition is out of its MOVING state. This is a
    /// suspension point: no locks are held while waiting.
    pub async fn await_ready(&self, partition: u32) {
        let gate = &self.gates[partition as usize];
        loop {
            let notified = gate.notify.notified();
            if !gate.moving.load(Ordering::Acquire) {
                return;
            }
            notified.await;
        }
    }
}
