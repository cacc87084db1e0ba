// src/core/version.rs

//! The ordered version domain used to serialize concurrent updates and
//! resolve write conflicts.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering as AtomicOrdering};

/// A totally-ordered write stamp assigned by a primary at apply time.
///
/// Ordering is lexicographic on `(topology_version, order, node_order)`.
/// Two versions are comparable only when their `data_center_id` matches;
/// cross-data-center pairs are settled by a [`ConflictResolver`].
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    bincode::Encode,
    bincode::Decode,
)]
pub struct CacheVersion {
    /// The topology version the stamping node observed at apply time.
    pub topology_version: u64,
    /// A strictly increasing per-node counter.
    pub order: u64,
    /// The ordinal of the stamping node in the membership at that topology version.
    pub node_order: u32,
    /// The data center the stamping node belongs to.
    pub data_center_id: u8,
}

impl CacheVersion {
    /// The version carried by an entry that has never been written.
    pub const ZERO: CacheVersion = CacheVersion {
        topology_version: 0,
        order: 0,
        node_order: 0,
        data_center_id: 0,
    };

    /// Compares two versions, returning `None` when they belong to different
    /// data centers and are therefore not directly orderable.
    pub fn try_compare(&self, other: &CacheVersion) -> Option<Ordering> {
        if self.data_center_id != other.data_center_id {
            return None;
        }
        Some(
            self.topology_version
                .cmp(&other.topology_version)
                .then(self.order.cmp(&other.order))
                .then(self.node_order.cmp(&other.node_order)),
        )
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }
}

impl std::fmt::Display for CacheVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[topVer={}, order={}, nodeOrder={}, dc={}]",
            self.topology_version, self.order, self.node_order, self.data_center_id
        )
    }
}

/// Decides whether an incoming cross-data-center write supersedes the
/// currently stored one. The engine consults it only when
/// [`CacheVersion::try_compare`] returns `None`.
pub trait ConflictResolver: Send + Sync {
    /// Returns `true` when the incoming version must replace the current one.
    fn incoming_wins(&self, current: &CacheVersion, incoming: &CacheVersion) -> bool;
}

/// The default resolver: higher per-node order wins, ties broken by the
/// numerically higher data center id.
#[derive(Debug, Default)]
pub struct OrderWinsResolver;

impl ConflictResolver for OrderWinsResolver {
    fn incoming_wins(&self, current: &CacheVersion, incoming: &CacheVersion) -> bool {
        match incoming.order.cmp(&current.order) {
            Ordering::Greater => true,
            Ordering::Less => false,
            Ordering::Equal => incoming.data_center_id > current.data_center_id,
        }
    }
}

/// Produces monotonically increasing [`CacheVersion`] stamps for the local node.
///
/// The topology listener refreshes `topology_version` and `node_order` on
/// every membership change; `order` only ever moves forward.
#[derive(Debug)]
pub struct VersionDomain {
    topology_version: AtomicU64,
    order: AtomicU64,
    node_order: AtomicU32,
    data_center_id: u8,
}

impl VersionDomain {
    pub fn new(data_center_id: u8) -> Self {
        Self {
            topology_version: AtomicU64::new(0),
            order: AtomicU64::new(0),
            node_order: AtomicU32::new(0),
            data_center_id,
        }
    }

    /// Issues the next write version. Strictly increasing per node.
    pub fn next(&self) -> CacheVersion {
        CacheVersion {
            topology_version: self.topology_version.load(AtomicOrdering::Acquire),
            order: self.order.fetch_add(1, AtomicOrdering::AcqRel) + 1,
            node_order: self.node_order.load(AtomicOrdering::Acquire),
            data_center_id: self.data_center_id,
        }
    }

    /// Called by the membership listener after a topology change settles.
    pub fn on_topology_change(&self, topology_version: u64, node_order: u32) {
        self.topology_version
            .store(topology_version, AtomicOrdering::Release);
        self.node_order.store(node_order, AtomicOrdering::Release);
    }

    /// Observes a remote version so locally issued orders stay ahead of any
    /// version this node has already applied.
    pub fn observe(&self, remote: &CacheVersion) {
        let mut current = self.order.load(AtomicOrdering::Acquire);
        while current < remote.order {
            match self.order.compare_exchange_weak(
                current,
                remote.order,
                AtomicOrdering::AcqRel,
                AtomicOrdering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }

    pub fn data_center_id(&self) -> u8 {
        self.data_center_id
    }
}
