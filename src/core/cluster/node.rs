// src/core/cluster/node.rs

//! Node identity and per-node metadata shared through discovery.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The unique 40-character hexadecimal run id of a cluster node.
#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    bincode::Encode,
    bincode::Decode,
)]
pub struct NodeId(String);

impl NodeId {
    /// Generates a fresh random node id.
    pub fn random() -> Self {
        let mut raw = [0u8; 20];
        // getrandom only fails on broken platforms; an id is required to boot.
        getrandom::fill(&mut raw).expect("OS random source unavailable");
        Self(hex::encode(raw))
    }

    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    /// The truncated form used in log output.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(8)]
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

bitflags! {
    /// Flags representing the state of a cluster node as seen by discovery.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    pub struct NodeFlags: u16 {
        const MYSELF  = 1 << 0;  // The node is this engine instance.
        const ALIVE   = 1 << 1;  // The node participates in affinity.
        const LEAVING = 1 << 2;  // The node announced a graceful stop.
        const FAILED  = 1 << 3;  // The node was declared failed by discovery.
    }
}

/// Represents the static identity of a node as published by discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct ClusterNode {
    pub id: NodeId,
    /// Optional human-readable name used in log output.
    pub name: Option<String>,
    /// The data center this node belongs to.
    pub data_center_id: u8,
    pub flags_raw: u16,
}

impl ClusterNode {
    pub fn new(id: NodeId, name: Option<String>, data_center_id: u8) -> Self {
        Self {
            id,
            name,
            data_center_id,
            flags_raw: NodeFlags::ALIVE.bits(),
        }
    }

    /// Gets the state flags for this node.
    pub fn get_flags(&self) -> NodeFlags {
        NodeFlags::from_bits_truncate(self.flags_raw)
    }

    /// Sets the state flags for this node.
    pub fn set_flags(&mut self, flags: NodeFlags) {
        self.flags_raw = flags.bits();
    }

    pub fn is_alive(&self) -> bool {
        let flags = self.get_flags();
        flags.contains(NodeFlags::ALIVE) && !flags.intersects(NodeFlags::FAILED)
    }
}
