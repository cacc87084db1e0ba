// src/core/cluster/affinity.rs

//! Implements the affinity function: key to partition, and partition to an
//! ordered list of owning nodes.

use crate::core::cluster::node::{ClusterNode, NodeId};
use bytes::Bytes;
use crc::{CRC_16_USB, CRC_64_ECMA_182, Crc};

/// The CRC16 algorithm used for mapping keys onto partitions.
const CRC16_ALGO: Crc<u16> = Crc::<u16>::new(&CRC_16_USB);

/// The CRC64 algorithm used for rendezvous scoring of (node, partition) pairs.
const CRC64_ALGO: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

/// Calculates the partition for a given key.
///
/// If the key contains a "hash tag" (a substring enclosed in `{...}`), only
/// the content within the tag is hashed. This allows callers to force
/// related keys into the same partition. Otherwise the entire key is used.
pub fn partition(key: &Bytes, partitions: u32) -> u32 {
    if let Some(start) = key.iter().position(|&b| b == b'{')
        && let Some(end_offset) = key[start + 1..].iter().position(|&b| b == b'}')
    {
        let end = start + 1 + end_offset;
        // Ensure the tag is not empty, e.g., "user:{}".
        if end > start + 1 {
            return u32::from(CRC16_ALGO.checksum(&key[start + 1..end])) % partitions;
        }
    }
    u32::from(CRC16_ALGO.checksum(key)) % partitions
}

/// Scores a (node, partition) pair for rendezvous hashing. Every node
/// computes identical scores, so the resulting owner lists agree cluster-wide
/// without coordination.
fn rendezvous_score(node: &NodeId, part: u32) -> u64 {
    let mut digest = CRC64_ALGO.digest();
    digest.update(node.as_bytes());
    digest.update(&part.to_le_bytes());
    digest.finalize()
}

/// Computes the ordered owner list for a single partition: position 0 is the
/// primary, the following `backups` entries (at most) are backups.
pub fn owners_of(nodes: &[ClusterNode], part: u32, backups: usize) -> Vec<NodeId> {
    let mut scored: Vec<(u64, &NodeId)> = nodes
        .iter()
        .filter(|n| n.is_alive())
        .map(|n| (rendezvous_score(&n.id, part), &n.id))
        .collect();
    // Highest score wins; node id breaks ties so the order is total.
    scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(b.1)));
    scored
        .into_iter()
        .take(1 + backups)
        .map(|(_, id)| id.clone())
        .collect()
}

/// Computes the full owner assignment for all partitions against a membership
/// list.
pub fn assign_owners(nodes: &[ClusterNode], partitions: u32, backups: usize) -> Vec<Vec<NodeId>> {
    (0..partitions)
        .map(|part| owners_of(nodes, part, backups))
        .collect()
}
