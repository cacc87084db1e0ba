// src/core/tasks/expiration.rs

//! The active TTL expiration sweeper. On primary-owned partitions expired
//! entries become tombstones with a fresh version from the local domain and
//! flow through the same deferred-delete discipline as removed entries; on
//! backup-owned partitions they are reclaimed in place, since backup
//! versions must stay primary-assigned.

use crate::core::metrics;
use crate::core::state::CacheNode;
use crate::core::storage::entry::EntryOp;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Runs the sweeper loop until shutdown.
pub async fn run(node: Arc<CacheNode>, mut shutdown_rx: broadcast::Receiver<()>) {
    info!("TTL expiration sweeper started.");
    let mut interval = tokio::time::interval(node.config.expiration_interval);

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("TTL expiration sweeper shutting down.");
                return;
            }
            _ = interval.tick() => {
                sweep(&node).await;
            }
        }
    }
}

/// One sweep over every resident partition.
async fn sweep(node: &Arc<CacheNode>) {
    let now = Instant::now();
    let mut purged = 0u64;

    for partition in 0..node.topology.partitions() {
        let store = node.data.partition(partition);
        if store.is_empty() {
            continue;
        }
        for entry in store.entries() {
            // Cheap peek; entries busy under an update are skipped and
            // caught on a later sweep.
            let Ok(guard) = entry.state().try_lock_owned() else {
                continue;
            };
            let expired = guard.is_expired(now) && !guard.is_deleted() && !guard.is_obsolete();
            drop(guard);
            if expired && purge(node, &entry.key).await {
                purged += 1;
            }
        }
    }

    if purged > 0 {
        debug!("Purged {purged} expired entries.");
    }
}

/// Re-locks the entry properly and disposes of it if it is still expired.
///
/// Only the primary of the owning partition stamps a tombstone version;
/// backups must keep every version primary-assigned, or a self-stamped
/// purge could outrun the primary's counter and reject its next replicated
/// write. On backup-owned partitions the expired entry (already hidden from
/// reads) is reclaimed by marking it obsolete and dropping it from the map,
/// leaving the version untouched.
async fn purge(node: &Arc<CacheNode>, key: &Bytes) -> bool {
    let Ok(mut locked) = node.data.lock_entry(key, 1).await else {
        return false;
    };
    let now = Instant::now();
    if !locked.guard.is_expired(now) || locked.guard.is_deleted() {
        node.data.release(vec![locked]);
        return false;
    }

    let partition = locked.entry.partition;
    let is_primary = node.topology.snapshot().primary(partition) == Some(node.id());
    if is_primary {
        let version = node.versions.next();
        locked
            .guard
            .apply(&EntryOp::Delete, version, None, false, node.resolver());
        node.data.release(vec![locked]);
    } else {
        locked.guard.mark_obsolete();
        let stale = locked.entry.clone();
        drop(locked);
        node.data.partition(partition).replace_obsolete(key, &stale);
    }
    metrics::EXPIRED_ENTRIES_TOTAL.inc();
    true
}
