// src/core/storage/deferred.rs

//! The deferred-delete queue. Tombstoned entries keep their version for
//! conflict resolution until the garbage collector disposes of them.

use crate::core::version::CacheVersion;
use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;
use tokio::sync::mpsc;

/// A record of an entry that left the locked region as a tombstone.
#[derive(Debug)]
pub struct Tombstone {
    pub partition: u32,
    pub key: Bytes,
    pub version: CacheVersion,
    pub queued_at: Instant,
}

/// The producer half of the deferred-delete queue. Enqueueing never blocks;
/// the garbage collector drains in arrival (and therefore age) order.
#[derive(Debug, Clone)]
pub struct TombstoneQueue {
    tx: mpsc::UnboundedSender<Tombstone>,
    queued: Arc<AtomicUsize>,
}

impl TombstoneQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Tombstone>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                queued: Arc::new(AtomicUsize::new(0)),
            },
            rx,
        )
    }

    /// Enqueues a tombstone for eventual collection. Must be called outside
    /// the entry lock region.
    pub fn enqueue(&self, partition: u32, key: Bytes, version: CacheVersion) {
        let tombstone = Tombstone {
            partition,
            key,
            version,
            queued_at: Instant::now(),
        };
        if self.tx.send(tombstone).is_ok() {
            self.queued.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// The number of tombstones currently awaiting collection.
    pub fn len(&self) -> usize {
        self.queued.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Called by the collector after disposing of one tombstone.
    pub(crate) fn mark_collected(&self) {
        self.queued.fetch_sub(1, Ordering::Relaxed);
    }
}
