// src/core/storage/partition.rs

//! Defines `PartitionStore`, the per-partition key-to-entry map, and the
//! multi-entry locking policy used by batched updates.

use crate::core::cluster::affinity;
use crate::core::errors::OpalDBError;
use crate::core::storage::deferred::TombstoneQueue;
use crate::core::storage::entry::{CacheEntry, EntryState};
use crate::core::version::CacheVersion;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::OwnedMutexGuard;
use tracing::trace;

/// An entry together with its held lock guard. Guards are owned so a batch
/// can carry them across suspension points.
pub struct LockedEntry {
    pub entry: Arc<CacheEntry>,
    pub guard: OwnedMutexGuard<EntryState>,
}

/// A single partition: a concurrent map from key to entry.
#[derive(Debug)]
pub struct PartitionStore {
    pub id: u32,
    entries: DashMap<Bytes, Arc<CacheEntry>>,
}

impl PartitionStore {
    fn new(id: u32) -> Self {
        Self {
            id,
            entries: DashMap::new(),
        }
    }

    /// Looks up an existing entry.
    pub fn peek(&self, key: &Bytes) -> Option<Arc<CacheEntry>> {
        self.entries.get(key).map(|e| e.value().clone())
    }

    /// Looks up an entry, creating a fresh one if the key is absent or the
    /// resident entry has been made obsolete.
    pub fn resolve_or_create(&self, key: &Bytes) -> Arc<CacheEntry> {
        self.entries
            .entry(key.clone())
            .or_insert_with(|| Arc::new(CacheEntry::new(key.clone(), self.id)))
            .value()
            .clone()
    }

    /// Replaces an obsolete resident entry with a fresh one. Used by the
    /// locking retry loop after it observes an obsolete entry.
    pub fn replace_obsolete(&self, key: &Bytes, stale: &Arc<CacheEntry>) {
        self.entries.remove_if(key, |_, resident| {
            Arc::ptr_eq(resident, stale)
        });
    }

    /// Removes a tombstoned entry from the map, provided the stored version
    /// still matches. The entry is marked obsolete under its lock first, so
    /// no concurrent update can resurrect it.
    pub async fn collect_tombstone(&self, key: &Bytes, version: &CacheVersion) -> bool {
        let Some(entry) = self.peek(key) else {
            return false;
        };
        let mut guard = entry.state().lock_owned().await;
        if !guard.is_deleted() || guard.is_obsolete() || guard.version() != *version {
            return false;
        }
        guard.mark_obsolete();
        drop(guard);
        self.entries
            .remove_if(key, |_, resident| Arc::ptr_eq(resident, &entry));
        true
    }

    /// The number of resident entries, tombstones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot of resident entries; used by background sweepers.
    pub fn entries(&self) -> Vec<Arc<CacheEntry>> {
        self.entries.iter().map(|e| e.value().clone()).collect()
    }
}

/// The local entry storage of one node: all partitions plus the tombstone
/// queue fed on unlock.
#[derive(Debug)]
pub struct CacheData {
    partitions: Vec<Arc<PartitionStore>>,
    partition_count: u32,
    pub tombstones: TombstoneQueue,
}

impl CacheData {
    pub fn new(partition_count: u32, tombstones: TombstoneQueue) -> Self {
        Self {
            partitions: (0..partition_count)
                .map(|id| Arc::new(PartitionStore::new(id)))
                .collect(),
            partition_count,
            tombstones,
        }
    }

    pub fn partition(&self, id: u32) -> &Arc<PartitionStore> {
        &self.partitions[id as usize]
    }

    pub fn partition_of(&self, key: &Bytes) -> u32 {
        affinity::partition(key, self.partition_count)
    }

    pub fn partition_for_key(&self, key: &Bytes) -> &Arc<PartitionStore> {
        self.partition(self.partition_of(key))
    }

    /// Locks one entry, creating it if needed. The single-key fast path of
    /// the batched policy below.
    pub async fn lock_entry(&self, key: &Bytes, retry_limit: u32) -> Result<LockedEntry, OpalDBError> {
        let store = self.partition_for_key(key);
        for _ in 0..retry_limit {
            let entry = store.resolve_or_create(key);
            let guard = entry.state().lock_owned().await;
            if guard.is_obsolete() {
                drop(guard);
                store.replace_obsolete(key, &entry);
                continue;
            }
            return Ok(LockedEntry { entry, guard });
        }
        Err(OpalDBError::EntryRemoved)
    }

    /// Locks a batch of entries.
    ///
    /// Monitors are acquired in the order given by the request's key list;
    /// every caller uses that same canonical order, which rules out lock
    /// cycles. If any entry is observed obsolete while locking the prefix,
    /// every guard acquired so far is released and the whole list is retried
    /// from scratch. Obsolete transitions are monotonic, so the retry loop
    /// converges; a fixed cap turns pathological churn into `EntryRemoved`.
    ///
    /// Keys must be distinct; requests are built from maps so duplicates
    /// cannot occur.
    pub async fn lock_entries(
        &self,
        keys: &[Bytes],
        retry_limit: u32,
    ) -> Result<Vec<LockedEntry>, OpalDBError> {
        if let [key] = keys {
            return Ok(vec![self.lock_entry(key, retry_limit).await?]);
        }

        'restart: for attempt in 0..retry_limit {
            if attempt > 0 {
                trace!("Retrying batch lock acquisition, attempt {attempt}");
            }
            let mut locked = Vec::with_capacity(keys.len());
            for key in keys {
                let store = self.partition_for_key(key);
                let entry = store.resolve_or_create(key);
                let guard = entry.state().lock_owned().await;
                if guard.is_obsolete() {
                    drop(guard);
                    store.replace_obsolete(key, &entry);
                    // Drop the whole prefix and start over.
                    drop(locked);
                    continue 'restart;
                }
                locked.push(LockedEntry { entry, guard });
            }
            return Ok(locked);
        }
        Err(OpalDBError::EntryRemoved)
    }

    /// Releases a batch of locked entries: tombstone records are collected
    /// under the locks, the guards are dropped, and only then are the
    /// tombstones enqueued for deferred deletion.
    pub fn release(&self, locked: Vec<LockedEntry>) {
        let mut pending = Vec::new();
        for le in locked {
            if le.guard.is_deleted() && !le.guard.is_obsolete() {
                pending.push((le.entry.partition, le.entry.key.clone(), le.guard.version()));
            }
            drop(le.guard);
        }
        for (partition, key, version) in pending {
            self.tombstones.enqueue(partition, key, version);
        }
    }

    /// A consistent local read: takes the entry lock so concurrent writers
    /// cannot be observed mid-update.
    pub async fn read_value(&self, key: &Bytes) -> Option<Bytes> {
        let entry = self.partition_for_key(key).peek(key)?;
        let guard = entry.state().lock_owned().await;
        guard.current_value(Instant::now()).cloned()
    }
}
