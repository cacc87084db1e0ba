// src/core/storage/entry.rs

//! Defines `CacheEntry`, the per-key unit of storage, and the version-checked
//! entry update rule.

use crate::core::version::{CacheVersion, ConflictResolver};
use bytes::Bytes;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// A resolved write against a single entry, after any transform has been
/// evaluated: either a new value or a removal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryOp {
    Update(Bytes),
    Delete,
}

/// The result of running the entry update rule.
#[derive(Debug, Clone)]
pub struct UpdateOutcome {
    /// Whether the write was applied. `false` means it was subsumed by a
    /// newer version already present on the entry.
    pub applied: bool,
    /// The value held by the entry before the rule ran.
    pub old_value: Option<Bytes>,
    /// Whether this apply turned the entry into a tombstone.
    pub tombstone: bool,
}

/// The mutable state of an entry, only ever touched under the entry lock.
#[derive(Debug)]
pub struct EntryState {
    value: Option<Bytes>,
    version: CacheVersion,
    create_time: Instant,
    ttl: Option<Duration>,
    expire_at: Option<Instant>,
    obsolete: bool,
    deleted: bool,
}

impl EntryState {
    fn new() -> Self {
        Self {
            value: None,
            version: CacheVersion::ZERO,
            create_time: Instant::now(),
            ttl: None,
            expire_at: None,
            obsolete: false,
            deleted: false,
        }
    }

    /// The live value of the entry, hiding tombstones and expired values.
    pub fn current_value(&self, now: Instant) -> Option<&Bytes> {
        if self.deleted || self.obsolete || self.is_expired(now) {
            return None;
        }
        self.value.as_ref()
    }

    pub fn raw_value(&self) -> Option<&Bytes> {
        self.value.as_ref()
    }

    pub fn version(&self) -> CacheVersion {
        self.version
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    pub fn create_time(&self) -> Instant {
        self.create_time
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.expire_at.is_some_and(|at| at <= now)
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn is_obsolete(&self) -> bool {
        self.obsolete
    }

    /// Marks the entry obsolete. Once set the entry is never reanimated; the
    /// key may only be re-inserted by creating a fresh entry.
    pub fn mark_obsolete(&mut self) {
        self.obsolete = true;
    }

    /// Runs the entry update rule.
    ///
    /// With `check_version` set (CLOCK ordering on primaries, always on
    /// backups), the incoming version is compared to the current one and a
    /// write that does not supersede it is discarded: the entry is left
    /// untouched and the caller reports the current value as the outcome.
    /// Cross-data-center pairs, which are not directly orderable, are settled
    /// by the resolver.
    pub fn apply(
        &mut self,
        op: &EntryOp,
        version: CacheVersion,
        ttl: Option<Duration>,
        check_version: bool,
        resolver: &dyn ConflictResolver,
    ) -> UpdateOutcome {
        let old_value = self.value.clone();

        if check_version && !self.version.is_zero() {
            let incoming_wins = match version.try_compare(&self.version) {
                Some(ord) => ord == std::cmp::Ordering::Greater,
                None => resolver.incoming_wins(&self.version, &version),
            };
            if !incoming_wins {
                return UpdateOutcome {
                    applied: false,
                    old_value,
                    tombstone: false,
                };
            }
        }

        let now = Instant::now();
        match op {
            EntryOp::Update(value) => {
                self.value = Some(value.clone());
                self.deleted = false;
                self.create_time = now;
                self.ttl = ttl;
                self.expire_at = ttl.map(|t| now + t);
            }
            EntryOp::Delete => {
                self.value = None;
                self.deleted = true;
                self.ttl = None;
                self.expire_at = None;
            }
        }
        self.version = version;

        UpdateOutcome {
            applied: true,
            old_value,
            tombstone: self.deleted,
        }
    }
}

/// A single cache entry. The state is guarded by an owned async mutex so
/// multi-entry batches can hold guards across suspension points.
#[derive(Debug)]
pub struct CacheEntry {
    pub key: Bytes,
    pub partition: u32,
    state: Arc<Mutex<EntryState>>,
}

impl CacheEntry {
    pub fn new(key: Bytes, partition: u32) -> Self {
        Self {
            key,
            partition,
            state: Arc::new(Mutex::new(EntryState::new())),
        }
    }

    /// The lock handle; cloned so guards can be held as owned values.
    pub fn state(&self) -> Arc<Mutex<EntryState>> {
        self.state.clone()
    }
}
