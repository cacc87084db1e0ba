// src/core/atomic/deferred_ack.rs

//! The deferred-ack aggregator. On each backup, acknowledgments owed to one
//! primary are coalesced into a single datagram, flushed when the buffer
//! crosses its capacity threshold or when the flush timer fires.

use crate::core::atomic::messages::{CacheMessage, DhtDeferredAckResponse};
use crate::core::cluster::node::NodeId;
use crate::core::metrics;
use crate::core::timer::{TimerId, TimerService};
use crate::core::transport::Transport;
use crate::core::version::CacheVersion;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Stripe count for concurrent adds into one buffer.
const ACK_STRIPES: usize = 8;

enum AddResult {
    Added,
    /// The add crossed the capacity threshold; the caller must flush.
    Threshold,
    /// The buffer was already sealed; the caller must start a fresh one.
    Sealed,
}

/// A buffer of future versions owed to one primary.
///
/// Adds run under the read half of the seal lock and append into stripes;
/// the single flusher takes the write half, seals the buffer, and drains all
/// stripes. The sealed flag guarantees every version is shipped exactly once:
/// once sealed, additions are refused and the caller creates a fresh buffer.
struct AckBuffer {
    generation: u64,
    created: Instant,
    seal_lock: RwLock<()>,
    stripes: [Mutex<Vec<CacheVersion>>; ACK_STRIPES],
    next_stripe: AtomicUsize,
    count: AtomicUsize,
    sealed: AtomicBool,
}

impl AckBuffer {
    fn new(generation: u64) -> Self {
        Self {
            generation,
            created: Instant::now(),
            seal_lock: RwLock::new(()),
            stripes: std::array::from_fn(|_| Mutex::new(Vec::new())),
            next_stripe: AtomicUsize::new(0),
            count: AtomicUsize::new(0),
            sealed: AtomicBool::new(false),
        }
    }

    fn try_add(&self, version: CacheVersion, threshold: usize) -> AddResult {
        let _adds = self.seal_lock.read();
        if self.sealed.load(Ordering::Acquire) {
            return AddResult::Sealed;
        }
        let idx = self.next_stripe.fetch_add(1, Ordering::Relaxed) % ACK_STRIPES;
        self.stripes[idx].lock().push(version);
        let filled = self.count.fetch_add(1, Ordering::AcqRel) + 1;
        if filled >= threshold {
            AddResult::Threshold
        } else {
            AddResult::Added
        }
    }

    /// Seals the buffer and drains every stripe. Returns `None` when another
    /// flusher got here first.
    fn seal_and_drain(&self) -> Option<Vec<CacheVersion>> {
        let _flush = self.seal_lock.write();
        if self.sealed.swap(true, Ordering::AcqRel) {
            return None;
        }
        let mut versions = Vec::with_capacity(self.count.load(Ordering::Acquire));
        for stripe in &self.stripes {
            versions.append(&mut stripe.lock());
        }
        Some(versions)
    }
}

/// Coalesces deferred acknowledgments per remote primary.
pub struct DeferredAckAggregator {
    buffers: DashMap<NodeId, Arc<AckBuffer>>,
    generation: AtomicU64,
    buffer_size: usize,
    timeout: Duration,
    transport: Arc<dyn Transport>,
    timers: Arc<TimerService>,
}

impl DeferredAckAggregator {
    pub fn new(
        buffer_size: usize,
        timeout: Duration,
        transport: Arc<dyn Transport>,
        timers: Arc<TimerService>,
    ) -> Self {
        Self {
            buffers: DashMap::new(),
            generation: AtomicU64::new(0),
            buffer_size,
            timeout,
            transport,
            timers,
        }
    }

    fn timer_id(primary: &NodeId, generation: u64) -> TimerId {
        TimerId::new(primary.as_str(), generation)
    }

    /// Records one future version owed to `primary`. Flushes inline when the
    /// buffer crosses its capacity threshold.
    pub async fn add(self: &Arc<Self>, primary: &NodeId, version: CacheVersion) {
        loop {
            let buffer = self.resolve_buffer(primary);
            match buffer.try_add(version, self.buffer_size) {
                AddResult::Added => return,
                AddResult::Threshold => {
                    self.flush(primary, &buffer).await;
                    return;
                }
                AddResult::Sealed => {
                    // A flush already claimed this buffer; detach it and
                    // retry against a fresh one.
                    self.buffers
                        .remove_if(primary, |_, resident| Arc::ptr_eq(resident, &buffer));
                }
            }
        }
    }

    fn resolve_buffer(self: &Arc<Self>, primary: &NodeId) -> Arc<AckBuffer> {
        if let Some(existing) = self.buffers.get(primary) {
            return existing.value().clone();
        }
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let buffer = self
            .buffers
            .entry(primary.clone())
            .or_insert_with(|| Arc::new(AckBuffer::new(generation)))
            .value()
            .clone();
        // Only the creator schedules the flush timer for its generation.
        if buffer.generation == generation {
            let aggregator = self.clone();
            let target = primary.clone();
            let timer_buffer = buffer.clone();
            self.timers.schedule(
                Self::timer_id(primary, generation),
                buffer.created + self.timeout,
                async move {
                    aggregator.flush(&target, &timer_buffer).await;
                },
            );
        }
        buffer
    }

    /// Seals the buffer and ships its contents to the primary.
    async fn flush(self: &Arc<Self>, primary: &NodeId, buffer: &Arc<AckBuffer>) {
        let Some(versions) = buffer.seal_and_drain() else {
            return;
        };
        self.buffers
            .remove_if(primary, |_, resident| Arc::ptr_eq(resident, buffer));
        self.timers.cancel(&Self::timer_id(primary, buffer.generation));

        if versions.is_empty() {
            return;
        }
        debug!(
            "Flushing {} deferred acks to {}",
            versions.len(),
            primary.short()
        );
        metrics::DEFERRED_ACK_FLUSHES_TOTAL.inc();
        metrics::DEFERRED_ACK_VERSIONS_TOTAL.inc_by(versions.len() as f64);
        let message =
            CacheMessage::DhtDeferredAck(DhtDeferredAckResponse {
                future_versions: versions,
            });
        if let Err(e) = self.transport.send(primary, message).await {
            warn!(
                "Failed to flush deferred acks to {}: {}",
                primary.short(),
                e
            );
        }
    }

    /// Discards the buffer owed to a departed primary; its acknowledgments
    /// can no longer be delivered.
    pub fn drop_node(&self, primary: &NodeId) {
        if let Some((_, buffer)) = self.buffers.remove(primary) {
            self.timers.cancel(&Self::timer_id(primary, buffer.generation));
            buffer.seal_and_drain();
        }
    }

    /// Best-effort flush of every buffer, used on graceful shutdown.
    pub async fn flush_all(self: &Arc<Self>) {
        let primaries: Vec<NodeId> = self.buffers.iter().map(|e| e.key().clone()).collect();
        for primary in primaries {
            if let Some(buffer) = self.buffers.get(&primary).map(|e| e.value().clone()) {
                self.flush(&primary, &buffer).await;
            }
        }
    }

    /// The number of versions currently buffered for a primary.
    pub fn pending_for(&self, primary: &NodeId) -> usize {
        self.buffers
            .get(primary)
            .map(|b| b.count.load(Ordering::Acquire))
            .unwrap_or(0)
    }
}
