// src/core/tasks/tombstone_gc.rs

//! The tombstone garbage collector: drains the deferred-delete queue once
//! tombstones age out or the queue grows past its hard cap.

use crate::core::metrics;
use crate::core::state::CacheNode;
use crate::core::storage::deferred::Tombstone;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};

/// How often the backlog is checked for due tombstones.
const GC_SWEEP_INTERVAL: Duration = Duration::from_millis(50);

/// Runs the collector loop until shutdown.
pub async fn run(
    node: Arc<CacheNode>,
    mut tombstone_rx: mpsc::UnboundedReceiver<Tombstone>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    info!("Tombstone garbage collector started.");
    let mut backlog: VecDeque<Tombstone> = VecDeque::new();
    let mut sweep = tokio::time::interval(GC_SWEEP_INTERVAL);

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("Tombstone garbage collector shutting down.");
                return;
            }
            received = tombstone_rx.recv() => {
                match received {
                    Some(tombstone) => backlog.push_back(tombstone),
                    None => return,
                }
            }
            _ = sweep.tick() => {
                collect_due(&node, &mut backlog).await;
            }
        }
    }
}

/// Disposes of every tombstone that aged past the configured TTL, plus the
/// oldest ones whenever the backlog exceeds the hard cap.
async fn collect_due(node: &Arc<CacheNode>, backlog: &mut VecDeque<Tombstone>) {
    let now = Instant::now();
    let mut collected = 0u64;

    loop {
        let due = match backlog.front() {
            Some(head) => {
                now.duration_since(head.queued_at) >= node.config.tombstone_ttl
                    || backlog.len() > node.config.tombstone_limit
            }
            None => false,
        };
        if !due {
            break;
        }
        let Some(tombstone) = backlog.pop_front() else {
            break;
        };
        let disposed = node
            .data
            .partition(tombstone.partition)
            .collect_tombstone(&tombstone.key, &tombstone.version)
            .await;
        node.data.tombstones.mark_collected();
        if disposed {
            collected += 1;
            metrics::TOMBSTONES_COLLECTED_TOTAL.inc();
        }
    }

    if collected > 0 {
        debug!("Collected {collected} tombstones.");
    }
}
