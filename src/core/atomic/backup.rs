// src/core/atomic/backup.rs

//! The backup-update coordinator. On the primary it fans the written entries
//! out to every backup owner and completes the originating near future under
//! the chosen write-synchronization contract; on the backup it applies the
//! shipped entries and acknowledges, directly or through the deferred-ack
//! aggregator.

use crate::config::WriteSyncMode;
use crate::core::atomic::futures::DhtPendingFuture;
use crate::core::atomic::messages::{
    CacheMessage, DhtDeferredAckResponse, DhtUpdateEntry, DhtUpdateRequest, DhtUpdateResponse,
    NearUpdateResponse,
};
use crate::core::cluster::node::NodeId;
use crate::core::metrics;
use crate::core::state::CacheNode;
use crate::core::storage::entry::EntryOp;
use crate::core::version::CacheVersion;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Fans the written entries out to the backup owners and completes the near
/// response according to the write-synchronization mode.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn dispatch_backups(
    node: Arc<CacheNode>,
    origin: NodeId,
    write_sync: WriteSyncMode,
    topology_version: u64,
    ttl_ms: Option<u64>,
    response: NearUpdateResponse,
    write_version: CacheVersion,
    buckets: HashMap<NodeId, Vec<DhtUpdateEntry>>,
) {
    let future_version = response.future_version;
    let awaiting: HashMap<NodeId, Vec<Vec<u8>>> = buckets
        .iter()
        .map(|(backup, entries)| {
            (
                backup.clone(),
                entries.iter().map(|e| e.key.clone()).collect(),
            )
        })
        .collect();

    // Registered before anything is sent so a fast acknowledgment cannot
    // miss the pending entry.
    node.futures.register_dht(DhtPendingFuture::new(
        future_version,
        origin.clone(),
        awaiting,
        response.clone(),
    ));

    // PRIMARY_SYNC and FULL_ASYNC complete the near response as soon as the
    // backup requests are on the wire; late backup failures are only logged
    // and counted.
    if write_sync != WriteSyncMode::FullSync {
        node.reply_near(&origin, response).await;
    }

    for (backup, entries) in buckets {
        metrics::BACKUP_REQUESTS_TOTAL.inc();
        let keys: Vec<Vec<u8>> = entries.iter().map(|e| e.key.clone()).collect();
        let message = CacheMessage::DhtRequest(DhtUpdateRequest {
            future_version,
            write_version,
            write_sync,
            topology_version,
            ttl_ms,
            entries,
        });
        if let Err(e) = node.transport.send(&backup, message).await {
            warn!(
                "Failed to send backup update to {}: {e}",
                backup.short()
            );
            // Treat an unreachable backup like an immediate failed
            // acknowledgment; membership events will catch up shortly.
            let errors = vec![e.to_string(); keys.len()];
            if let Some((origin, finished)) =
                node.futures.ack_dht(&future_version, &backup, keys, errors)
            {
                node.reply_near(&origin, finished).await;
            }
        }
    }
}

/// Applies a backup update shipped by a primary. Backups never write through
/// to the store; the store sits behind the primary only.
pub(crate) async fn process_dht_update(
    node: Arc<CacheNode>,
    source: NodeId,
    req: DhtUpdateRequest,
) {
    node.versions.observe(&req.write_version);

    let mut failed_keys: Vec<Vec<u8>> = Vec::new();
    let mut errors: Vec<String> = Vec::new();

    for entry in &req.entries {
        let key = Bytes::from(entry.key.clone());
        match node
            .data
            .lock_entry(&key, node.config.entry_retry_limit)
            .await
        {
            Ok(mut le) => {
                let version = entry.dr_version.unwrap_or(req.write_version);
                let op = match &entry.value {
                    Some(value) => EntryOp::Update(Bytes::from(value.clone())),
                    None => EntryOp::Delete,
                };
                let ttl = entry
                    .ttl_ms
                    .or(req.ttl_ms)
                    .map(Duration::from_millis);
                // Backups always compare versions, regardless of the
                // cache's write-order mode.
                le.guard.apply(&op, version, ttl, true, node.resolver());
                node.data.release(vec![le]);
            }
            Err(e) => {
                failed_keys.push(entry.key.clone());
                errors.push(e.to_string());
            }
        }
    }

    // A failed key or FULL_SYNC forces a direct response; everything else
    // rides the deferred-ack aggregator.
    if !failed_keys.is_empty() || req.write_sync == WriteSyncMode::FullSync {
        let message = CacheMessage::DhtResponse(DhtUpdateResponse {
            future_version: req.future_version,
            failed_keys,
            errors,
        });
        if let Err(e) = node.transport.send(&source, message).await {
            warn!(
                "Failed to send backup response to {}: {e}",
                source.short()
            );
        }
    } else {
        node.deferred_acks.add(&source, req.future_version).await;
    }
}

/// Handles a direct backup response arriving at the primary.
pub(crate) async fn handle_dht_response(
    node: &Arc<CacheNode>,
    source: NodeId,
    response: DhtUpdateResponse,
) {
    if !response.failed_keys.is_empty() {
        warn!(
            "Backup {} reported {} failed keys for future {}",
            source.short(),
            response.failed_keys.len(),
            response.future_version
        );
    }
    if let Some((origin, finished)) = node.futures.ack_dht(
        &response.future_version,
        &source,
        response.failed_keys,
        response.errors,
    ) {
        node.reply_near(&origin, finished).await;
    }
}

/// Handles a coalesced deferred-ack datagram arriving at the primary.
pub(crate) async fn handle_deferred_ack(
    node: &Arc<CacheNode>,
    source: NodeId,
    ack: DhtDeferredAckResponse,
) {
    debug!(
        "Received {} deferred acks from {}",
        ack.future_versions.len(),
        source.short()
    );
    for version in ack.future_versions {
        if let Some((origin, finished)) =
            node.futures.ack_dht(&version, &source, Vec::new(), Vec::new())
        {
            node.reply_near(&origin, finished).await;
        }
    }
}
