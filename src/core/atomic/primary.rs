// src/core/atomic/primary.rs

//! The primary-update engine: locks the target entries of a batch, validates
//! topology, applies the entry update rule, writes through to the store, and
//! hands the per-backup write buckets to the backup coordinator.

use crate::config::{WriteOrderMode, WriteSyncMode};
use crate::core::atomic::messages::{
    DhtUpdateEntry, NearUpdateRequest, NearUpdateResponse, Operation,
};
use crate::core::atomic::{backup, near};
use crate::core::cluster::node::NodeId;
use crate::core::errors::OpalDBError;
use crate::core::metrics;
use crate::core::state::CacheNode;
use crate::core::storage::entry::EntryOp;
use crate::core::version::CacheVersion;
use bytes::Bytes;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// One write planned for an entry of the batch. Planning happens under the
/// entry locks, before the store or the entry state is touched.
struct PlannedWrite {
    index: usize,
    op: EntryOp,
    version: CacheVersion,
    check_version: bool,
    ttl: Option<Duration>,
}

/// What the engine produced for one near request.
struct EngineOutcome {
    response: NearUpdateResponse,
    write_version: CacheVersion,
    topology_version: u64,
    buckets: HashMap<NodeId, Vec<DhtUpdateEntry>>,
}

impl EngineOutcome {
    fn finished(response: NearUpdateResponse) -> Self {
        Self {
            response,
            write_version: CacheVersion::ZERO,
            topology_version: 0,
            buckets: HashMap::new(),
        }
    }
}

/// Entry point for a near update arriving at this node as the primary of the
/// requested keys.
pub(crate) async fn process_near_update(
    node: Arc<CacheNode>,
    origin: NodeId,
    req: NearUpdateRequest,
) {
    let EngineOutcome {
        mut response,
        write_version,
        topology_version,
        buckets,
    } = run_update(&node, &req).await;

    if !response.remap_keys.is_empty() && req.write_sync == WriteSyncMode::FullAsync {
        // No caller waits on a FULL_ASYNC remap; the primary re-issues the
        // request itself against the new topology, bounded by the remap
        // retry limit so a flapping topology cannot loop forever.
        let remap = std::mem::take(&mut response.remap_keys);
        near::spawn_async_remap(node.clone(), &req, remap);
    }

    if buckets.is_empty() {
        node.reply_near(&origin, response).await;
        return;
    }
    backup::dispatch_backups(
        node,
        origin,
        req.write_sync,
        topology_version,
        req.ttl_ms,
        response,
        write_version,
        buckets,
    )
    .await;
}

fn fail_all(response: &mut NearUpdateResponse, keys: &[Vec<u8>], error: &OpalDBError) {
    for key in keys {
        response.add_failed(key.clone(), error);
    }
}

async fn run_update(node: &Arc<CacheNode>, req: &NearUpdateRequest) -> EngineOutcome {
    let mut response = NearUpdateResponse::new(req.future_version);

    if node.is_stopping() {
        fail_all(&mut response, &req.keys, &OpalDBError::NodeStopping);
        return EngineOutcome::finished(response);
    }

    // return_value is legal only for a single-key request; the batched path
    // must never observe it.
    debug_assert!(!(req.return_value && req.keys.len() > 1));

    let keys: Vec<Bytes> = req.keys.iter().map(|k| Bytes::from(k.clone())).collect();
    let partitions: BTreeSet<u32> = keys.iter().map(|k| node.data.partition_of(k)).collect();

    // Step 1: wait out any rebalance of the owning partitions. This is a
    // suspension point; no locks are held while waiting.
    for &partition in &partitions {
        if !node.await_preloader(partition).await {
            fail_all(&mut response, &req.keys, &OpalDBError::NodeStopping);
            return EngineOutcome::finished(response);
        }
    }

    // Step 2: lock all target entries, in request key order.
    let mut locked = match node
        .data
        .lock_entries(&keys, node.config.entry_retry_limit)
        .await
    {
        Ok(locked) => locked,
        Err(e) => {
            fail_all(&mut response, &req.keys, &e);
            return EngineOutcome::finished(response);
        }
    };

    // Step 3: topology check. The snapshot is taken under the topology read
    // lock and pins partition ownership for the rest of the request.
    let topology = node.topology.snapshot();
    if topology.version != req.topology_version && req.atomic_order == WriteOrderMode::Primary {
        debug!(
            "Topology moved from {} to {} under PRIMARY ordering; remapping {} keys",
            req.topology_version,
            topology.version,
            req.keys.len()
        );
        metrics::REMAPS_TOTAL.inc();
        response.remap_keys = req.keys.clone();
        node.data.release(locked);
        return EngineOutcome::finished(response);
    }

    // Partition-state probe: a partition this node does not own as primary
    // abandons the whole batch and triggers a full remap.
    let local = node.id();
    if partitions
        .iter()
        .any(|&p| topology.primary(p) != Some(local))
    {
        metrics::REMAPS_TOTAL.inc();
        response.remap_keys = req.keys.clone();
        node.data.release(locked);
        return EngineOutcome::finished(response);
    }

    // Step 4: the write version. An externally supplied version (CLOCK mode
    // assigns it on the near node) takes precedence over the local domain.
    let write_version = req.write_version.unwrap_or_else(|| node.versions.next());
    node.versions.observe(&write_version);

    // Step 5: path selection. The batched write-through path requires a
    // store, more than one key, and no cross-data-center version info.
    let store = node
        .store
        .as_ref()
        .filter(|_| node.config.store_enabled)
        .cloned();
    let batched = store.is_some()
        && keys.len() > 1
        && req.dr_versions.is_none()
        && node.config.batch_update_on_commit;

    // Step 6a: plan every write under the held locks: evaluate the filter,
    // run transforms, and pick the per-entry version.
    let request_ttl = req.ttl_ms.map(Duration::from_millis);
    let now = Instant::now();
    let mut planned: Vec<PlannedWrite> = Vec::with_capacity(locked.len());
    for (index, le) in locked.iter().enumerate() {
        let current = le.guard.current_value(now).cloned();

        if let Some(filter) = &req.filter
            && !filter.matches(current.as_ref())
        {
            // A filter-failed entry is left untouched and contributes no
            // backup write; the caller observes the current value when it
            // asked for the pre-update value.
            if req.return_value {
                response.return_value = current.map(|v| v.to_vec());
            }
            continue;
        }

        let op = match req.operation {
            Operation::Update => match req.values.as_ref().and_then(|v| v.get(index)) {
                Some(value) => EntryOp::Update(Bytes::from(value.clone())),
                None => {
                    response.add_failed(
                        req.keys[index].clone(),
                        &OpalDBError::Internal("update request without a value".into()),
                    );
                    continue;
                }
            },
            Operation::Delete => EntryOp::Delete,
            Operation::Transform => {
                let transform = req.transforms.as_ref().and_then(|t| t.get(index));
                let Some(transform) = transform else {
                    response.add_failed(
                        req.keys[index].clone(),
                        &OpalDBError::Internal("transform request without a transform".into()),
                    );
                    continue;
                };
                // A null transform result converts the operation to a
                // delete; a non-null result converts it to an update.
                match transform.apply(current.as_ref()) {
                    Ok(Some(value)) => EntryOp::Update(value),
                    Ok(None) => EntryOp::Delete,
                    Err(e) => {
                        response.add_failed(req.keys[index].clone(), &e);
                        continue;
                    }
                }
            }
        };

        let dr_version = req
            .dr_versions
            .as_ref()
            .and_then(|v| v.get(index))
            .copied()
            .flatten();
        let (version, check_version) = match dr_version {
            Some(dr) => (dr, true),
            None => (write_version, req.atomic_order == WriteOrderMode::Clock),
        };
        let ttl = req
            .dr_ttls_ms
            .as_ref()
            .and_then(|t| t.get(index))
            .copied()
            .flatten()
            .map(Duration::from_millis)
            .or(request_ttl);

        planned.push(PlannedWrite {
            index,
            op,
            version,
            check_version,
            ttl,
        });
    }

    // Steps 6b/7/8: apply in homogeneous sub-batches. Write-through runs
    // ahead of the entry updates of each sub-batch, so a store failure
    // leaves those entries untouched and emits no backup writes. In the
    // single-key path every entry is its own sub-batch.
    let mut buckets: HashMap<NodeId, Vec<DhtUpdateEntry>> = HashMap::new();
    let mut start = 0;
    while start < planned.len() {
        let is_update = matches!(planned[start].op, EntryOp::Update(_));
        let mut end = start + 1;
        if batched {
            while end < planned.len()
                && matches!(planned[end].op, EntryOp::Update(_)) == is_update
            {
                end += 1;
            }
        }
        let run = &planned[start..end];

        let store_result = match &store {
            Some(store) => {
                if is_update {
                    let pairs: Vec<(Bytes, Bytes)> = run
                        .iter()
                        .filter_map(|p| match &p.op {
                            EntryOp::Update(value) => Some((keys[p.index].clone(), value.clone())),
                            EntryOp::Delete => None,
                        })
                        .collect();
                    store.put_all(pairs).await
                } else {
                    store
                        .remove_all(run.iter().map(|p| keys[p.index].clone()).collect())
                        .await
                }
            }
            None => Ok(()),
        };

        if let Err(e) = store_result {
            warn!("Write-through failed for a sub-batch of {} keys: {e}", run.len());
            for p in run {
                response.add_failed(req.keys[p.index].clone(), &e);
            }
            start = end;
            continue;
        }

        for p in run {
            let le = &mut locked[p.index];
            let outcome =
                le.guard
                    .apply(&p.op, p.version, p.ttl, p.check_version, node.resolver());
            if req.return_value {
                response.return_value = outcome.old_value.as_ref().map(|v| v.to_vec());
            }
            if !outcome.applied {
                // Subsumed by a newer version already on the entry. Not an
                // error: from the writer's perspective the write has been
                // absorbed, so the response reports the current value.
                metrics::STALE_WRITES_SUBSUMED_TOTAL.inc();
                debug!(
                    "Write {} subsumed by newer version on entry",
                    p.version
                );
                continue;
            }
            let label = if matches!(p.op, EntryOp::Update(_)) {
                "update"
            } else {
                "delete"
            };
            metrics::UPDATES_APPLIED_TOTAL.with_label_values(&[label]).inc();

            // Step 8: bucket the write for every remote owner of the
            // partition.
            let partition = le.entry.partition;
            let owners = topology.owners(partition);
            for owner in owners.iter().skip(1).filter(|o| *o != local) {
                buckets.entry(owner.clone()).or_default().push(DhtUpdateEntry {
                    key: req.keys[p.index].clone(),
                    value: match &p.op {
                        EntryOp::Update(value) => Some(value.to_vec()),
                        EntryOp::Delete => None,
                    },
                    ttl_ms: p.ttl.map(|t| t.as_millis() as u64),
                    expire_time_ms: req
                        .dr_expire_times_ms
                        .as_ref()
                        .and_then(|t| t.get(p.index))
                        .copied()
                        .flatten(),
                    dr_version: dr_version_of(req, p.index),
                });
            }
        }
        start = end;
    }

    // Step 9: unlock. Tombstones are enqueued for deferred deletion outside
    // the lock region.
    node.data.release(locked);

    EngineOutcome {
        response,
        write_version,
        topology_version: topology.version,
        buckets,
    }
}

fn dr_version_of(req: &NearUpdateRequest, index: usize) -> Option<CacheVersion> {
    req.dr_versions
        .as_ref()
        .and_then(|v| v.get(index))
        .copied()
        .flatten()
}
