// src/core/atomic/near.rs

//! The client (near) update coordinator. Runs on the request-originating
//! node: partitions the user batch by primary owner, dispatches one request
//! per node, merges the responses, and drives the bounded remap loop when
//! the topology moves underneath the request.

use crate::config::{WriteOrderMode, WriteSyncMode};
use crate::core::atomic::messages::{
    CacheMessage, Filter, NearUpdateRequest, NearUpdateResponse, Operation, Transform,
};
use crate::core::atomic::primary;
use crate::core::cluster::node::NodeId;
use crate::core::errors::OpalDBError;
use crate::core::state::CacheNode;
use crate::core::version::CacheVersion;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// One key of a user batch together with its operation payload.
#[derive(Debug, Clone)]
pub struct UpdateItem {
    pub key: Bytes,
    /// The new value for `Operation::Update`.
    pub value: Option<Bytes>,
    /// The transform for `Operation::Transform`.
    pub transform: Option<Transform>,
    pub dr_version: Option<CacheVersion>,
    pub dr_ttl_ms: Option<u64>,
    pub dr_expire_time_ms: Option<u64>,
}

impl UpdateItem {
    fn put(key: Bytes, value: Bytes) -> Self {
        Self {
            key,
            value: Some(value),
            transform: None,
            dr_version: None,
            dr_ttl_ms: None,
            dr_expire_time_ms: None,
        }
    }

    fn remove(key: Bytes) -> Self {
        Self {
            key,
            value: None,
            transform: None,
            dr_version: None,
            dr_ttl_ms: None,
            dr_expire_time_ms: None,
        }
    }

    fn transform(key: Bytes, transform: Transform) -> Self {
        Self {
            key,
            value: None,
            transform: Some(transform),
            dr_version: None,
            dr_ttl_ms: None,
            dr_expire_time_ms: None,
        }
    }
}

/// A user-level update batch handed to the coordinator.
#[derive(Debug, Clone)]
pub struct UpdateBatch {
    pub operation: Operation,
    pub items: Vec<UpdateItem>,
    pub filter: Option<Filter>,
    pub ttl: Option<Duration>,
    pub write_sync: WriteSyncMode,
    /// Requests the pre-update value; legal only for a single-key batch.
    pub return_value: bool,
}

impl UpdateBatch {
    pub fn puts(pairs: Vec<(Bytes, Bytes)>, write_sync: WriteSyncMode) -> Self {
        Self {
            operation: Operation::Update,
            items: pairs
                .into_iter()
                .map(|(k, v)| UpdateItem::put(k, v))
                .collect(),
            filter: None,
            ttl: None,
            write_sync,
            return_value: false,
        }
    }

    pub fn removes(keys: Vec<Bytes>, write_sync: WriteSyncMode) -> Self {
        Self {
            operation: Operation::Delete,
            items: keys.into_iter().map(UpdateItem::remove).collect(),
            filter: None,
            ttl: None,
            write_sync,
            return_value: false,
        }
    }

    pub fn transforms(pairs: Vec<(Bytes, Transform)>, write_sync: WriteSyncMode) -> Self {
        Self {
            operation: Operation::Transform,
            items: pairs
                .into_iter()
                .map(|(k, t)| UpdateItem::transform(k, t))
                .collect(),
            filter: None,
            ttl: None,
            write_sync,
            return_value: false,
        }
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_return_value(mut self) -> Self {
        self.return_value = true;
        self
    }
}

/// The merged result the public future completes with. Per-key failures are
/// accumulated here; a top-level error is surfaced only when the cluster
/// could not even route the request.
#[derive(Debug, Clone, Default)]
pub struct UpdateResult {
    /// The pre-update value, when the batch requested it.
    pub value: Option<Bytes>,
    /// Keys whose write failed, with the error that failed each of them.
    pub failed: Vec<(Bytes, String)>,
}

impl UpdateResult {
    pub fn is_fully_applied(&self) -> bool {
        self.failed.is_empty()
    }
}

/// One dispatched per-primary group awaiting its response.
struct DispatchedGroup {
    future_version: CacheVersion,
    items: Vec<UpdateItem>,
    receiver: Option<oneshot::Receiver<NearUpdateResponse>>,
}

/// Runs a user batch through the update pipeline and completes when every
/// group has produced a terminal response.
pub(crate) async fn update(
    node: &Arc<CacheNode>,
    batch: UpdateBatch,
) -> Result<UpdateResult, OpalDBError> {
    if batch.return_value && batch.items.len() != 1 {
        return Err(OpalDBError::Rejected(
            "return-value is only legal for single-key requests".into(),
        ));
    }
    if batch.items.is_empty() {
        return Ok(UpdateResult::default());
    }
    run_update_loop(node, batch, 0).await
}

pub(crate) async fn run_update_loop(
    node: &Arc<CacheNode>,
    batch: UpdateBatch,
    mut attempts: u32,
) -> Result<UpdateResult, OpalDBError> {
    let mut result = UpdateResult::default();
    let mut pending = batch.items.clone();

    while !pending.is_empty() {
        if node.is_stopping() {
            return Err(OpalDBError::NodeStopping);
        }

        // Map keys onto their primary owners at the current topology.
        let topology = node.topology.snapshot();
        let mut groups: HashMap<NodeId, Vec<UpdateItem>> = HashMap::new();
        for item in pending.drain(..) {
            let partition = node.data.partition_of(&item.key);
            let Some(primary) = topology.primary(partition) else {
                return Err(OpalDBError::NoOwners(partition));
            };
            groups.entry(primary.clone()).or_default().push(item);
        }

        // Dispatch one near request per owning node. Keys owned locally are
        // handed to the primary engine directly, skipping the transport.
        let mut dispatched = Vec::with_capacity(groups.len());
        let mut remap_items: Vec<UpdateItem> = Vec::new();
        for (target, items) in groups {
            let future_version = node.versions.next();
            let request = build_request(node, &batch, &items, future_version, topology.version);
            let keys_wire = request.keys.clone();
            let receiver = node
                .futures
                .register_near(future_version, target.clone(), keys_wire);

            if &target == node.id() {
                tokio::spawn(primary::process_near_update(
                    node.clone(),
                    node.id().clone(),
                    request,
                ));
                dispatched.push(DispatchedGroup {
                    future_version,
                    items,
                    receiver: Some(receiver),
                });
            } else {
                match node
                    .transport
                    .send(&target, CacheMessage::NearRequest(request))
                    .await
                {
                    Ok(()) => dispatched.push(DispatchedGroup {
                        future_version,
                        items,
                        receiver: Some(receiver),
                    }),
                    Err(e) => {
                        // The primary is unreachable; send its keys around
                        // the remap loop once membership catches up.
                        warn!(
                            "Dispatch to {} failed ({e}); remapping {} keys",
                            target.short(),
                            items.len()
                        );
                        node.futures.abandon_near(&future_version);
                        dispatched.push(DispatchedGroup {
                            future_version,
                            items,
                            receiver: None,
                        });
                    }
                }
            }
        }

        // Await a terminal response from every outstanding group. Each
        // request's end time is bounded by the configured network timeout.
        for group in dispatched {
            let Some(receiver) = group.receiver else {
                remap_items.extend(group.items);
                continue;
            };
            match tokio::time::timeout(node.config.network_timeout, receiver).await {
                Ok(Ok(response)) => {
                    if batch.return_value {
                        result.value = response.return_value.map(Bytes::from);
                    }
                    for (key, error) in response
                        .failed_keys
                        .into_iter()
                        .zip(response.errors.into_iter())
                    {
                        result.failed.push((Bytes::from(key), error));
                    }
                    if !response.remap_keys.is_empty() {
                        debug!(
                            "Primary asked to remap {} keys at topology {}",
                            response.remap_keys.len(),
                            topology.version
                        );
                        let remap: HashSet<Vec<u8>> =
                            response.remap_keys.into_iter().collect();
                        remap_items.extend(
                            group
                                .items
                                .into_iter()
                                .filter(|item| remap.contains(item.key.as_ref())),
                        );
                    }
                }
                Ok(Err(_closed)) => {
                    // The registry was cleared underneath us: the node is
                    // stopping.
                    return Err(OpalDBError::NodeStopping);
                }
                Err(_elapsed) => {
                    node.futures.abandon_near(&group.future_version);
                    let error = OpalDBError::Rejected(format!(
                        "no response within {:?}",
                        node.config.network_timeout
                    ));
                    for item in group.items {
                        result.failed.push((item.key, error.to_string()));
                    }
                }
            }
        }

        if remap_items.is_empty() {
            break;
        }
        attempts += 1;
        if attempts > node.config.remap_retry_limit {
            let error = OpalDBError::Topology("remap attempts exhausted".into());
            for item in remap_items {
                result.failed.push((item.key, error.to_string()));
            }
            break;
        }
        // Re-map against the next topology: wait for the membership listener
        // to install a version above the one this round was mapped at. The
        // timeout covers the case where the remap came from a primary whose
        // topology is behind ours.
        if node.topology.version() <= topology.version {
            let _ = tokio::time::timeout(
                node.config.network_timeout,
                node.topology.await_version_above(topology.version),
            )
            .await;
        }
        pending = remap_items;
    }

    Ok(result)
}

/// Builds the wire request for one per-primary group.
fn build_request(
    node: &Arc<CacheNode>,
    batch: &UpdateBatch,
    items: &[UpdateItem],
    future_version: CacheVersion,
    topology_version: u64,
) -> NearUpdateRequest {
    let clock = node.config.atomic_write_order_mode == WriteOrderMode::Clock;
    // Under CLOCK ordering the write version is assigned here, on the near
    // node, so primaries can accept the request at any topology version.
    let write_version = clock.then(|| node.versions.next());

    let keys: Vec<Vec<u8>> = items.iter().map(|i| i.key.to_vec()).collect();
    let values = (batch.operation == Operation::Update).then(|| {
        items
            .iter()
            .map(|i| i.value.as_ref().map(|v| v.to_vec()).unwrap_or_default())
            .collect()
    });
    let transforms = (batch.operation == Operation::Transform).then(|| {
        items
            .iter()
            .map(|i| {
                i.transform
                    .clone()
                    .expect("transform batches carry a transform per item")
            })
            .collect()
    });
    let dr_versions = items
        .iter()
        .any(|i| i.dr_version.is_some())
        .then(|| items.iter().map(|i| i.dr_version).collect());
    let dr_ttls_ms = items
        .iter()
        .any(|i| i.dr_ttl_ms.is_some())
        .then(|| items.iter().map(|i| i.dr_ttl_ms).collect());
    let dr_expire_times_ms = items
        .iter()
        .any(|i| i.dr_expire_time_ms.is_some())
        .then(|| items.iter().map(|i| i.dr_expire_time_ms).collect());

    NearUpdateRequest {
        future_version,
        write_version,
        topology_version,
        write_sync: batch.write_sync,
        atomic_order: node.config.atomic_write_order_mode,
        operation: batch.operation,
        keys,
        values,
        transforms,
        filter: batch.filter.clone(),
        ttl_ms: batch.ttl.map(|t| t.as_millis() as u64),
        return_value: batch.return_value,
        fast_map: clock,
        dr_ttls_ms,
        dr_expire_times_ms,
        dr_versions,
    }
}

/// Re-issues a FULL_ASYNC remap from the primary side. One hop is already
/// spent; the shared loop bound caps request loops under a flapping
/// topology.
pub(crate) fn spawn_async_remap(
    node: Arc<CacheNode>,
    req: &NearUpdateRequest,
    remap_keys: Vec<Vec<u8>>,
) {
    let remap: HashSet<Vec<u8>> = remap_keys.into_iter().collect();
    let mut items = Vec::with_capacity(remap.len());
    for (index, key) in req.keys.iter().enumerate() {
        if !remap.contains(key) {
            continue;
        }
        items.push(UpdateItem {
            key: Bytes::from(key.clone()),
            value: req
                .values
                .as_ref()
                .and_then(|v| v.get(index))
                .map(|v| Bytes::from(v.clone())),
            transform: req
                .transforms
                .as_ref()
                .and_then(|t| t.get(index))
                .cloned(),
            dr_version: req
                .dr_versions
                .as_ref()
                .and_then(|v| v.get(index))
                .copied()
                .flatten(),
            dr_ttl_ms: req
                .dr_ttls_ms
                .as_ref()
                .and_then(|t| t.get(index))
                .copied()
                .flatten(),
            dr_expire_time_ms: req
                .dr_expire_times_ms
                .as_ref()
                .and_then(|t| t.get(index))
                .copied()
                .flatten(),
        });
    }
    let batch = UpdateBatch {
        operation: req.operation,
        items,
        filter: req.filter.clone(),
        ttl: req.ttl_ms.map(Duration::from_millis),
        write_sync: WriteSyncMode::FullAsync,
        return_value: false,
    };
    tokio::spawn(async move {
        match run_update_loop(&node, batch, 1).await {
            Ok(result) if !result.failed.is_empty() => warn!(
                "Asynchronous remap finished with {} failed keys",
                result.failed.len()
            ),
            Ok(_) => {}
            Err(e) => warn!("Asynchronous remap failed: {e}"),
        }
    });
}
