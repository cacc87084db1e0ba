// src/core/atomic/futures.rs

//! The future-version registry: maps a version to a pending operation so
//! responses arriving from remote nodes can demultiplex.

use crate::core::atomic::messages::NearUpdateResponse;
use crate::core::cluster::node::NodeId;
use crate::core::errors::OpalDBError;
use crate::core::metrics;
use crate::core::version::CacheVersion;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::oneshot;
use tracing::debug;

/// A pending near request awaiting its primary's response.
#[derive(Debug)]
pub struct NearPendingFuture {
    /// The primary the request was dispatched to.
    pub target: NodeId,
    /// The keys carried by the request, used to synthesize a remap response
    /// when the target departs.
    pub keys: Vec<Vec<u8>>,
    sender: Mutex<Option<oneshot::Sender<NearUpdateResponse>>>,
}

impl NearPendingFuture {
    /// Completes the future. Idempotent: only the first completion wins.
    fn complete(&self, response: NearUpdateResponse) -> bool {
        if let Some(tx) = self.sender.lock().take() {
            return tx.send(response).is_ok();
        }
        false
    }
}

/// A pending primary-side future awaiting backup acknowledgments before the
/// near response can be released (FULL_SYNC) or accounted (PRIMARY_SYNC).
#[derive(Debug)]
pub struct DhtPendingFuture {
    pub future_version: CacheVersion,
    /// The node the near response must be sent to on completion.
    pub origin: NodeId,
    state: Mutex<DhtPendingState>,
}

#[derive(Debug)]
struct DhtPendingState {
    /// Backups that have not acknowledged yet, with the keys shipped to each.
    awaiting: HashMap<NodeId, Vec<Vec<u8>>>,
    response: NearUpdateResponse,
    done: bool,
}

impl DhtPendingFuture {
    pub fn new(
        future_version: CacheVersion,
        origin: NodeId,
        awaiting: HashMap<NodeId, Vec<Vec<u8>>>,
        response: NearUpdateResponse,
    ) -> Self {
        Self {
            future_version,
            origin,
            state: Mutex::new(DhtPendingState {
                awaiting,
                response,
                done: false,
            }),
        }
    }

    /// Records an acknowledgment from one backup, merging any failed keys it
    /// reported. Returns the finished near response once the waiting set
    /// empties.
    fn ack(
        &self,
        from: &NodeId,
        failed_keys: Vec<Vec<u8>>,
        errors: Vec<String>,
    ) -> Option<NearUpdateResponse> {
        let mut state = self.state.lock();
        if state.done {
            return None;
        }
        state.awaiting.remove(from);
        state.response.failed_keys.extend(failed_keys);
        state.response.errors.extend(errors);
        if state.awaiting.is_empty() {
            state.done = true;
            return Some(state.response.clone());
        }
        None
    }

    /// Handles the departure of a backup: its keys are marked failed with a
    /// topology error and the wait on it is abandoned.
    fn node_left(&self, node: &NodeId) -> Option<NearUpdateResponse> {
        let mut state = self.state.lock();
        if state.done {
            return None;
        }
        let Some(keys) = state.awaiting.remove(node) else {
            return None;
        };
        let error = OpalDBError::Topology(format!("backup {} left during update", node.short()));
        for key in keys {
            state.response.add_failed(key, &error);
        }
        if state.awaiting.is_empty() {
            state.done = true;
            return Some(state.response.clone());
        }
        None
    }
}

/// The registry of all pending update futures on this node, keyed by future
/// version. Lookups are lock-free; every mutating operation is idempotent on
/// its own key.
#[derive(Debug, Default)]
pub struct UpdateFuturesRegistry {
    near: DashMap<CacheVersion, NearPendingFuture>,
    dht: DashMap<CacheVersion, DhtPendingFuture>,
}

impl UpdateFuturesRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a dispatched near request and returns the receiving half
    /// the coordinator awaits.
    pub fn register_near(
        &self,
        version: CacheVersion,
        target: NodeId,
        keys: Vec<Vec<u8>>,
    ) -> oneshot::Receiver<NearUpdateResponse> {
        let (tx, rx) = oneshot::channel();
        self.near.insert(
            version,
            NearPendingFuture {
                target,
                keys,
                sender: Mutex::new(Some(tx)),
            },
        );
        metrics::PENDING_FUTURES.inc();
        rx
    }

    /// Completes and removes a pending near future.
    pub fn complete_near(&self, response: NearUpdateResponse) -> bool {
        if let Some((_, pending)) = self.near.remove(&response.future_version) {
            metrics::PENDING_FUTURES.dec();
            return pending.complete(response);
        }
        debug!(
            "Dropping near response for unknown future {}",
            response.future_version
        );
        false
    }

    /// Abandons a pending near future, e.g. after a session timeout.
    pub fn abandon_near(&self, version: &CacheVersion) {
        if self.near.remove(version).is_some() {
            metrics::PENDING_FUTURES.dec();
        }
    }

    /// Registers a primary-side future awaiting backup acknowledgments.
    pub fn register_dht(&self, pending: DhtPendingFuture) {
        self.dht.insert(pending.future_version, pending);
        metrics::PENDING_FUTURES.inc();
    }

    /// Records a backup acknowledgment. When it was the last one, the future
    /// is removed and the finished response is returned together with its
    /// origin.
    pub fn ack_dht(
        &self,
        version: &CacheVersion,
        from: &NodeId,
        failed_keys: Vec<Vec<u8>>,
        errors: Vec<String>,
    ) -> Option<(NodeId, NearUpdateResponse)> {
        let finished = self
            .dht
            .get(version)
            .and_then(|pending| pending.ack(from, failed_keys, errors));
        finished.map(|response| {
            let origin = self
                .dht
                .remove(version)
                .map(|(_, p)| p.origin)
                .expect("completed dht future must still be registered");
            metrics::PENDING_FUTURES.dec();
            (origin, response)
        })
    }

    /// Applies a membership departure to every pending future.
    ///
    /// Primary-side futures waiting on the departed backup are finished with
    /// its keys failed; near futures targeted at the departed primary are
    /// completed with a synthetic remap response so the coordinator
    /// re-dispatches them at the new topology.
    pub fn on_node_left(&self, node: &NodeId) -> NodeLeftOutcome {
        let mut finished = Vec::new();
        for pending in self.dht.iter() {
            if let Some(response) = pending.node_left(node) {
                finished.push((pending.future_version, pending.origin.clone(), response));
            }
        }
        for (version, _, _) in &finished {
            if self.dht.remove(version).is_some() {
                metrics::PENDING_FUTURES.dec();
            }
        }

        let orphaned: Vec<CacheVersion> = self
            .near
            .iter()
            .filter(|pending| &pending.target == node)
            .map(|pending| *pending.key())
            .collect();
        for version in orphaned {
            if let Some((_, pending)) = self.near.remove(&version) {
                metrics::PENDING_FUTURES.dec();
                // The primary is gone; hand every key back to the
                // coordinator as a remap set.
                let mut response = NearUpdateResponse::new(version);
                response.remap_keys = pending.keys.clone();
                pending.complete(response);
            }
        }
        NodeLeftOutcome { finished }
    }

    /// Drops every pending future. Near waiters observe their channel close
    /// and surface a node-stopping error.
    pub fn clear(&self) {
        let near_count = self.near.len();
        let dht_count = self.dht.len();
        self.near.clear();
        self.dht.clear();
        metrics::PENDING_FUTURES.sub((near_count + dht_count) as f64);
    }

    pub fn pending_count(&self) -> usize {
        self.near.len() + self.dht.len()
    }
}

/// The result of applying a node departure to the registry.
pub struct NodeLeftOutcome {
    /// Primary-side futures finished by the departure: the near response must
    /// now be sent to each origin.
    pub finished: Vec<(CacheVersion, NodeId, NearUpdateResponse)>,
}
