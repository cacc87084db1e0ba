// src/core/state.rs

//! Defines `CacheNode`, the engine handle holding all shared per-node state,
//! its factory, and the message dispatch and membership listener loops.

use crate::config::CacheConfig;
use crate::core::atomic::deferred_ack::DeferredAckAggregator;
use crate::core::atomic::futures::UpdateFuturesRegistry;
use crate::core::atomic::messages::{CacheMessage, Filter, NearUpdateResponse, Transform};
use crate::core::atomic::near::{UpdateBatch, UpdateResult};
use crate::core::atomic::{backup, near, primary};
use crate::core::cluster::discovery::{Discovery, MembershipEvent, MembershipEventKind};
use crate::core::cluster::node::{ClusterNode, NodeId};
use crate::core::cluster::topology::PartitionTopology;
use crate::core::errors::OpalDBError;
use crate::core::storage::deferred::{Tombstone, TombstoneQueue};
use crate::core::storage::partition::CacheData;
use crate::core::store::CacheStore;
use crate::core::tasks;
use crate::core::timer::TimerService;
use crate::core::transport::{MessageEnvelope, Transport};
use crate::core::version::{ConflictResolver, OrderWinsResolver, VersionDomain};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

/// Contains the initialized engine handle plus the receivers its background
/// tasks consume. Created once by [`CacheNode::initialize`] and consumed by
/// [`CacheNode::spawn`].
pub struct NodeInit {
    pub node: Arc<CacheNode>,
    /// Feeds the tombstone garbage collector.
    pub tombstone_rx: mpsc::UnboundedReceiver<Tombstone>,
    /// Feeds the membership listener.
    pub membership_rx: broadcast::Receiver<MembershipEvent>,
}

/// The engine handle of one cache node. Wrapped in an `Arc` and passed to
/// every task of the update pipeline; there are no process-wide singletons.
pub struct CacheNode {
    pub config: CacheConfig,
    local: ClusterNode,
    pub topology: PartitionTopology,
    pub versions: VersionDomain,
    pub data: CacheData,
    pub futures: UpdateFuturesRegistry,
    pub transport: Arc<dyn Transport>,
    pub store: Option<Arc<dyn CacheStore>>,
    pub deferred_acks: Arc<DeferredAckAggregator>,
    pub timers: Arc<TimerService>,
    discovery: Arc<dyn Discovery>,
    resolver: Box<dyn ConflictResolver>,
    is_stopping: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
}

impl CacheNode {
    /// Initializes the engine state from the given configuration and
    /// collaborators. This is the main factory for a node's shared context.
    pub fn initialize(
        config: CacheConfig,
        local: ClusterNode,
        discovery: Arc<dyn Discovery>,
        transport: Arc<dyn Transport>,
        store: Option<Arc<dyn CacheStore>>,
    ) -> Result<NodeInit, OpalDBError> {
        config
            .validate()
            .map_err(|e| OpalDBError::Internal(e.to_string()))?;

        let timers = Arc::new(TimerService::new());
        let deferred_acks = Arc::new(DeferredAckAggregator::new(
            config.deferred_ack_buffer_size,
            config.deferred_ack_timeout,
            transport.clone(),
            timers.clone(),
        ));
        let (tombstones, tombstone_rx) = TombstoneQueue::new();
        let (shutdown_tx, _) = broadcast::channel(8);

        // Subscribe before seeding the topology so no membership event can
        // fall between the two.
        let membership_rx = discovery.subscribe();

        let node = Arc::new(Self {
            versions: VersionDomain::new(config.data_center_id),
            topology: PartitionTopology::new(config.partitions, config.backups),
            data: CacheData::new(config.partitions, tombstones),
            futures: UpdateFuturesRegistry::new(),
            transport,
            store,
            deferred_acks,
            timers,
            discovery,
            resolver: Box::new(OrderWinsResolver),
            is_stopping: AtomicBool::new(false),
            shutdown_tx,
            local,
            config,
        });

        let (version, nodes) = node.discovery.topology();
        node.apply_topology(version, nodes);

        info!(
            "Cache node {} initialized ({} partitions, {} backups)",
            node.local.id.short(),
            node.config.partitions,
            node.config.backups
        );
        Ok(NodeInit {
            node,
            tombstone_rx,
            membership_rx,
        })
    }

    /// Spawns the engine's background tasks: the message dispatch loop, the
    /// membership listener, the tombstone garbage collector, and the TTL
    /// expiration sweeper.
    pub fn spawn(init: NodeInit, message_rx: mpsc::Receiver<MessageEnvelope>) -> Arc<CacheNode> {
        let NodeInit {
            node,
            tombstone_rx,
            membership_rx,
        } = init;

        tokio::spawn(run_dispatch(
            node.clone(),
            message_rx,
            node.subscribe_shutdown(),
        ));
        tokio::spawn(run_membership(
            node.clone(),
            membership_rx,
            node.subscribe_shutdown(),
        ));
        tokio::spawn(tasks::tombstone_gc::run(
            node.clone(),
            tombstone_rx,
            node.subscribe_shutdown(),
        ));
        tokio::spawn(tasks::expiration::run(
            node.clone(),
            node.subscribe_shutdown(),
        ));
        node
    }

    /// Convenience wrapper: initialize the state and spawn the background
    /// tasks in one step.
    pub fn start(
        config: CacheConfig,
        local: ClusterNode,
        discovery: Arc<dyn Discovery>,
        transport: Arc<dyn Transport>,
        store: Option<Arc<dyn CacheStore>>,
        message_rx: mpsc::Receiver<MessageEnvelope>,
    ) -> Result<Arc<CacheNode>, OpalDBError> {
        let init = Self::initialize(config, local, discovery, transport, store)?;
        Ok(Self::spawn(init, message_rx))
    }

    /// Stops the engine: pending waiters observe a node-stopping error and
    /// buffered deferred acks are flushed best effort.
    pub async fn stop(&self) {
        if self.is_stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Cache node {} stopping", self.local.id.short());
        self.deferred_acks.flush_all().await;
        let _ = self.shutdown_tx.send(());
        self.timers.shutdown();
        self.futures.clear();
    }

    pub fn is_stopping(&self) -> bool {
        self.is_stopping.load(Ordering::SeqCst)
    }

    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    pub fn id(&self) -> &NodeId {
        &self.local.id
    }

    pub fn local_node(&self) -> &ClusterNode {
        &self.local
    }

    pub(crate) fn resolver(&self) -> &dyn ConflictResolver {
        self.resolver.as_ref()
    }

    /// Waits for a partition to leave its rebalance state. Returns `false`
    /// when the engine started stopping while waiting.
    pub(crate) async fn await_preloader(&self, partition: u32) -> bool {
        if !self.topology.is_moving(partition) {
            return !self.is_stopping();
        }
        let mut shutdown = self.subscribe_shutdown();
        tokio::select! {
            _ = self.topology.await_ready(partition) => !self.is_stopping(),
            _ = shutdown.recv() => false,
        }
    }

    /// Routes a near response back to its originator: locally through the
    /// futures registry, remotely over the transport.
    pub(crate) async fn reply_near(&self, origin: &NodeId, response: NearUpdateResponse) {
        if origin == &self.local.id {
            self.futures.complete_near(response);
            return;
        }
        if let Err(e) = self
            .transport
            .send(origin, CacheMessage::NearResponse(response))
            .await
        {
            warn!(
                "Failed to send near response to {}: {e}",
                origin.short()
            );
        }
    }

    /// Installs a topology observed at the given version and refreshes the
    /// version domain with this node's ordinal in it.
    pub(crate) fn apply_topology(&self, version: u64, nodes: Vec<ClusterNode>) {
        let snapshot = self.topology.apply_membership(version, nodes);
        let node_order = snapshot.node_order(&self.local.id).unwrap_or(0);
        self.versions
            .on_topology_change(snapshot.version, node_order);
    }

    // --- Public cache operations ---

    /// Runs a prepared update batch through the pipeline.
    pub async fn update(self: &Arc<Self>, batch: UpdateBatch) -> Result<UpdateResult, OpalDBError> {
        near::update(self, batch).await
    }

    /// Stores one key-value pair.
    pub async fn put(self: &Arc<Self>, key: Bytes, value: Bytes) -> Result<UpdateResult, OpalDBError> {
        self.update(UpdateBatch::puts(
            vec![(key, value)],
            self.config.write_synchronization_mode,
        ))
        .await
    }

    /// Stores a batch of key-value pairs. Each key is updated independently;
    /// there is no multi-key atomicity.
    pub async fn put_all(
        self: &Arc<Self>,
        pairs: Vec<(Bytes, Bytes)>,
    ) -> Result<UpdateResult, OpalDBError> {
        self.update(UpdateBatch::puts(
            pairs,
            self.config.write_synchronization_mode,
        ))
        .await
    }

    /// Stores a key-value pair only when the key holds no live value.
    /// The returned result's `value` is the pre-existing value, `None` when
    /// the put took effect.
    pub async fn put_if_absent(
        self: &Arc<Self>,
        key: Bytes,
        value: Bytes,
    ) -> Result<UpdateResult, OpalDBError> {
        self.update(
            UpdateBatch::puts(vec![(key, value)], self.config.write_synchronization_mode)
                .with_filter(Filter::NoValue)
                .with_return_value(),
        )
        .await
    }

    /// Replaces the value only when the key holds a live value.
    pub async fn replace(
        self: &Arc<Self>,
        key: Bytes,
        value: Bytes,
    ) -> Result<UpdateResult, OpalDBError> {
        self.update(
            UpdateBatch::puts(vec![(key, value)], self.config.write_synchronization_mode)
                .with_filter(Filter::HasValue)
                .with_return_value(),
        )
        .await
    }

    /// Removes one key.
    pub async fn remove(self: &Arc<Self>, key: Bytes) -> Result<UpdateResult, OpalDBError> {
        self.update(UpdateBatch::removes(
            vec![key],
            self.config.write_synchronization_mode,
        ))
        .await
    }

    /// Removes a batch of keys.
    pub async fn remove_all(self: &Arc<Self>, keys: Vec<Bytes>) -> Result<UpdateResult, OpalDBError> {
        self.update(UpdateBatch::removes(
            keys,
            self.config.write_synchronization_mode,
        ))
        .await
    }

    /// Applies a read-modify-write transform to one key. The transform is
    /// evaluated on the primary while the entry lock is held.
    pub async fn transform(
        self: &Arc<Self>,
        key: Bytes,
        transform: Transform,
    ) -> Result<UpdateResult, OpalDBError> {
        self.update(UpdateBatch::transforms(
            vec![(key, transform)],
            self.config.write_synchronization_mode,
        ))
        .await
    }

    /// Applies transforms to a batch of keys.
    pub async fn transform_all(
        self: &Arc<Self>,
        pairs: Vec<(Bytes, Transform)>,
    ) -> Result<UpdateResult, OpalDBError> {
        self.update(UpdateBatch::transforms(
            pairs,
            self.config.write_synchronization_mode,
        ))
        .await
    }

    /// Reads a key from the locally owned partitions. Reads take the entry
    /// lock, so a concurrent write is never observed mid-update.
    pub async fn get(&self, key: &Bytes) -> Result<Option<Bytes>, OpalDBError> {
        let partition = self.data.partition_of(key);
        if !self.topology.snapshot().is_owner(partition, &self.local.id) {
            return Err(OpalDBError::InvalidPartition(partition));
        }
        Ok(self.data.read_value(key).await)
    }

    /// Reads a batch of keys from the locally owned partitions.
    pub async fn get_all(
        &self,
        keys: &[Bytes],
    ) -> Result<HashMap<Bytes, Bytes>, OpalDBError> {
        let mut out = HashMap::with_capacity(keys.len());
        for key in keys {
            if let Some(value) = self.get(key).await? {
                out.insert(key.clone(), value);
            }
        }
        Ok(out)
    }
}

impl std::fmt::Debug for CacheNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheNode")
            .field("id", &self.local.id)
            .field("topology_version", &self.topology.version())
            .finish_non_exhaustive()
    }
}

/// The message dispatch loop: demultiplexes every incoming pipeline message.
/// Requests are spawned so a rebalance gate or entry lock never stalls the
/// loop; responses are handled inline.
async fn run_dispatch(
    node: Arc<CacheNode>,
    mut message_rx: mpsc::Receiver<MessageEnvelope>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                debug!("Dispatch loop for {} shutting down", node.id().short());
                return;
            }
            envelope = message_rx.recv() => {
                let Some((source, message)) = envelope else { return };
                match message {
                    CacheMessage::NearRequest(req) => {
                        tokio::spawn(primary::process_near_update(node.clone(), source, req));
                    }
                    CacheMessage::NearResponse(resp) => {
                        node.futures.complete_near(resp);
                    }
                    CacheMessage::DhtRequest(req) => {
                        tokio::spawn(backup::process_dht_update(node.clone(), source, req));
                    }
                    CacheMessage::DhtResponse(resp) => {
                        backup::handle_dht_response(&node, source, resp).await;
                    }
                    CacheMessage::DhtDeferredAck(ack) => {
                        backup::handle_deferred_ack(&node, source, ack).await;
                    }
                }
            }
        }
    }
}

/// The membership listener: applies every discovery event to the topology
/// and completes pending futures touched by departures.
async fn run_membership(
    node: Arc<CacheNode>,
    mut membership_rx: broadcast::Receiver<MembershipEvent>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => return,
            event = membership_rx.recv() => match event {
                Ok(event) => handle_membership_event(&node, event).await,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    // Fall back to a full re-read of the membership.
                    warn!("Membership listener lagged by {missed} events; re-reading topology");
                    let (version, nodes) = node.discovery.topology();
                    node.apply_topology(version, nodes);
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }
}

async fn handle_membership_event(node: &Arc<CacheNode>, event: MembershipEvent) {
    let mut nodes = node.topology.snapshot().nodes.clone();
    match &event.kind {
        MembershipEventKind::Joined(joined) => {
            nodes.retain(|n| n.id != joined.id);
            nodes.push(joined.clone());
            nodes.sort_by(|a, b| a.id.cmp(&b.id));
        }
        MembershipEventKind::Left(id) | MembershipEventKind::Failed(id) => {
            nodes.retain(|n| &n.id != id);
        }
    }
    node.apply_topology(event.topology_version, nodes);

    if let MembershipEventKind::Left(id) | MembershipEventKind::Failed(id) = &event.kind {
        // Pending primary-side futures waiting on the departed backup finish
        // with its keys failed; near futures aimed at the departed primary
        // come back as remap sets.
        let outcome = node.futures.on_node_left(id);
        for (_, origin, response) in outcome.finished {
            node.reply_near(&origin, response).await;
        }
        node.deferred_acks.drop_node(id);
    }
}
