// src/core/atomic/mod.rs

//! The atomic partitioned-cache update pipeline: near coordinator, primary
//! engine, backup coordinator, deferred-ack aggregator, and the wire
//! messages tying them together.

pub mod backup;
pub mod deferred_ack;
pub mod futures;
pub mod messages;
pub mod near;
pub mod primary;

pub use deferred_ack::DeferredAckAggregator;
pub use futures::{DhtPendingFuture, UpdateFuturesRegistry};
pub use messages::{
    CacheMessage, DhtDeferredAckResponse, DhtUpdateEntry, DhtUpdateRequest, DhtUpdateResponse,
    Filter, NearUpdateRequest, NearUpdateResponse, Operation, Transform,
};
pub use near::{UpdateBatch, UpdateItem, UpdateResult};
