// src/core/atomic/messages.rs

//! The wire messages of the atomic update pipeline.
//!
//! All messages travel bincode-encoded. Keys and values are raw byte strings
//! on the wire and become `Bytes` at the engine boundary.

use crate::config::{WriteOrderMode, WriteSyncMode};
use crate::core::errors::OpalDBError;
use crate::core::version::CacheVersion;
use bincode::config;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// The kind of write carried by a near request.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    bincode::Encode,
    bincode::Decode,
)]
pub enum Operation {
    Update,
    Delete,
    Transform,
}

/// A read-modify-write evaluated on the primary while the entry lock is held.
///
/// A `None` result converts the operation into a delete for that key; a
/// `Some` result converts it into an update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub enum Transform {
    /// Appends the given bytes to the current value.
    Append(Vec<u8>),
    /// Prepends the given bytes to the current value.
    Prepend(Vec<u8>),
    /// Treats the current value as a decimal integer and adds the delta.
    /// A missing value counts as zero.
    IncrBy(i64),
    /// Removes the entry when the current value equals the given bytes;
    /// otherwise leaves it unchanged.
    RemoveIfEquals(Vec<u8>),
}

impl Transform {
    /// Evaluates the transform against the current value.
    pub fn apply(&self, current: Option<&Bytes>) -> Result<Option<Bytes>, OpalDBError> {
        match self {
            Transform::Append(suffix) => {
                let mut out = current.map(|v| v.to_vec()).unwrap_or_default();
                out.extend_from_slice(suffix);
                Ok(Some(Bytes::from(out)))
            }
            Transform::Prepend(prefix) => {
                let mut out = prefix.clone();
                if let Some(v) = current {
                    out.extend_from_slice(v);
                }
                Ok(Some(Bytes::from(out)))
            }
            Transform::IncrBy(delta) => {
                let base = match current {
                    Some(v) => std::str::from_utf8(v)?
                        .parse::<i64>()
                        .map_err(|e| OpalDBError::Deployment(e.to_string()))?,
                    None => 0,
                };
                let next = base
                    .checked_add(*delta)
                    .ok_or_else(|| OpalDBError::Deployment("integer overflow".into()))?;
                Ok(Some(Bytes::from(next.to_string())))
            }
            Transform::RemoveIfEquals(expected) => match current {
                Some(v) if v.as_ref() == expected.as_slice() => Ok(None),
                Some(v) => Ok(Some(v.clone())),
                None => Ok(None),
            },
        }
    }
}

/// A per-entry predicate evaluated under the entry lock before a write is
/// applied. A failed filter leaves the entry untouched and emits no backup
/// write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub enum Filter {
    Always,
    /// The entry must hold a live value (replace semantics).
    HasValue,
    /// The entry must hold no live value (put-if-absent semantics).
    NoValue,
    /// The entry's live value must equal the given bytes.
    ValueEquals(Vec<u8>),
}

impl Filter {
    pub fn matches(&self, current: Option<&Bytes>) -> bool {
        match self {
            Filter::Always => true,
            Filter::HasValue => current.is_some(),
            Filter::NoValue => current.is_none(),
            Filter::ValueEquals(expected) => {
                current.is_some_and(|v| v.as_ref() == expected.as_slice())
            }
        }
    }
}

/// An update request from the originating node to a primary.
#[derive(Debug, Clone, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct NearUpdateRequest {
    /// Demultiplexing handle for every response belonging to this request.
    pub future_version: CacheVersion,
    /// The write version assigned on the near node under CLOCK ordering.
    /// Absent in PRIMARY ordering, where the primary assigns it at apply time.
    pub write_version: Option<CacheVersion>,
    /// The topology version the originator mapped the keys at.
    pub topology_version: u64,
    pub write_sync: WriteSyncMode,
    pub atomic_order: WriteOrderMode,
    pub operation: Operation,
    pub keys: Vec<Vec<u8>>,
    /// Parallel to `keys` for `Operation::Update`.
    pub values: Option<Vec<Vec<u8>>>,
    /// Parallel to `keys` for `Operation::Transform`.
    pub transforms: Option<Vec<Transform>>,
    pub filter: Option<Filter>,
    pub ttl_ms: Option<u64>,
    /// Requests the pre-update value in the response. Single-key only.
    pub return_value: bool,
    /// Set when the originator mapped at the current topology in CLOCK mode
    /// and the primary may skip the remap round-trip.
    pub fast_map: bool,
    /// Per-key conflict metadata carried for cross-data-center replication.
    pub dr_ttls_ms: Option<Vec<Option<u64>>>,
    pub dr_expire_times_ms: Option<Vec<Option<u64>>>,
    pub dr_versions: Option<Vec<Option<CacheVersion>>>,
}

/// The primary's reply to a near request.
#[derive(Debug, Clone, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct NearUpdateResponse {
    pub future_version: CacheVersion,
    /// The pre-update value, when `return_value` was requested.
    pub return_value: Option<Vec<u8>>,
    /// Keys whose write failed, parallel to `errors`.
    pub failed_keys: Vec<Vec<u8>>,
    pub errors: Vec<String>,
    /// Keys the originator must remap against a newer topology. Not a
    /// failure.
    pub remap_keys: Vec<Vec<u8>>,
}

impl NearUpdateResponse {
    pub fn new(future_version: CacheVersion) -> Self {
        Self {
            future_version,
            return_value: None,
            failed_keys: Vec::new(),
            errors: Vec::new(),
            remap_keys: Vec::new(),
        }
    }

    pub fn add_failed(&mut self, key: Vec<u8>, error: &OpalDBError) {
        self.failed_keys.push(key);
        self.errors.push(error.to_string());
    }
}

/// One written entry shipped from a primary to a backup.
#[derive(Debug, Clone, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct DhtUpdateEntry {
    pub key: Vec<u8>,
    /// `None` ships a tombstone.
    pub value: Option<Vec<u8>>,
    pub ttl_ms: Option<u64>,
    pub expire_time_ms: Option<u64>,
    /// Cross-data-center version override, when the write originated there.
    pub dr_version: Option<CacheVersion>,
}

/// A backup write request from a primary.
#[derive(Debug, Clone, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct DhtUpdateRequest {
    pub future_version: CacheVersion,
    /// The write version the primary stamped on every entry in this request.
    pub write_version: CacheVersion,
    pub write_sync: WriteSyncMode,
    pub topology_version: u64,
    pub ttl_ms: Option<u64>,
    pub entries: Vec<DhtUpdateEntry>,
}

/// A backup's direct reply to a primary.
#[derive(Debug, Clone, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct DhtUpdateResponse {
    pub future_version: CacheVersion,
    pub failed_keys: Vec<Vec<u8>>,
    pub errors: Vec<String>,
}

/// A coalesced acknowledgment of many backup applies in one datagram.
#[derive(Debug, Clone, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct DhtDeferredAckResponse {
    pub future_versions: Vec<CacheVersion>,
}

/// The envelope of every message exchanged by the atomic pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub enum CacheMessage {
    NearRequest(NearUpdateRequest),
    NearResponse(NearUpdateResponse),
    DhtRequest(DhtUpdateRequest),
    DhtResponse(DhtUpdateResponse),
    DhtDeferredAck(DhtDeferredAckResponse),
}

impl CacheMessage {
    /// Encodes the message for the wire. All numeric fields travel as
    /// fixed-width little-endian; strings and arrays are length-prefixed.
    pub fn encode(&self) -> Result<Vec<u8>, OpalDBError> {
        Ok(bincode::encode_to_vec(
            self,
            config::standard().with_fixed_int_encoding(),
        )?)
    }

    /// Decodes a message received from the wire.
    pub fn decode(raw: &[u8]) -> Result<Self, OpalDBError> {
        let (message, _) =
            bincode::decode_from_slice(raw, config::standard().with_fixed_int_encoding())?;
        Ok(message)
    }
}
