// src/core/errors.rs

//! Defines the primary error type for the entire engine.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// The main error enum of the cache engine. Variants map onto the failure
/// kinds the update pipeline reports, per key or per request.
#[derive(Error, Debug)]
pub enum OpalDBError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    /// The target entry turned obsolete while being locked. Retriable locally.
    #[error("Entry was removed concurrently")]
    EntryRemoved,

    /// The request hit a partition this node does not own; the originator must remap.
    #[error("Partition {0} is not owned by this node")]
    InvalidPartition(u32),

    /// A remote node left the cluster while a request against it was in flight.
    #[error("Node left the cluster mid-request: {0}")]
    Topology(String),

    /// The request was refused before execution, e.g. by a timeout or admission control.
    #[error("Operation rejected: {0}")]
    Rejected(String),

    /// A user-supplied transform could not be applied to the current value.
    #[error("Transform failed to apply: {0}")]
    Deployment(String),

    #[error("Node is stopping")]
    NodeStopping,

    #[error("Persistence store failure: {0}")]
    Store(String),

    #[error("Cluster error: {0}")]
    Cluster(String),

    #[error("No owners for partition {0}")]
    NoOwners(u32),

    #[error("Network timeout after {0:?}")]
    Timeout(Duration),

    #[error("Wire codec error: {0}")]
    Codec(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

// `std::io::Error` has no `Clone`, so the io variant holds an `Arc` and the
// rest clone field by field.
impl Clone for OpalDBError {
    fn clone(&self) -> Self {
        match self {
            OpalDBError::Io(e) => OpalDBError::Io(Arc::clone(e)),
            OpalDBError::EntryRemoved => OpalDBError::EntryRemoved,
            OpalDBError::InvalidPartition(p) => OpalDBError::InvalidPartition(*p),
            OpalDBError::Topology(s) => OpalDBError::Topology(s.clone()),
            OpalDBError::Rejected(s) => OpalDBError::Rejected(s.clone()),
            OpalDBError::Deployment(s) => OpalDBError::Deployment(s.clone()),
            OpalDBError::NodeStopping => OpalDBError::NodeStopping,
            OpalDBError::Store(s) => OpalDBError::Store(s.clone()),
            OpalDBError::Cluster(s) => OpalDBError::Cluster(s.clone()),
            OpalDBError::NoOwners(p) => OpalDBError::NoOwners(*p),
            OpalDBError::Timeout(d) => OpalDBError::Timeout(*d),
            OpalDBError::Codec(s) => OpalDBError::Codec(s.clone()),
            OpalDBError::Internal(s) => OpalDBError::Internal(s.clone()),
        }
    }
}

impl PartialEq for OpalDBError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (OpalDBError::Io(e1), OpalDBError::Io(e2)) => e1.to_string() == e2.to_string(),
            (OpalDBError::InvalidPartition(p1), OpalDBError::InvalidPartition(p2)) => p1 == p2,
            (OpalDBError::Topology(s1), OpalDBError::Topology(s2)) => s1 == s2,
            (OpalDBError::Rejected(s1), OpalDBError::Rejected(s2)) => s1 == s2,
            (OpalDBError::Deployment(s1), OpalDBError::Deployment(s2)) => s1 == s2,
            (OpalDBError::Store(s1), OpalDBError::Store(s2)) => s1 == s2,
            (OpalDBError::Cluster(s1), OpalDBError::Cluster(s2)) => s1 == s2,
            (OpalDBError::NoOwners(p1), OpalDBError::NoOwners(p2)) => p1 == p2,
            (OpalDBError::Timeout(d1), OpalDBError::Timeout(d2)) => d1 == d2,
            (OpalDBError::Codec(s1), OpalDBError::Codec(s2)) => s1 == s2,
            (OpalDBError::Internal(s1), OpalDBError::Internal(s2)) => s1 == s2,
            _ => core::mem::discriminant(self) == core::mem::discriminant(other),
        }
    }
}

// --- From trait implementations for easy error conversion ---

impl From<std::io::Error> for OpalDBError {
    fn from(e: std::io::Error) -> Self {
        OpalDBError::Io(Arc::new(e))
    }
}

impl From<bincode::error::EncodeError> for OpalDBError {
    fn from(e: bincode::error::EncodeError) -> Self {
        OpalDBError::Codec(e.to_string())
    }
}

impl From<bincode::error::DecodeError> for OpalDBError {
    fn from(e: bincode::error::DecodeError) -> Self {
        OpalDBError::Codec(e.to_string())
    }
}

impl From<std::str::Utf8Error> for OpalDBError {
    fn from(e: std::str::Utf8Error) -> Self {
        OpalDBError::Deployment(e.to_string())
    }
}
