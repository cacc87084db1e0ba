// src/core/store.rs

//! The optional write-through persistence store collaborator. The store sits
//! behind the primary only; backups never write through.

use crate::core::errors::OpalDBError;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// The batched write-through contract consumed by the primary-update engine.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Persists a batch of key-value pairs. Synchronous from the engine's
    /// point of view: an error fails the corresponding sub-batch.
    async fn put_all(&self, entries: Vec<(Bytes, Bytes)>) -> Result<(), OpalDBError>;

    /// Removes a batch of keys.
    async fn remove_all(&self, keys: Vec<Bytes>) -> Result<(), OpalDBError>;
}

/// An in-memory store used for embedding and tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<Bytes, Bytes>,
    failing: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent batch operation fail; used to exercise the
    /// engine's store-failure path.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn get(&self, key: &Bytes) -> Option<Bytes> {
        self.entries.get(key).map(|v| v.value().clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn check_failing(&self) -> Result<(), OpalDBError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(OpalDBError::Store("injected store failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn put_all(&self, entries: Vec<(Bytes, Bytes)>) -> Result<(), OpalDBError> {
        self.check_failing()?;
        for (key, value) in entries {
            self.entries.insert(key, value);
        }
        Ok(())
    }

    async fn remove_all(&self, keys: Vec<Bytes>) -> Result<(), OpalDBError> {
        self.check_failing()?;
        for key in keys {
            self.entries.remove(&key);
        }
        Ok(())
    }
}
