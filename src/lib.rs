// src/lib.rs

pub mod config;
pub mod core;

// Re-export
pub use crate::config::{CacheConfig, WriteOrderMode, WriteSyncMode};
pub use crate::core::{CacheNode, CacheVersion, OpalDBError};
