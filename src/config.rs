// src/config.rs

//! Manages cache engine configuration: loading, defaults, and validation.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;
use strum_macros::Display;

/// Controls when a near (client-side) update future is completed relative to
/// backup acknowledgments.
#[derive(
    Serialize,
    Deserialize,
    Debug,
    Display,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    bincode::Encode,
    bincode::Decode,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum WriteSyncMode {
    /// The primary replies to the originator only after every backup has acknowledged.
    #[default]
    FullSync,
    /// The primary replies after its local write; backups acknowledge asynchronously.
    PrimarySync,
    /// The primary replies immediately after dispatching backup writes.
    FullAsync,
}

/// Controls how a primary treats requests mapped at a stale topology version.
#[derive(
    Serialize,
    Deserialize,
    Debug,
    Display,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    bincode::Encode,
    bincode::Decode,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum WriteOrderMode {
    /// Accept requests at any topology version; version comparison rejects
    /// stale writes at the entry level.
    #[default]
    Clock,
    /// Reject requests mapped at a stale topology and ask the originator to remap.
    Primary,
}

/// The full configuration for a single cache node.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CacheConfig {
    /// Optional human-readable node name used in log output.
    #[serde(default)]
    pub node_name: Option<String>,
    /// Number of backup copies kept for every partition.
    #[serde(default = "default_backups")]
    pub backups: usize,
    /// Fixed partition count. Must not change for the lifetime of the cache.
    #[serde(default = "default_partitions")]
    pub partitions: u32,
    #[serde(default)]
    pub write_synchronization_mode: WriteSyncMode,
    #[serde(default)]
    pub atomic_write_order_mode: WriteOrderMode,
    /// Flush threshold for the deferred-ack buffer.
    #[serde(default = "default_deferred_ack_buffer_size")]
    pub deferred_ack_buffer_size: usize,
    /// Flush timeout for the deferred-ack buffer.
    #[serde(with = "humantime_serde", default = "default_deferred_ack_timeout")]
    pub deferred_ack_timeout: Duration,
    /// Whether write-through to the persistence store is performed.
    #[serde(default)]
    pub store_enabled: bool,
    /// Enables the batched write-through path for multi-key requests.
    #[serde(default = "default_batch_update_on_commit")]
    pub batch_update_on_commit: bool,
    /// Bound on session-level waits for remote responses.
    #[serde(with = "humantime_serde", default = "default_network_timeout")]
    pub network_timeout: Duration,
    /// Bound on the near-coordinator stale-topology remap loop.
    #[serde(default = "default_remap_retry_limit")]
    pub remap_retry_limit: u32,
    /// Bound on local retries when an entry is removed concurrently during locking.
    #[serde(default = "default_entry_retry_limit")]
    pub entry_retry_limit: u32,
    /// Age after which a tombstone becomes eligible for garbage collection.
    #[serde(with = "humantime_serde", default = "default_tombstone_ttl")]
    pub tombstone_ttl: Duration,
    /// Hard cap on queued tombstones; the oldest are collected early past it.
    #[serde(default = "default_tombstone_limit")]
    pub tombstone_limit: usize,
    /// Period of the active TTL expiration sweeper.
    #[serde(with = "humantime_serde", default = "default_expiration_interval")]
    pub expiration_interval: Duration,
    /// Data center id stamped into every version produced by this node.
    #[serde(default)]
    pub data_center_id: u8,
}

fn default_backups() -> usize {
    1
}
fn default_partitions() -> u32 {
    1024
}
fn default_deferred_ack_buffer_size() -> usize {
    256
}
fn default_deferred_ack_timeout() -> Duration {
    Duration::from_millis(500)
}
fn default_batch_update_on_commit() -> bool {
    true
}
fn default_network_timeout() -> Duration {
    Duration::from_secs(5)
}
fn default_remap_retry_limit() -> u32 {
    16
}
fn default_entry_retry_limit() -> u32 {
    8
}
fn default_tombstone_ttl() -> Duration {
    Duration::from_secs(10)
}
fn default_tombstone_limit() -> usize {
    131_072
}
fn default_expiration_interval() -> Duration {
    Duration::from_millis(100)
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            node_name: None,
            backups: default_backups(),
            partitions: default_partitions(),
            write_synchronization_mode: WriteSyncMode::default(),
            atomic_write_order_mode: WriteOrderMode::default(),
            deferred_ack_buffer_size: default_deferred_ack_buffer_size(),
            deferred_ack_timeout: default_deferred_ack_timeout(),
            store_enabled: false,
            batch_update_on_commit: default_batch_update_on_commit(),
            network_timeout: default_network_timeout(),
            remap_retry_limit: default_remap_retry_limit(),
            entry_retry_limit: default_entry_retry_limit(),
            tombstone_ttl: default_tombstone_ttl(),
            tombstone_limit: default_tombstone_limit(),
            expiration_interval: default_expiration_interval(),
            data_center_id: 0,
        }
    }
}

impl CacheConfig {
    /// Creates a new `CacheConfig` instance by reading and parsing a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        let config: CacheConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse TOML from '{path}'"))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the resolved configuration to ensure logical consistency.
    pub fn validate(&self) -> Result<()> {
        if self.partitions == 0 {
            return Err(anyhow!("partitions cannot be 0"));
        }
        if self.deferred_ack_buffer_size == 0 {
            return Err(anyhow!("deferred_ack_buffer_size cannot be 0"));
        }
        if self.deferred_ack_timeout.is_zero() {
            return Err(anyhow!("deferred_ack_timeout cannot be 0"));
        }
        if self.network_timeout.is_zero() {
            return Err(anyhow!("network_timeout cannot be 0"));
        }
        if self.remap_retry_limit == 0 {
            return Err(anyhow!("remap_retry_limit cannot be 0"));
        }
        if self.entry_retry_limit == 0 {
            return Err(anyhow!("entry_retry_limit cannot be 0"));
        }
        if self.tombstone_limit == 0 {
            return Err(anyhow!("tombstone_limit cannot be 0"));
        }
        Ok(())
    }
}
