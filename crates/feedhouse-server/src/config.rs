//! Node Configuration
//!
//! ## NodeConfig
//!
//! - **server_id**: Identity of the node (default: random UUID)
//! - **endpoint**: Address other nodes use to reach this node (default: `inproc://<server_id>`)
//! - **watch_timeout_ms**: Long-poll timeout used by replication links (default: 5s)
//! - **long_poll_timeout_ms**: Upper bound on a client supplied long-poll wait (default: 30s)
//! - **host_cache_ttl_ms**: How long discovered remote hosts are trusted (default: 10s)
//! - **host_cache_capacity**: Maximum remote hosts cached (default: 1024)
//! - **buffer**: Bucket and pool sizing, see `BufferConfig`
//!
//! ## Environment
//!
//! `NodeConfig::from_env()` reads:
//!
//! - `FEEDHOUSE_SERVER_ID`, `FEEDHOUSE_ENDPOINT`
//! - `FEEDHOUSE_WATCH_TIMEOUT_MS`, `FEEDHOUSE_LONG_POLL_TIMEOUT_MS`
//! - `FEEDHOUSE_HOST_CACHE_TTL_MS`, `FEEDHOUSE_HOST_CACHE_CAPACITY`
//! - `FEEDHOUSE_BUCKET_SIZE`, `FEEDHOUSE_MAX_POOL_SIZE`, `FEEDHOUSE_RECLAIM_INTERVAL_MS`
//!
//! Unset variables fall back to the defaults above.

use std::str::FromStr;
use std::time::Duration;

use feedhouse_core::ServerId;
use feedhouse_storage::BufferConfig;
use serde::{Deserialize, Serialize};

use crate::error::{FeedError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default = "default_server_id")]
    pub server_id: String,

    #[serde(default)]
    pub endpoint: Option<String>,

    /// Replication long-poll timeout in milliseconds (default: 5 seconds)
    #[serde(default = "default_watch_timeout_ms")]
    pub watch_timeout_ms: u64,

    /// Longest wait a search may request in milliseconds (default: 30 seconds)
    #[serde(default = "default_long_poll_timeout_ms")]
    pub long_poll_timeout_ms: u64,

    /// Remote host cache TTL in milliseconds (default: 10 seconds)
    #[serde(default = "default_host_cache_ttl_ms")]
    pub host_cache_ttl_ms: u64,

    #[serde(default = "default_host_cache_capacity")]
    pub host_cache_capacity: usize,

    #[serde(default)]
    pub buffer: BufferConfig,
}

impl NodeConfig {
    /// Configuration from `FEEDHOUSE_*` environment variables
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let buffer = BufferConfig {
            bucket_size: env_or("FEEDHOUSE_BUCKET_SIZE", defaults.buffer.bucket_size)?,
            max_pool_size: env_or("FEEDHOUSE_MAX_POOL_SIZE", defaults.buffer.max_pool_size)?,
            reclaim_interval_ms: env_or(
                "FEEDHOUSE_RECLAIM_INTERVAL_MS",
                defaults.buffer.reclaim_interval_ms,
            )?,
        };

        Ok(Self {
            server_id: std::env::var("FEEDHOUSE_SERVER_ID").unwrap_or(defaults.server_id),
            endpoint: std::env::var("FEEDHOUSE_ENDPOINT").ok(),
            watch_timeout_ms: env_or("FEEDHOUSE_WATCH_TIMEOUT_MS", defaults.watch_timeout_ms)?,
            long_poll_timeout_ms: env_or(
                "FEEDHOUSE_LONG_POLL_TIMEOUT_MS",
                defaults.long_poll_timeout_ms,
            )?,
            host_cache_ttl_ms: env_or("FEEDHOUSE_HOST_CACHE_TTL_MS", defaults.host_cache_ttl_ms)?,
            host_cache_capacity: env_or(
                "FEEDHOUSE_HOST_CACHE_CAPACITY",
                defaults.host_cache_capacity,
            )?,
            buffer,
        })
    }

    /// Same settings under another identity
    pub fn with_server_id(&self, server_id: impl Into<String>) -> Self {
        Self {
            server_id: server_id.into(),
            endpoint: None,
            ..self.clone()
        }
    }

    pub fn server_id(&self) -> ServerId {
        ServerId::new(self.server_id.clone())
    }

    pub fn endpoint(&self) -> String {
        self.endpoint
            .clone()
            .unwrap_or_else(|| format!("inproc://{}", self.server_id))
    }

    pub fn watch_timeout(&self) -> Duration {
        Duration::from_millis(self.watch_timeout_ms)
    }

    pub fn long_poll_timeout(&self) -> Duration {
        Duration::from_millis(self.long_poll_timeout_ms)
    }

    pub fn host_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.host_cache_ttl_ms)
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            server_id: default_server_id(),
            endpoint: None,
            watch_timeout_ms: default_watch_timeout_ms(),
            long_poll_timeout_ms: default_long_poll_timeout_ms(),
            host_cache_ttl_ms: default_host_cache_ttl_ms(),
            host_cache_capacity: default_host_cache_capacity(),
            buffer: BufferConfig::default(),
        }
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(value) => value
            .parse()
            .map_err(|e| FeedError::Config(format!("{name}={value:?}: {e}"))),
        Err(_) => Ok(default),
    }
}

fn default_server_id() -> String {
    ServerId::generate().to_string()
}

fn default_watch_timeout_ms() -> u64 {
    5_000 // 5 seconds
}

fn default_long_poll_timeout_ms() -> u64 {
    30_000 // 30 seconds
}

fn default_host_cache_ttl_ms() -> u64 {
    10_000 // 10 seconds
}

fn default_host_cache_capacity() -> usize {
    1024
}
