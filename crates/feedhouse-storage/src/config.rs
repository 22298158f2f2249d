//! Buffer Configuration
//!
//! This module defines configuration for message buffers and the buffer pool.
//!
//! ## BufferConfig
//!
//! - **bucket_size**: Capacity of a freshly allocated bucket (default: 1MB)
//! - **max_pool_size**: Memory budget shared by all buckets of a node (default: 256MB)
//! - **reclaim_interval_ms**: Period of the background reclamation pass (default: 5s)
//!
//! The budget is advisory: allocation never blocks, and the pool only gets back under
//! `max_pool_size` when a reclamation pass runs.
//!
//! ## Usage
//!
//! ```ignore
//! use feedhouse_storage::BufferConfig;
//!
//! // Small buckets for tests
//! let config = BufferConfig {
//!     bucket_size: 4 * 1024,
//!     max_pool_size: 64 * 1024,
//!     ..Default::default()
//! };
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferConfig {
    /// Capacity of a new bucket in bytes (default: 1MB)
    #[serde(default = "default_bucket_size")]
    pub bucket_size: usize,

    /// Total bucket capacity allowed across all buffers (default: 256MB)
    #[serde(default = "default_max_pool_size")]
    pub max_pool_size: usize,

    /// Background reclamation period in milliseconds (default: 5 seconds)
    #[serde(default = "default_reclaim_interval_ms")]
    pub reclaim_interval_ms: u64,
}

impl BufferConfig {
    pub fn reclaim_interval(&self) -> Duration {
        Duration::from_millis(self.reclaim_interval_ms)
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            bucket_size: default_bucket_size(),
            max_pool_size: default_max_pool_size(),
            reclaim_interval_ms: default_reclaim_interval_ms(),
        }
    }
}

fn default_bucket_size() -> usize {
    1024 * 1024 // 1MB
}

fn default_max_pool_size() -> usize {
    256 * 1024 * 1024 // 256MB
}

fn default_reclaim_interval_ms() -> u64 {
    5_000 // 5 seconds
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_apply_to_missing_fields() {
        let config: BufferConfig = serde_json::from_str(r#"{"bucket_size": 4096}"#).unwrap();
        assert_eq!(config.bucket_size, 4096);
        assert_eq!(config.max_pool_size, default_max_pool_size());
        assert_eq!(config.reclaim_interval(), Duration::from_secs(5));
    }
}
