//! Buffer Pool
//!
//! The `BufferPool` accounts for the memory committed to buckets across every
//! `MessageBuffer` of a node and reclaims whole buckets when the node goes over its
//! budget.
//!
//! ## Accounting
//!
//! - `get_bucket` always succeeds; the budget is advisory and allocation never blocks
//! - Each allocation is registered in allocation order along with a weak handle to
//!   the owning buffer
//! - Growing a bucket in place (`resized`) only adds the capacity delta
//!
//! ## Reclamation
//!
//! ```text
//! registrations (oldest first)
//! ┌──────────┬──────────┬──────────┬──────────┐
//! │ A:bkt 1  │ B:bkt 2  │ A:bkt 3  │ B:bkt 4  │
//! └──────────┴──────────┴──────────┴──────────┘
//!      │ over budget?
//!      ▼
//! ask buffer A to drop its leading bucket (1), then B (2), ...
//! until current_size <= max_size
//! ```
//!
//! A buffer never gives up its current (write) bucket. Registrations whose owner has
//! been dropped are released without asking anyone.
//!
//! `deallocate_buckets` is an explicit pass; `start_background_reclaim` runs it on an
//! interval.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use feedhouse_observability::metrics;
use serde::{Deserialize, Serialize};
use tokio::time;

use crate::buffer::{Eviction, MessageBuffer};
use crate::bucket::Bucket;
use crate::config::BufferConfig;

struct Registration {
    bucket_id: u64,
    capacity: usize,
    owner: Weak<MessageBuffer>,
}

#[derive(Default)]
struct PoolState {
    current_size: usize,
    registrations: VecDeque<Registration>,
}

/// Pool statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolStats {
    pub current_size: usize,
    pub max_size: usize,
    pub bucket_count: usize,
    pub utilization_pct: f64,
}

pub struct BufferPool {
    config: BufferConfig,
    next_bucket_id: AtomicU64,
    state: Mutex<PoolState>,
}

impl BufferPool {
    pub fn new(config: BufferConfig) -> Self {
        Self {
            config,
            next_bucket_id: AtomicU64::new(1),
            state: Mutex::new(PoolState::default()),
        }
    }

    pub fn config(&self) -> &BufferConfig {
        &self.config
    }

    /// Capacity of a regular bucket
    pub fn bucket_size(&self) -> usize {
        self.config.bucket_size
    }

    pub fn max_size(&self) -> usize {
        self.config.max_pool_size
    }

    pub fn current_size(&self) -> usize {
        self.lock().current_size
    }

    /// Allocate and register a bucket for `owner`
    pub fn get_bucket(&self, size: usize, owner: Weak<MessageBuffer>) -> Bucket {
        let bucket_id = self.next_bucket_id.fetch_add(1, Ordering::Relaxed);

        let mut state = self.lock();
        state.current_size += size;
        state.registrations.push_back(Registration {
            bucket_id,
            capacity: size,
            owner,
        });

        if state.current_size > self.config.max_pool_size {
            tracing::debug!(
                current_size = state.current_size,
                max_size = self.config.max_pool_size,
                "Buffer pool over budget"
            );
        }
        drop(state);

        metrics::BUCKETS_ALLOCATED_TOTAL.inc();
        metrics::POOL_SIZE_BYTES.add(size as i64);

        Bucket::new(bucket_id, size)
    }

    /// Record that a bucket was grown in place
    pub fn resized(&self, bucket_id: u64, new_capacity: usize) {
        let mut state = self.lock();
        let Some(registration) = state
            .registrations
            .iter_mut()
            .find(|r| r.bucket_id == bucket_id)
        else {
            return;
        };

        let old_capacity = registration.capacity;
        registration.capacity = new_capacity;
        state.current_size = state.current_size + new_capacity - old_capacity;
        drop(state);

        metrics::POOL_SIZE_BYTES.add(new_capacity as i64 - old_capacity as i64);
    }

    /// Evict buckets, oldest first, until the pool is within budget
    ///
    /// Returns the number of buckets evicted.
    pub async fn deallocate_buckets(&self) -> usize {
        let candidates: Vec<(u64, Weak<MessageBuffer>)> = {
            let state = self.lock();
            if state.current_size <= self.config.max_pool_size {
                return 0;
            }
            state
                .registrations
                .iter()
                .map(|r| (r.bucket_id, r.owner.clone()))
                .collect()
        };

        let mut evicted = 0;
        for (bucket_id, owner) in candidates {
            if self.current_size() <= self.config.max_pool_size {
                break;
            }

            let eviction = match owner.upgrade() {
                Some(buffer) => buffer.evict_bucket(bucket_id).await,
                None => Eviction::Unknown,
            };

            match eviction {
                Eviction::Retained => continue,
                Eviction::Evicted => {
                    self.release(bucket_id);
                    evicted += 1;
                    metrics::BUCKETS_EVICTED_TOTAL.inc();
                }
                Eviction::Unknown => self.release(bucket_id),
            }
        }

        if evicted > 0 {
            tracing::debug!(
                evicted,
                current_size = self.current_size(),
                "Reclaimed buffer pool memory"
            );
        }

        evicted
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.lock();
        let utilization_pct = if self.config.max_pool_size > 0 {
            (state.current_size as f64 / self.config.max_pool_size as f64) * 100.0
        } else {
            0.0
        };

        PoolStats {
            current_size: state.current_size,
            max_size: self.config.max_pool_size,
            bucket_count: state.registrations.len(),
            utilization_pct,
        }
    }

    /// Start background reclamation
    ///
    /// Spawns a tokio task that runs `deallocate_buckets` every `interval`.
    ///
    /// ## Example
    ///
    /// ```ignore
    /// let handle = pool.clone().start_background_reclaim(Duration::from_secs(5));
    ///
    /// // Later, during shutdown:
    /// handle.abort();
    /// ```
    pub fn start_background_reclaim(
        self: Arc<Self>,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(time::MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;

                tracing::trace!("Background reclaim tick");
                self.deallocate_buckets().await;
            }
        })
    }

    fn release(&self, bucket_id: u64) {
        let mut state = self.lock();
        let Some(index) = state
            .registrations
            .iter()
            .position(|r| r.bucket_id == bucket_id)
        else {
            return;
        };

        if let Some(registration) = state.registrations.remove(index) {
            state.current_size -= registration.capacity;
            drop(state);
            metrics::POOL_SIZE_BYTES.sub(registration.capacity as i64);
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("config", &self.config)
            .field("current_size", &self.current_size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(bucket_size: usize, max_pool_size: usize) -> BufferPool {
        BufferPool::new(BufferConfig {
            bucket_size,
            max_pool_size,
            ..Default::default()
        })
    }

    #[test]
    fn test_get_bucket_never_blocks_over_budget() {
        let pool = pool(100, 150);
        let a = pool.get_bucket(100, Weak::new());
        let b = pool.get_bucket(100, Weak::new());

        assert_ne!(a.id(), b.id());
        assert_eq!(pool.current_size(), 200);
        assert_eq!(pool.stats().bucket_count, 2);
    }

    #[test]
    fn test_resized_adjusts_by_delta() {
        let pool = pool(100, 1000);
        let bucket = pool.get_bucket(100, Weak::new());
        pool.resized(bucket.id(), 250);

        assert_eq!(pool.current_size(), 250);
        assert!((pool.stats().utilization_pct - 25.0).abs() < 0.01);
    }

    #[tokio::test]
    async fn test_dead_owners_are_released() {
        let pool = pool(100, 150);
        pool.get_bucket(100, Weak::new());
        pool.get_bucket(100, Weak::new());

        let evicted = pool.deallocate_buckets().await;
        assert_eq!(evicted, 0);
        assert_eq!(pool.current_size(), 100);
        assert_eq!(pool.stats().bucket_count, 1);
    }
}
