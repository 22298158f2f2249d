//! Message Buffer
//!
//! A `MessageBuffer` is the per-feed circular log: an ordered run of buckets, the
//! last of which accepts writes, guarded by one read/write lock.
//!
//! ## Write Path
//!
//! 1. Take the write lock
//! 2. Stamp the message with the node clock (inside the lock, so storage order and
//!    timestamp order always agree)
//! 3. Append the encoded frame to the current bucket; on overflow grow the empty
//!    current bucket or allocate a new one from the `BufferPool` and resume the write
//! 4. Release the write lock, then wake long-poll waiters through the
//!    `CallbackRegistry`
//!
//! ## Read Path
//!
//! Reads return a `BufferIter` that owns a read guard for its whole lifetime and
//! decodes frames lazily. While any iterator is alive, writers to this buffer wait;
//! other buffers are unaffected.
//!
//! ## Horizon
//!
//! Until the pool evicts a bucket the buffer holds every message it ever stored. After
//! an eviction the horizon moves to just past the last evicted timestamp, and queries
//! starting before it are reported as incomplete so callers can relay to peers.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use feedhouse_core::{Message, MessageClock, Timestamp};
use feedhouse_observability::metrics;
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedRwLockReadGuard, RwLock};

use crate::bucket::{Bucket, BucketOverflow};
use crate::callbacks::{BufferCallback, CallbackRegistry};
use crate::codec;
use crate::error::Result;
use crate::pool::BufferPool;

/// Answer of a buffer asked to drop one of its buckets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eviction {
    Evicted,
    /// The bucket is the current write bucket
    Retained,
    /// The buffer does not hold that bucket
    Unknown,
}

#[derive(Debug, Default)]
pub(crate) struct BufferState {
    buckets: VecDeque<Bucket>,
    horizon: Timestamp,
    message_count: usize,
}

/// Buffer statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferStats {
    pub bucket_count: usize,
    pub message_count: usize,
    pub bytes_used: usize,
    pub capacity: usize,
    pub earliest: Option<Timestamp>,
    pub latest: Option<Timestamp>,
    pub horizon: Timestamp,
}

pub struct MessageBuffer {
    this: Weak<MessageBuffer>,
    pool: Arc<BufferPool>,
    clock: Arc<MessageClock>,
    state: Arc<RwLock<BufferState>>,
    callbacks: CallbackRegistry,
}

impl MessageBuffer {
    pub fn new(pool: Arc<BufferPool>, clock: Arc<MessageClock>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            pool,
            clock,
            state: Arc::new(RwLock::new(BufferState::default())),
            callbacks: CallbackRegistry::new(),
        })
    }

    pub fn callbacks(&self) -> &CallbackRegistry {
        &self.callbacks
    }

    /// Stamp and store a message, returning the stored copy
    pub async fn add_message(&self, mut message: Message) -> Result<Message> {
        {
            let mut state = self.state.write().await;
            message.timestamp = self.clock.now();
            let frame = codec::encode(&message)?;
            self.write_frame(&mut state, message.timestamp, &frame);
        }

        self.callbacks.dispatch(self).await;
        Ok(message)
    }

    fn write_frame(&self, state: &mut BufferState, timestamp: Timestamp, frame: &[u8]) {
        if state.buckets.is_empty() {
            let bucket = self.pool.get_bucket(self.pool.bucket_size(), self.this.clone());
            state.buckets.push_back(bucket);
        }

        let Some(current) = state.buckets.back_mut() else {
            return;
        };
        if let Err(overflow) = current.append_raw(timestamp, frame) {
            metrics::BUCKET_OVERFLOWS_TOTAL.inc();
            self.recover(state, overflow);
        }
        state.message_count += 1;
    }

    fn recover(&self, state: &mut BufferState, overflow: BucketOverflow) {
        let current_capacity = state
            .buckets
            .back()
            .map_or(self.pool.bucket_size(), Bucket::capacity);
        let size = next_bucket_size(current_capacity, overflow.len());

        // An empty current bucket grows in place instead of being left behind
        if state.buckets.back().is_some_and(Bucket::is_empty) {
            if let Some(current) = state.buckets.back_mut() {
                current.resize(size);
                self.pool.resized(current.id(), current.capacity());
            }
        } else {
            state
                .buckets
                .push_back(self.pool.get_bucket(size, self.this.clone()));
        }

        if let Some(current) = state.buckets.back_mut() {
            if let Err(overflow) = current.resume(overflow) {
                tracing::error!(
                    bucket_id = current.id(),
                    frame_len = overflow.len(),
                    "Frame does not fit a freshly sized bucket"
                );
            }
        }
    }

    /// Messages with timestamp strictly after `from`
    pub async fn messages_after(&self, from: Timestamp) -> BufferIter {
        self.messages_between(from, false, Timestamp::MAX, true).await
    }

    /// Messages in a range, each bound inclusive or exclusive
    pub async fn messages_between(
        &self,
        from: Timestamp,
        from_inclusive: bool,
        to: Timestamp,
        to_inclusive: bool,
    ) -> BufferIter {
        let guard = self.state.clone().read_owned().await;
        BufferIter::new(guard, from, from_inclusive, to, to_inclusive)
    }

    /// Deliver messages after `from` now, or register for the next write
    ///
    /// Returns `true` if the callback ran immediately.
    pub async fn messages_after_or_register(
        &self,
        from: Timestamp,
        callback: BufferCallback,
    ) -> bool {
        let mut iter = self.messages_after(from).await;
        if iter.is_exhausted() {
            // Registered under the read guard so no write can slip in between
            self.callbacks.register(from, callback);
            drop(iter);
            false
        } else {
            callback(iter);
            true
        }
    }

    /// Drop the leading bucket if it is `bucket_id` and not the current bucket
    pub async fn evict_bucket(&self, bucket_id: u64) -> Eviction {
        let mut state = self.state.write().await;

        let Some(position) = state.buckets.iter().position(|b| b.id() == bucket_id) else {
            return Eviction::Unknown;
        };
        if position != 0 || state.buckets.len() == 1 {
            return Eviction::Retained;
        }

        let Some(bucket) = state.buckets.pop_front() else {
            return Eviction::Unknown;
        };
        state.message_count -= bucket.message_count();
        if let Some(last) = bucket.last_timestamp() {
            state.horizon = last.next();
        }

        tracing::debug!(
            bucket_id,
            messages = bucket.message_count(),
            horizon = %state.horizon,
            "Evicted bucket"
        );
        Eviction::Evicted
    }

    /// Earliest timestamp that is guaranteed to still be held
    pub async fn horizon(&self) -> Timestamp {
        self.state.read().await.horizon
    }

    /// True if every message at or after (or strictly after) `from` is still held
    pub async fn is_complete(&self, from: Timestamp, from_inclusive: bool) -> bool {
        let horizon = self.horizon().await;
        if from_inclusive {
            from >= horizon
        } else {
            from.next() >= horizon
        }
    }

    pub async fn stats(&self) -> BufferStats {
        let state = self.state.read().await;
        BufferStats {
            bucket_count: state.buckets.len(),
            message_count: state.message_count,
            bytes_used: state.buckets.iter().map(Bucket::len).sum(),
            capacity: state.buckets.iter().map(Bucket::capacity).sum(),
            earliest: state.earliest(),
            latest: state.latest(),
            horizon: state.horizon,
        }
    }
}

/// Capacity of the bucket that follows one of `current` bytes which a `needed`-byte
/// frame overflowed
fn next_bucket_size(current: usize, needed: usize) -> usize {
    if needed > current / 2 {
        current.max(needed * 2)
    } else {
        current
    }
}

impl BufferState {
    fn earliest(&self) -> Option<Timestamp> {
        self.buckets.iter().find_map(Bucket::first_timestamp)
    }

    fn latest(&self) -> Option<Timestamp> {
        self.buckets.iter().rev().find_map(Bucket::last_timestamp)
    }
}

impl std::fmt::Debug for MessageBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBuffer")
            .field("waiters", &self.callbacks.len())
            .finish()
    }
}

/// Lazy iterator over a buffer range, holding the buffer's read lock
pub struct BufferIter {
    guard: OwnedRwLockReadGuard<BufferState>,
    bucket: usize,
    position: usize,
    to: Timestamp,
    to_inclusive: bool,
}

impl BufferIter {
    fn new(
        guard: OwnedRwLockReadGuard<BufferState>,
        from: Timestamp,
        from_inclusive: bool,
        to: Timestamp,
        to_inclusive: bool,
    ) -> Self {
        let bucket = guard
            .buckets
            .partition_point(|b| b.first_timestamp().is_some_and(|first| first <= from))
            .saturating_sub(1);
        let position = guard
            .buckets
            .get(bucket)
            .map_or(0, |b| b.position_from(from, !from_inclusive));

        Self {
            guard,
            bucket,
            position,
            to,
            to_inclusive,
        }
    }

    /// Horizon of the buffer as of this read
    pub fn horizon(&self) -> Timestamp {
        self.guard.horizon
    }

    /// Timestamp of the next message, without consuming it
    pub fn peek_timestamp(&mut self) -> Option<Timestamp> {
        self.settle().map(|(_, entry)| entry.timestamp)
    }

    pub fn is_exhausted(&mut self) -> bool {
        self.peek_timestamp().is_none()
    }

    /// Move to the next index entry inside the range, crossing bucket boundaries
    fn settle(&mut self) -> Option<(usize, crate::bucket::IndexEntry)> {
        loop {
            let bucket = self.guard.buckets.get(self.bucket)?;
            match bucket.entry(self.position) {
                Some(entry) => {
                    let in_range = if self.to_inclusive {
                        entry.timestamp <= self.to
                    } else {
                        entry.timestamp < self.to
                    };
                    return in_range.then_some((self.bucket, entry));
                }
                None => {
                    self.bucket += 1;
                    self.position = 0;
                }
            }
        }
    }
}

impl Iterator for BufferIter {
    type Item = Message;

    fn next(&mut self) -> Option<Message> {
        loop {
            let (bucket, entry) = self.settle()?;
            self.position += 1;
            if let Some(message) = self.guard.buckets.get(bucket).and_then(|b| b.decode(&entry)) {
                return Some(message);
            }
        }
    }
}
