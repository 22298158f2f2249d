//! Buckets
//!
//! A `Bucket` is a fixed-capacity, append-only byte arena holding encoded message
//! frames, plus a time-sorted index of where each frame starts.
//!
//! ## Layout
//!
//! ```text
//! data:  [frame 0][frame 1][frame 2] ........ free ........
//!         ▲        ▲        ▲
//! index: (t0, 0)  (t1, n0) (t2, n0+n1)          t0 < t1 < t2
//! ```
//!
//! Written bytes are never modified. A bucket may only grow (`resize`), which the
//! owning buffer does while the bucket is empty and current.
//!
//! ## Overflow
//!
//! When a frame does not fit, nothing is committed. The bucket returns a
//! `BucketOverflow` carrying the part of the frame that fit and the part still
//! pending, and the caller resumes the write in a bucket with room:
//!
//! ```ignore
//! if let Err(overflow) = current.append(&message)? {
//!     let mut next = pool.get_bucket(overflow.len().max(bucket_size), owner);
//!     next.resume(overflow)?;
//! }
//! ```
//!
//! Resuming writes exactly the bytes an uninterrupted write would have produced.

use bytes::Bytes;
use feedhouse_core::{Message, Timestamp};

use crate::codec;
use crate::error::Result;

/// Position of one frame inside a bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub timestamp: Timestamp,
    pub offset: usize,
    pub len: usize,
}

/// A frame that did not fit into a bucket
#[derive(Debug, Clone)]
pub struct BucketOverflow {
    pub timestamp: Timestamp,
    /// Prefix of the frame that fit into the remaining space
    pub written: Bytes,
    /// Remainder that still needs room
    pub pending: Bytes,
}

impl BucketOverflow {
    /// Total frame length
    pub fn len(&self) -> usize {
        self.written.len() + self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn frame(&self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(self.len());
        frame.extend_from_slice(&self.written);
        frame.extend_from_slice(&self.pending);
        frame
    }
}

/// Result of an append that did not fail outright
pub type Append = std::result::Result<(), BucketOverflow>;

#[derive(Debug)]
pub struct Bucket {
    id: u64,
    capacity: usize,
    data: Vec<u8>,
    index: Vec<IndexEntry>,
}

impl Bucket {
    pub fn new(id: u64, capacity: usize) -> Self {
        Self {
            id,
            capacity,
            data: Vec::with_capacity(capacity),
            index: Vec::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes used by stored frames
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn remaining(&self) -> usize {
        self.capacity - self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn message_count(&self) -> usize {
        self.index.len()
    }

    pub fn first_timestamp(&self) -> Option<Timestamp> {
        self.index.first().map(|e| e.timestamp)
    }

    pub fn last_timestamp(&self) -> Option<Timestamp> {
        self.index.last().map(|e| e.timestamp)
    }

    /// Encode and store a message under its own timestamp
    ///
    /// The outer `Result` carries encoding failures, the inner one an overflow.
    pub fn append(&mut self, message: &Message) -> Result<Append> {
        let frame = codec::encode(message)?;
        Ok(self.append_raw(message.timestamp, &frame))
    }

    /// Store an already encoded frame verbatim
    ///
    /// Timestamps must be strictly increasing within a bucket; the caller enforces it.
    pub fn append_raw(&mut self, timestamp: Timestamp, frame: &[u8]) -> Append {
        if frame.len() > self.remaining() {
            let (written, pending) = frame.split_at(self.remaining());
            return Err(BucketOverflow {
                timestamp,
                written: Bytes::copy_from_slice(written),
                pending: Bytes::copy_from_slice(pending),
            });
        }

        debug_assert!(self.last_timestamp().map_or(true, |last| last < timestamp));

        self.index.push(IndexEntry {
            timestamp,
            offset: self.data.len(),
            len: frame.len(),
        });
        self.data.extend_from_slice(frame);
        Ok(())
    }

    /// Finish a write that overflowed another bucket
    pub fn resume(&mut self, overflow: BucketOverflow) -> Append {
        let frame = overflow.frame();
        self.append_raw(overflow.timestamp, &frame)
    }

    /// Grow the capacity; shrinking is ignored
    pub fn resize(&mut self, new_capacity: usize) {
        if new_capacity > self.capacity {
            self.data.reserve_exact(new_capacity - self.data.len());
            self.capacity = new_capacity;
        }
    }

    /// Index position of the first entry after (or at, if inclusive) `timestamp`
    pub fn position_from(&self, timestamp: Timestamp, exclusive: bool) -> usize {
        if exclusive {
            self.index.partition_point(|e| e.timestamp <= timestamp)
        } else {
            self.index.partition_point(|e| e.timestamp < timestamp)
        }
    }

    pub fn entry(&self, position: usize) -> Option<IndexEntry> {
        self.index.get(position).copied()
    }

    /// Raw frame bytes for an index entry
    pub fn frame(&self, entry: &IndexEntry) -> &[u8] {
        &self.data[entry.offset..entry.offset + entry.len]
    }

    /// Decoded messages after (or at) `timestamp`, skipping undecodable frames
    pub fn messages_from(
        &self,
        timestamp: Timestamp,
        exclusive: bool,
    ) -> impl Iterator<Item = Message> + '_ {
        self.index[self.position_from(timestamp, exclusive)..]
            .iter()
            .filter_map(move |entry| self.decode(entry))
    }

    pub(crate) fn decode(&self, entry: &IndexEntry) -> Option<Message> {
        match codec::decode(self.frame(entry)) {
            Ok(mut message) => {
                message.timestamp = entry.timestamp;
                Some(message)
            }
            Err(e) => {
                tracing::warn!(
                    bucket_id = self.id,
                    offset = entry.offset,
                    error = %e,
                    "Skipping undecodable frame"
                );
                None
            }
        }
    }
}
