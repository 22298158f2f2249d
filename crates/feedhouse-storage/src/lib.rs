//! FeedHouse Storage Layer
//!
//! This crate implements the in-memory message store of a FeedHouse node: the
//! per-feed `MessageBuffer` and the `BufferPool` that bounds the memory all buffers
//! use together.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────┐
//! │    Feed     │
//! └──────┬──────┘
//!        │ add_message / messages_after
//!        ▼
//! ┌─────────────────┐        ┌──────────────────┐
//! │ MessageBuffer   │───────►│ CallbackRegistry │  wake long-poll waiters
//! │ - RwLock        │        └──────────────────┘
//! │ - clock stamps  │
//! └────────┬────────┘
//!          │ frames
//!          ▼
//! ┌─────────────────┐        ┌──────────────────┐
//! │ Bucket, Bucket, │◄──────►│   BufferPool     │  allocate / evict oldest
//! │ ..., current    │        └──────────────────┘
//! └─────────────────┘
//! ```
//!
//! ## Main Components
//!
//! ### Bucket
//! Fixed-capacity arena of encoded frames plus a timestamp index. Overflow is a
//! value, not an error, and is resumed in a bucket with room.
//!
//! ### MessageBuffer
//! Per-feed log of buckets. One writer or many readers at a time; read iterators hold
//! the read lock until dropped.
//!
//! ### BufferPool
//! Global accounting of bucket capacity against the node budget, with explicit and
//! background reclamation.
//!
//! ### MergeIter
//! Lazy timestamp-ordered merge used to combine the buffers of a feed subtree.
//!
//! ## Usage Example
//!
//! ```ignore
//! use feedhouse_storage::{BufferConfig, BufferPool, MessageBuffer};
//!
//! let pool = Arc::new(BufferPool::new(BufferConfig::default()));
//! let buffer = MessageBuffer::new(pool, Arc::new(MessageClock::new()));
//!
//! let stored = buffer.add_message(message).await?;
//! for message in buffer.messages_after(Timestamp::EPOCH).await {
//!     println!("{} at {}", message.path, message.timestamp);
//! }
//! ```

pub mod bucket;
pub mod buffer;
pub mod callbacks;
pub mod codec;
pub mod config;
pub mod error;
pub mod merge;
pub mod pool;

pub use bucket::{Bucket, BucketOverflow, IndexEntry};
pub use buffer::{BufferIter, BufferStats, Eviction, MessageBuffer};
pub use callbacks::{BufferCallback, CallbackRegistry};
pub use config::BufferConfig;
pub use error::{Error, Result};
pub use merge::{MergeIter, MessageIter};
pub use pool::{BufferPool, PoolStats};
