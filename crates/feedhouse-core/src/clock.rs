//! Message Clock
//!
//! Every message stored on a node is stamped by that node's `MessageClock`. The clock
//! produces a strictly increasing sequence of `Timestamp`s, which is what gives each
//! node a total order over its own messages.
//!
//! ## Algorithm
//!
//! 1. Read the wall clock in milliseconds
//! 2. If it moved past the last value used, return `millis * 1_000_000` (counter reset)
//! 3. Otherwise keep the last value pinned and add one nanosecond
//!
//! Under a burst of calls within the same millisecond the clock drifts ahead of wall
//! time by one nanosecond per call; it catches up as soon as the wall clock passes it.
//! The result is always monotonic and unique, even if the wall clock steps backwards.
//!
//! ## Thread Safety
//!
//! `now()` takes a short internal lock; concurrent callers are serialized and each gets
//! a distinct value.
//!
//! ## Example
//!
//! ```ignore
//! let clock = MessageClock::new();
//! let a = clock.now();
//! let b = clock.now();
//! assert!(b > a);
//! ```

use std::fmt;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

const NANOS_PER_MILLI: u64 = 1_000_000;

/// Nanoseconds since the Unix epoch, as assigned by a `MessageClock`
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Before every message
    pub const EPOCH: Timestamp = Timestamp(0);

    /// After every message
    pub const MAX: Timestamp = Timestamp(u64::MAX);

    pub const fn from_nanos(nanos: u64) -> Self {
        Timestamp(nanos)
    }

    pub const fn from_millis(millis: u64) -> Self {
        Timestamp(millis.saturating_mul(NANOS_PER_MILLI))
    }

    pub const fn as_nanos(self) -> u64 {
        self.0
    }

    pub const fn as_millis(self) -> u64 {
        self.0 / NANOS_PER_MILLI
    }

    /// The sub-millisecond counter part
    pub const fn counter(self) -> u64 {
        self.0 % NANOS_PER_MILLI
    }

    /// Smallest timestamp strictly after this one
    pub const fn next(self) -> Self {
        Timestamp(self.0.saturating_add(1))
    }

    /// Largest timestamp strictly before this one
    pub const fn prev(self) -> Self {
        Timestamp(self.0.saturating_sub(1))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = (self.0 / 1_000_000_000) as i64;
        let nanos = (self.0 % 1_000_000_000) as u32;
        match DateTime::<Utc>::from_timestamp(secs, nanos) {
            Some(dt) => write!(f, "{}", dt.to_rfc3339_opts(SecondsFormat::Nanos, true)),
            None => write!(f, "{}ns", self.0),
        }
    }
}

/// Produces strictly increasing timestamps for one node
#[derive(Debug, Default)]
pub struct MessageClock {
    last: Mutex<Timestamp>,
}

impl MessageClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next timestamp; strictly greater than every value previously returned
    pub fn now(&self) -> Timestamp {
        let wall = Timestamp::from_millis(wall_clock_ms());

        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        let next = if wall > *last { wall } else { last.next() };
        *last = next;
        next
    }

    /// Last value handed out (EPOCH if the clock was never read)
    pub fn last(&self) -> Timestamp {
        *self.last.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn wall_clock_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
