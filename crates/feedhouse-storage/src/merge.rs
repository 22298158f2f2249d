//! Timestamp-ordered merge of message streams
//!
//! Feed searches combine a feed's own buffer with the buffers of every descendant.
//! Each source is already sorted by timestamp; `MergeIter` interleaves them lazily
//! with a min-heap keyed on the next timestamp of each source. Ties are broken by
//! source order, so the merge is stable.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use feedhouse_core::{Message, Timestamp};

/// Boxed message stream
pub type MessageIter = Box<dyn Iterator<Item = Message> + Send>;

struct Head {
    timestamp: Timestamp,
    source: usize,
    message: Message,
}

impl PartialEq for Head {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Head {}

impl PartialOrd for Head {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Head {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.timestamp, self.source).cmp(&(other.timestamp, other.source))
    }
}

pub struct MergeIter {
    sources: Vec<MessageIter>,
    heap: BinaryHeap<Reverse<Head>>,
}

impl MergeIter {
    pub fn new(sources: Vec<MessageIter>) -> Self {
        let mut merge = Self {
            heap: BinaryHeap::with_capacity(sources.len()),
            sources,
        };
        for source in 0..merge.sources.len() {
            merge.refill(source);
        }
        merge
    }

    fn refill(&mut self, source: usize) {
        if let Some(message) = self.sources[source].next() {
            self.heap.push(Reverse(Head {
                timestamp: message.timestamp,
                source,
                message,
            }));
        }
    }
}

impl Iterator for MergeIter {
    type Item = Message;

    fn next(&mut self) -> Option<Message> {
        let Reverse(head) = self.heap.pop()?;
        self.refill(head.source);
        Some(head.message)
    }
}
