//! Feed Nodes
//!
//! A `Feed` is one node of the feed tree: its own `MessageBuffer`, the segments of its
//! children, and the long-polls waiting on its subtree.
//!
//! ## Pending Requests
//!
//! ```text
//!             trigger (matching write)
//! Waiting ───────────────────────────► Triggered ──► Done
//!    │                                     ▲
//!    │ deadline passed                     │ re-search empty: back to Waiting
//!    ├────────────────────────────────► TimedOut ──► Done
//!    │
//!    └── receiver dropped ─────────────► skipped when next taken ──► Done
//! ```
//!
//! Requests are indexed three ways: by id, by resume timestamp (for triggers) and by
//! deadline (for the feed's single timer). Taking a request removes it from all three
//! indexes, so a request is resolved exactly once.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use feedhouse_core::{FeedPath, Message, Segment, Timestamp};
use feedhouse_observability::metrics;
use feedhouse_storage::MessageBuffer;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::Result;
use crate::search::{SearchOutcome, SearchRequest};

/// A long-poll waiting for data
pub(crate) struct PendingRequest {
    pub id: u64,
    pub request: SearchRequest,
    pub deadline: Option<Instant>,
    sender: oneshot::Sender<Result<SearchOutcome>>,
}

impl PendingRequest {
    pub fn new(
        id: u64,
        request: SearchRequest,
        deadline: Option<Instant>,
        sender: oneshot::Sender<Result<SearchOutcome>>,
    ) -> Self {
        Self {
            id,
            request,
            deadline,
            sender,
        }
    }

    /// The caller dropped its `PendingSearch`
    pub fn is_cancelled(&self) -> bool {
        self.sender.is_closed()
    }

    /// Hand the result to the caller; false if nobody is listening any more
    pub fn resolve(self, result: Result<SearchOutcome>) -> bool {
        self.sender.send(result).is_ok()
    }

    /// True if `message` can satisfy this request
    fn wakes_on(&self, message: &Message) -> bool {
        self.request.accepts_timestamp(message.timestamp) && self.request.filter.matches(message)
    }
}

#[derive(Default)]
struct PendingIndex {
    requests: BTreeMap<u64, PendingRequest>,
    by_resume: BTreeSet<(Timestamp, u64)>,
    timeouts: BTreeSet<(Instant, u64)>,
}

impl PendingIndex {
    fn insert(&mut self, pending: PendingRequest) {
        self.by_resume.insert((pending.request.from, pending.id));
        if let Some(deadline) = pending.deadline {
            self.timeouts.insert((deadline, pending.id));
        }
        self.requests.insert(pending.id, pending);
    }

    fn remove(&mut self, id: u64) -> Option<PendingRequest> {
        let pending = self.requests.remove(&id)?;
        self.by_resume.remove(&(pending.request.from, id));
        if let Some(deadline) = pending.deadline {
            self.timeouts.remove(&(deadline, id));
        }
        Some(pending)
    }

    fn remove_all(&mut self, ids: Vec<u64>) -> Vec<PendingRequest> {
        ids.into_iter().filter_map(|id| self.remove(id)).collect()
    }
}

/// The feed's single delayed timer
pub(crate) struct TimerSlot {
    pub deadline: Instant,
    pub generation: u64,
    pub handle: JoinHandle<()>,
}

pub struct Feed {
    path: FeedPath,
    buffer: Arc<MessageBuffer>,
    children: Mutex<BTreeSet<Segment>>,
    pending: Mutex<PendingIndex>,
    timer: Mutex<Option<TimerSlot>>,
    timer_generation: AtomicU64,
}

impl Feed {
    pub fn new(path: FeedPath, buffer: Arc<MessageBuffer>) -> Self {
        Self {
            path,
            buffer,
            children: Mutex::new(BTreeSet::new()),
            pending: Mutex::new(PendingIndex::default()),
            timer: Mutex::new(None),
            timer_generation: AtomicU64::new(0),
        }
    }

    pub fn path(&self) -> &FeedPath {
        &self.path
    }

    pub fn buffer(&self) -> &Arc<MessageBuffer> {
        &self.buffer
    }

    pub fn children(&self) -> Vec<Segment> {
        lock(&self.children).iter().cloned().collect()
    }

    /// Record a child segment; returns false if it was already known
    pub(crate) fn add_child(&self, segment: Segment) -> bool {
        lock(&self.children).insert(segment)
    }

    /// Long-polls currently waiting on this feed
    pub fn pending_count(&self) -> usize {
        lock(&self.pending).requests.len()
    }

    pub(crate) fn register(&self, pending: PendingRequest) {
        lock(&self.pending).insert(pending);
        metrics::LONG_POLLS_PENDING.inc();
    }

    pub(crate) fn take(&self, id: u64) -> Option<PendingRequest> {
        let pending = lock(&self.pending).remove(id);
        if pending.is_some() {
            metrics::LONG_POLLS_PENDING.dec();
        }
        pending
    }

    /// Remove every request that `message` may satisfy, plus cancelled ones it passes
    pub(crate) fn take_triggered(&self, message: &Message) -> Vec<PendingRequest> {
        let mut index = lock(&self.pending);

        let ids: Vec<u64> = index
            .by_resume
            .range(..=(message.timestamp, u64::MAX))
            .map(|&(_, id)| id)
            .filter(|id| {
                index
                    .requests
                    .get(id)
                    .is_some_and(|p| p.is_cancelled() || p.wakes_on(message))
            })
            .collect();

        let taken = index.remove_all(ids);
        drop(index);

        metrics::LONG_POLLS_PENDING.sub(taken.len() as i64);
        taken
    }

    /// Remove every request whose deadline is at or before `now`
    pub(crate) fn take_expired(&self, now: Instant) -> Vec<PendingRequest> {
        let mut index = lock(&self.pending);

        let ids: Vec<u64> = index
            .timeouts
            .iter()
            .take_while(|(deadline, _)| *deadline <= now)
            .map(|&(_, id)| id)
            .collect();

        let taken = index.remove_all(ids);
        drop(index);

        metrics::LONG_POLLS_PENDING.sub(taken.len() as i64);
        taken
    }

    pub(crate) fn take_all(&self) -> Vec<PendingRequest> {
        let mut index = lock(&self.pending);
        let ids: Vec<u64> = index.requests.keys().copied().collect();
        let taken = index.remove_all(ids);
        drop(index);

        metrics::LONG_POLLS_PENDING.sub(taken.len() as i64);
        taken
    }

    /// Earliest deadline still pending
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        lock(&self.pending)
            .timeouts
            .first()
            .map(|&(deadline, _)| deadline)
    }

    pub(crate) fn timer(&self) -> MutexGuard<'_, Option<TimerSlot>> {
        lock(&self.timer)
    }

    pub(crate) fn next_timer_generation(&self) -> u64 {
        self.timer_generation.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Abort the scheduled timer, if any
    pub(crate) fn cancel_timer(&self) {
        if let Some(slot) = self.timer().take() {
            slot.handle.abort();
        }
    }
}

impl std::fmt::Debug for Feed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Feed")
            .field("path", &self.path.to_string())
            .field("pending", &self.pending_count())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::MessageFilter;
    use feedhouse_core::{MessageClock, MessageType};
    use feedhouse_storage::{BufferConfig, BufferPool};
    use std::time::Duration;

    fn feed() -> Feed {
        let pool = Arc::new(BufferPool::new(BufferConfig::default()));
        let buffer = MessageBuffer::new(pool, Arc::new(MessageClock::new()));
        Feed::new("/a".parse().unwrap(), buffer)
    }

    fn pending(
        id: u64,
        from: u64,
        filter: MessageFilter,
        deadline: Option<Instant>,
    ) -> (PendingRequest, oneshot::Receiver<Result<SearchOutcome>>) {
        let (tx, rx) = oneshot::channel();
        let request = SearchRequest::new("/a".parse().unwrap())
            .after(Timestamp::from_nanos(from))
            .with_filter(filter);
        (PendingRequest::new(id, request, deadline, tx), rx)
    }

    fn message(ts: u64, kind: MessageType) -> Message {
        let mut message = Message::new("/a/~~m".parse().unwrap(), "x").with_kind(kind);
        message.timestamp = Timestamp::from_nanos(ts);
        message
    }

    #[test]
    fn test_trigger_takes_only_earlier_matching_requests() {
        let feed = feed();
        let (early, _rx1) = pending(1, 10, MessageFilter::any(), None);
        let (late, _rx2) = pending(2, 50, MessageFilter::any(), None);
        let (acks_ignored, _rx3) = pending(3, 10, MessageFilter::messages_only(), None);
        feed.register(early);
        feed.register(late);
        feed.register(acks_ignored);

        let taken = feed.take_triggered(&message(20, MessageType::Ack));
        let ids: Vec<u64> = taken.iter().map(|p| p.id).collect();

        assert_eq!(ids, vec![1]);
        assert_eq!(feed.pending_count(), 2);
    }

    #[test]
    fn test_cancelled_requests_are_pruned_on_trigger() {
        let feed = feed();
        let (request, rx) = pending(1, 10, MessageFilter::messages_only(), None);
        feed.register(request);
        drop(rx);

        let taken = feed.take_triggered(&message(20, MessageType::Ack));
        assert_eq!(taken.len(), 1);
        assert!(taken[0].is_cancelled());
        assert_eq!(feed.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_expired_in_deadline_order() {
        let feed = feed();
        let now = Instant::now();
        let (a, _rx1) = pending(1, 0, MessageFilter::any(), Some(now + Duration::from_secs(5)));
        let (b, _rx2) = pending(2, 0, MessageFilter::any(), Some(now));
        let (c, _rx3) = pending(3, 0, MessageFilter::any(), None);
        feed.register(a);
        feed.register(b);
        feed.register(c);

        assert_eq!(feed.next_deadline(), Some(now));

        let expired = feed.take_expired(now);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, 2);
        assert_eq!(feed.next_deadline(), Some(now + Duration::from_secs(5)));

        let rest = feed.take_all();
        assert_eq!(rest.len(), 2);
        assert!(feed.next_deadline().is_none());
    }

    #[test]
    fn test_take_removes_from_every_index() {
        let feed = feed();
        let (request, _rx) = pending(7, 0, MessageFilter::any(), Some(Instant::now()));
        feed.register(request);

        assert!(feed.take(7).is_some());
        assert!(feed.take(7).is_none());
        assert!(feed.next_deadline().is_none());
        assert!(feed.take_triggered(&message(5, MessageType::Message)).is_empty());
    }
}
