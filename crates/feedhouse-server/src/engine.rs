//! Feed Query Engine
//!
//! Writes, searches and long-polls against the feed tree of one node.
//!
//! ## Writes
//!
//! `post` stores a new message under a fresh id together with its `ACK` twin.
//! `replicate` stores a message that was first stored elsewhere, keeping its id and
//! recording where it came from. Both then trigger the written feed and every ancestor.
//!
//! ## Searches
//!
//! ```text
//! search(/shop, after T)
//!   ├─ /shop           buffer range ─┐
//!   ├─ /shop/orders    buffer range ─┼─ merged by timestamp, filtered
//!   ├─ /shop/payments  buffer range ─┘
//!   └─ relay (only if a buffer was trimmed past T): peers fill in [T, horizon)
//! ```
//!
//! A search that finds nothing and asked to wait is parked on the feed as a
//! `PendingRequest` and resolved by the first matching write or by the feed timer.
//! Resolution work always runs on the node's executor, never on the writer's task.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use feedhouse_core::{
    Ack, Error as CoreError, FeedPath, Message, MessageType, RemoteOrigin, ServerId, Timestamp,
};
use feedhouse_observability::metrics;
use feedhouse_storage::{BufferIter, MergeIter, MessageIter};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::time::Instant;
use uuid::Uuid;

use crate::cluster::{Cluster, ServiceFilter};
use crate::config::NodeConfig;
use crate::error::{FeedError, Result};
use crate::feed::{Feed, PendingRequest, TimerSlot};
use crate::search::{PendingSearch, SearchOutcome, SearchRequest};
use crate::services::ListenCallback;
use crate::tree::FeedTree;

pub struct FeedEngine {
    server_id: ServerId,
    config: NodeConfig,
    tree: FeedTree,
    executor: Handle,
    cluster: RwLock<Weak<Cluster>>,
    next_request_id: AtomicU64,
    closed: AtomicBool,
}

impl FeedEngine {
    pub fn new(config: NodeConfig, tree: FeedTree, executor: Handle) -> Self {
        Self {
            server_id: config.server_id(),
            config,
            tree,
            executor,
            cluster: RwLock::new(Weak::new()),
            next_request_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    pub fn server_id(&self) -> &ServerId {
        &self.server_id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn tree(&self) -> &FeedTree {
        &self.tree
    }

    pub fn cluster(&self) -> Option<Arc<Cluster>> {
        self.cluster
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .upgrade()
    }

    pub(crate) fn set_cluster(&self, cluster: &Arc<Cluster>) {
        *self.cluster.write().unwrap_or_else(|e| e.into_inner()) = Arc::downgrade(cluster);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(FeedError::Shutdown);
        }
        Ok(())
    }

    /// Store a new message under a fresh id, plus its `ACK` twin
    pub async fn post(self: &Arc<Self>, mut message: Message) -> Result<Ack> {
        self.ensure_open()?;

        if message.kind != MessageType::Message {
            return Err(CoreError::InvalidMessage(format!(
                "only {} can be posted, got {}",
                MessageType::Message,
                message.kind
            ))
            .into());
        }

        let feed_path = message.feed_path();
        if feed_path.is_root() {
            return Err(CoreError::InvalidPath("cannot post to the root feed".to_string()).into());
        }

        message.path = feed_path.with_message_id(Uuid::new_v4().to_string())?;
        message.server_id = Some(self.server_id.clone());
        message.remote = None;

        let feed = self.tree.get_or_create(&feed_path)?;
        let payload_len = message.payload.len();

        let stored = feed.buffer().add_message(message).await?;
        let mut twin = stored.ack_twin();
        twin.server_id = Some(self.server_id.clone());
        let ack = feed.buffer().add_message(twin).await?;

        metrics::MESSAGES_POSTED_TOTAL.inc();
        metrics::ACKS_STORED_TOTAL.inc();
        metrics::MESSAGE_BYTES_TOTAL.inc_by(payload_len as u64);

        tracing::debug!(
            path = %stored.path,
            timestamp = %stored.timestamp,
            bytes = payload_len,
            "Posted message"
        );

        self.trigger(&feed_path, &stored);
        self.trigger(&feed_path, &ack);

        Ok(Ack {
            path: stored.path,
            timestamp: stored.timestamp,
            server_id: self.server_id.clone(),
        })
    }

    /// Store a message first stored on another node
    pub async fn replicate(self: &Arc<Self>, mut message: Message) -> Result<Ack> {
        self.ensure_open()?;

        let Some(id) = message.id().map(str::to_string) else {
            return Err(CoreError::InvalidMessage(format!(
                "replicated message {} has no id",
                message.path
            ))
            .into());
        };

        let feed_path = message.feed_path();
        if feed_path.is_root() {
            return Err(CoreError::InvalidPath("cannot replicate to the root feed".to_string()).into());
        }

        let origin = match message.remote.take() {
            Some(origin) => origin,
            None => RemoteOrigin {
                message_id: id,
                timestamp: message.timestamp,
                server_id: message.server_id.clone().ok_or_else(|| {
                    CoreError::InvalidMessage(format!(
                        "replicated message {} has no origin server",
                        message.path
                    ))
                })?,
            },
        };
        message.remote = Some(origin);
        message.server_id = Some(self.server_id.clone());

        let feed = self.tree.get_or_create(&feed_path)?;
        let stored = feed.buffer().add_message(message).await?;
        metrics::MESSAGES_REPLICATED_TOTAL.inc();

        // An ACK never gets an ACK of its own
        let ack = if stored.kind == MessageType::Ack {
            None
        } else {
            let mut twin = stored.ack_twin();
            twin.server_id = Some(self.server_id.clone());
            metrics::ACKS_STORED_TOTAL.inc();
            Some(feed.buffer().add_message(twin).await?)
        };

        tracing::trace!(path = %stored.path, kind = %stored.kind, "Replicated message");

        self.trigger(&feed_path, &stored);
        if let Some(ack) = &ack {
            self.trigger(&feed_path, ack);
        }

        Ok(Ack {
            path: stored.path,
            timestamp: stored.timestamp,
            server_id: self.server_id.clone(),
        })
    }

    /// Wake long-polls on `feed_path` and its ancestors that `message` satisfies
    pub(crate) fn trigger(self: &Arc<Self>, feed_path: &FeedPath, message: &Message) {
        for feed in self.tree.ancestors(feed_path) {
            for pending in feed.take_triggered(message) {
                if pending.is_cancelled() {
                    metrics::LONG_POLL_RESOLUTIONS_TOTAL
                        .with_label_values(&["cancelled"])
                        .inc();
                    continue;
                }

                let engine = Arc::clone(self);
                let feed = Arc::clone(&feed);
                self.executor.spawn(async move {
                    engine.resolve_triggered(feed, pending).await;
                });
            }
        }
    }

    async fn resolve_triggered(self: Arc<Self>, feed: Arc<Feed>, pending: PendingRequest) {
        match self.search_now(&pending.request).await {
            Ok(messages) if messages.is_empty() => {
                tracing::trace!(feed = %feed.path(), request = pending.id, "Re-search empty, re-registering");
                self.park(&feed, pending).await;
            }
            Ok(messages) => {
                metrics::LONG_POLL_RESOLUTIONS_TOTAL
                    .with_label_values(&["triggered"])
                    .inc();
                pending.resolve(Ok(SearchOutcome::found(messages)));
            }
            Err(e) => {
                tracing::warn!(feed = %feed.path(), error = %e, "Triggered search failed");
                pending.resolve(Err(e));
            }
        }
    }

    /// Search, long-polling if the request asks to wait
    pub fn search(self: &Arc<Self>, request: SearchRequest) -> PendingSearch {
        if let Err(e) = self.ensure_open() {
            return PendingSearch::ready(Err(e));
        }
        if request.path.message_id().is_some() {
            return PendingSearch::ready(Err(CoreError::InvalidPath(format!(
                "{} names a message, not a feed",
                request.path
            ))
            .into()));
        }

        let engine = Arc::clone(self);
        PendingSearch::new(async move { engine.run_search(request).await })
    }

    async fn run_search(self: Arc<Self>, request: SearchRequest) -> Result<SearchOutcome> {
        let messages = self.search_now(&request).await?;

        let Some(wait) = request.wait else {
            return Ok(SearchOutcome::found(messages));
        };
        if !messages.is_empty() {
            return Ok(SearchOutcome::found(messages));
        }

        let wait = wait.min(self.config.long_poll_timeout());
        if wait.is_zero() {
            return Ok(SearchOutcome::timed_out(Vec::new()));
        }

        // Only a waiting search needs a feed to park on
        let feed = self.tree.get_or_create(&request.path)?;

        let (sender, receiver) = oneshot::channel();
        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let deadline = Instant::now() + wait;

        // Data before the park point was already considered
        let parked = request.with_relay(false);
        self.park(&feed, PendingRequest::new(id, parked, Some(deadline), sender))
            .await;

        match receiver.await {
            Ok(result) => result,
            Err(_) => Err(FeedError::Shutdown),
        }
    }

    /// Register a long-poll, then search once more for writes that raced the registration
    async fn park(self: &Arc<Self>, feed: &Arc<Feed>, pending: PendingRequest) {
        let id = pending.id;
        let request = pending.request.clone();

        feed.register(pending);
        self.schedule_timeout(feed);

        let result = match self.search_now(&request).await {
            Ok(messages) if messages.is_empty() => return,
            Ok(messages) => Ok(SearchOutcome::found(messages)),
            Err(e) => Err(e),
        };

        if let Some(pending) = feed.take(id) {
            metrics::LONG_POLL_RESOLUTIONS_TOTAL
                .with_label_values(&["triggered"])
                .inc();
            pending.resolve(result);
        }
    }

    /// Make sure the feed timer fires by its earliest pending deadline
    fn schedule_timeout(self: &Arc<Self>, feed: &Arc<Feed>) {
        let Some(deadline) = feed.next_deadline() else {
            return;
        };

        let mut slot = feed.timer();
        if let Some(current) = slot.as_ref() {
            if current.deadline <= deadline && !current.handle.is_finished() {
                return;
            }
            current.handle.abort();
        }

        let generation = feed.next_timer_generation();
        let engine = Arc::clone(self);
        let target = Arc::clone(feed);
        let handle = self.executor.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            engine.timeout(target, generation).await;
        });

        *slot = Some(TimerSlot {
            deadline,
            generation,
            handle,
        });
    }

    async fn timeout(self: Arc<Self>, feed: Arc<Feed>, generation: u64) {
        {
            let mut slot = feed.timer();
            if slot.as_ref().is_some_and(|s| s.generation == generation) {
                *slot = None;
            }
        }

        let expired = feed.take_expired(Instant::now());
        if !expired.is_empty() {
            tracing::debug!(feed = %feed.path(), expired = expired.len(), "Long-polls timed out");
        }

        for pending in expired {
            if pending.is_cancelled() {
                metrics::LONG_POLL_RESOLUTIONS_TOTAL
                    .with_label_values(&["cancelled"])
                    .inc();
                continue;
            }

            let result = self.search_now(&pending.request).await.map(|messages| {
                if messages.is_empty() {
                    SearchOutcome::timed_out(messages)
                } else {
                    SearchOutcome::found(messages)
                }
            });
            metrics::LONG_POLL_RESOLUTIONS_TOTAL
                .with_label_values(&["timed_out"])
                .inc();
            pending.resolve(result);
        }

        self.schedule_timeout(&feed);
    }

    /// Run a search without waiting
    pub(crate) async fn search_now(&self, request: &SearchRequest) -> Result<Vec<Message>> {
        let timer = metrics::SEARCH_LATENCY.start_timer();

        let ranges = self.read_subtree(request).await;
        let horizon = ranges
            .iter()
            .map(BufferIter::horizon)
            .max()
            .unwrap_or(Timestamp::EPOCH);

        let sources: Vec<MessageIter> = ranges
            .into_iter()
            .map(|range| {
                let filter = request.filter.clone();
                Box::new(range.filter(move |message| filter.matches(message))) as MessageIter
            })
            .collect();
        let local: Vec<Message> = MergeIter::new(sources).collect();

        let complete = if request.from_inclusive {
            request.from >= horizon
        } else {
            request.from.next() >= horizon
        };

        let messages = if complete || !request.relay {
            local
        } else {
            // A message and its ACK share a path
            let mut seen: HashSet<(FeedPath, MessageType)> =
                local.iter().map(|m| (m.path.clone(), m.kind)).collect();
            let mut combined: Vec<Message> = self
                .relay(request, horizon)
                .await
                .into_iter()
                .filter(|message| seen.insert((message.path.clone(), message.kind)))
                .collect();
            combined.extend(local);
            combined
        };

        timer.observe_duration();
        Ok(messages)
    }

    /// Read guards on every buffer of the searched subtree, parents before children
    ///
    /// Every guard is taken before any range is consumed. Writers stamp inside the
    /// write lock, so anything stamped below the newest message seen here is already
    /// committed and part of the result. A feed created while the guards were being
    /// taken restarts the pass, keeping the lock order the same for every reader.
    async fn read_subtree(&self, request: &SearchRequest) -> Vec<BufferIter> {
        loop {
            let feeds = self.tree.subtree(&request.path);

            let mut ranges = Vec::with_capacity(feeds.len());
            for feed in &feeds {
                let range = feed
                    .buffer()
                    .messages_between(
                        request.from,
                        request.from_inclusive,
                        request.to,
                        request.to_inclusive,
                    )
                    .await;
                ranges.push(range);
            }

            if self.tree.subtree(&request.path).len() == feeds.len() {
                return ranges;
            }

            drop(ranges);
            tracing::trace!(feed = %request.path, "Subtree grew during read, retrying");
        }
    }

    /// Fetch from peers what this node no longer holds below `horizon`
    ///
    /// Each peer is asked for the range still missing; once a peer answers, the upper
    /// bound moves down to its oldest message so later peers only fill in what precedes
    /// it. Batches come back newest-first and are returned oldest-first.
    async fn relay(&self, request: &SearchRequest, horizon: Timestamp) -> Vec<Message> {
        let Some(cluster) = self.cluster() else {
            return Vec::new();
        };

        let mut filters = vec![ServiceFilter::Exclude(self.server_id.clone())];
        if let Some(requester) = &request.requester {
            filters.push(ServiceFilter::Exclude(requester.clone()));
        }

        let peers = match cluster.get_services(&filters).await {
            Ok(peers) => peers,
            Err(e) => {
                tracing::warn!(feed = %request.path, error = %e, "Relay could not list peers");
                return Vec::new();
            }
        };

        let (mut to, mut to_inclusive) = relay_upper_bound(request, horizon);

        let mut batches: Vec<Vec<Message>> = Vec::new();
        for peer in peers {
            let bounded = SearchRequest {
                path: request.path.clone(),
                requester: Some(self.server_id.clone()),
                from: request.from,
                from_inclusive: request.from_inclusive,
                to,
                to_inclusive,
                relay: false,
                filter: request.filter.clone(),
                wait: None,
            };
            if range_is_empty(&bounded) {
                break;
            }

            match peer.search(bounded).await {
                Ok(outcome) => {
                    metrics::RELAY_REQUESTS_TOTAL.with_label_values(&["ok"]).inc();
                    if let Some(oldest) = outcome.messages.first() {
                        to = oldest.timestamp;
                        to_inclusive = false;
                        tracing::debug!(
                            feed = %request.path,
                            peer = %peer.server_id(),
                            relayed = outcome.messages.len(),
                            "Relayed messages from peer"
                        );
                        batches.push(outcome.messages);
                    }
                }
                Err(e) => {
                    metrics::RELAY_REQUESTS_TOTAL.with_label_values(&["error"]).inc();
                    tracing::warn!(
                        feed = %request.path,
                        peer = %peer.server_id(),
                        error = %e,
                        "Relay to peer failed"
                    );
                }
            }
        }

        batches.into_iter().rev().flatten().collect()
    }

    /// Deliver messages after `from` in `path`'s own buffer now, or on the next write
    pub async fn listen(
        &self,
        path: &FeedPath,
        from: Timestamp,
        callback: ListenCallback,
    ) -> Result<bool> {
        self.ensure_open()?;
        let feed = self.tree.get_or_create(path)?;

        let executor = self.executor.clone();
        let delivered = feed
            .buffer()
            .messages_after_or_register(
                from,
                Box::new(move |iter: BufferIter| {
                    let messages: Vec<Message> = iter.collect();
                    executor.spawn(async move { callback(messages) });
                }),
            )
            .await;

        Ok(delivered)
    }

    /// Cancel feed timers and resolve every waiting long-poll as timed out
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let mut resolved = 0;
        for feed in self.tree.feeds() {
            feed.cancel_timer();
            for pending in feed.take_all() {
                if pending.resolve(Ok(SearchOutcome::timed_out(Vec::new()))) {
                    resolved += 1;
                }
            }
        }

        tracing::info!(
            server_id = %self.server_id,
            resolved_long_polls = resolved,
            "Feed engine shut down"
        );
    }
}

/// Upper bound of what peers are asked for: the requested end, or just below the
/// horizon when local data covers the rest
fn relay_upper_bound(request: &SearchRequest, horizon: Timestamp) -> (Timestamp, bool) {
    if request.to < horizon {
        (request.to, request.to_inclusive)
    } else {
        (horizon, false)
    }
}

fn range_is_empty(request: &SearchRequest) -> bool {
    match request.to.cmp(&request.from) {
        std::cmp::Ordering::Less => true,
        std::cmp::Ordering::Equal => !(request.from_inclusive && request.to_inclusive),
        std::cmp::Ordering::Greater => {
            // (from, from.next()) holds nothing
            !request.from_inclusive && !request.to_inclusive && request.from.next() == request.to
        }
    }
}

impl std::fmt::Debug for FeedEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedEngine")
            .field("server_id", &self.server_id)
            .field("feeds", &self.tree.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(from: u64, from_inclusive: bool, to: u64, to_inclusive: bool) -> SearchRequest {
        SearchRequest {
            from: Timestamp::from_nanos(from),
            from_inclusive,
            to: Timestamp::from_nanos(to),
            to_inclusive,
            ..SearchRequest::new(FeedPath::root())
        }
    }

    #[test]
    fn test_range_is_empty() {
        assert!(range_is_empty(&request(10, true, 5, true)));
        assert!(range_is_empty(&request(10, false, 10, true)));
        assert!(range_is_empty(&request(10, false, 11, false)));

        assert!(!range_is_empty(&request(10, true, 10, true)));
        assert!(!range_is_empty(&request(10, false, 11, true)));
        assert!(!range_is_empty(&request(10, true, 11, false)));
        assert!(!range_is_empty(&request(10, false, 12, false)));
    }

    #[test]
    fn test_relay_upper_bound() {
        let horizon = Timestamp::from_nanos(100);

        // Requested end below the horizon keeps its own inclusiveness
        assert_eq!(
            relay_upper_bound(&request(0, true, 50, true), horizon),
            (Timestamp::from_nanos(50), true)
        );
        assert_eq!(
            relay_upper_bound(&request(0, true, 50, false), horizon),
            (Timestamp::from_nanos(50), false)
        );

        // The horizon itself is held locally
        assert_eq!(
            relay_upper_bound(&request(0, true, 100, true), horizon),
            (horizon, false)
        );
        assert_eq!(
            relay_upper_bound(&request(0, false, 500, true), horizon),
            (horizon, false)
        );
        assert_eq!(
            relay_upper_bound(&request(0, false, 99, true), horizon),
            (Timestamp::from_nanos(99), true)
        );
    }
}
