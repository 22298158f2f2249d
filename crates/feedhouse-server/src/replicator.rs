//! Replication Links
//!
//! A `Replicator` pulls from one node into another:
//!
//! ```text
//!  ┌────────────┐  watch(target, from, timeout)   ┌────────────┐
//!  │   source   │ ◄─────────────────────────────  │ Replicator │
//!  │            │  ─────────────────────────────► │   loop     │
//!  └────────────┘        batch (oldest first)     └─────┬──────┘
//!                                                       │ replicate(message) each
//!                                                       ▼
//!                                                 ┌────────────┐
//!                                                 │   target   │
//!                                                 └────────────┘
//! ```
//!
//! After a batch is forwarded the next watch starts after the last forwarded message;
//! an empty (timed-out) watch is re-issued from the same point. The first error stops
//! the link and is kept in its stats until someone calls `restart()`. `close()` is
//! checked before every re-arm and again when a watch returns, so an in-flight watch
//! still completes but its batch is dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use feedhouse_core::{ServerId, Timestamp};
use feedhouse_observability::metrics;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::error::FeedError;
use crate::services::FeedService;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Idle,
    Running,
    Closed,
    Failed,
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkState::Idle => write!(f, "idle"),
            LinkState::Running => write!(f, "running"),
            LinkState::Closed => write!(f, "closed"),
            LinkState::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplicatorStats {
    pub source: ServerId,
    pub target: ServerId,
    pub state: LinkState,
    /// Messages forwarded since the link was created
    pub replicated: u64,
    pub error_count: u64,
    pub last_error: Option<String>,
    /// Source timestamp of the last forwarded message
    pub last_timestamp: Timestamp,
}

pub struct Replicator {
    source: Arc<dyn FeedService>,
    target: Arc<dyn FeedService>,
    source_id: ServerId,
    target_id: ServerId,
    watch_timeout: Duration,
    closed: AtomicBool,
    stats: Mutex<ReplicatorStats>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Replicator {
    pub fn new(
        source: Arc<dyn FeedService>,
        target: Arc<dyn FeedService>,
        watch_timeout: Duration,
    ) -> Arc<Self> {
        let source_id = source.server_id();
        let target_id = target.server_id();

        Arc::new(Self {
            stats: Mutex::new(ReplicatorStats {
                source: source_id.clone(),
                target: target_id.clone(),
                state: LinkState::Idle,
                replicated: 0,
                error_count: 0,
                last_error: None,
                last_timestamp: Timestamp::EPOCH,
            }),
            source,
            target,
            source_id,
            target_id,
            watch_timeout,
            closed: AtomicBool::new(false),
            handle: Mutex::new(None),
        })
    }

    pub fn source_id(&self) -> &ServerId {
        &self.source_id
    }

    pub fn target_id(&self) -> &ServerId {
        &self.target_id
    }

    /// True if `server_id` is either end of this link
    pub fn involves(&self, server_id: &ServerId) -> bool {
        &self.source_id == server_id || &self.target_id == server_id
    }

    pub fn stats(&self) -> ReplicatorStats {
        self.lock_stats().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Spawn the pull loop, resuming after the last forwarded message
    pub fn start(self: &Arc<Self>) {
        let mut handle = self.handle.lock().unwrap_or_else(|e| e.into_inner());
        if handle.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }

        let from = {
            let mut stats = self.lock_stats();
            stats.state = LinkState::Running;
            stats.last_timestamp
        };

        info!(
            source = %self.source_id,
            target = %self.target_id,
            from = %from,
            "Starting replication link"
        );

        let link = Arc::clone(self);
        *handle = Some(tokio::spawn(async move { link.run(from).await }));
    }

    /// Stop re-arming; a watch already in flight completes and is discarded
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(source = %self.source_id, target = %self.target_id, "Closing replication link");
    }

    /// Start a failed or closed link again
    pub fn restart(self: &Arc<Self>) {
        self.closed.store(false, Ordering::Release);
        self.start();
    }

    async fn run(self: Arc<Self>, mut from: Timestamp) {
        metrics::REPLICATION_LINKS_ACTIVE.inc();

        loop {
            if self.is_closed() {
                self.lock_stats().state = LinkState::Closed;
                break;
            }

            let outcome = match self
                .source
                .watch(&self.target_id, from, self.watch_timeout)
                .await
            {
                Ok(outcome) => outcome,
                Err(e) => {
                    self.fail(e);
                    break;
                }
            };

            // Closed while the watch was in flight: drop the batch
            if self.is_closed() {
                self.lock_stats().state = LinkState::Closed;
                break;
            }

            let mut failed = false;
            for message in outcome.messages {
                let timestamp = message.timestamp;
                if let Err(e) = self.target.replicate(message).await {
                    self.fail(e);
                    failed = true;
                    break;
                }

                from = timestamp;
                let mut stats = self.lock_stats();
                stats.replicated += 1;
                stats.last_timestamp = timestamp;
            }

            if failed {
                break;
            }
        }

        metrics::REPLICATION_LINKS_ACTIVE.dec();
    }

    fn fail(&self, e: FeedError) {
        error!(
            source = %self.source_id,
            target = %self.target_id,
            error = %e,
            "Replication link failed"
        );
        metrics::REPLICATION_ERRORS_TOTAL.inc();

        let mut stats = self.lock_stats();
        stats.state = LinkState::Failed;
        stats.error_count += 1;
        stats.last_error = Some(e.to_string());
    }

    fn lock_stats(&self) -> MutexGuard<'_, ReplicatorStats> {
        self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for Replicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replicator")
            .field("source", &self.source_id)
            .field("target", &self.target_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}
