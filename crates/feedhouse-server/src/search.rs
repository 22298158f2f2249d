//! Search Requests and Results
//!
//! A `SearchRequest` names a feed subtree, a timestamp range, a message filter and
//! whether the caller is willing to wait. Searches resolve through `PendingSearch`,
//! an explicit future that completes exactly once: with the matching messages, with
//! an empty timed-out outcome, or with an error.
//!
//! ## Defaults
//!
//! ```text
//! from  EPOCH   exclusive
//! to    MAX     inclusive
//! relay true
//! wait  none    (return immediately, possibly empty)
//! ```
//!
//! ## Example
//!
//! ```ignore
//! let request = SearchRequest::new(orders)
//!     .after(last_seen)
//!     .with_filter(MessageFilter::messages_only())
//!     .wait(Duration::from_secs(30));
//!
//! let outcome = service.search(request).await?;
//! ```

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use feedhouse_core::{FeedPath, Message, MessageType, ServerId, Timestamp};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Predicate applied to every candidate message
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageFilter {
    /// Accepted kinds; `None` accepts every kind
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<MessageType>>,

    /// Only messages first stored on the searched node
    #[serde(default)]
    pub local_only: bool,

    /// Reject messages that originated on this server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude_origin: Option<ServerId>,
}

impl MessageFilter {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn messages_only() -> Self {
        Self {
            kinds: Some(vec![MessageType::Message]),
            ..Self::default()
        }
    }

    /// What a replication link pulls for `target`
    pub fn replication(target: &ServerId) -> Self {
        Self {
            kinds: None,
            local_only: true,
            exclude_origin: Some(target.clone()),
        }
    }

    pub fn matches(&self, message: &Message) -> bool {
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&message.kind) {
                return false;
            }
        }
        if self.local_only && message.is_replicated() {
            return false;
        }
        match &self.exclude_origin {
            Some(excluded) => message.origin_server() != Some(excluded),
            None => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchRequest {
    pub path: FeedPath,

    /// Node asking on behalf of a peer; never relayed back to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requester: Option<ServerId>,

    pub from: Timestamp,
    pub from_inclusive: bool,
    pub to: Timestamp,
    pub to_inclusive: bool,

    /// Ask peers for data this node no longer holds
    pub relay: bool,

    #[serde(default)]
    pub filter: MessageFilter,

    /// Long-poll for this long if nothing matches yet
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait: Option<Duration>,
}

impl SearchRequest {
    pub fn new(path: FeedPath) -> Self {
        Self {
            path,
            requester: None,
            from: Timestamp::EPOCH,
            from_inclusive: false,
            to: Timestamp::MAX,
            to_inclusive: true,
            relay: true,
            filter: MessageFilter::any(),
            wait: None,
        }
    }

    /// Messages strictly after `from`
    pub fn after(mut self, from: Timestamp) -> Self {
        self.from = from;
        self.from_inclusive = false;
        self
    }

    /// Messages at or after `from`
    pub fn starting_at(mut self, from: Timestamp) -> Self {
        self.from = from;
        self.from_inclusive = true;
        self
    }

    pub fn until(mut self, to: Timestamp, inclusive: bool) -> Self {
        self.to = to;
        self.to_inclusive = inclusive;
        self
    }

    pub fn with_filter(mut self, filter: MessageFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_relay(mut self, relay: bool) -> Self {
        self.relay = relay;
        self
    }

    pub fn requested_by(mut self, requester: ServerId) -> Self {
        self.requester = Some(requester);
        self
    }

    pub fn wait(mut self, wait: Duration) -> Self {
        self.wait = Some(wait);
        self
    }

    /// True if `timestamp` lies inside the requested range
    pub fn accepts_timestamp(&self, timestamp: Timestamp) -> bool {
        let after_from = if self.from_inclusive {
            timestamp >= self.from
        } else {
            timestamp > self.from
        };
        let before_to = if self.to_inclusive {
            timestamp <= self.to
        } else {
            timestamp < self.to
        };
        after_from && before_to
    }
}

/// Result of a search
#[derive(Debug, Clone, Default)]
pub struct SearchOutcome {
    pub messages: Vec<Message>,
    /// The search waited and its deadline passed
    pub timed_out: bool,
}

impl SearchOutcome {
    pub fn found(messages: Vec<Message>) -> Self {
        Self {
            messages,
            timed_out: false,
        }
    }

    pub fn timed_out(messages: Vec<Message>) -> Self {
        Self {
            messages,
            timed_out: true,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// A search that completes once
///
/// Dropping it cancels the search; a long-poll registered for it is skipped the next
/// time it is triggered or times out.
#[must_use = "searches do nothing unless awaited"]
pub struct PendingSearch {
    inner: BoxFuture<'static, Result<SearchOutcome>>,
}

impl PendingSearch {
    pub fn new<F>(future: F) -> Self
    where
        F: Future<Output = Result<SearchOutcome>> + Send + 'static,
    {
        Self {
            inner: Box::pin(future),
        }
    }

    /// Already resolved
    pub fn ready(result: Result<SearchOutcome>) -> Self {
        Self::new(futures::future::ready(result))
    }

    pub fn cancel(self) {
        drop(self);
    }
}

impl Future for PendingSearch {
    type Output = Result<SearchOutcome>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.as_mut().poll(cx)
    }
}

impl std::fmt::Debug for PendingSearch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingSearch").finish_non_exhaustive()
    }
}
