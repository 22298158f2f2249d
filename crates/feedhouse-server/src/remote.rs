//! Remote Services
//!
//! Peers are reached through a `ServiceConnector`, which turns an endpoint string into a
//! `FeedService` handle. Every handle it returns is wrapped in a `RemoteService`, so that
//! errors raised by the peer cross the boundary the same way they would over a wire:
//!
//! ```text
//! peer FeedError ──► ErrorEnvelope ──► JSON ──► ErrorEnvelope ──► rethrow(expected)
//!                                                                   │
//!                          kind expected here: local FeedError ◄────┤
//!                          anything else:      FeedError::Remote ◄──┘
//! ```
//!
//! Only kinds the calling operation can legitimately produce itself (an invalid path on
//! `search`, for instance) are rethrown as local errors. Everything else stays a
//! `FeedError::Remote` so callers can tell the peer failed, not them.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use feedhouse_core::{Ack, FeedPath, Message, ServerId, Timestamp};
use serde::{Deserialize, Serialize};

use crate::cluster::Cluster;
use crate::error::{FeedError, Result};
use crate::search::{PendingSearch, SearchRequest};
use crate::services::{FeedService, ListenCallback};

/// Error category carried across node boundaries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidPath,
    InvalidIdentifier,
    InvalidMessage,
    MalformedHeader,
    Io,
    Storage,
    ServiceNotFound,
    Shutdown,
    Server,
}

/// Kinds a caller of post/replicate can cause itself
const WRITE_ERRORS: &[ErrorKind] = &[
    ErrorKind::InvalidPath,
    ErrorKind::InvalidIdentifier,
    ErrorKind::InvalidMessage,
];

/// Kinds a caller of search/sync/listen can cause itself
const READ_ERRORS: &[ErrorKind] = &[ErrorKind::InvalidPath, ErrorKind::InvalidIdentifier];

/// Serializable form of an error raised on another node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub kind: ErrorKind,
    pub message: String,
    /// Node that raised the error
    pub server_id: ServerId,
}

impl ErrorEnvelope {
    pub fn from_error(error: &FeedError, server_id: &ServerId) -> Self {
        match error {
            // Keep the node that actually failed
            FeedError::Remote(envelope) => envelope.clone(),
            other => Self {
                kind: other.kind(),
                message: other.detail(),
                server_id: server_id.clone(),
            },
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| FeedError::Server(format!("encode error: {e}")))
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| FeedError::Server(format!("decode error: {e}")))
    }

    /// Local error for expected kinds, otherwise an opaque remote error
    pub fn rethrow(self, expected: &[ErrorKind]) -> FeedError {
        use feedhouse_core::Error as CoreError;

        if !expected.contains(&self.kind) {
            return FeedError::Remote(self);
        }

        match self.kind {
            ErrorKind::InvalidPath => CoreError::InvalidPath(self.message).into(),
            ErrorKind::InvalidIdentifier => CoreError::InvalidIdentifier(self.message).into(),
            ErrorKind::InvalidMessage => CoreError::InvalidMessage(self.message).into(),
            ErrorKind::MalformedHeader => CoreError::MalformedHeader(self.message).into(),
            ErrorKind::ServiceNotFound => {
                FeedError::ServiceNotFound(ServerId::new(self.message))
            }
            ErrorKind::Shutdown => FeedError::Shutdown,
            ErrorKind::Io | ErrorKind::Storage | ErrorKind::Server => FeedError::Remote(self),
        }
    }
}

/// Handle to a peer that maps its errors through `ErrorEnvelope`
pub struct RemoteService {
    server_id: ServerId,
    endpoint: String,
    inner: Arc<dyn FeedService>,
}

impl RemoteService {
    pub fn new(endpoint: impl Into<String>, inner: Arc<dyn FeedService>) -> Self {
        Self {
            server_id: inner.server_id(),
            endpoint: endpoint.into(),
            inner,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn map_err(server_id: &ServerId, error: FeedError, expected: &[ErrorKind]) -> FeedError {
        let envelope = ErrorEnvelope::from_error(&error, server_id);
        match envelope.to_json().and_then(|bytes| ErrorEnvelope::from_json(&bytes)) {
            Ok(received) => received.rethrow(expected),
            Err(e) => e,
        }
    }

    fn map_search(&self, search: PendingSearch) -> PendingSearch {
        let server_id = self.server_id.clone();
        PendingSearch::new(async move {
            search
                .await
                .map_err(|e| Self::map_err(&server_id, e, READ_ERRORS))
        })
    }
}

#[async_trait]
impl FeedService for RemoteService {
    fn server_id(&self) -> ServerId {
        self.server_id.clone()
    }

    /// Peers never expose their cluster
    fn cluster(&self) -> Option<Arc<Cluster>> {
        None
    }

    async fn initialize(&self, _cluster: Arc<Cluster>) -> Result<()> {
        Ok(())
    }

    async fn post(&self, message: Message) -> Result<Ack> {
        self.inner
            .post(message)
            .await
            .map_err(|e| Self::map_err(&self.server_id, e, WRITE_ERRORS))
    }

    async fn replicate(&self, message: Message) -> Result<Ack> {
        self.inner
            .replicate(message)
            .await
            .map_err(|e| Self::map_err(&self.server_id, e, WRITE_ERRORS))
    }

    fn search(&self, request: SearchRequest) -> PendingSearch {
        self.map_search(self.inner.search(request))
    }

    fn watch(&self, target: &ServerId, from: Timestamp, timeout: Duration) -> PendingSearch {
        self.map_search(self.inner.watch(target, from, timeout))
    }

    async fn sync(&self, path: &FeedPath) -> Result<Vec<Message>> {
        self.inner
            .sync(path)
            .await
            .map_err(|e| Self::map_err(&self.server_id, e, READ_ERRORS))
    }

    async fn listen(
        &self,
        path: &FeedPath,
        from: Timestamp,
        callback: ListenCallback,
    ) -> Result<bool> {
        self.inner
            .listen(path, from, callback)
            .await
            .map_err(|e| Self::map_err(&self.server_id, e, READ_ERRORS))
    }
}

/// Resolves endpoints into service handles
#[async_trait]
pub trait ServiceConnector: Send + Sync {
    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn FeedService>>;
}

/// Endpoint table for clusters that live in one process
#[derive(Default)]
pub struct InProcessNetwork {
    services: RwLock<HashMap<String, Arc<dyn FeedService>>>,
}

impl InProcessNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `service` reachable at `endpoint`
    pub fn bind(&self, endpoint: impl Into<String>, service: Arc<dyn FeedService>) {
        let endpoint = endpoint.into();
        tracing::debug!(endpoint = %endpoint, server_id = %service.server_id(), "Bound endpoint");
        self.services
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(endpoint, service);
    }

    /// Stop serving `endpoint`; handles already connected keep working
    pub fn unbind(&self, endpoint: &str) -> bool {
        self.services
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(endpoint)
            .is_some()
    }
}

#[async_trait]
impl ServiceConnector for InProcessNetwork {
    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn FeedService>> {
        let service = self
            .services
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(endpoint)
            .cloned()
            .ok_or_else(|| FeedError::Server(format!("no service bound at {endpoint}")))?;

        Ok(Arc::new(RemoteService::new(endpoint, service)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node() -> ServerId {
        ServerId::new("node-b")
    }

    #[test]
    fn test_expected_kind_is_rethrown_locally() {
        let error: FeedError = feedhouse_core::Error::InvalidPath("no root".to_string()).into();
        let envelope = ErrorEnvelope::from_error(&error, &node());

        let local = envelope.rethrow(READ_ERRORS);
        assert!(!local.is_remote());
        assert_eq!(local.kind(), ErrorKind::InvalidPath);
        assert_eq!(local.detail(), "no root");
    }

    #[test]
    fn test_unexpected_kind_stays_remote() {
        let error = FeedError::Server("disk on fire".to_string());
        let envelope = ErrorEnvelope::from_error(&error, &node());

        let local = envelope.rethrow(WRITE_ERRORS);
        assert!(local.is_remote());
        assert_eq!(local.kind(), ErrorKind::Server);
        assert!(local.to_string().contains("node-b"));
    }

    #[test]
    fn test_envelope_keeps_original_node() {
        let original = ErrorEnvelope {
            kind: ErrorKind::Storage,
            message: "checksum".to_string(),
            server_id: ServerId::new("node-c"),
        };
        let forwarded = ErrorEnvelope::from_error(&FeedError::Remote(original.clone()), &node());
        assert_eq!(forwarded, original);
    }

    #[test]
    fn test_envelope_json_shape() {
        let envelope = ErrorEnvelope {
            kind: ErrorKind::InvalidIdentifier,
            message: "empty".to_string(),
            server_id: node(),
        };
        let json: serde_json::Value =
            serde_json::from_slice(&envelope.to_json().unwrap()).unwrap();
        assert_eq!(json["kind"], "invalid_identifier");
        assert_eq!(json["server_id"], "node-b");
        assert_eq!(
            ErrorEnvelope::from_json(&envelope.to_json().unwrap()).unwrap(),
            envelope
        );
    }

    #[tokio::test]
    async fn test_unbound_endpoint_cannot_connect() {
        use crate::config::NodeConfig;
        use crate::services::LocalFeedService;

        let network = InProcessNetwork::new();
        let service =
            Arc::new(LocalFeedService::new(NodeConfig::default().with_server_id("node-b")).unwrap());
        network.bind("inproc://node-b", service);

        let remote = network.connect("inproc://node-b").await.unwrap();
        assert_eq!(remote.server_id(), node());

        assert!(network.unbind("inproc://node-b"));
        assert!(!network.unbind("inproc://node-b"));
        assert!(network.connect("inproc://node-b").await.is_err());
    }
}
