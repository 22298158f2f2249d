//! Error types for FeedHouse nodes

use feedhouse_core::ServerId;
use thiserror::Error;

use crate::remote::{ErrorEnvelope, ErrorKind};

pub type Result<T> = std::result::Result<T, FeedError>;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error(transparent)]
    Core(#[from] feedhouse_core::Error),

    /// Error raised by another node that has no local counterpart
    #[error("Remote error from {}: {}", .0.server_id, .0.message)]
    Remote(ErrorEnvelope),

    #[error("Server error: {0}")]
    Server(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Service not found: {0}")]
    ServiceNotFound(ServerId),

    #[error("Service is shutting down")]
    Shutdown,
}

impl From<feedhouse_storage::Error> for FeedError {
    fn from(e: feedhouse_storage::Error) -> Self {
        match e {
            feedhouse_storage::Error::Core(core) => FeedError::Core(core),
        }
    }
}

impl FeedError {
    /// Category used when the error crosses a node boundary
    pub fn kind(&self) -> ErrorKind {
        use feedhouse_core::Error as CoreError;

        match self {
            FeedError::Core(CoreError::InvalidPath(_)) => ErrorKind::InvalidPath,
            FeedError::Core(CoreError::InvalidIdentifier(_)) => ErrorKind::InvalidIdentifier,
            FeedError::Core(CoreError::InvalidMessage(_)) => ErrorKind::InvalidMessage,
            FeedError::Core(CoreError::MalformedHeader(_)) => ErrorKind::MalformedHeader,
            FeedError::Core(CoreError::Io(_)) => ErrorKind::Io,
            FeedError::Core(_) => ErrorKind::Storage,
            FeedError::Remote(envelope) => envelope.kind,
            FeedError::Server(_) | FeedError::Config(_) => ErrorKind::Server,
            FeedError::ServiceNotFound(_) => ErrorKind::ServiceNotFound,
            FeedError::Shutdown => ErrorKind::Shutdown,
        }
    }

    /// Message without the category prefix
    pub fn detail(&self) -> String {
        use feedhouse_core::Error as CoreError;

        match self {
            FeedError::Core(CoreError::InvalidPath(s))
            | FeedError::Core(CoreError::InvalidIdentifier(s))
            | FeedError::Core(CoreError::InvalidMessage(s))
            | FeedError::Core(CoreError::MalformedHeader(s))
            | FeedError::Server(s)
            | FeedError::Config(s) => s.clone(),
            FeedError::Remote(envelope) => envelope.message.clone(),
            FeedError::ServiceNotFound(id) => id.to_string(),
            other => other.to_string(),
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, FeedError::Remote(_))
    }
}
