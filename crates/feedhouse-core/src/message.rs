//! Message Data Structure
//!
//! This module defines `Message`, the unit of data posted to and replicated between
//! FeedHouse nodes, plus the small value types that travel with it.
//!
//! ## Structure
//! Each message carries:
//! - **path**: the feed path plus a terminal message id segment
//! - **kind**: `MESSAGE`, `ACK` or the `NONE` sentinel
//! - **headers**: arbitrary JSON object supplied by the poster
//! - **payload**: opaque bytes
//! - **timestamp**: assigned by the clock of the node that stored this copy
//! - **server_id**: the node whose clock assigned `timestamp`
//! - **remote**: where the message was first stored, set once it has been replicated
//!
//! ## Identity
//! Two messages are equal when their paths are equal. A message replicated to several
//! nodes keeps its path everywhere, so consumers deduplicate by path even though each
//! node stamps its own timestamp.
//!
//! ## Example
//! ```ignore
//! let message = Message::new(orders.clone(), Bytes::from("{\"id\": 1}"))
//!     .with_header("content-type", "application/json");
//! ```

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::clock::Timestamp;
use crate::path::FeedPath;

/// Logical type of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    Message,
    Ack,
    None,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageType::Message => write!(f, "MESSAGE"),
            MessageType::Ack => write!(f, "ACK"),
            MessageType::None => write!(f, "NONE"),
        }
    }
}

/// Identity of a FeedHouse node
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerId(String);

impl ServerId {
    pub fn new(id: impl Into<String>) -> Self {
        ServerId(id.into())
    }

    /// Random id for a freshly started node
    pub fn generate() -> Self {
        ServerId(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ServerId {
    fn from(id: &str) -> Self {
        ServerId::new(id)
    }
}

/// Where a replicated message was originally stored
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteOrigin {
    pub message_id: String,
    pub timestamp: Timestamp,
    pub server_id: ServerId,
}

/// A message stored in a feed
#[derive(Debug, Clone)]
pub struct Message {
    pub path: FeedPath,
    pub kind: MessageType,
    pub headers: Map<String, Value>,
    pub payload: Bytes,
    pub timestamp: Timestamp,
    pub server_id: Option<ServerId>,
    pub remote: Option<RemoteOrigin>,
}

impl Message {
    /// A new, unstamped `MESSAGE` addressed to `path`
    pub fn new(path: FeedPath, payload: impl Into<Bytes>) -> Self {
        Self {
            path,
            kind: MessageType::Message,
            headers: Map::new(),
            payload: payload.into(),
            timestamp: Timestamp::EPOCH,
            server_id: None,
            remote: None,
        }
    }

    pub fn with_kind(mut self, kind: MessageType) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Id from the terminal path segment, if assigned
    pub fn id(&self) -> Option<&str> {
        self.path.message_id()
    }

    /// Path of the feed holding this message
    pub fn feed_path(&self) -> FeedPath {
        self.path.feed_path()
    }

    /// True if this copy arrived through replication
    pub fn is_replicated(&self) -> bool {
        self.remote.is_some()
    }

    /// Node that first stored this message
    pub fn origin_server(&self) -> Option<&ServerId> {
        match &self.remote {
            Some(remote) => Some(&remote.server_id),
            None => self.server_id.as_ref(),
        }
    }

    /// The `ACK` twin recorded next to this message
    pub fn ack_twin(&self) -> Message {
        Message {
            path: self.path.clone(),
            kind: MessageType::Ack,
            headers: Map::new(),
            payload: Bytes::new(),
            timestamp: Timestamp::EPOCH,
            server_id: None,
            remote: self.remote.clone(),
        }
    }

    /// Header block written in front of the payload when stored
    pub fn header(&self) -> MessageHeader {
        MessageHeader {
            path: self.path.clone(),
            kind: self.kind,
            timestamp: self.timestamp,
            server_id: self.server_id.clone(),
            remote: self.remote.clone(),
            headers: self.headers.clone(),
        }
    }

    pub fn from_parts(header: MessageHeader, payload: Bytes) -> Self {
        Self {
            path: header.path,
            kind: header.kind,
            headers: header.headers,
            payload,
            timestamp: header.timestamp,
            server_id: header.server_id,
            remote: header.remote,
        }
    }
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path
    }
}

impl Eq for Message {}

/// Serialized metadata of a stored message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageHeader {
    pub path: FeedPath,
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub timestamp: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<ServerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<RemoteOrigin>,
    #[serde(default)]
    pub headers: Map<String, Value>,
}

/// Acknowledgement returned by post and replicate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub path: FeedPath,
    pub timestamp: Timestamp,
    pub server_id: ServerId,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn orders() -> FeedPath {
        "/shop/orders".parse().unwrap()
    }

    #[test]
    fn test_equality_is_by_path() {
        let path = orders().with_message_id("m-1").unwrap();
        let a = Message::new(path.clone(), "one");
        let mut b = Message::new(path, "two");
        b.timestamp = Timestamp::from_nanos(42);

        assert_eq!(a, b);
        assert_ne!(a, Message::new(orders().with_message_id("m-2").unwrap(), "one"));
    }

    #[test]
    fn test_ack_twin_keeps_path_and_drops_payload() {
        let message = Message::new(orders().with_message_id("m-1").unwrap(), "body")
            .with_header("k", "v");
        let ack = message.ack_twin();

        assert_eq!(ack.kind, MessageType::Ack);
        assert_eq!(ack.path, message.path);
        assert!(ack.payload.is_empty());
        assert!(ack.headers.is_empty());
    }

    #[test]
    fn test_origin_server_prefers_remote_stamp() {
        let mut message = Message::new(orders().with_message_id("m-1").unwrap(), "body");
        message.server_id = Some(ServerId::new("b"));
        assert_eq!(message.origin_server(), Some(&ServerId::new("b")));

        message.remote = Some(RemoteOrigin {
            message_id: "m-1".to_string(),
            timestamp: Timestamp::from_nanos(7),
            server_id: ServerId::new("a"),
        });
        assert!(message.is_replicated());
        assert_eq!(message.origin_server(), Some(&ServerId::new("a")));
    }

    #[test]
    fn test_header_json_shape() {
        let message = Message::new(orders().with_message_id("m-1").unwrap(), "body")
            .with_header("k", 1);
        let json = serde_json::to_value(message.header()).unwrap();

        assert_eq!(json["path"], "/shop/orders/~~m-1");
        assert_eq!(json["type"], "MESSAGE");
        assert_eq!(json["headers"]["k"], 1);
        assert!(json.get("remote").is_none());
    }
}
