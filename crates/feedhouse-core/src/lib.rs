//! FeedHouse Core
//!
//! Shared building blocks for every FeedHouse crate:
//!
//! - [`clock`]: per-node monotonic `MessageClock` and the `Timestamp` it produces
//! - [`path`]: typed, escaped `FeedPath` addresses
//! - [`message`]: the `Message` model, its header block and acknowledgements
//! - [`varint`]: length prefixes used by the stored frame format
//! - [`error`]: the core `Error` type

pub mod clock;
pub mod error;
pub mod message;
pub mod path;
pub mod varint;

pub use clock::{MessageClock, Timestamp};
pub use error::{Error, Result};
pub use message::{Ack, Message, MessageHeader, MessageType, RemoteOrigin, ServerId};
pub use path::{FeedPath, Segment};
