//! Error Types for FeedHouse
//!
//! This module defines the error types shared by every FeedHouse crate.
//!
//! ## Error Categories
//!
//! ### Addressing Errors
//! - `InvalidPath`: A feed address string or path composition is malformed
//! - `InvalidIdentifier`: A feed id, feed name, version or message id is empty or misplaced
//! - `InvalidMessage`: A message cannot be used for the requested operation
//!   (for example posting an `ACK`, or replicating a message without an id)
//!
//! ### Data Integrity Errors
//! - `MalformedHeader`: A stored header block could not be parsed
//! - `CrcMismatch`: A stored frame failed its checksum
//! - `Truncated`: A stored frame ended before all declared bytes were present
//!
//! ### I/O Errors
//! - `Io`: Streaming or I/O failure
//! - `Json`: JSON encoding failure while building a header block
//!
//! ## Usage
//! All functions in FeedHouse core return `Result<T>` which is aliased to `Result<T, Error>`.
//!
//! ```ignore
//! use feedhouse_core::{FeedPath, Result};
//!
//! fn orders() -> Result<FeedPath> {
//!     "/shop/orders".parse()
//! }
//! ```

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Malformed header: {0}")]
    MalformedHeader(String),

    #[error("CRC mismatch")]
    CrcMismatch,

    #[error("Truncated frame: {0}")]
    Truncated(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
