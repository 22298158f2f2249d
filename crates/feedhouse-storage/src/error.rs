//! Storage Error Types
//!
//! This module defines all error types that can occur during buffer operations.
//!
//! ## Error Categories
//!
//! ### Core Errors
//! - `Core`: Path, frame or header errors raised by `feedhouse-core` or the frame codec
//!
//! Bucket overflow is not an error: it is reported as a `BucketOverflow` value and
//! always recovered inside `MessageBuffer`.
//!
//! ## Usage
//!
//! All storage operations return `Result<T>` which is aliased to
//! `Result<T, Error>`. This allows clean error propagation with `?`.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Core(#[from] feedhouse_core::Error),
}
