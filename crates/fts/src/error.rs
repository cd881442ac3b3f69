//! FTS Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction.

use derive_more::{Display, Error};

/// An FTS error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for FTS operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// The extraction subprocess could not be started.
    #[display("failed to spawn text extraction process")]
    Spawn,
    /// Reading or writing a job's scratch files failed.
    #[display("I/O error")]
    Io,
    /// The owning database rejected a callback.
    #[display("database error")]
    Database,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io | Self::Database)
    }
}
