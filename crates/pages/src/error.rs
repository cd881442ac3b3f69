//! Page Count Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction.

use derive_more::{Display, Error};

/// A page count error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for page count operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
/// Failing to count one particular file is not an error at all; see
/// [`CountError`].
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// The owning database rejected a read or write.
    #[display("database error")]
    Database,
    /// The counting server could not be started or stopped talking.
    #[display("page counting server error: {_0}")]
    Server(#[error(not(source))] String),
    #[display("I/O error")]
    Io,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Database | Self::Io)
    }
}

/// Why the counting server could not count one file.
#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum CountError {
    /// The file is DRM-locked; other formats of the same book may not be.
    #[display("file is DRM locked")]
    Drm,
    #[display("page counting failed: {_0}")]
    Failed(#[error(not(source))] String),
}
