//! Library Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction.

use derive_more::{Display, Error};
use tome_pages::BookId;

/// A library error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for library operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// The database lock was used out of order by this thread.
    #[display("library lock misused")]
    Lock,
    #[display("library database error")]
    Cache,
    /// Reading or writing the book files failed.
    #[display("library storage error")]
    Storage,
    #[display("could not start library runtime")]
    Runtime,
    #[display("book {_0} not found")]
    BookNotFound(#[error(not(source))] BookId),
    /// The file has no extension to tell its format by.
    #[display("unknown book format")]
    UnknownFormat,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Cache | Self::Storage)
    }
}
