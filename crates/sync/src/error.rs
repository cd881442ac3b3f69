//! Lock Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction.

use derive_more::{Display, Error};

/// A locking error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for lock operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Misuse of the lock by the calling thread.
///
/// None of these are retryable: they describe a programming error at the
/// call site, and the lock state is left exactly as it was before the call.
#[derive(Debug, Display, Error, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The calling thread holds the lock shared and asked for it exclusively.
    #[display("cannot upgrade a shared lock to an exclusive lock")]
    Upgrade,
    /// The calling thread holds the lock exclusively and asked for it shared.
    #[display("cannot downgrade an exclusive lock to a shared lock")]
    Downgrade,
    /// The calling thread released a lock it does not hold.
    #[display("release called on a lock the current thread does not hold")]
    NotHeld,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        false
    }
}
