//! CLI Error Types

use derive_more::{Display, Error};

/// A command error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for command operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    #[display("configuration error")]
    Config,
    #[display("library error")]
    Library,
    #[display("I/O error")]
    Io,
    /// The file cannot be handled by this command.
    #[display("unsupported file: {_0}")]
    Unsupported(#[error(not(source))] String),
    #[display("background work did not finish within {_0} seconds")]
    Timeout(#[error(not(source))] u64),
}
