//! Full-text extraction pipeline.
//!
//! Extraction of text from book files is slow and, depending on the file,
//! liable to crash or hang. Each [`Job`] therefore runs in its own
//! subprocess, driven by one worker thread per pool slot, and every outcome
//! is funnelled to a single supervisor thread. That supervisor is the only
//! thread that writes back into the owning database (via [`FtsDatabase`]),
//! which confines write contention to one thread no matter how many workers
//! are running.
//!
//! The pool holds the database through a [`DbHandle`] that does not keep it
//! alive; results arriving after the database has gone are dropped.

mod command;
pub mod error;
mod job;
mod pool;
mod supervisor;
mod worker;

pub use crate::command::{EXTRACT_SUBCOMMAND, ExtractCommand};
pub use crate::job::{BookId, Job, JobResult, extracted_text_path};
pub use crate::pool::Pool;
pub use tome_sync::DbHandle;

use crate::error::Result;

/// The database operations the pool calls back into, always from the
/// supervisor thread.
pub trait FtsDatabase: Send + Sync + 'static {
    /// Persist the extracted text for one (book, format) pair. Failed
    /// extractions arrive here with an empty `text`.
    fn commit_fts_result(&self, book_id: BookId, fmt: &str, fmt_size: u64, fmt_hash: &str, text: &str) -> Result<()>;

    /// Offer the pool the next item(s) from the database's indexing backlog,
    /// typically by calling [`Pool::add_job`].
    fn queue_next_fts_job(&self) -> Result<()>;
}
