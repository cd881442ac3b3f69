//! Page count maintenance.
//!
//! Page counts are estimated by an external counting [`Server`] and cached
//! per book. [`MaintainPageCounts`] owns the one thread allowed to talk to
//! that server; callers only ever queue work for it. A count is recomputed
//! when the book's preferred format, that format's size, or the server's
//! algorithm version changes.

pub mod error;
mod maintain;
mod pages;
mod preferences;
pub mod server;

pub use crate::error::CountError;
pub use crate::maintain::{
    BACKLOG_BATCH_SIZE, MaintainPageCounts, PageDatabase, count_book, count_book_and_commit, do_backlog,
};
pub use crate::pages::{BookId, DRM_LOCKED, FAILED, NO_SUPPORTED_FORMAT, Pages};
pub use crate::preferences::{FORCED_FIRST, FormatPreferences};
pub use crate::server::{Launcher, ProcessServer, Server};
pub use tome_sync::{DbHandle, LockGuard};
