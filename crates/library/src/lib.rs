//! The book library database.
//!
//! [`Library`] is the one object callers and background workers share. It
//! owns the library lock, the metadata database, the book files, the
//! full-text extraction pool and the page-count thread, and implements the
//! database side of both background subsystems.

pub mod error;
mod fts;
mod library;
mod pages;
mod store;

pub use crate::library::Library;
pub use tome_cache::{Book, Format, SearchHit};
pub use tome_pages::Pages;
