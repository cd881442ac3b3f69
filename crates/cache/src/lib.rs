//! SQLite persistence for the book library.
//!
//! Stores books, their formats, the text extracted from each format for
//! full-text search, and the page count estimate of each book. Text and page
//! counts are derived data: both are keyed on the format content they were
//! computed from, so a changed format puts its book back into the relevant
//! backlog.

mod db;
pub mod error;
mod models;
mod repo;

pub use crate::db::Database;
pub use crate::models::{Book, Format, SearchHit};
pub use crate::repo::Repository;
