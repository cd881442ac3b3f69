use crate::error::Error;
use crate::models::{to_datetime, to_u64};
use time::UtcDateTime;
use tome_pages::BookId;

/// One stored file of a book, e.g. its EPUB.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Format {
    pub book_id: BookId,
    /// Upper-case format name.
    pub name: String,
    pub size: u64,
    /// BLAKE3 hash of the stored file.
    pub hash: String,
    pub added_at: UtcDateTime,
}

#[derive(sqlx::FromRow)]
pub(crate) struct FormatRow {
    book_id: i64,
    format: String,
    size: i64,
    hash: String,
    added_at: i64,
}
impl TryFrom<FormatRow> for Format {
    type Error = Error;
    fn try_from(row: FormatRow) -> Result<Self, Self::Error> {
        Ok(Self {
            book_id: to_u64(row.book_id, "book id")?,
            name: row.format,
            size: to_u64(row.size, "format size")?,
            hash: row.hash,
            added_at: to_datetime(row.added_at, "format added date")?,
        })
    }
}
