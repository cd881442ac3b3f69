use crate::error::Error;
use crate::models::to_u64;
use tome_pages::BookId;

/// One full-text search match.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub book_id: BookId,
    pub format: String,
    /// Matching excerpt with the matched terms wrapped in `[` and `]`.
    pub snippet: String,
    /// BM25 relevance; lower is better.
    pub rank: f64,
}

#[derive(sqlx::FromRow)]
pub(crate) struct SearchRow {
    book_id: i64,
    format: String,
    snippet: String,
    rank: f64,
}
impl TryFrom<SearchRow> for SearchHit {
    type Error = Error;
    fn try_from(row: SearchRow) -> Result<Self, Self::Error> {
        Ok(Self { book_id: to_u64(row.book_id, "book id")?, format: row.format, snippet: row.snippet, rank: row.rank })
    }
}
