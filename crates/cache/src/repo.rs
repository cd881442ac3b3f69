//! Queries over books and the data derived from their formats.

use crate::Database;
use crate::error::{ErrorKind, Result};
use crate::models::{Book, BookRow, Format, FormatRow, PagesRow, SearchHit, SearchRow, to_i64, to_u64};
use exn::ResultExt;
use sqlx::SqlitePool;
use time::UtcDateTime;
use tome_pages::{BookId, Pages};

/// Repository for books, their formats, extracted text and page counts.
///
/// Page count scans and text extraction both work off backlogs kept here:
/// - a book needs a page scan from the moment any of its formats is added or
///   replaced until [`Repository::set_pages`] stores a result for it;
/// - a format needs text extraction while it has no extracted text, or its
///   text was extracted from content with a different hash.
#[derive(Debug, Clone)]
pub struct Repository {
    pool: SqlitePool,
}
impl From<&Database> for Repository {
    fn from(db: &Database) -> Self {
        Self { pool: db.pool().clone() }
    }
}
impl Repository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    // =========================================================================
    // Books & Formats
    // =========================================================================

    pub async fn insert_book(&self, title: impl AsRef<str>) -> Result<Book> {
        let row: BookRow = sqlx::query_as(include_str!("../queries/insert_book.sql"))
            .bind(title.as_ref())
            .bind(UtcDateTime::now().unix_timestamp())
            .fetch_one(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        row.try_into()
    }

    pub async fn get_book(&self, book_id: BookId) -> Result<Option<Book>> {
        let row: Option<BookRow> = sqlx::query_as(include_str!("../queries/get_book.sql"))
            .bind(to_i64(book_id, "book id")?)
            .fetch_optional(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        row.map(Book::try_from).transpose()
    }

    /// Add or replace a format of an existing book, flagging the book for a
    /// page scan.
    ///
    /// Returns [`ErrorKind::BookNotFound`] if there is no such book.
    pub async fn upsert_format(&self, format: &Format) -> Result<()> {
        let book_id = to_i64(format.book_id, "book id")?;
        let mut tx = self.pool.begin().await.or_raise(|| ErrorKind::Database)?;
        let flagged = sqlx::query(include_str!("../queries/flag_page_scan.sql"))
            .bind(book_id)
            .execute(&mut *tx)
            .await
            .or_raise(|| ErrorKind::Database)?;
        if flagged.rows_affected() == 0 {
            exn::bail!(ErrorKind::BookNotFound(format.book_id));
        }
        sqlx::query(include_str!("../queries/upsert_format.sql"))
            .bind(book_id)
            .bind(format.name.to_uppercase())
            .bind(to_i64(format.size, "format size")?)
            .bind(&format.hash)
            .bind(format.added_at.unix_timestamp())
            .execute(&mut *tx)
            .await
            .or_raise(|| ErrorKind::Database)?;
        tx.commit().await.or_raise(|| ErrorKind::Database)?;
        Ok(())
    }

    /// Every format of a book, alphabetically.
    pub async fn list_formats(&self, book_id: BookId) -> Result<Vec<Format>> {
        let rows: Vec<FormatRow> = sqlx::query_as(include_str!("../queries/list_formats.sql"))
            .bind(to_i64(book_id, "book id")?)
            .fetch_all(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        rows.into_iter().map(Format::try_from).collect()
    }

    pub async fn get_format(&self, book_id: BookId, fmt: impl AsRef<str>) -> Result<Option<Format>> {
        let row: Option<FormatRow> = sqlx::query_as(include_str!("../queries/get_format.sql"))
            .bind(to_i64(book_id, "book id")?)
            .bind(fmt.as_ref().to_uppercase())
            .fetch_optional(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        row.map(Format::try_from).transpose()
    }

    // =========================================================================
    // Page Counts
    // =========================================================================

    pub async fn get_pages(&self, book_id: BookId) -> Result<Option<Pages>> {
        let row: Option<PagesRow> = sqlx::query_as(include_str!("../queries/get_pages.sql"))
            .bind(to_i64(book_id, "book id")?)
            .fetch_optional(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        row.map(Pages::try_from).transpose()
    }

    /// Store a page count and take the book off the page scan backlog.
    pub async fn set_pages(&self, book_id: BookId, pages: &Pages) -> Result<()> {
        let id = to_i64(book_id, "book id")?;
        let mut tx = self.pool.begin().await.or_raise(|| ErrorKind::Database)?;
        let cleared = sqlx::query(include_str!("../queries/clear_page_scan.sql"))
            .bind(id)
            .execute(&mut *tx)
            .await
            .or_raise(|| ErrorKind::Database)?;
        if cleared.rows_affected() == 0 {
            exn::bail!(ErrorKind::BookNotFound(book_id));
        }
        sqlx::query(include_str!("../queries/upsert_pages.sql"))
            .bind(id)
            .bind(pages.pages)
            .bind(i64::from(pages.algorithm))
            .bind(&pages.format)
            .bind(to_i64(pages.format_size, "format size")?)
            .bind(pages.scanned_at.unix_timestamp())
            .execute(&mut *tx)
            .await
            .or_raise(|| ErrorKind::Database)?;
        tx.commit().await.or_raise(|| ErrorKind::Database)?;
        Ok(())
    }

    /// Up to `limit` books flagged for a page scan, highest id first.
    pub async fn books_needing_page_scan(&self, limit: usize) -> Result<Vec<BookId>> {
        let rows: Vec<(i64,)> = sqlx::query_as(include_str!("../queries/books_needing_page_scan.sql"))
            .bind(to_i64(limit as u64, "limit")?)
            .fetch_all(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        rows.into_iter().map(|(id,)| to_u64(id, "book id")).collect()
    }

    pub async fn page_scan_backlog_count(&self) -> Result<u64> {
        let (count,): (i64,) = sqlx::query_as(include_str!("../queries/count_page_scans.sql"))
            .fetch_one(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        to_u64(count, "count")
    }

    // =========================================================================
    // Full-Text Search
    // =========================================================================

    /// Up to `limit` formats whose extracted text is missing or stale, newest
    /// books first.
    pub async fn next_fts_candidates(&self, limit: usize) -> Result<Vec<Format>> {
        let rows: Vec<FormatRow> = sqlx::query_as(include_str!("../queries/next_fts_candidates.sql"))
            .bind(to_i64(limit as u64, "limit")?)
            .fetch_all(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        rows.into_iter().map(Format::try_from).collect()
    }

    pub async fn fts_backlog_count(&self) -> Result<u64> {
        let (count,): (i64,) = sqlx::query_as(include_str!("../queries/count_fts_backlog.sql"))
            .fetch_one(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        to_u64(count, "count")
    }

    /// Store text extracted from a format.
    ///
    /// Nothing is stored, and `false` returned, if the format has been
    /// replaced or removed since the content hashed to `fmt_hash` was read.
    pub async fn commit_fts(
        &self,
        book_id: BookId,
        fmt: impl AsRef<str>,
        fmt_size: u64,
        fmt_hash: impl AsRef<str>,
        text: impl AsRef<str>,
    ) -> Result<bool> {
        let book_id = to_i64(book_id, "book id")?;
        let fmt = fmt.as_ref().to_uppercase();
        let fmt_hash = fmt_hash.as_ref();
        let result = sqlx::query(include_str!("../queries/commit_fts.sql"))
            .bind(book_id)
            .bind(&fmt)
            .bind(fmt_hash)
            .bind(to_i64(fmt_size, "format size")?)
            .bind(text.as_ref())
            .bind(UtcDateTime::now().unix_timestamp())
            .bind(book_id)
            .bind(&fmt)
            .bind(fmt_hash)
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get_fts_text(&self, book_id: BookId, fmt: impl AsRef<str>) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as(include_str!("../queries/get_fts_text.sql"))
            .bind(to_i64(book_id, "book id")?)
            .bind(fmt.as_ref().to_uppercase())
            .fetch_optional(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(row.map(|(text,)| text))
    }

    /// Best matches for an FTS5 query expression, most relevant first.
    pub async fn search(&self, query: impl AsRef<str>, limit: usize) -> Result<Vec<SearchHit>> {
        let rows: Vec<SearchRow> = sqlx::query_as(include_str!("../queries/search.sql"))
            .bind(query.as_ref())
            .bind(to_i64(limit as u64, "limit")?)
            .fetch_all(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        rows.into_iter().map(SearchHit::try_from).collect()
    }
}
