use crate::error::Error;
use crate::models::{to_datetime, to_u64};
use time::UtcDateTime;
use tome_pages::BookId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Book {
    pub id: BookId,
    pub title: String,
    pub added_at: UtcDateTime,
    /// A format changed since the page count was last stored.
    pub needs_page_scan: bool,
}

#[derive(sqlx::FromRow)]
pub(crate) struct BookRow {
    id: i64,
    title: String,
    added_at: i64,
    needs_page_scan: bool,
}
impl TryFrom<BookRow> for Book {
    type Error = Error;
    fn try_from(row: BookRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: to_u64(row.id, "book id")?,
            title: row.title,
            added_at: to_datetime(row.added_at, "book added date")?,
            needs_page_scan: row.needs_page_scan,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_to_model() {
        let added = UtcDateTime::now();
        let row = BookRow { id: 7, title: "Middlemarch".to_string(), added_at: added.unix_timestamp(), needs_page_scan: true };
        let book = Book::try_from(row).unwrap();
        assert_eq!(book.id, 7);
        assert!(book.needs_page_scan);
        // Unix timestamps are whole seconds.
        assert_eq!(book.added_at, added.replace_nanosecond(0).unwrap());
    }

    #[test]
    fn test_negative_id_is_invalid() {
        let row = BookRow { id: -1, title: String::new(), added_at: 0, needs_page_scan: false };
        assert!(Book::try_from(row).is_err());
    }
}
