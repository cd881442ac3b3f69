//! The library's side of page count maintenance.

use crate::Library;
use exn::ResultExt;
use std::path::Path;
use tome_pages::error::{ErrorKind, Result};
use tome_pages::{BookId, LockGuard, PageDatabase, Pages};

impl PageDatabase for Library {
    fn safe_read_lock(&self) -> Result<LockGuard<'_>> {
        Library::safe_read_lock(self).or_raise(|| ErrorKind::Database)
    }

    fn formats(&self, book_id: BookId) -> Result<Vec<String>> {
        let formats = self.book_formats(book_id).or_raise(|| ErrorKind::Database)?;
        Ok(formats.into_iter().map(|f| f.name).collect())
    }

    fn pages(&self, book_id: BookId) -> Result<Option<Pages>> {
        self.page_count(book_id).or_raise(|| ErrorKind::Database)
    }

    fn format_db_size(&self, book_id: BookId, fmt: &str) -> Result<Option<u64>> {
        let format = self.format(book_id, fmt).or_raise(|| ErrorKind::Database)?;
        Ok(format.map(|f| f.size))
    }

    fn copy_format_to(&self, book_id: BookId, fmt: &str, destination: &Path) -> Result<()> {
        let _guard = Library::safe_read_lock(self).or_raise(|| ErrorKind::Database)?;
        self.store().copy_to(book_id, fmt, destination).or_raise(|| ErrorKind::Io)?;
        Ok(())
    }

    fn set_pages(&self, book_id: BookId, pages: &Pages) -> Result<()> {
        let _guard = self.write_lock().or_raise(|| ErrorKind::Database)?;
        self.block_on(self.repo().set_pages(book_id, pages)).or_raise(|| ErrorKind::Database)
    }

    fn books_needing_page_scan(&self, limit: usize) -> Result<Vec<BookId>> {
        let _guard = Library::safe_read_lock(self).or_raise(|| ErrorKind::Database)?;
        self.block_on(self.repo().books_needing_page_scan(limit)).or_raise(|| ErrorKind::Database)
    }
}
