//! The library's side of full-text indexing.

use crate::Library;
use exn::ResultExt;
use tome_cache::Format;
use tome_fts::error::{ErrorKind, Result};
use tome_fts::{BookId, FtsDatabase};

impl Library {
    /// Hand one backlog format to the pool: copy it to the scratch directory
    /// and queue a job for the copy.
    fn queue_fts_job(&self, format: Format) -> Result<()> {
        let Format { book_id, name: fmt, size, hash, .. } = format;
        let path = self.fts_scratch.path().join(format!("{book_id}.{}", fmt.to_lowercase()));
        let copied = {
            let _guard = self.safe_read_lock().or_raise(|| ErrorKind::Database)?;
            self.store().copy_to(book_id, &fmt, &path)
        };
        if let Err(err) = copied {
            // Empty text keeps an unreadable file from being offered forever.
            tracing::warn!(book_id, fmt = %fmt, error = ?err, "Failed to copy format for text extraction");
            let _ = std::fs::remove_file(&path);
            return self.commit_fts_result(book_id, &fmt, size, &hash, "");
        }
        self.in_flight().insert((book_id, fmt.clone()));
        self.fts.add_job(book_id, fmt, path, size, hash);
        Ok(())
    }
}

impl FtsDatabase for Library {
    fn commit_fts_result(&self, book_id: BookId, fmt: &str, fmt_size: u64, fmt_hash: &str, text: &str) -> Result<()> {
        let stored = {
            let _guard = self.write_lock().or_raise(|| ErrorKind::Database)?;
            self.block_on(self.repo().commit_fts(book_id, fmt, fmt_size, fmt_hash, text))
        };
        self.in_flight().remove(&(book_id, fmt.to_string()));
        if !stored.or_raise(|| ErrorKind::Database)? {
            tracing::debug!(book_id, fmt, "Format changed during text extraction; result discarded");
        }
        Ok(())
    }

    fn queue_next_fts_job(&self) -> Result<()> {
        while !self.is_closed() && self.fts.has_idle_worker() {
            let next = {
                let in_flight = self.in_flight().len();
                let _guard = self.safe_read_lock().or_raise(|| ErrorKind::Database)?;
                let candidates =
                    self.block_on(self.repo().next_fts_candidates(in_flight + 1)).or_raise(|| ErrorKind::Database)?;
                let in_flight = self.in_flight();
                candidates.into_iter().find(|f| !in_flight.contains(&(f.book_id, f.name.clone())))
            };
            let Some(format) = next else {
                break;
            };
            self.queue_fts_job(format)?;
        }
        Ok(())
    }
}
