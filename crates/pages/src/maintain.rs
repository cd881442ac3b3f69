use crate::error::{CountError, ErrorKind, Result};
use crate::pages::{BookId, DRM_LOCKED, FAILED, NO_SUPPORTED_FORMAT, Pages};
use crate::preferences::FormatPreferences;
use crate::server::{Launcher, Server};
use crossbeam_channel::{Receiver, Sender, unbounded};
use exn::ResultExt;
use std::collections::HashSet;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tome_sync::{DbHandle, LockGuard};

/// Books fetched per backlog query.
pub const BACKLOG_BATCH_SIZE: usize = 100;

/// The database operations the page-count thread needs.
pub trait PageDatabase: Send + Sync + 'static {
    /// A shared hold on the database lock, released on drop.
    fn safe_read_lock(&self) -> Result<LockGuard<'_>>;
    /// Upper-case formats currently stored for the book.
    fn formats(&self, book_id: BookId) -> Result<Vec<String>>;
    /// The cached page count, if one was ever recorded.
    fn pages(&self, book_id: BookId) -> Result<Option<Pages>>;
    /// Live size of the stored format, `None` if the book no longer has it.
    fn format_db_size(&self, book_id: BookId, fmt: &str) -> Result<Option<u64>>;
    fn copy_format_to(&self, book_id: BookId, fmt: &str, destination: &Path) -> Result<()>;
    /// Persist a page count; also clears the book's needs-scan flag.
    fn set_pages(&self, book_id: BookId, pages: &Pages) -> Result<()>;
    /// Ids of books flagged as needing a scan, highest id first.
    fn books_needing_page_scan(&self, limit: usize) -> Result<Vec<BookId>>;
}

/// Removes a scratch copy however the count attempt ends.
struct Scratch(PathBuf);
impl Drop for Scratch {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.0)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(path = %self.0.display(), error = %e, "Failed to remove page count scratch file");
        }
    }
}

/// Decide the page count of one book without persisting it.
///
/// A cached count is returned as-is when it was taken from the book's best
/// format, at that format's current size, with the server's current
/// algorithm. Otherwise each candidate format is copied into `scratch_dir`
/// and counted in preference order until one succeeds.
#[tracing::instrument(skip(db, server, preferences, scratch_dir))]
pub fn count_book<D: PageDatabase + ?Sized>(
    db: &D,
    book_id: BookId,
    server: &mut dyn Server,
    preferences: &FormatPreferences,
    scratch_dir: &Path,
) -> Result<Pages> {
    let algorithm = server.algorithm();
    let (candidates, cached) = {
        let _guard = db.safe_read_lock()?;
        let candidates = preferences.candidates(&db.formats(book_id)?);
        let mut cached = db.pages(book_id)?;
        if let (Some(pages), Some(best)) = (&cached, candidates.first())
            && pages.format == *best
            && pages.algorithm == algorithm
            && db.format_db_size(book_id, best)? == Some(pages.format_size)
        {
            tracing::debug!(book_id, fmt = %best, pages = pages.pages, "Cached page count is current");
            return Ok(pages.clone());
        }
        // Only a real count is worth falling back to.
        cached = cached.filter(|pages| !pages.is_failure());
        (candidates, cached)
    };
    if candidates.is_empty() {
        return Ok(Pages::failure(NO_SUPPORTED_FORMAT, algorithm));
    }

    let mut drm = false;
    for fmt in &candidates {
        let Some(size) = db.format_db_size(book_id, fmt)? else {
            continue;
        };
        let scratch = Scratch(scratch_dir.join(format!("{book_id}.{}", fmt.to_lowercase())));
        if let Err(err) = db.copy_format_to(book_id, fmt, &scratch.0) {
            tracing::warn!(book_id, fmt = %fmt, error = ?err, "Failed to copy format for page counting");
            continue;
        }
        match server.count_pages(&scratch.0) {
            Ok(pages) => {
                tracing::debug!(book_id, fmt = %fmt, pages, "Counted pages");
                return Ok(Pages::counted(pages, algorithm, fmt.as_str(), size));
            },
            Err(CountError::Drm) => {
                tracing::info!(book_id, fmt = %fmt, "Cannot count pages of DRM locked format");
                drm = true;
            },
            Err(CountError::Failed(message)) => {
                tracing::warn!(book_id, fmt = %fmt, error = %message, "Failed to count pages");
            },
        }
    }

    Ok(match cached {
        Some(pages) => pages,
        None if drm => Pages::failure(DRM_LOCKED, algorithm),
        None => Pages::failure(FAILED, algorithm),
    })
}

/// [`count_book`], then persist whatever it decided.
pub fn count_book_and_commit<D: PageDatabase + ?Sized>(
    db: &D,
    book_id: BookId,
    server: &mut dyn Server,
    preferences: &FormatPreferences,
    scratch_dir: &Path,
) -> Result<Pages> {
    let pages = count_book(db, book_id, server, preferences, scratch_dir)?;
    db.set_pages(book_id, &pages)?;
    Ok(pages)
}

/// Count every book flagged as needing a scan, newest first, in batches of
/// [`BACKLOG_BATCH_SIZE`]. Returns how many books were processed.
///
/// A book whose count cannot be persisted stays flagged; the drain ends once
/// a batch holds nothing but books already seen in this drain.
pub fn do_backlog<D: PageDatabase + ?Sized>(
    db: &D,
    server: &mut dyn Server,
    preferences: &FormatPreferences,
    scratch_dir: &Path,
    shut_down: &AtomicBool,
) -> Result<usize> {
    let mut seen = HashSet::new();
    while !shut_down.load(Ordering::Acquire) {
        let batch = db.books_needing_page_scan(BACKLOG_BATCH_SIZE)?;
        if batch.is_empty() {
            break;
        }
        let mut progressed = false;
        for book_id in batch {
            if shut_down.load(Ordering::Acquire) {
                break;
            }
            if !seen.insert(book_id) {
                continue;
            }
            progressed = true;
            if let Err(err) = count_book_and_commit(db, book_id, server, preferences, scratch_dir) {
                tracing::warn!(book_id, error = ?err, "Failed to update page count");
            }
        }
        if !progressed {
            tracing::warn!(remaining = seen.len(), "Page count backlog is not shrinking; giving up for now");
            break;
        }
    }
    Ok(seen.len())
}

enum Message {
    Book(BookId),
    Backlog,
    Shutdown,
}

/// Counter bumped after every unit of work, for callers that want to wait
/// for the thread to catch up.
#[derive(Default)]
struct Ticks {
    count: Mutex<u64>,
    changed: Condvar,
}

impl Ticks {
    fn tick(&self) {
        *self.count.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        self.changed.notify_all();
    }

    fn get(&self) -> u64 {
        *self.count.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait_for(&self, target: u64, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        while *count < target {
            count = match deadline {
                None => self.changed.wait(count).unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                        return false;
                    };
                    self.changed.wait_timeout(count, remaining).unwrap_or_else(PoisonError::into_inner).0
                },
            };
        }
        true
    }
}

/// Keeps page counts up to date on one dedicated thread.
///
/// Requests never block: they are queued and handled in order. The counting
/// server is started on that thread by the [`Launcher`] and stopped when the
/// thread ends.
pub struct MaintainPageCounts {
    messages: Sender<Message>,
    shut_down: Arc<AtomicBool>,
    ticks: Arc<Ticks>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl MaintainPageCounts {
    pub fn start<D: PageDatabase + ?Sized>(db: DbHandle<D>, launcher: Launcher, input_format_order: Vec<String>) -> Result<Self> {
        let (tx, rx) = unbounded();
        let shut_down = Arc::new(AtomicBool::new(false));
        let ticks = Arc::new(Ticks::default());
        let context = Context { db, rx, shut_down: Arc::clone(&shut_down), ticks: Arc::clone(&ticks) };
        let thread = thread::Builder::new()
            .name("page-counts".to_string())
            .spawn(move || context.run(launcher, &input_format_order))
            .or_raise(|| ErrorKind::Io)?;
        Ok(Self { messages: tx, shut_down, ticks, thread: Mutex::new(Some(thread)) })
    }

    pub fn queue_book(&self, book_id: BookId) {
        self.send(Message::Book(book_id));
    }

    /// Ask for every book flagged as needing a scan to be processed.
    pub fn queue_backlog(&self) {
        self.send(Message::Backlog);
    }

    fn send(&self, message: Message) {
        if self.messages.send(message).is_err() {
            tracing::debug!("Page count thread has stopped; request dropped");
        }
    }

    /// Units of work completed so far.
    pub fn ticks(&self) -> u64 {
        self.ticks.get()
    }

    /// Block until at least `target` units of work have completed. Returns
    /// `false` on timeout.
    pub fn wait_for_ticks(&self, target: u64, timeout: Duration) -> bool {
        self.ticks.wait_for(target, timeout)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Stop the thread and wait for it, unless called from that very thread.
    /// Work queued before the call is abandoned; the count in progress, if
    /// any, is allowed to finish.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.send(Message::Shutdown);
        let thread = self.thread.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(thread) = thread
            && thread.thread().id() != thread::current().id()
            && thread.join().is_err()
        {
            tracing::error!("Page count thread panicked");
        }
    }
}

impl Drop for MaintainPageCounts {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Context<D: PageDatabase + ?Sized> {
    db: DbHandle<D>,
    rx: Receiver<Message>,
    shut_down: Arc<AtomicBool>,
    ticks: Arc<Ticks>,
}

impl<D: PageDatabase + ?Sized> Context<D> {
    fn run(self, launcher: Launcher, input_format_order: &[String]) {
        let mut server = match catch_unwind(AssertUnwindSafe(launcher)) {
            Ok(Ok(server)) => server,
            Ok(Err(err)) => {
                tracing::error!(error = ?err, "Failed to start page counting server");
                return;
            },
            Err(_) => {
                tracing::error!("Page counting server panicked while starting");
                return;
            },
        };
        let scratch = match tempfile::Builder::new().prefix("tome-pages-").tempdir() {
            Ok(dir) => dir,
            Err(e) => {
                tracing::error!(error = %e, "Failed to create page count scratch directory");
                return;
            },
        };
        let preferences = FormatPreferences::new(server.input_formats(), input_format_order);
        tracing::debug!("Page count thread started");

        while let Ok(message) = self.rx.recv() {
            if self.shut_down.load(Ordering::Acquire) {
                break;
            }
            let Some(db) = self.db.get() else {
                break;
            };
            let outcome = catch_unwind(AssertUnwindSafe(|| match message {
                Message::Shutdown => Ok(()),
                Message::Book(book_id) => {
                    count_book_and_commit(db.as_ref(), book_id, server.as_mut(), &preferences, scratch.path()).map(drop)
                },
                Message::Backlog => {
                    let processed = do_backlog(db.as_ref(), server.as_mut(), &preferences, scratch.path(), &self.shut_down)?;
                    tracing::info!(processed, "Page count backlog drained");
                    Ok(())
                },
            }));
            // Must not be the last strong reference while the tick wakes a
            // waiter that then closes the database.
            drop(db);
            match outcome {
                Ok(Ok(())) => {},
                Ok(Err(err)) => tracing::error!(error = ?err, "Page count maintenance failed"),
                Err(_) => tracing::error!("Page count maintenance panicked"),
            }
            self.ticks.tick();
        }
        tracing::debug!("Page count thread stopped");
    }
}
