use crate::error::{ErrorKind, Result};
use crate::store::{Store, format_of};
use exn::{OptionExt, ResultExt};
use std::collections::HashSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::runtime::Runtime;
use tome_cache::{Book, Database, Format, Repository, SearchHit};
use tome_config::Config;
use tome_fts::{ExtractCommand, Pool};
use tome_pages::{BookId, Launcher, MaintainPageCounts, Pages};
use tome_sync::{DbHandle, LockGuard, ShLock};

const DATABASE_FILE: &str = "metadata.db";
const BACKLOG_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A book library: its metadata database, its book files and the background
/// workers keeping extracted text and page counts up to date.
///
/// Every read happens under a shared hold of the library lock and every write
/// under an exclusive hold. Callers may take either hold themselves (see
/// [`Library::safe_read_lock`]) to group several calls; holds are reentrant
/// but never upgrade, so a thread holding the read lock must release it
/// before calling anything that writes.
///
/// The database is driven by a private tokio runtime, so every method here
/// blocks and none may be called from inside an async context.
pub struct Library {
    root: PathBuf,
    lock: ShLock,
    runtime: Runtime,
    db: Database,
    repo: Repository,
    store: Store,
    config: Config,
    handle: DbHandle<Library>,
    pub(crate) fts: Pool<Library>,
    /// (book, format) pairs handed to the FTS pool and not yet committed.
    pub(crate) fts_in_flight: Mutex<HashSet<(BookId, String)>>,
    pub(crate) fts_scratch: TempDir,
    indexing: AtomicBool,
    page_counts: Mutex<Option<MaintainPageCounts>>,
    closed: AtomicBool,
}

impl Library {
    /// Open the library rooted at `root`, creating it if needed.
    ///
    /// Nothing runs in the background until [`Library::start_indexing`] or
    /// [`Library::start_page_counts`] is called.
    #[tracing::instrument(skip_all, fields(root = %root.as_ref().display()))]
    pub fn open(root: impl AsRef<Path>, config: &Config) -> Result<Arc<Self>> {
        let root = root.as_ref().to_path_buf();
        let store = Store::open(&root)?;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("tome-db")
            .enable_all()
            .build()
            .or_raise(|| ErrorKind::Runtime)?;
        let db = runtime.block_on(Database::connect(root.join(DATABASE_FILE))).or_raise(|| ErrorKind::Cache)?;
        let repo = Repository::from(&db);
        let fts_scratch = tempfile::Builder::new().prefix("tome-fts-").tempdir().or_raise(|| ErrorKind::Storage)?;
        let command = match &config.fts.extractor {
            Some(argv) => ExtractCommand::from_argv(argv).ok_or_raise(|| ErrorKind::Runtime)?,
            None => ExtractCommand::current_exe().or_raise(|| ErrorKind::Runtime)?,
        }
        .with_low_priority(config.fts.low_priority);
        let max_workers = config.fts.max_workers;
        tracing::info!("Opened library");
        Ok(Arc::new_cyclic(|weak| {
            let handle = DbHandle::from(weak.clone());
            Self {
                root,
                lock: ShLock::new(),
                runtime,
                db,
                repo,
                store,
                config: config.clone(),
                fts: Pool::new(handle.clone(), command, max_workers),
                handle,
                fts_in_flight: Mutex::new(HashSet::new()),
                fts_scratch,
                indexing: AtomicBool::new(false),
                page_counts: Mutex::new(None),
                closed: AtomicBool::new(false),
            }
        }))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Shared hold on the library lock, released on drop.
    pub fn safe_read_lock(&self) -> Result<LockGuard<'_>> {
        self.lock.read().or_raise(|| ErrorKind::Lock)
    }

    /// Exclusive hold on the library lock, released on drop.
    pub fn write_lock(&self) -> Result<LockGuard<'_>> {
        self.lock.write().or_raise(|| ErrorKind::Lock)
    }

    pub(crate) fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }

    pub(crate) fn repo(&self) -> &Repository {
        &self.repo
    }

    pub(crate) fn store(&self) -> &Store {
        &self.store
    }

    pub(crate) fn in_flight(&self) -> MutexGuard<'_, HashSet<(BookId, String)>> {
        self.fts_in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    // =========================================================================
    // Books
    // =========================================================================

    pub fn create_book(&self, title: impl AsRef<str>) -> Result<Book> {
        let _guard = self.write_lock()?;
        self.block_on(self.repo.insert_book(title)).or_raise(|| ErrorKind::Cache)
    }

    pub fn book(&self, book_id: BookId) -> Result<Option<Book>> {
        let _guard = self.safe_read_lock()?;
        self.block_on(self.repo.get_book(book_id)).or_raise(|| ErrorKind::Cache)
    }

    /// Store the file at `source` as a format of the book, named after its
    /// extension, replacing any previous file of that format.
    #[tracing::instrument(skip(self, source), fields(source = %source.as_ref().display()))]
    pub fn add_format(&self, book_id: BookId, source: impl AsRef<Path>) -> Result<Format> {
        let source = source.as_ref();
        let fmt = format_of(source)?;
        let format = {
            let _guard = self.write_lock()?;
            if self.block_on(self.repo.get_book(book_id)).or_raise(|| ErrorKind::Cache)?.is_none() {
                exn::bail!(ErrorKind::BookNotFound(book_id));
            }
            let stored = self.store.import(book_id, &fmt, source)?;
            let format = Format {
                book_id,
                name: fmt,
                size: stored.size,
                hash: stored.hash,
                added_at: time::UtcDateTime::now(),
            };
            self.block_on(self.repo.upsert_format(&format)).or_raise(|| ErrorKind::Cache)?;
            format
        };
        if self.indexing.load(Ordering::Acquire) {
            self.fts.check_for_work();
        }
        if let Some(page_counts) = self.page_counts().as_ref() {
            page_counts.queue_book(book_id);
        }
        Ok(format)
    }

    /// Every format of the book, alphabetically.
    pub fn book_formats(&self, book_id: BookId) -> Result<Vec<Format>> {
        let _guard = self.safe_read_lock()?;
        self.block_on(self.repo.list_formats(book_id)).or_raise(|| ErrorKind::Cache)
    }

    pub fn format(&self, book_id: BookId, fmt: &str) -> Result<Option<Format>> {
        let _guard = self.safe_read_lock()?;
        self.block_on(self.repo.get_format(book_id, fmt)).or_raise(|| ErrorKind::Cache)
    }

    /// Where the file of a format lives inside the library.
    pub fn format_path(&self, book_id: BookId, fmt: &str) -> PathBuf {
        self.store.path(book_id, fmt)
    }

    pub fn page_count(&self, book_id: BookId) -> Result<Option<Pages>> {
        let _guard = self.safe_read_lock()?;
        self.block_on(self.repo.get_pages(book_id)).or_raise(|| ErrorKind::Cache)
    }

    /// Books still waiting for a page count.
    pub fn pending_page_scans(&self) -> Result<u64> {
        let _guard = self.safe_read_lock()?;
        self.block_on(self.repo.page_scan_backlog_count()).or_raise(|| ErrorKind::Cache)
    }

    // =========================================================================
    // Full-Text Search
    // =========================================================================

    pub fn fts_text(&self, book_id: BookId, fmt: &str) -> Result<Option<String>> {
        let _guard = self.safe_read_lock()?;
        self.block_on(self.repo.get_fts_text(book_id, fmt)).or_raise(|| ErrorKind::Cache)
    }

    pub fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>> {
        let _guard = self.safe_read_lock()?;
        self.block_on(self.repo.search(query, limit)).or_raise(|| ErrorKind::Cache)
    }

    /// Formats whose text still has to be extracted, including those being
    /// extracted right now.
    pub fn fts_backlog(&self) -> Result<u64> {
        let _guard = self.safe_read_lock()?;
        self.block_on(self.repo.fts_backlog_count()).or_raise(|| ErrorKind::Cache)
    }

    // =========================================================================
    // Background work
    // =========================================================================

    /// Start extracting text for every format that needs it.
    pub fn start_indexing(&self) {
        if !self.config.fts.enabled || self.is_closed() {
            tracing::debug!("Full-text indexing disabled");
            return;
        }
        self.indexing.store(true, Ordering::Release);
        self.fts.check_for_work();
    }

    /// Start the page-count thread with the server `launcher` starts, and
    /// queue every book that needs a count. Does nothing if it is already
    /// running.
    pub fn start_page_counts(&self, launcher: Launcher) -> Result<()> {
        if !self.config.pages.enabled || self.is_closed() {
            tracing::debug!("Page counting disabled");
            return Ok(());
        }
        let mut page_counts = self.page_counts();
        if page_counts.is_some() {
            return Ok(());
        }
        let maintain =
            MaintainPageCounts::start(self.handle.clone(), launcher, self.config.pages.input_format_order.clone())
                .or_raise(|| ErrorKind::Runtime)?;
        maintain.queue_backlog();
        *page_counts = Some(maintain);
        Ok(())
    }

    fn page_counts(&self) -> MutexGuard<'_, Option<MaintainPageCounts>> {
        self.page_counts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until both backlogs are empty, for whichever of the background
    /// workers were started. Returns `false` if `timeout` passes first.
    pub fn wait_for_backlogs(&self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now().checked_add(timeout);
        loop {
            let fts_done = !self.indexing.load(Ordering::Acquire) || self.fts_backlog()? == 0;
            let pages_done = self.page_counts().is_none() || self.pending_page_scans()? == 0;
            if fts_done && pages_done {
                return Ok(true);
            }
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return Ok(false);
            }
            std::thread::sleep(BACKLOG_POLL_INTERVAL);
        }
    }

    /// Stop all background work and close the database. Later calls do
    /// nothing; dropping the last reference to the library calls this too.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.fts.shutdown();
        let page_counts = self.page_counts().take();
        if let Some(page_counts) = page_counts {
            page_counts.shutdown();
        }
        self.block_on(self.db.close());
        tracing::info!(root = %self.root.display(), "Closed library");
    }
}

impl Drop for Library {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Library {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Library")
            .field("root", &self.root)
            .field("lock", &self.lock)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
