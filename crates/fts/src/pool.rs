use crate::FtsDatabase;
use crate::command::ExtractCommand;
use crate::job::{BookId, Job};
use crate::supervisor::{SupervisorMessage, supervise};
use crate::worker::{Cancel, Worker, WorkerMessage};
use crossbeam_channel::{Receiver, Sender, unbounded};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use tome_sync::DbHandle;

struct State {
    initialized: bool,
    shut_down: bool,
    target: usize,
    workers: Vec<Worker>,
    next_worker_id: usize,
    supervisor: Option<JoinHandle<()>>,
    /// Dropped at shutdown, which every worker observes as cancellation.
    cancel: Option<Sender<()>>,
}

/// Supervised pool of text extraction workers.
///
/// Starts lazily on the first [`add_job`](Self::add_job) or
/// [`check_for_work`](Self::check_for_work). Results are committed in the
/// order jobs finish, not the order they were submitted.
pub struct Pool<D: FtsDatabase + ?Sized> {
    db: DbHandle<D>,
    command: Arc<ExtractCommand>,
    jobs_tx: Sender<WorkerMessage>,
    jobs_rx: Receiver<WorkerMessage>,
    supervise_tx: Sender<SupervisorMessage>,
    supervise_rx: Receiver<SupervisorMessage>,
    cancel_rx: Receiver<()>,
    state: Mutex<State>,
}

impl<D: FtsDatabase + ?Sized> Pool<D> {
    pub fn new(db: DbHandle<D>, command: ExtractCommand, max_workers: usize) -> Self {
        let (jobs_tx, jobs_rx) = unbounded();
        let (supervise_tx, supervise_rx) = unbounded();
        let (cancel_tx, cancel_rx) = unbounded();
        Self {
            db,
            command: Arc::new(command),
            jobs_tx,
            jobs_rx,
            supervise_tx,
            supervise_rx,
            cancel_rx,
            state: Mutex::new(State {
                initialized: false,
                shut_down: false,
                target: max_workers.max(1),
                workers: Vec::new(),
                next_worker_id: 0,
                supervisor: None,
                cancel: Some(cancel_tx),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    /// Start the supervisor and the workers. Only the first call does
    /// anything, and nothing restarts a pool that has been shut down.
    pub fn initialize(&self) {
        let mut state = self.state();
        if state.initialized || state.shut_down {
            return;
        }
        state.initialized = true;
        let db = self.db.clone();
        let messages = self.supervise_rx.clone();
        match thread::Builder::new().name("fts-supervisor".to_string()).spawn(move || supervise(&db, &messages)) {
            Ok(handle) => state.supervisor = Some(handle),
            Err(e) => tracing::error!(error = %e, "Failed to start FTS supervisor thread"),
        }
        let target = state.target;
        self.grow(&mut state, target);
        tracing::info!(workers = state.workers.len(), "FTS pool started");
    }

    fn grow(&self, state: &mut State, target: usize) {
        if state.cancel.is_none() {
            return;
        }
        let cancel = Cancel::new(self.cancel_rx.clone());
        while state.workers.len() < target {
            let id = state.next_worker_id;
            state.next_worker_id += 1;
            let spawned = Worker::spawn(
                id,
                self.jobs_rx.clone(),
                self.supervise_tx.clone(),
                cancel.clone(),
                Arc::clone(&self.command),
            );
            match spawned {
                Ok(worker) => state.workers.push(worker),
                Err(e) => {
                    tracing::error!(worker = id, error = %e, "Failed to start FTS worker thread");
                    break;
                },
            }
        }
    }

    /// Stop every thread the pool started and wait for them to finish.
    ///
    /// In-flight extractions are killed and their jobs dropped without a
    /// commit. Calling this more than once, or on a pool that never started,
    /// does nothing.
    pub fn shutdown(&self) {
        let (supervisor, workers) = {
            let mut state = self.state();
            if state.shut_down {
                return;
            }
            state.shut_down = true;
            let _ = self.supervise_tx.send(SupervisorMessage::Quit);
            for _ in &state.workers {
                let _ = self.jobs_tx.send(WorkerMessage::Quit);
            }
            state.cancel.take();
            (state.supervisor.take(), std::mem::take(&mut state.workers))
        };
        let me = thread::current().id();
        let handles = supervisor.into_iter().chain(workers.into_iter().map(Worker::into_handle));
        for handle in handles {
            // The last reference to the database may be dropped on one of our
            // own threads, which then shuts the pool down from inside it.
            if handle.thread().id() == me {
                continue;
            }
            if handle.join().is_err() {
                tracing::error!("FTS thread panicked during shutdown");
            }
        }
        tracing::info!("FTS pool shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.state().shut_down
    }

    /// Number of live worker threads.
    pub fn num_of_workers(&self) -> usize {
        self.state().workers.iter().filter(|w| w.is_alive()).count()
    }

    /// Resize the pool to `num` workers (at least one).
    ///
    /// Growing spawns workers immediately. Shrinking queues one retirement
    /// per excess worker: idle workers leave straight away, busy ones after
    /// finishing their current job.
    pub fn set_num_of_workers(&self, num: usize) {
        let num = num.max(1);
        let mut state = self.state();
        state.workers.retain(Worker::is_alive);
        state.target = num;
        if !state.initialized || state.shut_down {
            return;
        }
        let current = state.workers.len();
        if num > current {
            self.grow(&mut state, num);
        } else {
            for _ in num..current {
                let _ = self.jobs_tx.send(WorkerMessage::Quit);
            }
        }
    }

    /// Workers currently running an extraction.
    pub fn busy_worker_count(&self) -> usize {
        self.state().workers.iter().filter(|w| w.is_alive() && w.is_working()).count()
    }

    /// Workers waiting for a job.
    pub fn idle_worker_count(&self) -> usize {
        self.state().workers.iter().filter(|w| w.is_alive() && !w.is_working()).count()
    }

    /// `true` if a newly queued job would be picked up without waiting
    /// behind the jobs already queued.
    pub fn has_idle_worker(&self) -> bool {
        self.idle_worker_count() > self.jobs_rx.len()
    }

    pub fn add_job(
        &self,
        book_id: BookId,
        fmt: impl Into<String>,
        path: impl Into<PathBuf>,
        fmt_size: u64,
        fmt_hash: impl Into<String>,
    ) {
        self.initialize();
        let job = Job::new(book_id, fmt, path, fmt_size, fmt_hash);
        if self.is_shut_down() {
            tracing::debug!(book_id, fmt = %job.fmt, "FTS pool shut down; discarding job");
            job.cleanup();
            return;
        }
        tracing::trace!(book_id, fmt = %job.fmt, path = %job.path.display(), "Queued FTS job");
        let _ = self.jobs_tx.send(WorkerMessage::Job(job));
    }

    /// Ask the supervisor to pull more work from the database's backlog.
    pub fn check_for_work(&self) {
        self.initialize();
        let _ = self.supervise_tx.send(SupervisorMessage::CheckForWork);
    }
}

impl<D: FtsDatabase + ?Sized> Drop for Pool<D> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::error::Result;
    use crossbeam_channel::RecvTimeoutError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    const COPY_UPPERCASE: &str = r#"tr a-z A-Z < "$1" > "$1.txt""#;
    const WAIT: Duration = Duration::from_secs(10);

    struct MockDb {
        commits: Sender<(BookId, String, String)>,
        checks: AtomicUsize,
    }
    impl FtsDatabase for MockDb {
        fn commit_fts_result(&self, book_id: BookId, fmt: &str, _size: u64, _hash: &str, text: &str) -> Result<()> {
            let _ = self.commits.send((book_id, fmt.to_string(), text.to_string()));
            Ok(())
        }

        fn queue_next_fts_job(&self) -> Result<()> {
            self.checks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn setup(script: &str, workers: usize) -> (Arc<MockDb>, Receiver<(BookId, String, String)>, Pool<MockDb>) {
        let (commits, received) = unbounded();
        let db = Arc::new(MockDb { commits, checks: AtomicUsize::new(0) });
        let command = ExtractCommand::new("sh", ["-c", script, "extract"]);
        let pool = Pool::new(DbHandle::new(&db), command, workers);
        (db, received, pool)
    }

    fn scratch(dir: &tempfile::TempDir, book_id: BookId, content: &str) -> PathBuf {
        let path = dir.path().join(format!("{book_id}.txt"));
        std::fs::write(&path, content).unwrap();
        path
    }

    fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + WAIT;
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_each_completed_job_commits_once() {
        let dir = tempfile::tempdir().unwrap();
        let (db, received, pool) = setup(COPY_UPPERCASE, 2);
        pool.add_job(1, "TXT", scratch(&dir, 1, "first"), 5, "a");
        pool.add_job(2, "TXT", scratch(&dir, 2, "second"), 6, "b");
        let mut commits = vec![received.recv_timeout(WAIT).unwrap(), received.recv_timeout(WAIT).unwrap()];
        commits.sort();
        assert_eq!(commits, [(1, "TXT".to_string(), "FIRST".to_string()), (2, "TXT".to_string(), "SECOND".to_string())]);
        assert_eq!(received.recv_timeout(Duration::from_millis(300)), Err(RecvTimeoutError::Timeout));
        // Every commit immediately asks the database for more work.
        wait_until(|| db.checks.load(Ordering::SeqCst) >= 2);
        pool.shutdown();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_failed_job_commits_empty_text() {
        let dir = tempfile::tempdir().unwrap();
        let (_db, received, pool) = setup("echo 'cannot parse' >&2; exit 1", 1);
        pool.add_job(3, "EPUB", scratch(&dir, 3, "x"), 1, "h");
        assert_eq!(received.recv_timeout(WAIT).unwrap(), (3, "EPUB".to_string(), String::new()));
        pool.shutdown();
    }

    #[test]
    fn test_shutdown_kills_in_flight_job() {
        let dir = tempfile::tempdir().unwrap();
        let (_db, received, pool) = setup("sleep 30", 1);
        let path = scratch(&dir, 4, "x");
        pool.add_job(4, "TXT", &path, 1, "h");
        wait_until(|| pool.busy_worker_count() == 1);
        let started = Instant::now();
        pool.shutdown();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(received.try_recv().is_err());
        assert!(!path.exists());
        // Second call is a no-op.
        pool.shutdown();
        assert!(pool.is_shut_down());
        assert_eq!(pool.num_of_workers(), 0);
    }

    #[test]
    fn test_shutdown_without_initialize() {
        let (_db, _received, pool) = setup(COPY_UPPERCASE, 2);
        pool.shutdown();
        pool.shutdown();
        // A shut down pool never starts again.
        pool.check_for_work();
        assert_eq!(pool.num_of_workers(), 0);
    }

    #[test]
    fn test_result_dropped_when_database_gone() {
        let dir = tempfile::tempdir().unwrap();
        let (db, received, pool) = setup(r#"sleep 0.3; cp "$1" "$1.txt""#, 1);
        pool.add_job(5, "TXT", scratch(&dir, 5, "x"), 1, "h");
        drop(db);
        assert_eq!(received.recv_timeout(Duration::from_secs(2)), Err(RecvTimeoutError::Disconnected));
        pool.shutdown();
    }

    #[test]
    fn test_check_for_work_reaches_database() {
        let (db, _received, pool) = setup(COPY_UPPERCASE, 1);
        pool.check_for_work();
        wait_until(|| db.checks.load(Ordering::SeqCst) == 1);
        pool.shutdown();
    }

    #[test]
    fn test_resize() {
        let (_db, _received, pool) = setup(COPY_UPPERCASE, 3);
        pool.set_num_of_workers(5);
        assert_eq!(pool.num_of_workers(), 0, "resizing does not start the pool");
        pool.initialize();
        assert_eq!(pool.num_of_workers(), 5);
        assert!(pool.has_idle_worker());
        pool.set_num_of_workers(2);
        wait_until(|| pool.num_of_workers() == 2);
        pool.set_num_of_workers(0);
        wait_until(|| pool.num_of_workers() == 1);
        assert_eq!(pool.idle_worker_count(), 1);
        assert_eq!(pool.busy_worker_count(), 0);
        pool.shutdown();
    }
}
