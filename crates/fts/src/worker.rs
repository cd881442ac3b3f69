use crate::command::ExtractCommand;
use crate::error::{ErrorKind, Result};
use crate::job::{Job, JobResult};
use crate::supervisor::SupervisorMessage;
use crossbeam_channel::{Receiver, Sender, TryRecvError, select};
use exn::ResultExt;
use std::any::Any;
use std::fs::File;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::process::{Child, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// How long a worker blocks on the cancellation channel between checks of
/// its child's exit status.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub(crate) enum WorkerMessage {
    Job(Job),
    Quit,
}

/// Cancellation shared by every worker of a pool: nothing is ever sent on
/// it, the pool signals shutdown by dropping the only sender.
#[derive(Clone)]
pub(crate) struct Cancel(Receiver<()>);
impl Cancel {
    pub(crate) fn new(rx: Receiver<()>) -> Self {
        Self(rx)
    }

    fn is_cancelled(&self) -> bool {
        matches!(self.0.try_recv(), Err(TryRecvError::Disconnected))
    }
}

pub(crate) struct Worker {
    working: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl Worker {
    pub(crate) fn spawn(
        id: usize,
        jobs: Receiver<WorkerMessage>,
        results: Sender<SupervisorMessage>,
        cancel: Cancel,
        command: Arc<ExtractCommand>,
    ) -> std::io::Result<Self> {
        let working = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&working);
        let handle = thread::Builder::new()
            .name(format!("fts-worker-{id}"))
            .spawn(move || run(id, &jobs, &results, &cancel, &command, &flag))?;
        Ok(Self { working, handle })
    }

    pub(crate) fn is_alive(&self) -> bool {
        !self.handle.is_finished()
    }

    pub(crate) fn is_working(&self) -> bool {
        self.working.load(Ordering::Acquire)
    }

    pub(crate) fn into_handle(self) -> JoinHandle<()> {
        self.handle
    }
}

/// Clears the `working` flag however the job ends, panics included.
struct Working<'a>(&'a AtomicBool);
impl<'a> Working<'a> {
    fn start(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::Release);
        Self(flag)
    }
}
impl Drop for Working<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn run(
    id: usize,
    jobs: &Receiver<WorkerMessage>,
    results: &Sender<SupervisorMessage>,
    cancel: &Cancel,
    command: &ExtractCommand,
    working: &AtomicBool,
) {
    tracing::debug!(worker = id, "FTS worker started");
    while let Ok(WorkerMessage::Job(job)) = jobs.recv() {
        if cancel.is_cancelled() {
            job.cleanup();
            continue;
        }
        let _working = Working::start(working);
        let outcome = catch_unwind(AssertUnwindSafe(|| run_job(&job, command, cancel)));
        let result = match outcome {
            Ok(Ok(Some(result))) => result,
            Ok(Ok(None)) => {
                tracing::debug!(worker = id, book_id = job.book_id, fmt = %job.fmt, "FTS job abandoned at shutdown");
                continue;
            },
            Ok(Err(err)) => JobResult::failure(&job, format!("{err:?}")),
            Err(panic) => {
                job.cleanup();
                JobResult::failure(&job, panic_message(panic.as_ref()))
            },
        };
        if !cancel.is_cancelled() {
            // The supervisor only goes away at shutdown.
            let _ = results.send(SupervisorMessage::Result(result));
        }
    }
    tracing::debug!(worker = id, "FTS worker retired");
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    let detail = panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic");
    format!("text extraction panicked: {detail}")
}

/// Run one job to completion in a subprocess.
///
/// Returns `Ok(None)` if the pool was shut down while the subprocess was
/// still running; the child is killed and the job dropped. Whatever happens,
/// the job's scratch files are gone when this returns.
pub(crate) fn run_job(job: &Job, command: &ExtractCommand, cancel: &Cancel) -> Result<Option<JobResult>> {
    let result = run_job_inner(job, command, cancel);
    job.cleanup();
    result
}

fn run_job_inner(job: &Job, command: &ExtractCommand, cancel: &Cancel) -> Result<Option<JobResult>> {
    let error_path = job.error_path();
    let stderr = File::create(&error_path).or_raise(|| ErrorKind::Io)?;
    let mut child = command
        .build(&job.path)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(stderr)
        .spawn()
        .or_raise(|| ErrorKind::Spawn)?;
    let status = loop {
        if let Some(status) = child.try_wait().or_raise(|| ErrorKind::Io)? {
            break status;
        }
        select! {
            recv(cancel.0) -> _ => {
                kill(&mut child);
                return Ok(None);
            },
            default(POLL_INTERVAL) => {},
        }
    };
    match std::fs::read(job.text_path()) {
        Ok(bytes) => Ok(Some(JobResult::success(job, String::from_utf8_lossy(&bytes).into_owned()))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let stderr = std::fs::read(&error_path).map(|b| String::from_utf8_lossy(&b).into_owned());
            let error = match stderr {
                Ok(text) if !text.trim().is_empty() => text,
                _ => format!("text extraction exited ({status}) without producing any output"),
            };
            Ok(Some(JobResult::failure(job, error)))
        },
        Err(e) => Err(e).or_raise(|| ErrorKind::Io),
    }
}

fn kill(child: &mut Child) {
    if let Err(e) = child.kill() {
        tracing::warn!(pid = child.id(), error = %e, "Failed to kill text extraction process");
    }
    // Reap it so no zombie outlives the pool.
    let _ = child.wait();
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;
    use std::time::Instant;

    fn sh(script: &str) -> ExtractCommand {
        ExtractCommand::new("sh", ["-c", script, "extract"])
    }

    fn job_in(dir: &tempfile::TempDir, content: &str) -> Job {
        let path = dir.path().join("1.txt");
        std::fs::write(&path, content).unwrap();
        Job::new(1, "TXT", path, content.len() as u64, "hash")
    }

    #[test]
    fn test_successful_extraction() {
        let dir = tempfile::tempdir().unwrap();
        let job = job_in(&dir, "hello world");
        let (_tx, rx) = unbounded();
        let result = run_job(&job, &sh(r#"tr a-z A-Z < "$1" > "$1.txt""#), &Cancel::new(rx)).unwrap().unwrap();
        assert!(result.ok);
        assert_eq!(result.text, "HELLO WORLD");
        assert_eq!(result.fmt_hash, "hash");
        assert!(!job.path.exists());
        assert!(!job.text_path().exists());
        assert!(!job.error_path().exists());
    }

    #[test]
    fn test_invalid_utf8_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let job = job_in(&dir, "x");
        let (_tx, rx) = unbounded();
        let result =
            run_job(&job, &sh(r#"printf 'caf\351' > "$1.txt""#), &Cancel::new(rx)).unwrap().unwrap();
        assert!(result.ok);
        assert_eq!(result.text, "caf\u{FFFD}");
    }

    #[test]
    fn test_failed_extraction_captures_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let job = job_in(&dir, "x");
        let (_tx, rx) = unbounded();
        let result = run_job(&job, &sh("echo 'unsupported format' >&2; exit 3"), &Cancel::new(rx)).unwrap().unwrap();
        assert!(!result.ok);
        assert_eq!(result.text.trim(), "unsupported format");
        assert!(!job.error_path().exists());
    }

    #[test]
    fn test_spawn_failure_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let job = job_in(&dir, "x");
        let (_tx, rx) = unbounded();
        let command = ExtractCommand::new(dir.path().join("missing-extractor"), Vec::<String>::new());
        let err = run_job(&job, &command, &Cancel::new(rx)).unwrap_err();
        assert!(matches!(*err, ErrorKind::Spawn));
        assert!(!job.path.exists());
    }

    #[test]
    fn test_cancellation_kills_child() {
        let dir = tempfile::tempdir().unwrap();
        let job = job_in(&dir, "x");
        let (tx, rx) = unbounded::<()>();
        let cancel = Cancel::new(rx);
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            drop(tx);
        });
        let started = Instant::now();
        let result = run_job(&job, &sh("sleep 30"), &cancel).unwrap();
        assert!(result.is_none());
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(cancel.is_cancelled());
        assert!(!job.path.exists());
        canceller.join().unwrap();
    }
}
