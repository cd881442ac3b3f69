use crate::FtsDatabase;
use crate::error::Result;
use crate::job::JobResult;
use crossbeam_channel::Receiver;
use std::panic::{AssertUnwindSafe, catch_unwind};
use tome_sync::DbHandle;

pub(crate) enum SupervisorMessage {
    Result(JobResult),
    CheckForWork,
    Quit,
}

/// Body of the supervisor thread: the only place the pool writes to the
/// database. Nothing that happens while handling one message may end the
/// loop; only [`SupervisorMessage::Quit`] (or every sender going away) does.
pub(crate) fn supervise<D: FtsDatabase + ?Sized>(db: &DbHandle<D>, messages: &Receiver<SupervisorMessage>) {
    tracing::debug!("FTS supervisor started");
    while let Ok(message) = messages.recv() {
        let outcome = match message {
            SupervisorMessage::Quit => break,
            SupervisorMessage::CheckForWork => catch_unwind(AssertUnwindSafe(|| check_for_work(db))),
            SupervisorMessage::Result(result) => catch_unwind(AssertUnwindSafe(|| {
                commit_result(db, result)?;
                // Keep the pipeline saturated.
                check_for_work(db)
            })),
        };
        match outcome {
            Ok(Ok(())) => {},
            Ok(Err(err)) => tracing::error!(error = ?err, "FTS supervisor failed to handle message"),
            Err(_) => tracing::error!("FTS supervisor panicked while handling message"),
        }
    }
    tracing::debug!("FTS supervisor stopped");
}

fn check_for_work<D: FtsDatabase + ?Sized>(db: &DbHandle<D>) -> Result<()> {
    match db.get() {
        Some(db) => db.queue_next_fts_job(),
        None => Ok(()),
    }
}

/// Write one result back to the database; failures are stored as an empty
/// extraction so the format is not offered again until it changes.
pub(crate) fn commit_result<D: FtsDatabase + ?Sized>(db: &DbHandle<D>, result: JobResult) -> Result<()> {
    let JobResult { book_id, fmt, fmt_size, fmt_hash, ok, text } = result;
    let text = if ok {
        text
    } else {
        tracing::warn!(book_id, fmt = %fmt, error = %text.trim_end(), "Failed to extract text for full-text indexing");
        String::new()
    };
    let Some(db) = db.get() else {
        tracing::debug!(book_id, fmt = %fmt, "Database closed; dropping FTS result");
        return Ok(());
    };
    db.commit_fts_result(book_id, &fmt, fmt_size, &fmt_hash, &text)
}
