use std::ffi::OsString;
use std::path::{Path, PathBuf};

pub type BookId = u64;

/// An immutable request to extract the text of one format of one book.
///
/// `path` is a scratch copy of the format owned by the job: it is deleted,
/// together with its sidecar files, once the job has run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub book_id: BookId,
    pub fmt: String,
    pub path: PathBuf,
    pub fmt_size: u64,
    pub fmt_hash: String,
}

impl Job {
    pub fn new(
        book_id: BookId,
        fmt: impl Into<String>,
        path: impl Into<PathBuf>,
        fmt_size: u64,
        fmt_hash: impl Into<String>,
    ) -> Self {
        Self { book_id, fmt: fmt.into(), path: path.into(), fmt_size, fmt_hash: fmt_hash.into() }
    }

    /// Where the extractor writes the text it extracted.
    pub fn text_path(&self) -> PathBuf {
        extracted_text_path(&self.path)
    }

    /// Where the extractor's standard error is captured.
    pub fn error_path(&self) -> PathBuf {
        sidecar(&self.path, "error")
    }

    /// Remove the scratch input and both sidecars, whichever of them exist.
    pub(crate) fn cleanup(&self) {
        for path in [self.path.clone(), self.text_path(), self.error_path()] {
            match std::fs::remove_file(&path) {
                Ok(()) => {},
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to remove FTS scratch file"),
            }
        }
    }
}

/// `<input>.txt`: where an extractor run on `input` must write its text.
pub fn extracted_text_path(input: &Path) -> PathBuf {
    sidecar(input, "txt")
}

/// `<path>.<ext>`, appended rather than replacing any existing extension.
fn sidecar(path: &Path, ext: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".");
    name.push(ext);
    PathBuf::from(name)
}

/// The outcome of a [`Job`], consumed once by the supervisor.
///
/// When `ok` is false, `text` holds the diagnostic output of the failed
/// extraction rather than book text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobResult {
    pub book_id: BookId,
    pub fmt: String,
    pub fmt_size: u64,
    pub fmt_hash: String,
    pub ok: bool,
    pub text: String,
}

impl JobResult {
    pub fn success(job: &Job, text: String) -> Self {
        Self::from_job(job, true, text)
    }

    pub fn failure(job: &Job, error: String) -> Self {
        Self::from_job(job, false, error)
    }

    fn from_job(job: &Job, ok: bool, text: String) -> Self {
        Self {
            book_id: job.book_id,
            fmt: job.fmt.clone(),
            fmt_size: job.fmt_size,
            fmt_hash: job.fmt_hash.clone(),
            ok,
            text,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sidecars_append_extension() {
        let job = Job::new(7, "EPUB", "/tmp/fts/7.epub", 10, "abc");
        assert_eq!(job.text_path(), PathBuf::from("/tmp/fts/7.epub.txt"));
        assert_eq!(job.error_path(), PathBuf::from("/tmp/fts/7.epub.error"));
        assert_eq!(extracted_text_path(&job.path), job.text_path());
    }

    #[test]
    fn test_cleanup_removes_existing_files_only() {
        let dir = tempfile::tempdir().unwrap();
        let job = Job::new(1, "TXT", dir.path().join("1.txt"), 3, "h");
        std::fs::write(&job.path, "abc").unwrap();
        std::fs::write(job.error_path(), "boom").unwrap();
        job.cleanup();
        assert!(!job.path.exists());
        assert!(!job.error_path().exists());
        assert!(!job.text_path().exists());
    }
}
