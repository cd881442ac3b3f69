//! Entry point of text extraction subprocesses.

use crate::error::{ErrorKind, Result};
use crate::text::text_of;
use exn::{OptionExt, ResultExt};
use std::path::Path;
use tome_fts::extracted_text_path;

/// Write the text of the file at `path` to `<path>.txt`.
#[tracing::instrument(skip_all, fields(path = %path.display()))]
pub fn run(path: &Path) -> Result<()> {
    let fmt = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_uppercase)
        .ok_or_raise(|| ErrorKind::Unsupported(format!("{} has no extension", path.display())))?;
    let data = std::fs::read(path).or_raise(|| ErrorKind::Io)?;
    let text = text_of(&fmt, &data).ok_or_raise(|| ErrorKind::Unsupported(format!("cannot extract text from {fmt}")))?;
    std::fs::write(extracted_text_path(path), text).or_raise(|| ErrorKind::Io)?;
    tracing::debug!(bytes = data.len(), "Extracted text");
    Ok(())
}
