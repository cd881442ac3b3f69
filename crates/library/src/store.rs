//! On-disk layout of book files: `<root>/books/<book id>/book.<fmt>`.

use crate::error::{ErrorKind, Result};
use exn::{OptionExt, ResultExt};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tome_pages::BookId;

const BOOKS_DIR: &str = "books";

/// A file copied into the store.
#[derive(Debug)]
pub(crate) struct Stored {
    pub(crate) size: u64,
    pub(crate) hash: String,
}

#[derive(Debug)]
pub(crate) struct Store {
    root: PathBuf,
}

impl Store {
    pub(crate) fn open(library_root: &Path) -> Result<Self> {
        let root = library_root.join(BOOKS_DIR);
        fs::create_dir_all(&root).or_raise(|| ErrorKind::Storage)?;
        Ok(Self { root })
    }

    pub(crate) fn path(&self, book_id: BookId, fmt: &str) -> PathBuf {
        self.root.join(book_id.to_string()).join(format!("book.{}", fmt.to_lowercase()))
    }

    /// Copy `source` in as the given format, replacing any previous file.
    ///
    /// The file is written next to its destination and renamed into place,
    /// so readers never see a partial copy.
    pub(crate) fn import(&self, book_id: BookId, fmt: &str, source: &Path) -> Result<Stored> {
        let destination = self.path(book_id, fmt);
        let dir = destination.parent().ok_or_raise(|| ErrorKind::Storage)?;
        fs::create_dir_all(dir).or_raise(|| ErrorKind::Storage)?;
        let mut reader = BufReader::new(File::open(source).or_raise(|| ErrorKind::Storage)?);
        let mut staging = tempfile::NamedTempFile::new_in(dir).or_raise(|| ErrorKind::Storage)?;
        let mut hasher = blake3::Hasher::new();
        let mut size = 0u64;
        {
            let mut writer = BufWriter::new(staging.as_file_mut());
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                let read = reader.read(&mut buf).or_raise(|| ErrorKind::Storage)?;
                if read == 0 {
                    break;
                }
                hasher.update(&buf[..read]);
                writer.write_all(&buf[..read]).or_raise(|| ErrorKind::Storage)?;
                size += read as u64;
            }
            writer.flush().or_raise(|| ErrorKind::Storage)?;
        }
        staging.persist(&destination).or_raise(|| ErrorKind::Storage)?;
        tracing::debug!(book_id, fmt, size, path = %destination.display(), "Stored book format");
        Ok(Stored { size, hash: hasher.finalize().to_string() })
    }

    pub(crate) fn copy_to(&self, book_id: BookId, fmt: &str, destination: &Path) -> Result<u64> {
        fs::copy(self.path(book_id, fmt), destination).or_raise(|| ErrorKind::Storage)
    }
}

/// Format name of a file, from its extension.
pub(crate) fn format_of(path: &Path) -> Result<String> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .filter(|ext| !ext.is_empty())
        .map(str::to_uppercase)
        .ok_or_raise(|| ErrorKind::UnknownFormat)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_import_hashes_and_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let source = dir.path().join("source.epub");
        fs::write(&source, b"first").unwrap();
        let first = store.import(3, "EPUB", &source).unwrap();
        assert_eq!(first.size, 5);
        assert_eq!(first.hash, blake3::hash(b"first").to_string());
        assert_eq!(store.path(3, "EPUB"), dir.path().join("books/3/book.epub"));

        fs::write(&source, b"second!").unwrap();
        let second = store.import(3, "EPUB", &source).unwrap();
        assert_ne!(first.hash, second.hash);
        assert_eq!(fs::read(store.path(3, "EPUB")).unwrap(), b"second!");
        assert_eq!(fs::read_dir(dir.path().join("books/3")).unwrap().count(), 1);
    }

    #[rstest]
    #[case("book.epub", Some("EPUB"))]
    #[case("/a/b/Book.Pdf", Some("PDF"))]
    #[case("README", None)]
    #[case("trailing.", None)]
    fn test_format_of(#[case] path: &str, #[case] expected: Option<&str>) {
        assert_eq!(format_of(Path::new(path)).ok().as_deref(), expected);
    }
}
