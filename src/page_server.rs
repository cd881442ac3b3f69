//! The built-in page counting server.
//!
//! Speaks the [`tome_pages::server::protocol`] line protocol on stdin and
//! stdout until stdin closes.

use crate::error::{ErrorKind, Result};
use crate::text::{TEXT_FORMATS, text_of};
use exn::ResultExt;
use memchr::memmem;
use std::io::{BufRead, Write};
use std::path::Path;
use tome_pages::CountError;
use tome_pages::server::protocol::{Greeting, Response};

/// Bump whenever counts would come out differently, so cached counts are
/// recomputed.
pub const ALGORITHM: u32 = 1;
pub const CHARS_PER_PAGE: u64 = 2400;

const DRM_MARKERS: [&[u8]; 3] = [b"META-INF/encryption.xml", b"EncryptedData", b"/Encrypt"];

pub fn input_formats() -> Vec<String> {
    std::iter::once("PDF").chain(TEXT_FORMATS).map(String::from).collect()
}

pub fn run(input: impl BufRead, mut output: impl Write) -> Result<()> {
    let greeting = Greeting { algorithm: ALGORITHM, formats: input_formats() };
    writeln!(output, "{greeting}").or_raise(|| ErrorKind::Io)?;
    output.flush().or_raise(|| ErrorKind::Io)?;
    for line in input.lines() {
        let line = line.or_raise(|| ErrorKind::Io)?;
        if line.is_empty() {
            continue;
        }
        let result = count_pages(Path::new(&line));
        tracing::debug!(path = %line, result = ?result, "Counted pages");
        writeln!(output, "{}", Response::from(result)).or_raise(|| ErrorKind::Io)?;
        output.flush().or_raise(|| ErrorKind::Io)?;
    }
    Ok(())
}

pub fn count_pages(path: &Path) -> std::result::Result<u64, CountError> {
    let fmt = path.extension().and_then(|ext| ext.to_str()).map(str::to_uppercase).unwrap_or_default();
    let data = std::fs::read(path).map_err(|e| CountError::Failed(e.to_string()))?;
    if DRM_MARKERS.iter().any(|marker| memmem::find(&data, marker).is_some()) {
        return Err(CountError::Drm);
    }
    if fmt == "PDF" {
        return match pdf_page_objects(&data) {
            0 => Err(CountError::Failed("no page objects found".to_string())),
            pages => Ok(pages),
        };
    }
    let text = text_of(&fmt, &data).ok_or_else(|| CountError::Failed(format!("cannot count pages of {fmt:?}")))?;
    let chars = text.chars().filter(|c| !c.is_whitespace()).count() as u64;
    Ok(chars.div_ceil(CHARS_PER_PAGE).max(1))
}

/// Number of `/Type /Page` dictionaries, not counting `/Type /Pages` tree
/// nodes.
fn pdf_page_objects(data: &[u8]) -> u64 {
    memmem::find_iter(data, b"/Type")
        .filter(|&at| {
            let rest = &data[at + b"/Type".len()..];
            let start = rest.iter().take_while(|b| b.is_ascii_whitespace()).count();
            let rest = &rest[start..];
            rest.starts_with(b"/Page") && !rest.get(b"/Page".len()).is_some_and(u8::is_ascii_alphanumeric)
        })
        .count() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn file(dir: &tempfile::TempDir, name: &str, data: &[u8]) -> std::path::PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, data).unwrap();
        path
    }

    #[rstest]
    #[case(b"<< /Type /Pages /Kids [3 0 R 4 0 R] >> << /Type /Page >> << /Type/Page>>".as_slice(), 2)]
    #[case(b"<< /Type /Catalog >>".as_slice(), 0)]
    #[case(b"/Type /PageLabel".as_slice(), 0)]
    fn test_pdf_page_objects(#[case] data: &[u8], #[case] expected: u64) {
        assert_eq!(pdf_page_objects(data), expected);
    }

    #[rstest]
    #[case("a.txt", "x".repeat(2400).into_bytes(), Ok(1))]
    #[case("b.txt", "x".repeat(2401).into_bytes(), Ok(2))]
    #[case("c.txt", Vec::new(), Ok(1))]
    #[case("d.html", format!("<p>{}</p>", "y".repeat(4800)).into_bytes(), Ok(2))]
    #[case("e.pdf", b"%PDF-1.7 << /Type /Page >>".to_vec(), Ok(1))]
    #[case("f.pdf", b"%PDF-1.7 /Encrypt 5 0 R".to_vec(), Err(CountError::Drm))]
    #[case("g.txt", b"EncryptedData".to_vec(), Err(CountError::Drm))]
    fn test_count_pages(#[case] name: &str, #[case] data: Vec<u8>, #[case] expected: std::result::Result<u64, CountError>) {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(count_pages(&file(&dir, name, &data)), expected);
    }

    #[test]
    fn test_unsupported_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(count_pages(&file(&dir, "a.cbz", b"PK")), Err(CountError::Failed(_))));
        assert!(matches!(count_pages(&dir.path().join("gone.txt")), Err(CountError::Failed(_))));
    }

    #[test]
    fn test_protocol_session() {
        let dir = tempfile::tempdir().unwrap();
        let txt = file(&dir, "a.txt", b"hello");
        let input = format!("{}\n\n{}\n", txt.display(), dir.path().join("gone.txt").display());
        let mut output = Vec::new();
        run(input.as_bytes(), &mut output).unwrap();
        let output = String::from_utf8(output).unwrap();
        let lines = output.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), 3);
        let greeting = Greeting::parse(lines[0]).unwrap();
        assert_eq!(greeting.algorithm, ALGORITHM);
        assert!(greeting.formats.contains(&"PDF".to_string()));
        assert_eq!(Response::parse(lines[1]), Some(Response::Ok(1)));
        assert!(matches!(Response::parse(lines[2]), Some(Response::Err(_))));
    }
}
