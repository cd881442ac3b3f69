use time::UtcDateTime;

pub type BookId = u64;

/// No format of the book can be handled by the counting server.
pub const NO_SUPPORTED_FORMAT: i64 = -1;
/// Every supported format failed to count.
pub const FAILED: i64 = -2;
/// Every supported format failed and at least one of them was DRM-locked.
pub const DRM_LOCKED: i64 = -3;

/// Persisted page count estimate of one book.
///
/// A negative `pages` is one of the sentinel outcomes above rather than a
/// count; it still records a terminal result so backlog scans stop offering
/// the book until one of its formats changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pages {
    pub pages: i64,
    /// Version of the counting algorithm that produced `pages`.
    pub algorithm: u32,
    /// Format the count was taken from (empty for sentinel outcomes).
    pub format: String,
    /// Size of that format when it was counted.
    pub format_size: u64,
    pub scanned_at: UtcDateTime,
}

impl Pages {
    pub fn counted(pages: u64, algorithm: u32, format: impl Into<String>, format_size: u64) -> Self {
        Self {
            pages: i64::try_from(pages).unwrap_or(i64::MAX),
            algorithm,
            format: format.into(),
            format_size,
            scanned_at: UtcDateTime::now(),
        }
    }

    pub fn failure(code: i64, algorithm: u32) -> Self {
        debug_assert!(code < 0, "failure sentinels are negative");
        Self { pages: code, algorithm, format: String::new(), format_size: 0, scanned_at: UtcDateTime::now() }
    }

    pub fn is_failure(&self) -> bool {
        self.pages < 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(NO_SUPPORTED_FORMAT)]
    #[case(FAILED)]
    #[case(DRM_LOCKED)]
    fn test_sentinels_are_failures(#[case] code: i64) {
        let pages = Pages::failure(code, 1);
        assert!(pages.is_failure());
        assert!(pages.format.is_empty());
    }

    #[test]
    fn test_counted() {
        let pages = Pages::counted(312, 1, "EPUB", 2048);
        assert!(!pages.is_failure());
        assert_eq!(pages.pages, 312);
        assert_eq!(pages.format, "EPUB");
    }
}
