use std::collections::HashMap;

/// Formats that are always tried first, in this order, whatever the
/// configured preference says: their page counts are the most reliable.
pub const FORCED_FIRST: [&str; 4] = ["EPUB", "KEPUB", "AZW3", "MOBI"];

/// Order in which a book's formats are offered to the counting server.
///
/// Only formats the server declared it can handle are ranked at all. Among
/// those, [`FORCED_FIRST`] come first, then the configured order, then any
/// remaining supported formats alphabetically.
#[derive(Debug, Clone, Default)]
pub struct FormatPreferences {
    ranks: HashMap<String, usize>,
}

impl FormatPreferences {
    pub fn new<S: AsRef<str>>(supported: &[S], configured: &[S]) -> Self {
        let supported = supported.iter().map(|f| f.as_ref().to_uppercase()).collect::<Vec<_>>();
        let mut ranks = HashMap::new();
        let forced = FORCED_FIRST.iter().map(|f| f.to_string());
        let configured = configured.iter().map(|f| f.as_ref().to_uppercase());
        let mut rest = supported.clone();
        rest.sort();
        for fmt in forced.chain(configured).chain(rest) {
            if supported.contains(&fmt) && !ranks.contains_key(&fmt) {
                let rank = ranks.len();
                ranks.insert(fmt, rank);
            }
        }
        Self { ranks }
    }

    pub fn rank(&self, fmt: &str) -> Option<usize> {
        self.ranks.get(&fmt.to_uppercase()).copied()
    }

    /// The supported subset of `formats`, best first.
    pub fn candidates<S: AsRef<str>>(&self, formats: &[S]) -> Vec<String> {
        let mut candidates = formats
            .iter()
            .map(|f| f.as_ref().to_uppercase())
            .filter_map(|f| self.rank(&f).map(|rank| (rank, f)))
            .collect::<Vec<_>>();
        candidates.sort();
        candidates.dedup();
        candidates.into_iter().map(|(_, fmt)| fmt).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn prefs() -> FormatPreferences {
        FormatPreferences::new(&["PDF", "EPUB", "TXT", "MOBI", "DOCX"], &["PDF", "TXT", "EPUB"])
    }

    #[test]
    fn test_forced_formats_beat_configuration() {
        assert_eq!(prefs().candidates(&["pdf", "epub"]), ["EPUB", "PDF"]);
        assert_eq!(prefs().candidates(&["TXT", "MOBI", "PDF"]), ["MOBI", "PDF", "TXT"]);
    }

    #[test]
    fn test_unconfigured_supported_formats_come_last() {
        assert_eq!(prefs().candidates(&["DOCX", "TXT"]), ["TXT", "DOCX"]);
    }

    #[rstest]
    #[case(&["CBZ"])]
    #[case(&["KEPUB", "AZW3"])]
    #[case(&[])]
    fn test_unsupported_formats_are_dropped(#[case] formats: &[&str]) {
        assert!(prefs().candidates(formats).is_empty());
    }
}
