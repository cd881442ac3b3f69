//! Layered configuration for tome.
//!
//! Values are resolved, lowest priority first, from the built-in defaults, an
//! optional configuration file (TOML, YAML or JSON depending on its
//! extension) and `TOME_` environment variables, where `__` separates nested
//! keys: `TOME_FTS__MAX_WORKERS=2` sets `fts.max_workers`.

pub mod error;

use crate::error::{ErrorKind, Result};
use exn::{OptionExt, ResultExt};
use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const ENV_PREFIX: &str = "TOME_";

/// Input formats in the order their page counts are trusted, best first.
pub const DEFAULT_INPUT_FORMAT_ORDER: [&str; 17] = [
    "EPUB", "AZW3", "MOBI", "LIT", "PRC", "FB2", "HTML", "HTM", "XHTM", "SHTML", "XHTML", "ZIP", "DOCX", "ODT", "RTF",
    "PDF", "TXT",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Tracing filter directives, overridden by `RUST_LOG`.
    pub log: String,
    pub fts: FtsConfig,
    pub pages: PagesConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self { log: "tome=info".to_string(), fts: FtsConfig::default(), pages: PagesConfig::default() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FtsConfig {
    pub enabled: bool,
    /// Text extraction subprocesses run at once.
    pub max_workers: usize,
    /// Run the extractor at a lower scheduling priority.
    pub low_priority: bool,
    /// Extractor program and leading arguments; the file path is appended.
    /// Defaults to this executable's `extract-text` command.
    pub extractor: Option<Vec<String>>,
}

impl Default for FtsConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism().map_or(2, usize::from);
        Self { enabled: true, max_workers: (cpus / 2).max(1), low_priority: true, extractor: None }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PagesConfig {
    pub enabled: bool,
    /// Preferred formats for counting, best first.
    pub input_format_order: Vec<String>,
    /// Counting server program and arguments. Defaults to this executable's
    /// `page-server` command.
    pub server: Option<Vec<String>>,
}

impl Default for PagesConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            input_format_order: DEFAULT_INPUT_FORMAT_ORDER.iter().map(|f| f.to_string()).collect(),
            server: None,
        }
    }
}

impl Config {
    /// Where the configuration file is looked for when none is given.
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "tome").map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Load from defaults, `file` (or the default file, if it exists) and
    /// the environment.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let file = match file {
            Some(file) => Some(file.to_path_buf()),
            None => Self::default_path().filter(|path| path.is_file()),
        };
        Self::extract(Self::figment(file.as_deref())?.merge(Env::prefixed(ENV_PREFIX).split("__")))
    }

    /// Defaults layered with a configuration file, without the environment.
    pub fn figment(file: Option<&Path>) -> Result<Figment> {
        let figment = Figment::from(Serialized::defaults(Self::default()));
        let Some(file) = file else {
            return Ok(figment);
        };
        if !file.is_file() {
            exn::bail!(ErrorKind::Invalid(format!("configuration file {} does not exist", file.display())));
        }
        let extension = file
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase)
            .ok_or_raise(|| ErrorKind::Invalid(format!("cannot tell the format of {}", file.display())))?;
        tracing::debug!(path = %file.display(), "Loading configuration file");
        Ok(match extension.as_str() {
            "toml" => figment.merge(Toml::file_exact(file)),
            "yaml" | "yml" => figment.merge(Yaml::file_exact(file)),
            "json" => figment.merge(Json::file_exact(file)),
            other => exn::bail!(ErrorKind::Invalid(format!("unsupported configuration format: {other}"))),
        })
    }

    pub fn extract(figment: Figment) -> Result<Self> {
        let config: Self = figment.extract().or_raise(|| ErrorKind::Load)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.fts.max_workers == 0 {
            exn::bail!(ErrorKind::Invalid("fts.max_workers must be at least 1".to_string()));
        }
        if self.fts.extractor.as_ref().is_some_and(Vec::is_empty) {
            exn::bail!(ErrorKind::Invalid("fts.extractor must name a program".to_string()));
        }
        if self.pages.server.as_ref().is_some_and(Vec::is_empty) {
            exn::bail!(ErrorKind::Invalid("pages.server must name a program".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn write(dir: &tempfile::TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::extract(Config::figment(None).unwrap()).unwrap();
        assert_eq!(config, Config::default());
        assert!(config.fts.max_workers >= 1);
        assert_eq!(config.pages.input_format_order.first().map(String::as_str), Some("EPUB"));
    }

    #[rstest]
    #[case("config.toml", "log = \"debug\"\n[fts]\nmax_workers = 3\n")]
    #[case("config.yaml", "log: debug\nfts:\n  max_workers: 3\n")]
    #[case("config.json", r#"{"log": "debug", "fts": {"max_workers": 3}}"#)]
    fn test_file_formats(#[case] name: &str, #[case] content: &str) {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, name, content);
        let config = Config::extract(Config::figment(Some(&path)).unwrap()).unwrap();
        assert_eq!(config.log, "debug");
        assert_eq!(config.fts.max_workers, 3);
        // Untouched keys keep their defaults.
        assert!(config.fts.low_priority);
        assert!(config.pages.enabled);
    }

    #[test]
    fn test_environment_overrides_file() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("config.toml", "[fts]\nmax_workers = 3\n[pages]\nenabled = true\n")?;
            jail.set_env("TOME_FTS__MAX_WORKERS", "7");
            jail.set_env("TOME_PAGES__ENABLED", "false");
            jail.set_env("TOME_LOG", "tome=trace");
            // Unprefixed variables are ignored.
            jail.set_env("FTS__LOW_PRIORITY", "false");
            let config = Config::load(Some(Path::new("config.toml"))).unwrap();
            assert_eq!(config.fts.max_workers, 7);
            assert!(!config.pages.enabled);
            assert_eq!(config.log, "tome=trace");
            assert!(config.fts.low_priority);
            Ok(())
        });
    }

    #[test]
    fn test_invalid_environment_value() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("config.toml", "")?;
            jail.set_env("TOME_FTS__MAX_WORKERS", "0");
            let err = Config::load(Some(Path::new("config.toml"))).unwrap_err();
            assert!(matches!(*err, ErrorKind::Invalid(_)));
            Ok(())
        });
    }

    #[rstest]
    #[case("[fts]\nmax_workers = 0\n")]
    #[case("[fts]\nextractor = []\n")]
    #[case("[pages]\nserver = []\n")]
    fn test_invalid_values(#[case] content: &str) {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "config.toml", content);
        let err = Config::extract(Config::figment(Some(&path)).unwrap()).unwrap_err();
        assert!(matches!(*err, ErrorKind::Invalid(_)));
    }

    #[test]
    fn test_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "config.toml", "[fts\n");
        let err = Config::extract(Config::figment(Some(&path)).unwrap()).unwrap_err();
        assert!(matches!(*err, ErrorKind::Load));
    }

    #[rstest]
    #[case("config.ini")]
    #[case("missing.toml")]
    fn test_unusable_files(#[case] name: &str) {
        let dir = tempfile::tempdir().unwrap();
        if name != "missing.toml" {
            write(&dir, name, "log = debug");
        }
        let err = Config::figment(Some(&dir.path().join(name))).unwrap_err();
        assert!(matches!(*err, ErrorKind::Invalid(_)));
    }
}
