use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Subcommand of the `tome` binary that extracts text from one file.
pub const EXTRACT_SUBCOMMAND: &str = "extract-text";

/// The fixed entry point every extraction subprocess runs.
///
/// The job's scratch path is appended as the final argument. The process is
/// expected to write `<path>.txt` on success and diagnostics to stderr on
/// failure.
#[derive(Debug, Clone)]
pub struct ExtractCommand {
    program: PathBuf,
    args: Vec<OsString>,
    low_priority: bool,
}

impl ExtractCommand {
    pub fn new<I, S>(program: impl Into<PathBuf>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Self { program: program.into(), args: args.into_iter().map(Into::into).collect(), low_priority: false }
    }

    /// The running executable's own `extract-text` subcommand.
    pub fn current_exe() -> io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?, [EXTRACT_SUBCOMMAND]))
    }

    /// Build from a configured argv (program followed by leading arguments).
    pub fn from_argv(argv: &[String]) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self::new(program, args))
    }

    /// Run extractions under `nice` when it is available.
    pub fn with_low_priority(mut self, low_priority: bool) -> Self {
        self.low_priority = low_priority;
        self
    }

    pub(crate) fn build(&self, path: &Path) -> Command {
        let nice = self.low_priority.then(|| which::which("nice").ok()).flatten();
        let mut command = match nice {
            Some(nice) => {
                let mut command = Command::new(nice);
                command.args(["-n", "10"]).arg(&self.program);
                command
            },
            None => Command::new(&self.program),
        };
        command.args(&self.args).arg(path);
        command
    }
}
