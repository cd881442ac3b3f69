use crate::error::{CountError, ErrorKind, Result};
use exn::{OptionExt, ResultExt};
use std::ffi::{OsStr, OsString};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

/// Something that can count the pages of a book file.
///
/// A server lives for the whole run of the page-count thread and is only
/// ever used from that thread.
pub trait Server: Send {
    /// Version of the counting algorithm. Cached counts taken with any other
    /// version are recomputed.
    fn algorithm(&self) -> u32;

    /// Upper-case formats this server can count.
    fn input_formats(&self) -> &[String];

    fn count_pages(&mut self, path: &Path) -> std::result::Result<u64, CountError>;
}

/// Starts a [`Server`] on the page-count thread.
pub type Launcher = Box<dyn FnOnce() -> Result<Box<dyn Server>> + Send>;

/// Line protocol spoken between [`ProcessServer`] and its child.
///
/// The child announces itself once with `READY <algorithm> <FMT,FMT,...>`.
/// After that every request is one line holding a file path, answered by
/// exactly one of `OK <pages>`, `DRM` or `ERR <message>`.
pub mod protocol {
    use crate::error::CountError;
    use std::fmt;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Greeting {
        pub algorithm: u32,
        pub formats: Vec<String>,
    }

    impl Greeting {
        pub fn parse(line: &str) -> Option<Self> {
            let mut parts = line.split_whitespace();
            if parts.next()? != "READY" {
                return None;
            }
            let algorithm = parts.next()?.parse().ok()?;
            let formats = parts
                .next()
                .unwrap_or_default()
                .split(',')
                .filter(|f| !f.is_empty())
                .map(str::to_uppercase)
                .collect();
            Some(Self { algorithm, formats })
        }
    }

    impl fmt::Display for Greeting {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "READY {} {}", self.algorithm, self.formats.join(","))
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Response {
        Ok(u64),
        Drm,
        Err(String),
    }

    impl Response {
        pub fn parse(line: &str) -> Option<Self> {
            let line = line.trim_end_matches(['\r', '\n']);
            let (word, rest) = line.split_once(' ').unwrap_or((line, ""));
            match word {
                "OK" => rest.trim().parse().ok().map(Self::Ok),
                "DRM" => Some(Self::Drm),
                "ERR" => Some(Self::Err(rest.to_string())),
                _ => None,
            }
        }

        pub fn into_result(self) -> Result<u64, CountError> {
            match self {
                Self::Ok(pages) => Ok(pages),
                Self::Drm => Err(CountError::Drm),
                Self::Err(message) => Err(CountError::Failed(message)),
            }
        }
    }

    impl From<Result<u64, CountError>> for Response {
        fn from(result: Result<u64, CountError>) -> Self {
            match result {
                Ok(pages) => Self::Ok(pages),
                Err(CountError::Drm) => Self::Drm,
                Err(CountError::Failed(message)) => Self::Err(message),
            }
        }
    }

    impl fmt::Display for Response {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                Self::Ok(pages) => write!(f, "OK {pages}"),
                Self::Drm => f.write_str("DRM"),
                // Messages must stay on one line.
                Self::Err(message) => write!(f, "ERR {}", message.replace(['\r', '\n'], " ")),
            }
        }
    }
}

/// A running counting server child with its pipes.
///
/// Dropping it closes the child's stdin, which asks it to exit, then kills
/// and reaps it in case it did not.
struct Process {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: BufReader<ChildStdout>,
}

impl Process {
    /// Spawn `program args...` and wait for its greeting.
    fn spawn(program: &OsStr, args: &[OsString]) -> Result<(Self, protocol::Greeting)> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .or_raise(|| ErrorKind::Server("failed to start page counting server".to_string()))?;
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let (Some(stdin), Some(stdout)) = (stdin, stdout) else {
            let _ = child.kill();
            let _ = child.wait();
            exn::bail!(ErrorKind::Server("page counting server has no pipes".to_string()));
        };
        let mut process = Self { child, stdin: Some(stdin), stdout: BufReader::new(stdout) };
        let line = process.read_line().or_raise(|| ErrorKind::Io)?;
        let greeting = protocol::Greeting::parse(&line)
            .ok_or_raise(|| ErrorKind::Server(format!("unexpected greeting {:?}", line.trim_end())))?;
        Ok((process, greeting))
    }

    fn read_line(&mut self) -> std::io::Result<String> {
        let mut line = String::new();
        if self.stdout.read_line(&mut line)? == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        Ok(line)
    }

    fn request(&mut self, path: &Path) -> std::io::Result<String> {
        let stdin = self.stdin.as_mut().ok_or(std::io::ErrorKind::BrokenPipe)?;
        writeln!(stdin, "{}", path.display())?;
        stdin.flush()?;
        self.read_line()
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        drop(self.stdin.take());
        if let Err(e) = self.child.kill() {
            tracing::trace!(error = %e, "Page counting server already exited");
        }
        let _ = self.child.wait();
    }
}

/// A [`Server`] backed by a long-lived child process.
///
/// A child that stops responding fails the count in progress and is
/// replaced by a fresh one on the next request, so one file that crashes
/// the server does not fail every book after it.
pub struct ProcessServer {
    program: OsString,
    args: Vec<OsString>,
    process: Option<Process>,
    algorithm: u32,
    formats: Vec<String>,
}

impl ProcessServer {
    /// Spawn `program args...` and wait for its greeting.
    #[tracing::instrument(skip_all, fields(program = ?program.as_ref()))]
    pub fn spawn<I, S>(program: impl AsRef<OsStr>, args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        let program = program.as_ref().to_os_string();
        let args = args.into_iter().map(Into::into).collect::<Vec<_>>();
        let (process, greeting) = Process::spawn(&program, &args)?;
        tracing::debug!(algorithm = greeting.algorithm, formats = ?greeting.formats, "Page counting server ready");
        Ok(Self { program, args, process: Some(process), algorithm: greeting.algorithm, formats: greeting.formats })
    }

    /// A [`Launcher`] that spawns `argv` once the page-count thread starts.
    pub fn launcher(argv: Vec<OsString>) -> Launcher {
        Box::new(move || -> Result<Box<dyn Server>> {
            let (program, args) = argv
                .split_first()
                .ok_or_raise(|| ErrorKind::Server("no page counting server configured".to_string()))?;
            Ok(Box::new(Self::spawn(program, args.iter().cloned())?))
        })
    }

    /// `true` while a child is running; `false` between a crash and the
    /// restart on the next request.
    pub fn is_running(&self) -> bool {
        self.process.is_some()
    }

    fn restart(&self) -> std::result::Result<Process, CountError> {
        let (process, greeting) = Process::spawn(&self.program, &self.args)
            .map_err(|err| CountError::Failed(format!("failed to restart page counting server: {err:?}")))?;
        if greeting.algorithm != self.algorithm {
            tracing::warn!(
                expected = self.algorithm,
                actual = greeting.algorithm,
                "Restarted page counting server reports a different algorithm"
            );
        }
        tracing::info!("Restarted page counting server");
        Ok(process)
    }
}

impl Server for ProcessServer {
    fn algorithm(&self) -> u32 {
        self.algorithm
    }

    fn input_formats(&self) -> &[String] {
        &self.formats
    }

    fn count_pages(&mut self, path: &Path) -> std::result::Result<u64, CountError> {
        let path_display = path.display().to_string();
        if path_display.contains(['\r', '\n']) {
            return Err(CountError::Failed("path cannot be sent to the page counting server".to_string()));
        }
        if self.process.is_none() {
            self.process = Some(self.restart()?);
        }
        let response = match self.process.as_mut() {
            Some(process) => process.request(path),
            None => Err(std::io::ErrorKind::BrokenPipe.into()),
        };
        let line = match response {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(path = %path_display, error = %e, "Page counting server stopped responding");
                self.process = None;
                return Err(CountError::Failed(format!("page counting server stopped responding: {e}")));
            },
        };
        protocol::Response::parse(&line)
            .ok_or_else(|| CountError::Failed(format!("unexpected response {:?}", line.trim_end())))?
            .into_result()
    }
}
