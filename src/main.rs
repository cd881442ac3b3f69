//! `tome`: a book library with background text indexing and page counting.

mod error;
mod extract;
mod page_server;
mod text;

use crate::error::{ErrorKind, Result};
use clap::{Parser, Subcommand};
use exn::{OptionExt, ResultExt};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tome_config::Config;
use tome_fts::EXTRACT_SUBCOMMAND;
use tome_library::Library;
use tome_pages::{Launcher, ProcessServer};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

const PAGE_SERVER_SUBCOMMAND: &str = "page-server";
/// Logging for the helper subprocesses, whose stderr is captured.
const HELPER_LOG: &str = "tome=warn";

#[derive(Debug, Parser)]
#[command(name = "tome", version, about)]
struct Cli {
    /// Configuration file (TOML, YAML or JSON).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Add files as the formats of one new book.
    Add {
        #[arg(long)]
        library: PathBuf,
        /// Defaults to the name of the first file.
        #[arg(long)]
        title: Option<String>,
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Extract text and count pages until nothing is left to do.
    Index {
        #[arg(long)]
        library: PathBuf,
        /// Give up after this many seconds.
        #[arg(long, default_value_t = 3600)]
        timeout: u64,
    },
    /// Full-text search of indexed books.
    Search {
        #[arg(long)]
        library: PathBuf,
        query: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Write the text of PATH to PATH.txt.
    #[command(name = EXTRACT_SUBCOMMAND, hide = true)]
    ExtractText { path: PathBuf },
    /// Count pages of the files named on stdin.
    #[command(name = PAGE_SERVER_SUBCOMMAND, hide = true)]
    PageServer,
}

fn init_tracing(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new("tome=info"));
    // Only the first subscriber installed in a process takes effect.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err:?}");
            ExitCode::FAILURE
        },
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::ExtractText { path } => {
            init_tracing(HELPER_LOG);
            extract::run(&path)
        },
        Command::PageServer => {
            init_tracing(HELPER_LOG);
            page_server::run(std::io::stdin().lock(), std::io::stdout().lock())
        },
        Command::Add { library, title, files } => {
            let library = open(&library, &configure(cli.config.as_deref())?)?;
            add(&library, title, &files)
        },
        Command::Index { library, timeout } => {
            let library = open(&library, &configure(cli.config.as_deref())?)?;
            index(&library, timeout)
        },
        Command::Search { library, query, limit } => {
            let library = open(&library, &configure(cli.config.as_deref())?)?;
            search(&library, &query, limit)
        },
    }
}

/// Load the configuration and start logging as it asks.
fn configure(file: Option<&Path>) -> Result<Config> {
    let config = Config::load(file).or_raise(|| ErrorKind::Config)?;
    init_tracing(&config.log);
    Ok(config)
}

fn open(root: &Path, config: &Config) -> Result<Arc<Library>> {
    Library::open(root, config).or_raise(|| ErrorKind::Library)
}

fn add(library: &Library, title: Option<String>, files: &[PathBuf]) -> Result<()> {
    let title = match title {
        Some(title) => title,
        None => files
            .first()
            .and_then(|file| file.file_stem())
            .map(|stem| stem.to_string_lossy().into_owned())
            .ok_or_raise(|| ErrorKind::Unsupported("cannot derive a title".to_string()))?,
    };
    let book = library.create_book(&title).or_raise(|| ErrorKind::Library)?;
    for file in files {
        let format = library.add_format(book.id, file).or_raise(|| ErrorKind::Library)?;
        tracing::info!(book_id = book.id, fmt = %format.name, size = format.size, "Added format");
    }
    println!("{}\t{}", book.id, book.title);
    library.close();
    Ok(())
}

/// The configured counting server, or this executable's own.
fn page_server_launcher(config: &Config) -> Result<Launcher> {
    let argv = match &config.pages.server {
        Some(argv) => argv.iter().map(OsString::from).collect(),
        None => {
            let exe = std::env::current_exe().or_raise(|| ErrorKind::Io)?;
            vec![exe.into_os_string(), OsString::from(PAGE_SERVER_SUBCOMMAND)]
        },
    };
    Ok(ProcessServer::launcher(argv))
}

fn index(library: &Library, timeout: u64) -> Result<()> {
    library.start_indexing();
    library.start_page_counts(page_server_launcher(library.config())?).or_raise(|| ErrorKind::Library)?;
    let finished = library.wait_for_backlogs(Duration::from_secs(timeout)).or_raise(|| ErrorKind::Library)?;
    let fts_backlog = library.fts_backlog().or_raise(|| ErrorKind::Library)?;
    let page_backlog = library.pending_page_scans().or_raise(|| ErrorKind::Library)?;
    library.close();
    tracing::info!(fts_backlog, page_backlog, "Indexing stopped");
    if !finished {
        exn::bail!(ErrorKind::Timeout(timeout));
    }
    Ok(())
}

fn search(library: &Library, query: &str, limit: usize) -> Result<()> {
    let hits = library.search(query, limit).or_raise(|| ErrorKind::Library)?;
    for hit in hits {
        let title = library.book(hit.book_id).or_raise(|| ErrorKind::Library)?.map(|book| book.title);
        println!("{}\t{}\t{}\t{}", hit.book_id, hit.format, title.unwrap_or_default(), hit.snippet);
    }
    library.close();
    Ok(())
}
