use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use libreread::config::{Config, IndexConfig};
use libreread::models::{Direction, OwnerId};
use libreread::search::RemoteIndex;
use libreread::Services;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "libreread", version, about = "Personal e-book library")]
struct Cli {
    /// TOML config file; `LIBREREAD_*` variables override it.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, global = true, default_value_t = 1)]
    owner: OwnerId,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Store a PDF or EPUB and index it.
    Ingest {
        path: PathBuf,
        /// Defaults to the type implied by the file extension.
        #[arg(long)]
        content_type: Option<String>,
    },
    /// Reopen a book at its saved position.
    Open { filename: String },
    /// Jump to a 1-based spine position.
    Goto { filename: String, position: i64 },
    /// Move one spine entry from `href`.
    Step {
        filename: String,
        href: String,
        direction: Direction,
    },
    /// Report the page number of `href`.
    Locate { filename: String, href: String },
    Search { term: String },
    Library {
        #[arg(default_value_t = 1)]
        page: u64,
        #[arg(long)]
        recent: bool,
    },
    Metadata { filename: String },
    Edit {
        filename: String,
        #[arg(long)]
        title: String,
        #[arg(long)]
        author: String,
        #[arg(long)]
        cover: Option<String>,
    },
    Delete { filename: String },
    /// Install the attachment ingest pipeline on a remote index.
    BootstrapIndex,
}

fn content_type_for(path: &Path) -> Result<&'static str> {
    let extension = path
        .extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "pdf" => Ok("application/pdf"),
        "epub" => Ok("application/epub+zip"),
        other => bail!("cannot infer a content type for extension {:?}", other),
    }
}

fn print<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn bootstrap_index(config: &Config) -> Result<()> {
    match &config.index {
        IndexConfig::Remote {
            url,
            index,
            timeout_secs,
        } => {
            let remote = RemoteIndex::new(url, index, Duration::from_secs(*timeout_secs))?;
            remote.ensure_attachment_pipeline()?;
            log::info!("attachment pipeline installed on {}", url);
        }
        IndexConfig::Embedded { .. } => {
            log::info!("embedded index needs no bootstrap");
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref()).context("loading configuration")?;

    if let Command::BootstrapIndex = cli.command {
        return bootstrap_index(&config);
    }

    let services = Services::open(config).context("opening library")?;
    let owner = cli.owner;
    let library = &services.library;
    let navigator = library.navigator();

    match cli.command {
        Command::Ingest { path, content_type } => {
            let content_type = match content_type {
                Some(content_type) => content_type,
                None => content_type_for(&path)?.to_string(),
            };
            match services.ingestor.ingest_file(owner, &path, &content_type) {
                Ok(book_id) => {
                    // Page content indexing runs in the background.
                    services.tasks.wait_idle();
                    print(&serde_json::json!({ "book_id": book_id, "message": "uploaded successfully" }))?;
                }
                Err(err) => bail!(err.user_message()),
            }
        }
        Command::Open { filename } => print(&library.open_book(owner, &filename)?)?,
        Command::Goto { filename, position } => {
            print(&navigator.resolve_by_id(&filename, position))?
        }
        Command::Step {
            filename,
            href,
            direction,
        } => print(&navigator.step(&filename, &href, direction))?,
        Command::Locate { filename, href } => print(&navigator.current_page(&filename, &href))?,
        Command::Search { term } => print(&library.search(owner, &term)?)?,
        Command::Library { page, recent } => {
            if recent {
                print(&library.recently_read(owner)?)?
            } else {
                print(&library.library_page(owner, page)?)?
            }
        }
        Command::Metadata { filename } => print(&library.book_metadata(&filename)?)?,
        Command::Edit {
            filename,
            title,
            author,
            cover,
        } => print(&library.edit_book(owner, &filename, &title, &author, cover.as_deref())?)?,
        Command::Delete { filename } => {
            let book = library.delete_book(owner, &filename)?;
            log::info!("removed {} ({})", book.filename, book.format);
        }
        Command::BootstrapIndex => {}
    }

    services.tasks.shutdown();
    Ok(())
}
