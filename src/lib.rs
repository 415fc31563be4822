//! Core of a personal e-book library: ingestion of PDF and EPUB uploads,
//! EPUB reading-position navigation, library listings and search.

pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod ingest;
pub mod library;
pub mod models;
pub mod navigation;
pub mod pagination;
pub mod parser;
pub mod search;
pub mod tasks;
pub mod tools;

use crate::cache::{BookCache, KeyValueCache, SqliteCache};
use crate::config::Config;
use crate::db::BookStore;
use crate::error::StartupError;
use crate::ingest::Ingestor;
use crate::library::Library;
use crate::search::SearchIndex;
use crate::tasks::TaskPool;
use crate::tools::{SystemTools, ToolRunner};
use std::sync::Arc;

pub use config::ConfigError;
pub use models::{Book, BookFormat, BookId, Direction, HrefData, OwnerId, ReaderView};

/// Every component, wired from one [`Config`].
pub struct Services {
    pub config: Arc<Config>,
    pub store: Arc<BookStore>,
    pub cache: BookCache,
    pub index: SearchIndex,
    pub tasks: Arc<TaskPool>,
    pub ingestor: Ingestor,
    pub library: Library,
}

impl Services {
    /// Opens the database, cache and index named by `config` and runs the
    /// external document tools from `PATH`.
    pub fn open(config: Config) -> Result<Self, StartupError> {
        let database = config.database_file();
        let store = Arc::new(BookStore::open(&database)?);
        let cache: Arc<dyn KeyValueCache> = Arc::new(SqliteCache::open(&database)?);
        let tools: Arc<dyn ToolRunner> = Arc::new(SystemTools::new(&config.tools));
        let index = SearchIndex::from_config(&config)?;
        Ok(Self::assemble(config, store, cache, tools, index))
    }

    /// Wires pre-built parts, used when some of them are substituted.
    pub fn assemble(
        config: Config,
        store: Arc<BookStore>,
        cache: Arc<dyn KeyValueCache>,
        tools: Arc<dyn ToolRunner>,
        index: SearchIndex,
    ) -> Self {
        let config = Arc::new(config);
        let cache = BookCache::new(cache);
        let tasks = Arc::new(TaskPool::new(config.background_workers));
        let ingestor = Ingestor::new(
            Arc::clone(&config),
            Arc::clone(&store),
            cache.clone(),
            tools,
            index.clone(),
            Arc::clone(&tasks),
        );
        let library = Library::new(
            Arc::clone(&config),
            Arc::clone(&store),
            cache.clone(),
            index.clone(),
        );
        log::info!(
            "services ready: index backend {}, {} background workers",
            index.backend().name(),
            config.background_workers
        );
        Self {
            config,
            store,
            cache,
            index,
            tasks,
            ingestor,
            library,
        }
    }
}
