//! Full-text index over the library.
//!
//! Two backends implement [`IndexBackend`]: an embedded tantivy index on
//! local disk and a remote Elasticsearch-compatible HTTP index. One is
//! chosen from [`Config`] at startup; callers only see [`SearchIndex`].

pub mod embedded;
pub mod remote;

use crate::config::{Config, IndexConfig};
use crate::error::IndexError;
use crate::models::{BookFormat, BookId, OwnerId};
use log::warn;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

pub use embedded::EmbeddedIndex;
pub use remote::RemoteIndex;

/// Hits returned per collection by one query.
pub const MAX_HITS: usize = 50;

pub type Result<T> = std::result::Result<T, IndexError>;

/// Whole-book search document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookInfo {
    #[serde(default)]
    pub owner_id: OwnerId,
    #[serde(default)]
    pub book_id: BookId,
    pub title: String,
    pub author: String,
    pub url: String,
    pub cover: String,
}

impl BookInfo {
    /// `{owner}_{book}`
    pub fn key(&self) -> String {
        info_key(self.owner_id, self.book_id)
    }
}

/// One PDF page or EPUB spine entry, base64-encoded in `data`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookDetail {
    pub owner_id: OwnerId,
    pub book_id: BookId,
    #[serde(rename = "thedata")]
    pub data: String,
    pub title: String,
    pub author: String,
    pub url: String,
    /// Fragment href for EPUB entries, empty for PDF pages.
    pub se_url: String,
    pub cover: String,
    pub page: i64,
    pub format: BookFormat,
}

impl BookDetail {
    /// `{owner}_{book}_{page}`
    pub fn key(&self) -> String {
        detail_key(self.owner_id, self.book_id, self.page)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookDetailHit {
    #[serde(default)]
    pub owner_id: OwnerId,
    #[serde(default)]
    pub book_id: BookId,
    pub title: String,
    pub author: String,
    pub url: String,
    #[serde(default)]
    pub se_url: String,
    pub cover: String,
    pub page: i64,
    pub format: BookFormat,
    #[serde(default)]
    pub highlights: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResults {
    pub book_info: Vec<BookInfo>,
    pub book_detail: Vec<BookDetailHit>,
}

pub fn info_key(owner_id: OwnerId, book_id: BookId) -> String {
    format!("{}_{}", owner_id, book_id)
}

pub fn detail_key(owner_id: OwnerId, book_id: BookId, page: i64) -> String {
    format!("{}_{}_{}", owner_id, book_id, page)
}

pub trait IndexBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether per-page content is indexed and searchable.
    fn supports_detail(&self) -> bool;

    /// Writes `doc`, replacing any document with the same key.
    fn index_info(&self, doc: &BookInfo) -> Result<()>;

    fn index_detail(&self, doc: &BookDetail) -> Result<()>;

    /// Rewrites title, author and cover on the info document and on detail
    /// pages `0..=detail_pages`.
    fn update_info(&self, doc: &BookInfo, detail_pages: i64) -> Result<()>;

    fn delete_info(&self, owner_id: OwnerId, book_id: BookId) -> Result<()>;

    fn delete_detail(&self, owner_id: OwnerId, book_id: BookId, page: i64) -> Result<()>;

    /// Matches `term` against titles and authors, restricted to `owner_id`
    /// inside the backend query when given.
    fn query(&self, term: &str, owner_id: Option<OwnerId>) -> Result<SearchResults>;
}

/// The index used by ingestion and the library, backed by one backend for
/// the life of the process.
#[derive(Clone)]
pub struct SearchIndex {
    backend: Arc<dyn IndexBackend>,
}

impl SearchIndex {
    pub fn new(backend: Arc<dyn IndexBackend>) -> Self {
        Self { backend }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let backend: Arc<dyn IndexBackend> = match &config.index {
            IndexConfig::Embedded { .. } => {
                let path = config
                    .embedded_index_path()
                    .unwrap_or_else(|| config.asset_path.join("lr_index.tantivy"));
                Arc::new(EmbeddedIndex::open(path)?)
            }
            IndexConfig::Remote {
                url,
                index,
                timeout_secs,
            } => Arc::new(RemoteIndex::new(
                url,
                index,
                Duration::from_secs(*timeout_secs),
            )?),
        };
        Ok(Self::new(backend))
    }

    pub fn backend(&self) -> &Arc<dyn IndexBackend> {
        &self.backend
    }

    pub fn supports_detail(&self) -> bool {
        self.backend.supports_detail()
    }

    pub fn index_info(&self, doc: &BookInfo) -> Result<()> {
        self.backend.index_info(doc)
    }

    pub fn index_detail(&self, doc: &BookDetail) -> Result<()> {
        self.backend.index_detail(doc)
    }

    pub fn update_info(&self, doc: &BookInfo, detail_pages: i64) -> Result<()> {
        self.backend.update_info(doc, detail_pages)
    }

    /// Removes the info document and detail pages `0..=detail_pages`.
    /// Every page is attempted; the first failure is returned.
    pub fn delete_book(&self, owner_id: OwnerId, book_id: BookId, detail_pages: i64) -> Result<()> {
        let mut first_error = self.backend.delete_info(owner_id, book_id).err();
        if self.backend.supports_detail() {
            for page in 0..=detail_pages {
                if let Err(err) = self.backend.delete_detail(owner_id, book_id, page) {
                    warn!(
                        "failed to delete {} from {}: {}",
                        detail_key(owner_id, book_id, page),
                        self.backend.name(),
                        err
                    );
                    first_error.get_or_insert(err);
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub fn query(&self, term: &str) -> Result<SearchResults> {
        self.backend.query(term, None)
    }

    pub fn query_for_owner(&self, owner_id: OwnerId, term: &str) -> Result<SearchResults> {
        let mut results = self.backend.query(term, Some(owner_id))?;
        results.book_info.retain(|hit| hit.owner_id == owner_id);
        results.book_detail.retain(|hit| hit.owner_id == owner_id);
        Ok(results)
    }
}
