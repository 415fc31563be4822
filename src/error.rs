use std::path::PathBuf;
use thiserror::Error;

/// An external document utility failed or produced nothing usable.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("{program} is not installed or not on PATH")]
    MissingBinary { program: String },
    #[error("{program} exited with status {status}: {stderr}")]
    NonZeroExit {
        program: String,
        status: String,
        stderr: String,
    },
    #[error("{program} produced unreadable output: {reason}")]
    UnreadableOutput { program: String, reason: String },
    #[error("archive {path} could not be extracted: {reason}")]
    Archive { path: PathBuf, reason: String },
    #[error("io error running {program}: {source}")]
    Io {
        program: String,
        source: std::io::Error,
    },
}

/// The EPUB container or OPF package document is structurally broken.
#[derive(Debug, Error)]
pub enum PackageError {
    #[error("missing META-INF/container.xml in {0}")]
    MissingContainer(PathBuf),
    #[error("container.xml has no rootfile full-path")]
    MissingRootfile,
    #[error("package document {path} unreadable: {source}")]
    UnreadablePackage {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("xml error in {document}: {reason}")]
    Xml { document: String, reason: String },
    #[error("package document declares an empty spine")]
    EmptySpine,
    #[error("spine references {0}, which is not in the manifest")]
    DanglingSpineRef(String),
}

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("http error talking to search index: {0}")]
    Http(#[from] reqwest::Error),
    #[error("search index returned {status} for {url}: {body}")]
    Status {
        status: u16,
        url: String,
        body: String,
    },
    #[error("embedded index error: {0}")]
    Embedded(#[from] tantivy::TantivyError),
    #[error("embedded query error: {0}")]
    Query(#[from] tantivy::query::QueryParserError),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("cache value for {key} is corrupt: {reason}")]
    CorruptValue { key: String, reason: String },
    #[error("cache lock poisoned")]
    Poisoned,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("unsupported content type: {0}")]
    UnsupportedFormat(String),
    #[error("{0} already exists")]
    Duplicate(String),
    #[error("{0} collides with a reserved upload directory")]
    ReservedName(String),
    #[error("invalid page count {raw:?} for {filename}")]
    InvalidPageCount { filename: String, raw: String },
    #[error("malformed package: {0}")]
    MalformedPackage(#[from] PackageError),
    #[error("tool failure: {0}")]
    Tool(#[from] ToolError),
    #[error("store failure: {0}")]
    Store(#[from] StoreError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A spine or manifest lookup missed. Public navigation calls log this and
/// return zero-valued data instead.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum NavigationError {
    #[error("no cached package for {0}")]
    PackageNotCached(String),
    #[error("fragment {0} is not in the manifest")]
    UnknownFragment(String),
    #[error("manifest item {0} is not in the spine")]
    NotInSpine(String),
    #[error("spine position {position} outside 1..={len}")]
    OutOfRange { position: i64, len: usize },
    #[error("navigation cache unavailable: {0}")]
    Cache(String),
}

impl From<StoreError> for NavigationError {
    fn from(err: StoreError) -> Self {
        NavigationError::Cache(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum LibraryError {
    #[error("book {0} not found")]
    NotFound(String),
    #[error("store failure: {0}")]
    Store(#[from] StoreError),
    #[error("navigation failure: {0}")]
    Navigation(#[from] NavigationError),
    #[error("search failure: {0}")]
    Index(#[from] IndexError),
}

impl From<rusqlite::Error> for IngestError {
    fn from(err: rusqlite::Error) -> Self {
        IngestError::Store(StoreError::Sqlite(err))
    }
}

impl From<rusqlite::Error> for LibraryError {
    fn from(err: rusqlite::Error) -> Self {
        LibraryError::Store(StoreError::Sqlite(err))
    }
}

impl IngestError {
    /// Human-readable rejection text surfaced in upload responses.
    pub fn user_message(&self) -> String {
        match self {
            IngestError::Duplicate(filename) => format!("{} already exists. ", filename),
            IngestError::UnsupportedFormat(content_type) => {
                format!("{} is not a supported book format. ", content_type)
            }
            other => format!("upload failed: {}. ", other),
        }
    }
}

/// Opening the store, cache or index failed while wiring services.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("store failure: {0}")]
    Store(#[from] StoreError),
    #[error("search index failure: {0}")]
    Index(#[from] IndexError),
}
