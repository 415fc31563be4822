use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const ENABLE_ES_ENV: &str = "LIBREREAD_ELASTICSEARCH";
pub const ES_PATH_ENV: &str = "LIBREREAD_ES_PATH";
pub const ASSET_PATH_ENV: &str = "LIBREREAD_ASSET_PATH";
pub const DB_PATH_ENV: &str = "LIBREREAD_DB_PATH";
pub const UPLOAD_DIR_ENV: &str = "LIBREREAD_UPLOAD_DIR";
pub const INDEX_PATH_ENV: &str = "LIBREREAD_INDEX_PATH";

const DEFAULT_ES_PATH: &str = "http://localhost:9200";
const DEFAULT_INDEX_NAME: &str = "lr_index";
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
}

/// Process-wide settings, built once at startup and handed to each component.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root that relative paths below are resolved against.
    pub asset_path: PathBuf,
    pub upload_dir: PathBuf,
    /// URL prefix under which `upload_dir` is served.
    pub upload_prefix: String,
    pub cover_dir: PathBuf,
    pub cover_prefix: String,
    pub database_path: PathBuf,
    pub index: IndexConfig,
    pub tools: ToolConfig,
    pub background_workers: usize,
    pub page_size: usize,
    pub recently_read_limit: usize,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum IndexConfig {
    Embedded {
        path: PathBuf,
    },
    Remote {
        url: String,
        #[serde(default = "default_index_name")]
        index: String,
        #[serde(default = "default_timeout_secs")]
        timeout_secs: u64,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolConfig {
    pub pdfinfo: String,
    pub pdfimages: String,
    pub pdfseparate: String,
}

fn default_index_name() -> String {
    DEFAULT_INDEX_NAME.to_string()
}

fn default_timeout_secs() -> u64 {
    DEFAULT_HTTP_TIMEOUT_SECS
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            pdfinfo: "pdfinfo".to_string(),
            pdfimages: "pdfimages".to_string(),
            pdfseparate: "pdfseparate".to_string(),
        }
    }
}

impl Default for IndexConfig {
    fn default() -> Self {
        IndexConfig::Embedded {
            path: PathBuf::from("lr_index.tantivy"),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            asset_path: PathBuf::from("."),
            upload_dir: PathBuf::from("uploads"),
            upload_prefix: "/uploads".to_string(),
            cover_dir: PathBuf::from("uploads/img"),
            cover_prefix: "/cover".to_string(),
            database_path: PathBuf::from("libreread.db"),
            index: IndexConfig::default(),
            tools: ToolConfig::default(),
            background_workers: 2,
            page_size: 18,
            recently_read_limit: 12,
        }
    }
}

impl Config {
    /// Defaults, then the optional TOML file, then `LIBREREAD_*` variables.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(toml::from_str(&raw)?)
    }

    /// A config rooted at `root`, used for scratch installations and tests.
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            asset_path: root.to_path_buf(),
            ..Self::default()
        }
    }

    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ASSET_PATH_ENV) {
            self.asset_path = PathBuf::from(value);
        }
        if let Some(value) = lookup(DB_PATH_ENV) {
            self.database_path = PathBuf::from(value);
        }
        if let Some(value) = lookup(UPLOAD_DIR_ENV) {
            self.upload_dir = PathBuf::from(value);
        }

        match lookup(ENABLE_ES_ENV).as_deref() {
            Some("1") => {
                let url = lookup(ES_PATH_ENV).unwrap_or_else(|| DEFAULT_ES_PATH.to_string());
                self.index = IndexConfig::Remote {
                    url,
                    index: default_index_name(),
                    timeout_secs: default_timeout_secs(),
                };
            }
            Some("0") => {
                if !matches!(self.index, IndexConfig::Embedded { .. }) {
                    self.index = IndexConfig::default();
                }
            }
            Some(other) => {
                return Err(ConfigError::InvalidValue {
                    key: ENABLE_ES_ENV,
                    value: other.to_string(),
                })
            }
            None => {}
        }

        if let Some(value) = lookup(INDEX_PATH_ENV) {
            if let IndexConfig::Embedded { path } = &mut self.index {
                *path = PathBuf::from(value);
            }
        }
        Ok(())
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.asset_path.join(path)
        }
    }

    pub fn upload_root(&self) -> PathBuf {
        self.resolve(&self.upload_dir)
    }

    pub fn cover_root(&self) -> PathBuf {
        self.resolve(&self.cover_dir)
    }

    pub fn database_file(&self) -> PathBuf {
        self.resolve(&self.database_path)
    }

    pub fn embedded_index_path(&self) -> Option<PathBuf> {
        match &self.index {
            IndexConfig::Embedded { path } => Some(self.resolve(path)),
            IndexConfig::Remote { .. } => None,
        }
    }

    /// Public URL of a path relative to the upload directory.
    pub fn public_upload_path(&self, relative: &str) -> String {
        join_url(&self.upload_prefix, relative)
    }

    pub fn public_cover_path(&self, file_name: &str) -> String {
        join_url(&self.cover_prefix, file_name)
    }
}

fn join_url(prefix: &str, relative: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    let relative = relative.trim_start_matches('/');
    if relative.is_empty() {
        prefix.to_string()
    } else {
        format!("{}/{}", prefix, relative)
    }
}
