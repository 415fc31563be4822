use crate::db;
use crate::error::StoreError;
use crate::parser::epub::EpubPackage;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

pub type Result<T> = std::result::Result<T, StoreError>;

/// String key/value store without expiry.
pub trait KeyValueCache: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueCache for MemoryCache {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        entries.remove(key);
        Ok(())
    }
}

/// Cache persisted in the `kv_cache` table so reading positions survive restarts.
pub struct SqliteCache {
    conn: Mutex<Connection>,
}

impl SqliteCache {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            conn: Mutex::new(db::open_db(path)?),
        })
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self {
            conn: Mutex::new(db::open_in_memory()?),
        })
    }
}

impl KeyValueCache for SqliteCache {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let value = conn
            .query_row(
                "SELECT value FROM kv_cache WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        conn.execute(
            "INSERT INTO kv_cache (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        conn.execute("DELETE FROM kv_cache WHERE key = ?1", params![key])?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheField {
    Package,
    CurrentPage,
    CurrentFragment,
    PackagePath,
    TotalPages,
}

impl CacheField {
    pub const ALL: [CacheField; 5] = [
        CacheField::Package,
        CacheField::CurrentPage,
        CacheField::CurrentFragment,
        CacheField::PackagePath,
        CacheField::TotalPages,
    ];
}

/// A book's filename plus the value being addressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheKey<'a> {
    pub book: &'a str,
    pub field: CacheField,
}

impl<'a> CacheKey<'a> {
    pub fn new(book: &'a str, field: CacheField) -> Self {
        Self { book, field }
    }

    /// Storage layout shared with existing installations.
    pub fn storage_key(&self) -> String {
        match self.field {
            CacheField::Package => self.book.to_string(),
            CacheField::CurrentPage => format!("{}...current_page...", self.book),
            CacheField::CurrentFragment => format!("{}...current_fragment...", self.book),
            CacheField::PackagePath => format!("{}...filepath...", self.book),
            CacheField::TotalPages => format!("{}...total_pages...", self.book),
        }
    }
}

/// Typed access to the per-book package graph and reading position.
#[derive(Clone)]
pub struct BookCache {
    cache: Arc<dyn KeyValueCache>,
}

impl BookCache {
    pub fn new(cache: Arc<dyn KeyValueCache>) -> Self {
        Self { cache }
    }

    fn get(&self, book: &str, field: CacheField) -> Result<Option<String>> {
        self.cache.get(&CacheKey::new(book, field).storage_key())
    }

    fn set(&self, book: &str, field: CacheField, value: &str) -> Result<()> {
        self.cache.set(&CacheKey::new(book, field).storage_key(), value)
    }

    fn get_i64(&self, book: &str, field: CacheField) -> Result<Option<i64>> {
        let key = CacheKey::new(book, field).storage_key();
        match self.cache.get(&key)? {
            Some(raw) => raw
                .trim()
                .parse::<i64>()
                .map(Some)
                .map_err(|err| StoreError::CorruptValue {
                    key,
                    reason: err.to_string(),
                }),
            None => Ok(None),
        }
    }

    pub fn package(&self, book: &str) -> Result<Option<EpubPackage>> {
        match self.get(book, CacheField::Package)? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|err| StoreError::CorruptValue {
                    key: CacheKey::new(book, CacheField::Package).storage_key(),
                    reason: err.to_string(),
                }),
            None => Ok(None),
        }
    }

    /// Stores a freshly parsed package and resets the reading position to page 1.
    pub fn store_package(&self, book: &str, package: &EpubPackage) -> Result<()> {
        let raw = serde_json::to_string(package).map_err(|err| StoreError::CorruptValue {
            key: book.to_string(),
            reason: err.to_string(),
        })?;
        self.set(book, CacheField::Package, &raw)?;
        self.set_total_pages(book, package.spine.len() as i64)?;
        self.set_position(book, 1, 0)?;
        self.set(book, CacheField::PackagePath, &package.base_path)?;
        Ok(())
    }

    pub fn package_path(&self, book: &str) -> Result<Option<String>> {
        self.get(book, CacheField::PackagePath)
    }

    pub fn total_pages(&self, book: &str) -> Result<Option<i64>> {
        self.get_i64(book, CacheField::TotalPages)
    }

    pub fn set_total_pages(&self, book: &str, total: i64) -> Result<()> {
        self.set(book, CacheField::TotalPages, &total.to_string())
    }

    pub fn current_page(&self, book: &str) -> Result<Option<i64>> {
        self.get_i64(book, CacheField::CurrentPage)
    }

    pub fn current_fragment(&self, book: &str) -> Result<Option<i64>> {
        self.get_i64(book, CacheField::CurrentFragment)
    }

    pub fn set_position(&self, book: &str, page: i64, fragment_index: i64) -> Result<()> {
        self.set(book, CacheField::CurrentPage, &page.to_string())?;
        self.set(book, CacheField::CurrentFragment, &fragment_index.to_string())
    }

    pub fn clear(&self, book: &str) -> Result<()> {
        for field in CacheField::ALL {
            self.cache.remove(&CacheKey::new(book, field).storage_key())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::epub::ManifestItem;

    fn package() -> EpubPackage {
        EpubPackage {
            title: "T".to_string(),
            author: "A".to_string(),
            manifest: vec![
                ManifestItem::new("c1", "ch1.xhtml", "application/xhtml+xml"),
                ManifestItem::new("c2", "ch2.xhtml", "application/xhtml+xml"),
            ],
            spine: vec!["c1".to_string(), "c2".to_string()],
            base_path: "/uploads/book/OEBPS".to_string(),
            package_dir: "uploads/book/OEBPS".into(),
            cover: String::new(),
        }
    }

    #[test]
    fn storage_keys_keep_legacy_suffixes() {
        assert_eq!(CacheKey::new("b.epub", CacheField::Package).storage_key(), "b.epub");
        assert_eq!(
            CacheKey::new("b.epub", CacheField::CurrentPage).storage_key(),
            "b.epub...current_page..."
        );
        assert_eq!(
            CacheKey::new("b.epub", CacheField::PackagePath).storage_key(),
            "b.epub...filepath..."
        );
    }

    #[test]
    fn store_package_resets_position() {
        let cache = BookCache::new(Arc::new(MemoryCache::new()));
        cache.set_position("b.epub", 2, 1).unwrap();
        cache.store_package("b.epub", &package()).unwrap();

        assert_eq!(cache.total_pages("b.epub").unwrap(), Some(2));
        assert_eq!(cache.current_page("b.epub").unwrap(), Some(1));
        assert_eq!(cache.current_fragment("b.epub").unwrap(), Some(0));
        assert_eq!(cache.package("b.epub").unwrap(), Some(package()));
    }

    #[test]
    fn sqlite_cache_overwrites_and_removes() {
        let cache = SqliteCache::in_memory().unwrap();
        cache.set("k", "1").unwrap();
        cache.set("k", "2").unwrap();
        assert_eq!(cache.get("k").unwrap().as_deref(), Some("2"));
        cache.remove("k").unwrap();
        assert_eq!(cache.get("k").unwrap(), None);
    }

    #[test]
    fn corrupt_counter_is_reported() {
        let raw = Arc::new(MemoryCache::new());
        raw.set("b.epub...total_pages...", "many").unwrap();
        let cache = BookCache::new(raw);
        assert!(matches!(
            cache.total_pages("b.epub"),
            Err(StoreError::CorruptValue { .. })
        ));
    }

    #[test]
    fn clear_drops_every_field() {
        let raw = Arc::new(MemoryCache::new());
        let cache = BookCache::new(raw.clone());
        cache.store_package("b.epub", &package()).unwrap();
        cache.clear("b.epub").unwrap();
        assert_eq!(raw.get("b.epub").unwrap(), None);
        assert_eq!(cache.total_pages("b.epub").unwrap(), None);
    }
}
