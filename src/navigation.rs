use crate::cache::{BookCache, KeyValueCache};
use crate::error::NavigationError;
use crate::models::{CurrentPage, Direction, HrefData};
use crate::parser::epub::EpubPackage;
use log::{debug, warn};
use std::sync::Arc;

pub type Result<T> = std::result::Result<T, NavigationError>;

/// Where a reader left off, as needed to reopen the viewer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedPosition {
    pub current_page: i64,
    pub total_pages: i64,
    pub id_ref: String,
    pub href_path: String,
    pub package_path: String,
}

/// Reading position state per EPUB, stored in the key-value cache.
///
/// Public operations never fail: lookups that miss are logged and come
/// back as zero-valued data, which viewers treat as "not navigable".
#[derive(Clone)]
pub struct Navigator {
    cache: BookCache,
}

fn boundaries(page: i64, len: usize) -> (bool, bool) {
    (page <= 1, page >= len as i64)
}

/// Strips the `#anchor` and the package base prefix from a viewer href.
pub fn relative_fragment<'a>(href: &'a str, base_path: &str) -> &'a str {
    let href = href.split('#').next().unwrap_or_default();
    let prefix = format!("{}/", base_path.trim_end_matches('/'));
    href.strip_prefix(prefix.as_str()).unwrap_or(href)
}

impl Navigator {
    pub fn new(cache: Arc<dyn KeyValueCache>) -> Self {
        Self {
            cache: BookCache::new(cache),
        }
    }

    pub fn from_cache(cache: BookCache) -> Self {
        Self { cache }
    }

    fn package(&self, book: &str) -> Result<EpubPackage> {
        self.cache
            .package(book)?
            .ok_or_else(|| NavigationError::PackageNotCached(book.to_string()))
    }

    fn base_path(&self, book: &str, package: &EpubPackage) -> Result<String> {
        Ok(self
            .cache
            .package_path(book)?
            .unwrap_or_else(|| package.base_path.clone()))
    }

    fn spine_index(&self, package: &EpubPackage, base: &str, href: &str) -> Result<usize> {
        let fragment = relative_fragment(href, base);
        let item = package
            .manifest
            .iter()
            .find(|item| item.href == fragment)
            .ok_or_else(|| NavigationError::UnknownFragment(fragment.to_string()))?;
        package
            .spine
            .iter()
            .position(|id| *id == item.id)
            .ok_or_else(|| NavigationError::NotInSpine(item.id.clone()))
    }

    fn href_at(&self, package: &EpubPackage, base: &str, index: usize) -> String {
        match package.spine.get(index).and_then(|id| package.item(id)) {
            Some(item) => format!("{}/{}", base, item.href),
            None => String::new(),
        }
    }

    /// Jumps to the 1-based spine position `position` and stores it.
    pub fn resolve_by_id(&self, book: &str, position: i64) -> HrefData {
        match self.try_resolve_by_id(book, position) {
            Ok(data) => data,
            Err(NavigationError::OutOfRange { position, len }) => {
                warn!("{}: position {} outside 1..={}", book, position, len);
                let clamped = position.clamp(1, len.max(1) as i64);
                let (left_none, right_none) = boundaries(clamped, len);
                HrefData {
                    current_page: 0,
                    href_path: String::new(),
                    left_none,
                    right_none,
                }
            }
            Err(err) => {
                warn!("{}: cannot resolve position {}: {}", book, position, err);
                HrefData::default()
            }
        }
    }

    pub fn try_resolve_by_id(&self, book: &str, position: i64) -> Result<HrefData> {
        let package = self.package(book)?;
        let len = package.spine.len();
        if position < 1 || position > len as i64 {
            return Err(NavigationError::OutOfRange { position, len });
        }
        let base = self.base_path(book, &package)?;
        let index = (position - 1) as usize;
        let href_path = self.href_at(&package, &base, index);
        if href_path.is_empty() {
            return Err(NavigationError::UnknownFragment(package.spine[index].clone()));
        }

        self.cache.set_position(book, position, index as i64)?;
        let (left_none, right_none) = boundaries(position, len);
        debug!("{}: jumped to page {}", book, position);
        Ok(HrefData {
            current_page: position,
            href_path,
            left_none,
            right_none,
        })
    }

    /// Moves one spine entry forward or back from the fragment at `href`.
    /// At either end the current position is returned unchanged with the
    /// matching boundary flag set.
    pub fn step(&self, book: &str, href: &str, direction: Direction) -> HrefData {
        self.try_step(book, href, direction).unwrap_or_else(|err| {
            warn!("{}: cannot step {:?} from {}: {}", book, direction, href, err);
            HrefData::default()
        })
    }

    pub fn try_step(&self, book: &str, href: &str, direction: Direction) -> Result<HrefData> {
        let package = self.package(book)?;
        let base = self.base_path(book, &package)?;
        let len = package.spine.len();
        let current = self.spine_index(&package, &base, href)?;

        let target = match direction {
            Direction::Next if current + 1 < len => Some(current + 1),
            Direction::Previous if current > 0 => Some(current - 1),
            _ => None,
        };

        let Some(target) = target else {
            let page = current as i64 + 1;
            let (left_none, right_none) = boundaries(page, len);
            return Ok(HrefData {
                current_page: page,
                href_path: self.href_at(&package, &base, current),
                left_none,
                right_none,
            });
        };

        let page = target as i64 + 1;
        let href_path = self.href_at(&package, &base, target);
        if href_path.is_empty() {
            return Err(NavigationError::UnknownFragment(package.spine[target].clone()));
        }
        self.cache.set_position(book, page, target as i64)?;
        let (left_none, right_none) = boundaries(page, len);
        debug!("{}: stepped {:?} to page {}", book, direction, page);
        Ok(HrefData {
            current_page: page,
            href_path,
            left_none,
            right_none,
        })
    }

    /// Page number for `href` without touching the stored position.
    pub fn current_page(&self, book: &str, href: &str) -> CurrentPage {
        self.try_current_page(book, href).unwrap_or_else(|err| {
            warn!("{}: cannot locate {}: {}", book, href, err);
            CurrentPage::default()
        })
    }

    pub fn try_current_page(&self, book: &str, href: &str) -> Result<CurrentPage> {
        let package = self.package(book)?;
        let base = self.base_path(book, &package)?;
        let index = self.spine_index(&package, &base, href)?;
        let page = index as i64 + 1;
        let (left_none, right_none) = boundaries(page, package.spine.len());
        Ok(CurrentPage {
            current_page: page,
            left_none,
            right_none,
        })
    }

    /// The stored position, used when a book is reopened.
    pub fn saved_position(&self, book: &str) -> Result<SavedPosition> {
        let package = self.package(book)?;
        let base = self.base_path(book, &package)?;
        let len = package.spine.len();
        let fragment = self.cache.current_fragment(book)?.unwrap_or(0);
        if fragment < 0 || fragment >= len as i64 {
            return Err(NavigationError::OutOfRange {
                position: fragment + 1,
                len,
            });
        }
        let index = fragment as usize;
        Ok(SavedPosition {
            current_page: self.cache.current_page(book)?.unwrap_or(fragment + 1),
            total_pages: self.cache.total_pages(book)?.unwrap_or(len as i64),
            id_ref: package.spine[index].clone(),
            href_path: self.href_at(&package, &base, index),
            package_path: base,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::parser::epub::ManifestItem;
    use std::path::PathBuf;

    const BOOK: &str = "book.epub";

    fn navigator(spine_len: usize) -> (Navigator, BookCache) {
        let manifest = (1..=spine_len)
            .map(|n| ManifestItem::new(&format!("c{}", n), &format!("ch{}.xhtml", n), "application/xhtml+xml"))
            .collect();
        let spine = (1..=spine_len).map(|n| format!("c{}", n)).collect();
        let package = EpubPackage {
            title: "Book".to_string(),
            author: "Author".to_string(),
            manifest,
            spine,
            base_path: "/uploads/book/OEBPS".to_string(),
            package_dir: PathBuf::from("uploads/book/OEBPS"),
            cover: String::new(),
        };
        let raw: Arc<dyn KeyValueCache> = Arc::new(MemoryCache::new());
        let cache = BookCache::new(raw.clone());
        cache.store_package(BOOK, &package).unwrap();
        (Navigator::new(raw), cache)
    }

    #[test]
    fn strips_anchor_and_base() {
        assert_eq!(
            relative_fragment("/uploads/book/OEBPS/ch2.xhtml#p4", "/uploads/book/OEBPS"),
            "ch2.xhtml"
        );
        assert_eq!(relative_fragment("ch2.xhtml", "/uploads/book/OEBPS"), "ch2.xhtml");
    }

    #[test]
    fn resolve_by_id_sets_position_and_flags() {
        let (nav, cache) = navigator(4);
        let data = nav.resolve_by_id(BOOK, 2);
        assert_eq!(data.current_page, 2);
        assert_eq!(data.href_path, "/uploads/book/OEBPS/ch2.xhtml");
        assert!(!data.left_none && !data.right_none);
        assert_eq!(cache.current_page(BOOK).unwrap(), Some(2));
        assert_eq!(cache.current_fragment(BOOK).unwrap(), Some(1));

        let last = nav.resolve_by_id(BOOK, 4);
        assert!(last.right_none);
        assert!(!last.left_none);
    }

    #[test]
    fn resolve_by_id_out_of_range_leaves_state() {
        let (nav, cache) = navigator(4);
        let data = nav.resolve_by_id(BOOK, 9);
        assert_eq!(data.current_page, 0);
        assert_eq!(data.href_path, "");
        assert!(data.right_none);
        let low = nav.resolve_by_id(BOOK, 0);
        assert!(low.left_none);
        assert_eq!(cache.current_page(BOOK).unwrap(), Some(1));
    }

    #[test]
    fn step_next_and_previous_persist() {
        let (nav, cache) = navigator(4);
        let next = nav.step(BOOK, "/uploads/book/OEBPS/ch2.xhtml", Direction::Next);
        assert_eq!(next.current_page, 3);
        assert_eq!(next.href_path, "/uploads/book/OEBPS/ch3.xhtml");
        assert_eq!(cache.current_page(BOOK).unwrap(), Some(3));
        assert_eq!(cache.current_fragment(BOOK).unwrap(), Some(2));

        let back = nav.step(BOOK, &next.href_path, Direction::Previous);
        assert_eq!(back.current_page, 2);
        assert_eq!(cache.current_fragment(BOOK).unwrap(), Some(1));
    }

    #[test]
    fn step_past_either_end_stays_put() {
        let (nav, cache) = navigator(3);
        let first = nav.step(BOOK, "/uploads/book/OEBPS/ch1.xhtml", Direction::Previous);
        assert_eq!(first.current_page, 1);
        assert!(first.left_none);
        assert_eq!(first.href_path, "/uploads/book/OEBPS/ch1.xhtml");

        nav.resolve_by_id(BOOK, 2);
        let last = nav.step(BOOK, "/uploads/book/OEBPS/ch3.xhtml", Direction::Next);
        assert_eq!(last.current_page, 3);
        assert!(last.right_none);
        assert_eq!(last.href_path, "/uploads/book/OEBPS/ch3.xhtml");
        assert_eq!(cache.current_page(BOOK).unwrap(), Some(2));
    }

    #[test]
    fn unknown_fragment_degrades_to_zero() {
        let (nav, _) = navigator(3);
        assert_eq!(
            nav.step(BOOK, "/uploads/book/OEBPS/missing.xhtml", Direction::Next),
            HrefData::default()
        );
        assert_eq!(nav.current_page("other.epub", "ch1.xhtml"), CurrentPage::default());
        assert!(matches!(
            nav.try_current_page(BOOK, "missing.xhtml"),
            Err(NavigationError::UnknownFragment(_))
        ));
    }

    #[test]
    fn resolve_then_locate_round_trips() {
        let (nav, _) = navigator(5);
        for page in 1..=5 {
            let data = nav.resolve_by_id(BOOK, page);
            let located = nav.current_page(BOOK, &data.href_path);
            assert_eq!(located.current_page, page);
            assert_eq!(located.left_none, data.left_none);
            assert_eq!(located.right_none, data.right_none);
        }
    }

    #[test]
    fn saved_position_follows_last_step() {
        let (nav, _) = navigator(4);
        nav.resolve_by_id(BOOK, 3);
        let saved = nav.saved_position(BOOK).unwrap();
        assert_eq!(saved.current_page, 3);
        assert_eq!(saved.total_pages, 4);
        assert_eq!(saved.id_ref, "c3");
        assert_eq!(saved.href_path, "/uploads/book/OEBPS/ch3.xhtml");
        assert_eq!(saved.package_path, "/uploads/book/OEBPS");
    }
}
