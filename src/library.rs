use crate::cache::BookCache;
use crate::config::Config;
use crate::db::BookStore;
use crate::error::LibraryError;
use crate::models::{Book, BookFormat, BookMetadata, BookSummary, OwnerId, ReaderView};
use crate::navigation::Navigator;
use crate::pagination::{total_pages, LibraryPage};
use crate::search::{BookInfo, SearchIndex, SearchResults};
use log::{info, warn};
use std::sync::Arc;

pub type Result<T> = std::result::Result<T, LibraryError>;

/// Legacy rows stored covers as `./uploads/...`; the public form drops the dot.
pub fn public_cover(cover: &str) -> String {
    match cover.strip_prefix("./") {
        Some(rest) => format!("/{}", rest),
        None => cover.to_string(),
    }
}

/// Reader-facing operations over stored books.
pub struct Library {
    config: Arc<Config>,
    store: Arc<BookStore>,
    cache: BookCache,
    navigator: Navigator,
    index: SearchIndex,
}

impl Library {
    pub fn new(
        config: Arc<Config>,
        store: Arc<BookStore>,
        cache: BookCache,
        index: SearchIndex,
    ) -> Self {
        let navigator = Navigator::from_cache(cache.clone());
        Self {
            config,
            store,
            cache,
            navigator,
            index,
        }
    }

    pub fn navigator(&self) -> &Navigator {
        &self.navigator
    }

    fn book(&self, owner_id: OwnerId, filename: &str) -> Result<Book> {
        self.store
            .find_book(owner_id, filename)?
            .ok_or_else(|| LibraryError::NotFound(filename.to_string()))
    }

    /// Everything the viewer needs to reopen `filename` where the reader
    /// left off. Marks the book as currently being read.
    pub fn open_book(&self, owner_id: OwnerId, filename: &str) -> Result<ReaderView> {
        let book = self.book(owner_id, filename)?;

        let view = match book.format {
            BookFormat::Epub => {
                let saved = self.navigator.saved_position(filename)?;
                ReaderView {
                    format: book.format,
                    file_name: book.filename.clone(),
                    current_page: saved.current_page,
                    total_pages: saved.total_pages,
                    id_ref: saved.id_ref,
                    href_path: saved.href_path,
                    package_path: saved.package_path,
                }
            }
            BookFormat::Pdf => ReaderView {
                format: book.format,
                file_name: book.filename.clone(),
                current_page: 1,
                total_pages: book.pages,
                id_ref: String::new(),
                href_path: self.config.public_upload_path(&book.filename),
                package_path: String::new(),
            },
        };

        self.store
            .touch_currently_reading(book.id, owner_id, chrono::Utc::now().timestamp_millis())?;
        Ok(view)
    }

    /// Rewrites title and author (and the cover when given), then refreshes
    /// the search documents. Index failures are logged only.
    pub fn edit_book(
        &self,
        owner_id: OwnerId,
        filename: &str,
        title: &str,
        author: &str,
        cover: Option<&str>,
    ) -> Result<Book> {
        if self
            .store
            .update_metadata(owner_id, filename, title, author, cover)?
            == 0
        {
            return Err(LibraryError::NotFound(filename.to_string()));
        }
        let book = self.book(owner_id, filename)?;
        info!("updated metadata for {}", filename);

        let detail_pages = self.detail_pages(&book);
        let doc = BookInfo {
            owner_id,
            book_id: book.id,
            title: book.title.clone(),
            author: book.author.clone(),
            url: book.url.clone(),
            cover: book.cover.clone(),
        };
        if let Err(err) = self.index.update_info(&doc, detail_pages) {
            warn!("failed to reindex {}: {}", filename, err);
        }
        Ok(book)
    }

    /// Removes the row, its reading marker, its search documents and its
    /// cached navigation state.
    pub fn delete_book(&self, owner_id: OwnerId, filename: &str) -> Result<Book> {
        let book = self
            .store
            .delete_book(owner_id, filename)?
            .ok_or_else(|| LibraryError::NotFound(filename.to_string()))?;

        let detail_pages = self.detail_pages(&book);
        if let Err(err) = self.index.delete_book(owner_id, book.id, detail_pages) {
            warn!("failed to remove {} from the index: {}", filename, err);
        }
        self.cache.clear(filename)?;
        info!("deleted {} (book {})", filename, book.id);
        Ok(book)
    }

    pub fn library_page(&self, owner_id: OwnerId, page: u64) -> Result<LibraryPage> {
        let page = page.max(1);
        let page_size = self.config.page_size.max(1) as u64;
        let count = self.store.count_books(owner_id)?.max(0) as u64;
        let offset = (page - 1)
            .checked_mul(page_size)
            .and_then(|offset| i64::try_from(offset).ok());
        let books = match offset {
            Some(offset) => self
                .store
                .paginated_books(owner_id, page_size as i64, offset)?,
            None => Vec::new(),
        };
        Ok(LibraryPage::new(page, total_pages(count, page_size), books))
    }

    pub fn recently_read(&self, owner_id: OwnerId) -> Result<Vec<BookSummary>> {
        Ok(self
            .store
            .currently_reading(owner_id, self.config.recently_read_limit as i64)?)
    }

    pub fn book_metadata(&self, filename: &str) -> Result<BookMetadata> {
        let book = self
            .store
            .find_by_filename(filename)?
            .ok_or_else(|| LibraryError::NotFound(filename.to_string()))?;
        Ok(BookMetadata {
            title: book.title,
            author: book.author,
            cover: public_cover(&book.cover),
        })
    }

    pub fn search(&self, owner_id: OwnerId, term: &str) -> Result<SearchResults> {
        Ok(self.index.query_for_owner(owner_id, term)?)
    }

    /// Highest detail id that may exist for `book`.
    fn detail_pages(&self, book: &Book) -> i64 {
        match self.cache.total_pages(&book.filename) {
            Ok(Some(total)) => total,
            Ok(None) => book.pages,
            Err(err) => {
                warn!("total pages for {} unreadable: {}", book.filename, err);
                book.pages
            }
        }
    }
}
