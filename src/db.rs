use crate::error::StoreError;
use crate::models::{Book, BookFormat, BookId, BookSummary, NewBook, OwnerId};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

pub type Result<T> = std::result::Result<T, StoreError>;

const MIGRATIONS: &[(&str, &str)] = &[
    ("0000_book", include_str!("../migrations/0000_book.sql")),
    (
        "0001_currently_reading",
        include_str!("../migrations/0001_currently_reading.sql"),
    ),
    (
        "0002_book_file_hash",
        include_str!("../migrations/0002_book_file_hash.sql"),
    ),
    ("0003_kv_cache", include_str!("../migrations/0003_kv_cache.sql")),
];

const BOOK_COLUMNS: &str = "id, user_id, title, author, filename, file_path, url, cover, pages, format, file_hash, uploaded_on";

pub fn open_db(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
        }
    }
    let conn = Connection::open(path)?;
    migrate(&conn)?;
    Ok(conn)
}

pub fn open_in_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory()?;
    migrate(&conn)?;
    Ok(conn)
}

fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            id TEXT PRIMARY KEY NOT NULL,
            applied_at INTEGER NOT NULL
        );",
    )?;
    for (id, sql) in MIGRATIONS {
        apply_migration(conn, id, sql)?;
    }
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    Ok(())
}

fn apply_migration(conn: &Connection, id: &str, sql: &str) -> Result<()> {
    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM schema_migrations WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()?;
    if existing.is_some() {
        return Ok(());
    }
    conn.execute_batch(sql)?;
    conn.execute(
        "INSERT INTO schema_migrations (id, applied_at) VALUES (?1, ?2)",
        params![id, chrono::Utc::now().timestamp_millis()],
    )?;
    log::info!("applied migration {}", id);
    Ok(())
}

fn book_from_row(row: &Row<'_>) -> rusqlite::Result<Book> {
    let format: String = row.get(9)?;
    let format = format
        .parse::<BookFormat>()
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(9, Type::Text, err.into()))?;
    Ok(Book {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        title: row.get(2)?,
        author: row.get(3)?,
        filename: row.get(4)?,
        file_path: row.get(5)?,
        url: row.get(6)?,
        cover: row.get(7)?,
        pages: row.get(8)?,
        format,
        file_hash: row.get(10)?,
        uploaded_on: row.get(11)?,
    })
}

/// The `book` and `currently_reading` tables.
pub struct BookStore {
    conn: Mutex<Connection>,
}

impl BookStore {
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::new(open_db(path)?))
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self::new(open_in_memory()?))
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    pub fn insert_book(&self, book: &NewBook) -> Result<BookId> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO book (user_id, title, author, filename, file_path, url, cover, pages, format, file_hash, uploaded_on)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                book.owner_id,
                book.title,
                book.author,
                book.filename,
                book.file_path,
                book.url,
                book.cover,
                book.pages,
                book.format.as_str(),
                book.file_hash,
                book.uploaded_on,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn find_book(&self, owner_id: OwnerId, filename: &str) -> Result<Option<Book>> {
        let conn = self.conn()?;
        let book = conn
            .query_row(
                &format!("SELECT {} FROM book WHERE user_id = ?1 AND filename = ?2", BOOK_COLUMNS),
                params![owner_id, filename],
                book_from_row,
            )
            .optional()?;
        Ok(book)
    }

    /// Lookup by filename alone, for public metadata and cover routes.
    pub fn find_by_filename(&self, filename: &str) -> Result<Option<Book>> {
        let conn = self.conn()?;
        let book = conn
            .query_row(
                &format!(
                    "SELECT {} FROM book WHERE filename = ?1 ORDER BY id LIMIT 1",
                    BOOK_COLUMNS
                ),
                params![filename],
                book_from_row,
            )
            .optional()?;
        Ok(book)
    }

    pub fn get_book(&self, book_id: BookId) -> Result<Option<Book>> {
        let conn = self.conn()?;
        let book = conn
            .query_row(
                &format!("SELECT {} FROM book WHERE id = ?1", BOOK_COLUMNS),
                params![book_id],
                book_from_row,
            )
            .optional()?;
        Ok(book)
    }

    /// Returns the number of rows touched; `cover` is left alone when `None`.
    pub fn update_metadata(
        &self,
        owner_id: OwnerId,
        filename: &str,
        title: &str,
        author: &str,
        cover: Option<&str>,
    ) -> Result<usize> {
        let conn = self.conn()?;
        let mut changed = conn.execute(
            "UPDATE book SET title = ?1, author = ?2 WHERE user_id = ?3 AND filename = ?4",
            params![title, author, owner_id, filename],
        )?;
        if let Some(cover) = cover {
            changed = changed.max(conn.execute(
                "UPDATE book SET cover = ?1 WHERE user_id = ?2 AND filename = ?3",
                params![cover, owner_id, filename],
            )?);
        }
        Ok(changed)
    }

    /// Deletes the book and its currently-reading marker, returning the removed row.
    pub fn delete_book(&self, owner_id: OwnerId, filename: &str) -> Result<Option<Book>> {
        let book = match self.find_book(owner_id, filename)? {
            Some(book) => book,
            None => return Ok(None),
        };
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM currently_reading WHERE book_id = ?1",
            params![book.id],
        )?;
        conn.execute("DELETE FROM book WHERE id = ?1", params![book.id])?;
        Ok(Some(book))
    }

    pub fn count_books(&self, owner_id: OwnerId) -> Result<i64> {
        let conn = self.conn()?;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM book WHERE user_id = ?1",
            params![owner_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Newest first, matching the library grid ordering.
    pub fn paginated_books(
        &self,
        owner_id: OwnerId,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<BookSummary>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, title, url, cover FROM book WHERE user_id = ?1 ORDER BY id DESC LIMIT ?2 OFFSET ?3",
        )?;
        let rows = stmt.query_map(params![owner_id, limit, offset], |row| {
            Ok(BookSummary {
                id: row.get(0)?,
                title: row.get(1)?,
                url: row.get(2)?,
                cover: row.get(3)?,
            })
        })?;

        let mut books = Vec::new();
        for row in rows {
            books.push(row?);
        }
        Ok(books)
    }

    /// Records a read of `book_id`, updating the existing marker in place.
    pub fn touch_currently_reading(
        &self,
        book_id: BookId,
        owner_id: OwnerId,
        date_read: i64,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO currently_reading (book_id, user_id, date_read) VALUES (?1, ?2, ?3)
             ON CONFLICT(book_id) DO UPDATE SET date_read = excluded.date_read",
            params![book_id, owner_id, date_read],
        )?;
        Ok(())
    }

    pub fn currently_reading(&self, owner_id: OwnerId, limit: i64) -> Result<Vec<BookSummary>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT book.id, book.title, book.url, book.cover
             FROM currently_reading
             JOIN book ON book.id = currently_reading.book_id
             WHERE currently_reading.user_id = ?1
             ORDER BY currently_reading.date_read DESC, currently_reading.id DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![owner_id, limit], |row| {
            Ok(BookSummary {
                id: row.get(0)?,
                title: row.get(1)?,
                url: row.get(2)?,
                cover: row.get(3)?,
            })
        })?;

        let mut books = Vec::new();
        for row in rows {
            books.push(row?);
        }
        Ok(books)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_book(owner_id: OwnerId, filename: &str) -> NewBook {
        NewBook {
            owner_id,
            title: filename.to_string(),
            author: "unknown".to_string(),
            filename: filename.to_string(),
            file_path: format!("uploads/{}", filename),
            url: format!("/book/{}", filename),
            cover: String::new(),
            pages: 3,
            format: BookFormat::Pdf,
            file_hash: None,
            uploaded_on: 1,
        }
    }

    #[test]
    fn migrations_are_recorded_once() {
        let conn = open_in_memory().unwrap();
        migrate(&conn).unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_migrations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, MIGRATIONS.len() as i64);
    }

    #[test]
    fn owner_and_filename_are_unique() {
        let store = BookStore::in_memory().unwrap();
        store.insert_book(&new_book(1, "a.pdf")).unwrap();
        assert!(store.insert_book(&new_book(1, "a.pdf")).is_err());
        store.insert_book(&new_book(2, "a.pdf")).unwrap();
        assert_eq!(store.count_books(1).unwrap(), 1);
    }

    #[test]
    fn rejects_zero_pages() {
        let store = BookStore::in_memory().unwrap();
        let mut book = new_book(1, "empty.pdf");
        book.pages = 0;
        assert!(store.insert_book(&book).is_err());
    }

    #[test]
    fn currently_reading_keeps_one_row_per_book() {
        let store = BookStore::in_memory().unwrap();
        let first = store.insert_book(&new_book(1, "a.pdf")).unwrap();
        let second = store.insert_book(&new_book(1, "b.pdf")).unwrap();

        store.touch_currently_reading(first, 1, 10).unwrap();
        store.touch_currently_reading(second, 1, 20).unwrap();
        store.touch_currently_reading(first, 1, 30).unwrap();

        let recent = store.currently_reading(1, 12).unwrap();
        let ids: Vec<BookId> = recent.iter().map(|book| book.id).collect();
        assert_eq!(ids, vec![first, second]);
    }

    #[test]
    fn delete_removes_reading_marker() {
        let store = BookStore::in_memory().unwrap();
        let id = store.insert_book(&new_book(1, "a.pdf")).unwrap();
        store.touch_currently_reading(id, 1, 10).unwrap();

        let removed = store.delete_book(1, "a.pdf").unwrap();
        assert_eq!(removed.map(|book| book.id), Some(id));
        assert!(store.currently_reading(1, 12).unwrap().is_empty());
        assert!(store.delete_book(1, "a.pdf").unwrap().is_none());
    }

    #[test]
    fn paginates_newest_first() {
        let store = BookStore::in_memory().unwrap();
        for i in 0..5 {
            store.insert_book(&new_book(1, &format!("{}.pdf", i))).unwrap();
        }
        let page = store.paginated_books(1, 2, 1).unwrap();
        let titles: Vec<&str> = page.iter().map(|book| book.title.as_str()).collect();
        assert_eq!(titles, vec!["3.pdf", "2.pdf"]);
    }

    #[test]
    fn update_metadata_keeps_cover_when_absent() {
        let store = BookStore::in_memory().unwrap();
        let mut book = new_book(1, "a.pdf");
        book.cover = "/cover/a.png".to_string();
        store.insert_book(&book).unwrap();

        store.update_metadata(1, "a.pdf", "New", "Someone", None).unwrap();
        let updated = store.find_book(1, "a.pdf").unwrap().unwrap();
        assert_eq!(updated.title, "New");
        assert_eq!(updated.cover, "/cover/a.png");
    }
}
