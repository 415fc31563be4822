//! Embedded index on local disk.
//!
//! The index is opened, used and closed around every call; no handle is
//! held between requests. Only whole-book documents are stored, so
//! content search is unavailable with this backend.

use super::{BookDetail, BookInfo, IndexBackend, Result, SearchResults, MAX_HITS};
use crate::models::{BookId, OwnerId};
use log::debug;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tantivy::collector::TopDocs;
use tantivy::query::{BooleanQuery, Occur, Query, TermQuery};
use tantivy::schema::{Field, IndexRecordOption, Schema, Value, STORED, STRING, TEXT};
use tantivy::tokenizer::TokenStream;
use tantivy::{Index, IndexWriter, ReloadPolicy, TantivyDocument, Term};

const SEPARATOR: &str = "*****";
const WRITER_HEAP_BYTES: usize = 20_000_000;

struct Fields {
    key: Field,
    id: Field,
    owner: Field,
    title: Field,
    author: Field,
}

fn schema() -> Schema {
    let mut builder = Schema::builder();
    builder.add_text_field("key", STRING | STORED);
    builder.add_text_field("id", STRING | STORED);
    builder.add_text_field("owner_id", STRING);
    builder.add_text_field("title", TEXT | STORED);
    builder.add_text_field("author", TEXT | STORED);
    builder.build()
}

fn fields(schema: &Schema) -> Result<Fields> {
    Ok(Fields {
        key: schema.get_field("key")?,
        id: schema.get_field("id")?,
        owner: schema.get_field("owner_id")?,
        title: schema.get_field("title")?,
        author: schema.get_field("author")?,
    })
}

/// `owner*****book*****title*****author*****cover*****url*****`
pub fn composite_id(doc: &BookInfo) -> String {
    format!(
        "{o}{s}{b}{s}{t}{s}{a}{s}{c}{s}{u}{s}",
        o = doc.owner_id,
        b = doc.book_id,
        t = doc.title,
        a = doc.author,
        c = doc.cover,
        u = doc.url,
        s = SEPARATOR
    )
}

pub fn parse_composite_id(id: &str) -> Option<BookInfo> {
    let parts: Vec<&str> = id.split(SEPARATOR).collect();
    if parts.len() < 6 {
        return None;
    }
    Some(BookInfo {
        owner_id: parts[0].parse().ok()?,
        book_id: parts[1].parse().ok()?,
        title: parts[2].to_string(),
        author: parts[3].to_string(),
        cover: parts[4].to_string(),
        url: parts[5].to_string(),
    })
}

pub struct EmbeddedIndex {
    path: PathBuf,
    lock: Mutex<()>,
}

impl EmbeddedIndex {
    /// Prepares the index directory, creating an empty index if needed.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let index = Self {
            path: path.into(),
            lock: Mutex::new(()),
        };
        index.open_index()?;
        Ok(index)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open_index(&self) -> Result<Index> {
        std::fs::create_dir_all(&self.path)?;
        if self.path.join("meta.json").exists() {
            Ok(Index::open_in_dir(&self.path)?)
        } else {
            Ok(Index::create_in_dir(&self.path, schema())?)
        }
    }

    fn write<F>(&self, apply: F) -> Result<()>
    where
        F: FnOnce(&mut IndexWriter, &Fields) -> Result<()>,
    {
        let _guard = self.lock.lock().map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::Other, "embedded index lock poisoned")
        })?;
        let index = self.open_index()?;
        let fields = fields(&index.schema())?;
        let mut writer: IndexWriter = index.writer_with_num_threads(1, WRITER_HEAP_BYTES)?;
        apply(&mut writer, &fields)?;
        writer.commit()?;
        writer.wait_merging_threads()?;
        Ok(())
    }

    fn put(&self, doc: &BookInfo) -> Result<()> {
        let key = doc.key();
        self.write(|writer, fields| {
            writer.delete_term(Term::from_field_text(fields.key, &key));
            let mut document = TantivyDocument::default();
            document.add_text(fields.key, &key);
            document.add_text(fields.id, composite_id(doc));
            document.add_text(fields.owner, doc.owner_id.to_string());
            document.add_text(fields.title, &doc.title);
            document.add_text(fields.author, &doc.author);
            writer.add_document(document)?;
            Ok(())
        })?;
        debug!("embedded index stored {}", key);
        Ok(())
    }
}

impl IndexBackend for EmbeddedIndex {
    fn name(&self) -> &'static str {
        "embedded"
    }

    fn supports_detail(&self) -> bool {
        false
    }

    fn index_info(&self, doc: &BookInfo) -> Result<()> {
        self.put(doc)
    }

    fn index_detail(&self, doc: &BookDetail) -> Result<()> {
        debug!("embedded index skips detail {}", doc.key());
        Ok(())
    }

    fn update_info(&self, doc: &BookInfo, _detail_pages: i64) -> Result<()> {
        self.put(doc)
    }

    fn delete_info(&self, owner_id: OwnerId, book_id: BookId) -> Result<()> {
        let key = super::info_key(owner_id, book_id);
        self.write(|writer, fields| {
            writer.delete_term(Term::from_field_text(fields.key, &key));
            Ok(())
        })
    }

    fn delete_detail(&self, _owner_id: OwnerId, _book_id: BookId, _page: i64) -> Result<()> {
        Ok(())
    }

    fn query(&self, term: &str, owner_id: Option<OwnerId>) -> Result<SearchResults> {
        let _guard = self.lock.lock().map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::Other, "embedded index lock poisoned")
        })?;
        let index = self.open_index()?;
        let fields = fields(&index.schema())?;

        let Some(query) = match_query(&index, &fields, term, owner_id)? else {
            return Ok(SearchResults::default());
        };
        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()?;
        let searcher = reader.searcher();
        let top_docs = searcher.search(query.as_ref(), &TopDocs::with_limit(MAX_HITS))?;

        let mut book_info = Vec::new();
        for (_score, address) in top_docs {
            let document: TantivyDocument = searcher.doc(address)?;
            let id = document
                .get_first(fields.id)
                .and_then(|value| value.as_str())
                .unwrap_or_default();
            if let Some(info) = parse_composite_id(id) {
                book_info.push(info);
            }
        }

        Ok(SearchResults {
            book_info,
            book_detail: Vec::new(),
        })
    }
}

/// Plain-text match: any analyzed word of `term` in title or author, and
/// the owner when given. `None` when `term` has no searchable words.
fn match_query(
    index: &Index,
    fields: &Fields,
    term: &str,
    owner_id: Option<OwnerId>,
) -> Result<Option<Box<dyn Query>>> {
    let mut analyzer = index.tokenizer_for_field(fields.title)?;
    let mut stream = analyzer.token_stream(term);
    let mut words: Vec<(Occur, Box<dyn Query>)> = Vec::new();
    while let Some(token) = stream.next() {
        for field in [fields.title, fields.author] {
            words.push((
                Occur::Should,
                Box::new(TermQuery::new(
                    Term::from_field_text(field, &token.text),
                    IndexRecordOption::WithFreqs,
                )),
            ));
        }
    }
    if words.is_empty() {
        return Ok(None);
    }

    let words: Box<dyn Query> = Box::new(BooleanQuery::new(words));
    let Some(owner_id) = owner_id else {
        return Ok(Some(words));
    };
    let owner: Box<dyn Query> = Box::new(TermQuery::new(
        Term::from_field_text(fields.owner, &owner_id.to_string()),
        IndexRecordOption::Basic,
    ));
    Ok(Some(Box::new(BooleanQuery::new(vec![
        (Occur::Must, words),
        (Occur::Must, owner),
    ]))))
}
