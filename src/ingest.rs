use crate::cache::BookCache;
use crate::config::Config;
use crate::db::BookStore;
use crate::error::IngestError;
use crate::models::{BookFormat, BookId, NewBook, OwnerId};
use crate::parser::epub::EpubPackage;
use crate::search::{BookDetail, BookInfo, SearchIndex};
use crate::tasks::{TaskPool, TaskResult};
use crate::tools::ToolRunner;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use log::{info, warn};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, IngestError>;

const UNKNOWN_AUTHOR: &str = "unknown";
const SPLIT_PREFIX: &str = "splitpdf_";

/// Canonical stored name for an upload: known extension stripped, whitespace
/// replaced by underscores, extension for `content_type` appended.
pub fn normalize_filename(declared: &str, content_type: &str) -> Result<(String, BookFormat)> {
    let format = BookFormat::from_content_type(content_type)
        .ok_or_else(|| IngestError::UnsupportedFormat(content_type.to_string()))?;

    let base = Path::new(declared)
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    let lower = base.to_lowercase();
    let stem = [".pdf", ".epub"]
        .iter()
        .find(|ext| lower.ends_with(*ext))
        .map(|ext| &base[..base.len() - ext.len()])
        .unwrap_or(&base);
    let stem: String = stem
        .chars()
        .map(|c| if c.is_whitespace() { '_' } else { c })
        .collect();

    Ok((format!("{}{}", stem, format.extension()), format))
}

fn stem_of(filename: &str, format: BookFormat) -> &str {
    filename.strip_suffix(format.extension()).unwrap_or(filename)
}

/// Turns uploads into stored, cached and indexed books.
pub struct Ingestor {
    config: Arc<Config>,
    store: Arc<BookStore>,
    cache: BookCache,
    tools: Arc<dyn ToolRunner>,
    index: SearchIndex,
    tasks: Arc<TaskPool>,
}

impl Ingestor {
    pub fn new(
        config: Arc<Config>,
        store: Arc<BookStore>,
        cache: BookCache,
        tools: Arc<dyn ToolRunner>,
        index: SearchIndex,
        tasks: Arc<TaskPool>,
    ) -> Self {
        Self {
            config,
            store,
            cache,
            tools,
            index,
            tasks,
        }
    }

    /// Stores `upload` for `owner_id` and returns the new book id. Content
    /// indexing continues in the background after this returns.
    pub fn ingest<R: Read>(
        &self,
        owner_id: OwnerId,
        upload: &mut R,
        declared_filename: &str,
        content_type: &str,
    ) -> Result<BookId> {
        let (filename, format) = normalize_filename(declared_filename, content_type)?;
        info!("ingesting {} as {}", declared_filename, filename);

        if format == BookFormat::Epub && self.is_reserved(stem_of(&filename, format)) {
            warn!("{} would overwrite a reserved upload directory", filename);
            return Err(IngestError::ReservedName(filename));
        }
        if self.store.find_book(owner_id, &filename)?.is_some() {
            info!("{} already exists for owner {}", filename, owner_id);
            return Err(IngestError::Duplicate(filename));
        }

        let upload_root = self.config.upload_root();
        fs::create_dir_all(&upload_root)?;
        let upload_path = upload_root.join(&filename);
        let file_hash = save_upload(upload, &upload_path)?;

        let book_id = match format {
            BookFormat::Pdf => self.ingest_pdf(owner_id, &filename, &upload_path, file_hash)?,
            BookFormat::Epub => self.ingest_epub(owner_id, &filename, &upload_path, file_hash)?,
        };
        info!("{} stored as book {}", filename, book_id);
        Ok(book_id)
    }

    /// Reads the file at `path` and ingests it under its own file name.
    pub fn ingest_file(&self, owner_id: OwnerId, path: &Path, content_type: &str) -> Result<BookId> {
        let mut file = File::open(path)?;
        let declared = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        self.ingest(owner_id, &mut file, &declared, content_type)
    }

    /// EPUBs unpack next to the cover directory and the PDF split
    /// directories, so their names are off limits as upload stems.
    fn is_reserved(&self, stem: &str) -> bool {
        let cover_root = self.config.cover_root();
        let cover_in_uploads = cover_root.parent() == Some(self.config.upload_root().as_path());
        let cover_name = cover_root
            .file_name()
            .map(|name| name.to_string_lossy().to_string());
        (cover_in_uploads && cover_name.as_deref() == Some(stem)) || stem.starts_with(SPLIT_PREFIX)
    }

    fn ingest_pdf(
        &self,
        owner_id: OwnerId,
        filename: &str,
        upload_path: &Path,
        file_hash: String,
    ) -> Result<BookId> {
        let pdf = self.tools.extract_info(upload_path)?;
        let title = non_empty_or(pdf.title, filename);
        let author = non_empty_or(pdf.author, UNKNOWN_AUTHOR);
        let parsed = pdf.pages.trim().parse::<i64>();
        let pages = match parsed {
            Ok(pages) if pages >= 1 => pages,
            _ => {
                return Err(IngestError::InvalidPageCount {
                    filename: filename.to_string(),
                    raw: pdf.pages,
                })
            }
        };
        info!("{}: title {:?}, author {:?}, {} pages", filename, title, author, pages);

        self.cache.set_total_pages(filename, pages)?;

        let cover_prefix = self.config.cover_root().join(filename);
        let cover = match self.tools.rasterize_cover(upload_path, &cover_prefix) {
            Ok(Some(_)) => self
                .config
                .public_cover_path(&format!("{}-001-000.png", filename)),
            Ok(None) => String::new(),
            Err(err) => {
                warn!("{}: cover extraction failed: {}", filename, err);
                String::new()
            }
        };

        let url = format!("/book/{}", filename);
        let book_id = self.store.insert_book(&NewBook {
            owner_id,
            title: title.clone(),
            author: author.clone(),
            filename: filename.to_string(),
            file_path: upload_path.to_string_lossy().to_string(),
            url: url.clone(),
            cover: cover.clone(),
            pages,
            format: BookFormat::Pdf,
            file_hash: Some(file_hash),
            uploaded_on: chrono::Utc::now().timestamp_millis(),
        })?;

        let info = BookInfo {
            owner_id,
            book_id,
            title,
            author,
            url,
            cover,
        };
        self.index_info(&info);

        if self.index.supports_detail() {
            let feed = PdfFeed {
                info,
                source: upload_path.to_path_buf(),
                split_dir: self
                    .config
                    .upload_root()
                    .join(format!("{}{}_{}", SPLIT_PREFIX, owner_id, Uuid::new_v4())),
                pages,
            };
            let tools = Arc::clone(&self.tools);
            let index = self.index.clone();
            self.tasks.submit(&format!("pdf feed {}", filename), move || {
                feed.run(tools.as_ref(), &index)
            });
        }
        Ok(book_id)
    }

    fn ingest_epub(
        &self,
        owner_id: OwnerId,
        filename: &str,
        upload_path: &Path,
        file_hash: String,
    ) -> Result<BookId> {
        let stem = stem_of(filename, BookFormat::Epub);
        let extract_dir = self.config.upload_root().join(stem);
        self.tools.unzip_archive(upload_path, &extract_dir)?;

        let mut package =
            EpubPackage::resolve(&extract_dir, &self.config.public_upload_path(stem))?;
        package.title = non_empty_or(std::mem::take(&mut package.title), filename);
        package.author = non_empty_or(std::mem::take(&mut package.author), UNKNOWN_AUTHOR);
        info!(
            "{}: title {:?}, author {:?}, {} spine entries",
            filename,
            package.title,
            package.author,
            package.spine.len()
        );

        self.cache.store_package(filename, &package)?;

        let url = format!("/book/{}", filename);
        let book_id = self.store.insert_book(&NewBook {
            owner_id,
            title: package.title.clone(),
            author: package.author.clone(),
            filename: filename.to_string(),
            file_path: package.package_dir.to_string_lossy().to_string(),
            url: url.clone(),
            cover: package.cover.clone(),
            pages: 1,
            format: BookFormat::Epub,
            file_hash: Some(file_hash),
            uploaded_on: chrono::Utc::now().timestamp_millis(),
        })?;

        let info = BookInfo {
            owner_id,
            book_id,
            title: package.title.clone(),
            author: package.author.clone(),
            url,
            cover: package.cover.clone(),
        };
        self.index_info(&info);

        if self.index.supports_detail() {
            let index = self.index.clone();
            self.tasks.submit(&format!("epub feed {}", filename), move || {
                feed_epub(&info, &package, &index)
            });
        }
        Ok(book_id)
    }

    fn index_info(&self, info: &BookInfo) {
        if let Err(err) = self.index.index_info(info) {
            warn!("failed to index {}: {}", info.key(), err);
        }
    }
}

fn non_empty_or(value: String, fallback: &str) -> String {
    if value.trim().is_empty() {
        fallback.to_string()
    } else {
        value
    }
}

/// Copies the upload to `target`, returning its sha256 in hex.
fn save_upload<R: Read>(upload: &mut R, target: &Path) -> Result<String> {
    let mut out = File::create(target)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = upload.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
        out.write_all(&buffer[..read])?;
    }
    out.flush()?;
    let digest = hasher.finalize();
    Ok(digest.iter().map(|byte| format!("{:02x}", byte)).collect())
}

fn detail(info: &BookInfo, data: &[u8], page: i64, se_url: &str, format: BookFormat) -> BookDetail {
    BookDetail {
        owner_id: info.owner_id,
        book_id: info.book_id,
        data: STANDARD.encode(data),
        title: info.title.clone(),
        author: info.author.clone(),
        url: info.url.clone(),
        se_url: se_url.to_string(),
        cover: info.cover.clone(),
        page,
        format,
    }
}

/// Splits a PDF into pages and indexes each page's bytes.
struct PdfFeed {
    info: BookInfo,
    source: PathBuf,
    split_dir: PathBuf,
    pages: i64,
}

impl PdfFeed {
    fn run(&self, tools: &dyn ToolRunner, index: &SearchIndex) -> TaskResult {
        fs::create_dir_all(&self.split_dir)?;
        let result = self.split_and_index(tools, index);
        if let Err(err) = fs::remove_dir_all(&self.split_dir) {
            warn!("could not remove {}: {}", self.split_dir.display(), err);
        }
        result
    }

    fn split_and_index(&self, tools: &dyn ToolRunner, index: &SearchIndex) -> TaskResult {
        tools.split_pages(&self.source, &self.split_dir)?;

        let mut indexed = 0;
        for page in 1..=self.pages {
            let page_path = self.split_dir.join(format!("{}.pdf", page));
            let data = match fs::read(&page_path) {
                Ok(data) => data,
                Err(err) => {
                    warn!("page {} of {} not split: {}", page, self.info.url, err);
                    continue;
                }
            };
            let doc = detail(&self.info, &data, page, "", BookFormat::Pdf);
            match index.index_detail(&doc) {
                Ok(()) => indexed += 1,
                Err(err) => warn!("failed to index {}: {}", doc.key(), err),
            }
        }
        info!("indexed {} of {} pages for {}", indexed, self.pages, self.info.url);
        Ok(())
    }
}

fn feed_epub(info: &BookInfo, package: &EpubPackage, index: &SearchIndex) -> TaskResult {
    let mut indexed = 0;
    for (position, item) in package.spine_items() {
        let path = package.package_dir.join(&item.href);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(err) => {
                warn!("skipping {}: {}", path.display(), err);
                continue;
            }
        };
        let doc = detail(info, &data, position as i64, &item.href, BookFormat::Epub);
        match index.index_detail(&doc) {
            Ok(()) => indexed += 1,
            Err(err) => warn!("failed to index {}: {}", doc.key(), err),
        }
    }
    info!(
        "indexed {} of {} spine entries for {}",
        indexed,
        package.spine.len(),
        info.url
    );
    Ok(())
}
