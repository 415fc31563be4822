#![allow(dead_code)]

use libreread::cache::{KeyValueCache, MemoryCache};
use libreread::config::Config;
use libreread::db::BookStore;
use libreread::search::{BookDetail, BookInfo, IndexBackend, SearchIndex, SearchResults};
use libreread::tools::{extract_zip, PdfInfo, ToolRunner};
use libreread::Services;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

pub type ToolResult<T> = libreread::tools::Result<T>;
pub type IndexResult<T> = libreread::search::Result<T>;

/// Stands in for the poppler utilities.
#[derive(Default)]
pub struct FakeTools {
    pub info: PdfInfo,
    /// Pages `split_pages` writes; defaults to the count reported by `info`.
    pub split_page_count: Option<i64>,
    pub with_cover: bool,
}

impl FakeTools {
    pub fn pdf(title: &str, author: &str, pages: &str) -> Self {
        Self {
            info: PdfInfo {
                title: title.to_string(),
                author: author.to_string(),
                pages: pages.to_string(),
            },
            ..Self::default()
        }
    }
}

impl ToolRunner for FakeTools {
    fn extract_info(&self, _path: &Path) -> ToolResult<PdfInfo> {
        Ok(self.info.clone())
    }

    fn rasterize_cover(&self, _path: &Path, prefix: &Path) -> ToolResult<Option<PathBuf>> {
        if !self.with_cover {
            return Ok(None);
        }
        let cover = libreread::tools::cover_image_path(prefix);
        if let Some(parent) = cover.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&cover, b"png").unwrap();
        Ok(Some(cover))
    }

    fn split_pages(&self, _path: &Path, out_dir: &Path) -> ToolResult<()> {
        let count = self
            .split_page_count
            .unwrap_or_else(|| self.info.pages.trim().parse().unwrap_or(0));
        for page in 1..=count {
            fs::write(out_dir.join(format!("{}.pdf", page)), format!("page {}", page)).unwrap();
        }
        Ok(())
    }

    fn unzip_archive(&self, archive: &Path, dest: &Path) -> ToolResult<()> {
        extract_zip(archive, dest)
    }
}

/// Records every document written, with detail content search enabled.
#[derive(Default)]
pub struct RecordingBackend {
    pub infos: Mutex<Vec<BookInfo>>,
    pub details: Mutex<Vec<BookDetail>>,
    pub updates: Mutex<Vec<(BookInfo, i64)>>,
    pub deleted: Mutex<Vec<String>>,
}

impl RecordingBackend {
    pub fn details(&self) -> Vec<BookDetail> {
        let mut details = self.details.lock().unwrap().clone();
        details.sort_by_key(|detail| detail.page);
        details
    }
}

impl IndexBackend for RecordingBackend {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn supports_detail(&self) -> bool {
        true
    }

    fn index_info(&self, doc: &BookInfo) -> IndexResult<()> {
        self.infos.lock().unwrap().push(doc.clone());
        Ok(())
    }

    fn index_detail(&self, doc: &BookDetail) -> IndexResult<()> {
        self.details.lock().unwrap().push(doc.clone());
        Ok(())
    }

    fn update_info(&self, doc: &BookInfo, detail_pages: i64) -> IndexResult<()> {
        self.updates.lock().unwrap().push((doc.clone(), detail_pages));
        Ok(())
    }

    fn delete_info(&self, owner_id: i64, book_id: i64) -> IndexResult<()> {
        self.deleted
            .lock()
            .unwrap()
            .push(libreread::search::info_key(owner_id, book_id));
        Ok(())
    }

    fn delete_detail(&self, owner_id: i64, book_id: i64, page: i64) -> IndexResult<()> {
        self.deleted
            .lock()
            .unwrap()
            .push(libreread::search::detail_key(owner_id, book_id, page));
        Ok(())
    }

    fn query(&self, term: &str, owner_id: Option<i64>) -> IndexResult<SearchResults> {
        let term = term.to_lowercase();
        let book_info = self
            .infos
            .lock()
            .unwrap()
            .iter()
            .filter(|info| owner_id.map_or(true, |owner| info.owner_id == owner))
            .filter(|info| {
                info.title.to_lowercase().contains(&term)
                    || info.author.to_lowercase().contains(&term)
            })
            .cloned()
            .collect();
        Ok(SearchResults {
            book_info,
            book_detail: Vec::new(),
        })
    }
}

pub struct Harness {
    pub services: Services,
    pub backend: Arc<RecordingBackend>,
    pub cache: Arc<MemoryCache>,
    pub dir: tempfile::TempDir,
}

/// Services over a scratch directory, an in-memory store and cache, fake
/// tools and a recording index.
pub fn harness(tools: FakeTools) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::rooted_at(dir.path());
    let backend = Arc::new(RecordingBackend::default());
    let cache = Arc::new(MemoryCache::new());
    let kv: Arc<dyn KeyValueCache> = cache.clone();
    let services = Services::assemble(
        config,
        Arc::new(BookStore::in_memory().unwrap()),
        kv,
        Arc::new(tools),
        SearchIndex::new(backend.clone()),
    );
    Harness {
        services,
        backend,
        cache,
        dir,
    }
}

pub const CONTAINER_XML: &str = r#"<?xml version="1.0"?>
<container version="1.0" xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
  <rootfiles>
    <rootfile full-path="OEBPS/content.opf" media-type="application/oebps-package+xml"/>
  </rootfiles>
</container>"#;

/// OPF with `chapters` spine entries `c1..cN` at `Text/chN.xhtml` and a
/// JPEG cover item.
pub fn package_document(title: &str, author: &str, chapters: usize) -> String {
    let mut manifest = String::from(
        r#"    <item id="cover-image" href="images/cover.jpg" media-type="image/jpeg"/>
"#,
    );
    let mut spine = String::new();
    for n in 1..=chapters {
        manifest.push_str(&format!(
            "    <item id=\"c{n}\" href=\"Text/ch{n}.xhtml\" media-type=\"application/xhtml+xml\"/>\n"
        ));
        spine.push_str(&format!("    <itemref idref=\"c{n}\"/>\n"));
    }
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<package xmlns="http://www.idpf.org/2007/opf" version="2.0">
  <metadata xmlns:dc="http://purl.org/dc/elements/1.1/">
    <dc:title>{title}</dc:title>
    <dc:creator>{author}</dc:creator>
  </metadata>
  <manifest>
{manifest}  </manifest>
  <spine toc="ncx">
{spine}  </spine>
</package>"#
    )
}

/// Writes an EPUB archive to `path` with `chapters` chapter documents.
pub fn write_epub(path: &Path, title: &str, author: &str, chapters: usize) {
    let file = File::create(path).unwrap();
    let mut zip = ZipWriter::new(file);
    let options = SimpleFileOptions::default();

    zip.start_file("mimetype", options).unwrap();
    zip.write_all(b"application/epub+zip").unwrap();
    zip.start_file("META-INF/container.xml", options).unwrap();
    zip.write_all(CONTAINER_XML.as_bytes()).unwrap();
    zip.start_file("OEBPS/content.opf", options).unwrap();
    zip.write_all(package_document(title, author, chapters).as_bytes())
        .unwrap();
    zip.start_file("OEBPS/images/cover.jpg", options).unwrap();
    zip.write_all(b"jpeg").unwrap();
    for n in 1..=chapters {
        zip.start_file(format!("OEBPS/Text/ch{}.xhtml", n), options)
            .unwrap();
        zip.write_all(
            format!("<html><body><p>Chapter {} text</p></body></html>", n).as_bytes(),
        )
        .unwrap();
    }
    zip.finish().unwrap();
}
