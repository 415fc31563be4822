use crate::error::PackageError;
use log::{error, info, warn};
use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;

pub type Result<T> = std::result::Result<T, PackageError>;

const CONTAINER_PATH: &str = "META-INF/container.xml";

/// `<img src>` first, then SVG `<image href>`.
const COVER_SOURCE_PATTERNS: [&str; 2] = [
    r#"(?is)<img\b[^>]*?\bsrc\s*=\s*["']([^"']+)["']"#,
    r#"(?is)<image\b[^>]*?\bhref\s*=\s*["']([^"']+)["']"#,
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestItem {
    pub id: String,
    pub href: String,
    pub media_type: String,
}

impl ManifestItem {
    pub fn new(id: &str, href: &str, media_type: &str) -> Self {
        Self {
            id: id.to_string(),
            href: href.to_string(),
            media_type: media_type.to_string(),
        }
    }
}

/// Manifest and spine of one unpacked EPUB, cached per book so navigation
/// never re-reads the archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpubPackage {
    pub title: String,
    pub author: String,
    pub manifest: Vec<ManifestItem>,
    /// Manifest ids in reading order.
    pub spine: Vec<String>,
    /// Public URL prefix that manifest hrefs are relative to.
    pub base_path: String,
    /// Local directory that manifest hrefs are relative to.
    pub package_dir: PathBuf,
    /// Public cover URL, empty when none was found.
    pub cover: String,
}

/// Fields read straight from the OPF document.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct OpfDocument {
    pub title: String,
    pub author: String,
    pub manifest: Vec<ManifestItem>,
    pub spine: Vec<String>,
}

impl EpubPackage {
    /// Builds the package graph for an archive already unpacked into
    /// `extract_dir`, which is served publicly under `public_dir`.
    pub fn resolve(extract_dir: &Path, public_dir: &str) -> Result<Self> {
        let container_path = extract_dir.join(CONTAINER_PATH);
        let container = fs::read_to_string(&container_path)
            .map_err(|_| PackageError::MissingContainer(extract_dir.to_path_buf()))?;
        let root_path = find_opf_path(&container)?;

        let opf_path = extract_dir.join(&root_path);
        let opf = fs::read_to_string(&opf_path).map_err(|source| {
            PackageError::UnreadablePackage {
                path: opf_path.clone(),
                source,
            }
        })?;
        let document = parse_opf(&opf)?;
        validate_spine(&document)?;

        let (package_dir, base_path) = match root_path.rsplit_once('/') {
            Some((dir, _)) => (
                extract_dir.join(dir),
                format!("{}/{}", public_dir.trim_end_matches('/'), dir),
            ),
            None => (
                extract_dir.to_path_buf(),
                public_dir.trim_end_matches('/').to_string(),
            ),
        };

        let mut package = EpubPackage {
            title: document.title,
            author: document.author,
            manifest: document.manifest,
            spine: document.spine,
            base_path,
            package_dir,
            cover: String::new(),
        };
        package.cover = package.find_cover();
        info!(
            "resolved package {} with {} spine entries",
            root_path,
            package.spine.len()
        );
        Ok(package)
    }

    pub fn item(&self, id: &str) -> Option<&ManifestItem> {
        self.manifest.iter().find(|item| item.id == id)
    }

    /// Public path of the manifest item `id`, or an empty string when the
    /// id is not in the manifest.
    pub fn fragment_path(&self, id: &str) -> String {
        self.item(id)
            .map(|item| format!("{}/{}", self.base_path, item.href))
            .unwrap_or_default()
    }

    /// Spine position of the first manifest item with this href.
    pub fn spine_index_for_href(&self, href: &str) -> Option<usize> {
        let item = self.manifest.iter().find(|item| item.href == href)?;
        self.spine.iter().position(|id| *id == item.id)
    }

    /// Each spine position paired with the manifest item it references.
    /// Dangling references are skipped.
    pub fn spine_items(&self) -> impl Iterator<Item = (usize, &ManifestItem)> + '_ {
        self.spine
            .iter()
            .enumerate()
            .filter_map(|(index, id)| self.item(id).map(|item| (index, item)))
    }

    fn find_cover(&self) -> String {
        let first_ref = self.spine.first().map(String::as_str).unwrap_or_default();
        let cover_item = if first_ref.contains("cover") {
            self.item(first_ref)
        } else {
            self.manifest.iter().find(|item| item.id.contains("cover"))
        };
        let Some(cover_item) = cover_item else {
            return String::new();
        };

        if !is_markup(&cover_item.href) {
            return format!("{}/{}", self.base_path, cover_item.href);
        }

        let page_path = self.package_dir.join(&cover_item.href);
        let markup = match fs::read_to_string(&page_path) {
            Ok(markup) => markup,
            Err(err) => {
                warn!("cover page {} unreadable: {}", page_path.display(), err);
                return String::new();
            }
        };
        match find_cover_image_src(&markup) {
            Some(src) => {
                let relative = join_relative(&cover_item.href, &src);
                format!("{}/{}", self.base_path, relative)
            }
            None => String::new(),
        }
    }
}

fn is_markup(href: &str) -> bool {
    href.contains("html") || href.contains("xml")
}

fn validate_spine(document: &OpfDocument) -> Result<()> {
    if document.spine.is_empty() {
        return Err(PackageError::EmptySpine);
    }
    for id in &document.spine {
        if !document.manifest.iter().any(|item| &item.id == id) {
            return Err(PackageError::DanglingSpineRef(id.clone()));
        }
    }
    Ok(())
}

fn xml_error(document: &str, err: impl ToString) -> PackageError {
    PackageError::Xml {
        document: document.to_string(),
        reason: err.to_string(),
    }
}

fn tag_is(event: &BytesStart, name: &[u8]) -> bool {
    event.local_name().as_ref() == name
}

fn attribute(event: &BytesStart, name: &[u8]) -> Option<String> {
    event
        .attributes()
        .flatten()
        .find(|attr| attr.key.local_name().as_ref() == name)
        .and_then(|attr| attr.unescape_value().ok().map(|value| value.to_string()))
}

/// `full-path` of the first `rootfile` in container.xml.
pub fn find_opf_path(container: &str) -> Result<String> {
    let mut reader = Reader::from_str(container);
    reader.trim_text(true);
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(event)) | Ok(Event::Empty(event)) => {
                if tag_is(&event, b"rootfile") {
                    if let Some(path) = attribute(&event, b"full-path") {
                        if !path.is_empty() {
                            return Ok(path);
                        }
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(err) => return Err(xml_error(CONTAINER_PATH, err)),
            _ => {}
        }
        buf.clear();
    }

    Err(PackageError::MissingRootfile)
}

#[derive(Clone, Copy, PartialEq)]
enum Field {
    None,
    Title,
    Creator,
}

/// Reads metadata, manifest and spine from an OPF document. Repeated ids
/// are kept as-is; lookups take the first match.
pub fn parse_opf(opf: &str) -> Result<OpfDocument> {
    let mut reader = Reader::from_str(opf);
    reader.trim_text(true);
    let mut buf = Vec::new();
    let mut document = OpfDocument::default();
    let mut field = Field::None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(event)) => {
                field = match event.local_name().as_ref() {
                    b"title" if document.title.is_empty() => Field::Title,
                    b"creator" if document.author.is_empty() => Field::Creator,
                    _ => Field::None,
                };
                collect_entry(&event, &mut document);
            }
            Ok(Event::Empty(event)) => collect_entry(&event, &mut document),
            Ok(Event::Text(text)) => {
                let value = text.unescape().map_err(|err| xml_error("package", err))?;
                match field {
                    Field::Title => document.title = value.trim().to_string(),
                    Field::Creator => document.author = value.trim().to_string(),
                    Field::None => {}
                }
            }
            Ok(Event::End(_)) => field = Field::None,
            Ok(Event::Eof) => break,
            Err(err) => return Err(xml_error("package", err)),
            _ => {}
        }
        buf.clear();
    }

    Ok(document)
}

fn collect_entry(event: &BytesStart, document: &mut OpfDocument) {
    if tag_is(event, b"item") {
        if let (Some(id), Some(href)) = (attribute(event, b"id"), attribute(event, b"href")) {
            let media_type = attribute(event, b"media-type").unwrap_or_default();
            document.manifest.push(ManifestItem {
                id,
                href,
                media_type,
            });
        }
    } else if tag_is(event, b"itemref") {
        if let Some(idref) = attribute(event, b"idref") {
            document.spine.push(idref);
        }
    }
}

/// Source of the first `<img>` (or SVG `<image>`) in a cover page. Cover
/// pages are often not well-formed, so this is a text scan rather than a
/// parse and may miss unusual markup.
pub fn find_cover_image_src(markup: &str) -> Option<String> {
    cover_source_patterns().iter().find_map(|pattern| {
        let captures = pattern.captures(markup)?;
        Some(captures.get(1)?.as_str().to_string())
    })
}

fn cover_source_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        COVER_SOURCE_PATTERNS
            .iter()
            .filter_map(|pattern| match Regex::new(pattern) {
                Ok(regex) => Some(regex),
                Err(err) => {
                    error!("cover source pattern {:?} rejected: {}", pattern, err);
                    None
                }
            })
            .collect()
    })
}

/// Resolves `src` against the directory of `page_href`, both relative to
/// the package directory.
fn join_relative(page_href: &str, src: &str) -> String {
    let page_dir = Path::new(page_href).parent().unwrap_or_else(|| Path::new(""));
    let mut parts: Vec<String> = Vec::new();
    for component in page_dir.join(src).components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().to_string()),
            Component::ParentDir => {
                parts.pop();
            }
            _ => {}
        }
    }
    parts.join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONTAINER: &str = r#"<?xml version="1.0"?>
<container version="1.0" xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
  <rootfiles>
    <rootfile full-path="OEBPS/content.opf" media-type="application/oebps-package+xml"/>
    <rootfile full-path="OEBPS/other.opf" media-type="application/oebps-package+xml"/>
  </rootfiles>
</container>"#;

    const OPF: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<package xmlns="http://www.idpf.org/2007/opf" version="3.0">
  <metadata xmlns:dc="http://purl.org/dc/elements/1.1/">
    <dc:title>Pride &amp; Prejudice</dc:title>
    <dc:creator>Jane Austen</dc:creator>
    <dc:creator>Someone Else</dc:creator>
  </metadata>
  <manifest>
    <item id="cover" href="cover.xhtml" media-type="application/xhtml+xml"/>
    <item id="c1" href="text/ch1.xhtml" media-type="application/xhtml+xml"/>
    <item id="c2" href="text/ch2.xhtml" media-type="application/xhtml+xml"/>
    <item id="img" href="images/cover.jpg" media-type="image/jpeg"/>
  </manifest>
  <spine>
    <itemref idref="cover"/>
    <itemref idref="c1"/>
    <itemref idref="c2"/>
  </spine>
</package>"#;

    #[test]
    fn finds_first_rootfile() {
        assert_eq!(find_opf_path(CONTAINER).unwrap(), "OEBPS/content.opf");
    }

    #[test]
    fn missing_rootfile_is_rejected() {
        let err = find_opf_path("<container><rootfiles/></container>").unwrap_err();
        assert!(matches!(err, PackageError::MissingRootfile));
    }

    #[test]
    fn parses_metadata_manifest_and_spine() {
        let doc = parse_opf(OPF).unwrap();
        assert_eq!(doc.title, "Pride & Prejudice");
        assert_eq!(doc.author, "Jane Austen");
        assert_eq!(doc.manifest.len(), 4);
        assert_eq!(doc.manifest[1], ManifestItem::new("c1", "text/ch1.xhtml", "application/xhtml+xml"));
        assert_eq!(doc.spine, vec!["cover", "c1", "c2"]);
    }

    #[test]
    fn prefixed_opf_elements_are_read() {
        let opf = r#"<opf:package xmlns:opf="http://www.idpf.org/2007/opf">
  <opf:manifest><opf:item id="a" href="a.html" media-type="text/html"/></opf:manifest>
  <opf:spine><opf:itemref idref="a"/></opf:spine>
</opf:package>"#;
        let doc = parse_opf(opf).unwrap();
        assert_eq!(doc.manifest[0].href, "a.html");
        assert_eq!(doc.spine, vec!["a"]);
    }

    #[test]
    fn dangling_spine_ref_is_rejected() {
        let doc = OpfDocument {
            manifest: vec![ManifestItem::new("a", "a.html", "text/html")],
            spine: vec!["a".to_string(), "missing".to_string()],
            ..OpfDocument::default()
        };
        assert!(matches!(
            validate_spine(&doc),
            Err(PackageError::DanglingSpineRef(id)) if id == "missing"
        ));
    }

    #[test]
    fn img_scan_tolerates_broken_markup() {
        let markup = r#"<html><body><div><p>unclosed <IMG class="c" SRC='images/cover.png'></body>"#;
        assert_eq!(find_cover_image_src(markup).as_deref(), Some("images/cover.png"));
        let svg = r#"<svg><image width="600" xlink:href="../images/c.jpg"/></svg>"#;
        assert_eq!(find_cover_image_src(svg).as_deref(), Some("../images/c.jpg"));
        assert_eq!(find_cover_image_src("<p>no picture</p>"), None);
    }

    #[test]
    fn cover_patterns_compile_once_and_are_reused() {
        assert_eq!(cover_source_patterns().len(), COVER_SOURCE_PATTERNS.len());
        assert!(std::ptr::eq(cover_source_patterns(), cover_source_patterns()));
        for _ in 0..3 {
            assert_eq!(
                find_cover_image_src(r#"<img src="a.jpg">"#).as_deref(),
                Some("a.jpg")
            );
        }
    }

    #[test]
    fn relative_cover_sources_are_normalized() {
        assert_eq!(join_relative("cover.xhtml", "images/c.jpg"), "images/c.jpg");
        assert_eq!(join_relative("text/cover.xhtml", "../images/c.jpg"), "images/c.jpg");
    }

    #[test]
    fn resolves_unpacked_archive() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("META-INF")).unwrap();
        fs::create_dir_all(root.join("OEBPS/text")).unwrap();
        fs::write(root.join("META-INF/container.xml"), CONTAINER).unwrap();
        fs::write(root.join("OEBPS/content.opf"), OPF).unwrap();
        fs::write(
            root.join("OEBPS/cover.xhtml"),
            r#"<html><body><img src="images/cover.jpg" alt="cover"/></body></html>"#,
        )
        .unwrap();

        let package = EpubPackage::resolve(root, "/uploads/pride").unwrap();
        assert_eq!(package.base_path, "/uploads/pride/OEBPS");
        assert_eq!(package.package_dir, root.join("OEBPS"));
        assert_eq!(package.cover, "/uploads/pride/OEBPS/images/cover.jpg");
        assert_eq!(package.fragment_path("c2"), "/uploads/pride/OEBPS/text/ch2.xhtml");
        assert_eq!(package.fragment_path("nope"), "");
        assert_eq!(package.spine_index_for_href("text/ch1.xhtml"), Some(1));
        assert_eq!(package.spine_items().count(), 3);
    }

    #[test]
    fn cover_falls_back_to_manifest_id_scan() {
        let package = EpubPackage {
            title: String::new(),
            author: String::new(),
            manifest: vec![
                ManifestItem::new("c1", "ch1.xhtml", "application/xhtml+xml"),
                ManifestItem::new("cover-image", "img/front.jpg", "image/jpeg"),
            ],
            spine: vec!["c1".to_string()],
            base_path: "/uploads/b".to_string(),
            package_dir: PathBuf::from("/nonexistent"),
            cover: String::new(),
        };
        assert_eq!(package.find_cover(), "/uploads/b/img/front.jpg");
    }

    #[test]
    fn missing_container_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let err = EpubPackage::resolve(dir.path(), "/uploads/x").unwrap_err();
        assert!(matches!(err, PackageError::MissingContainer(_)));
    }
}
