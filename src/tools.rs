use crate::config::ToolConfig;
use crate::error::ToolError;
use log::{debug, warn};
use std::ffi::OsStr;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use zip::ZipArchive;

pub type Result<T> = std::result::Result<T, ToolError>;

/// Raw `pdfinfo` fields. `pages` is left unparsed so callers decide how to
/// treat a missing or garbled count.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PdfInfo {
    pub title: String,
    pub author: String,
    pub pages: String,
}

/// The document utilities ingestion depends on.
pub trait ToolRunner: Send + Sync {
    fn extract_info(&self, path: &Path) -> Result<PdfInfo>;

    /// Renders the first-page image to `{prefix}-001-000.png`. Returns the
    /// written file, or `None` when the document has no embedded image.
    fn rasterize_cover(&self, path: &Path, prefix: &Path) -> Result<Option<PathBuf>>;

    /// Writes one `{n}.pdf` per page into `out_dir`. Blocks until done.
    fn split_pages(&self, path: &Path, out_dir: &Path) -> Result<()>;

    fn unzip_archive(&self, archive: &Path, dest: &Path) -> Result<()>;
}

/// Runs the poppler utilities installed on the host.
#[derive(Debug, Clone)]
pub struct SystemTools {
    pdfinfo: String,
    pdfimages: String,
    pdfseparate: String,
}

impl SystemTools {
    pub fn new(config: &ToolConfig) -> Self {
        Self {
            pdfinfo: config.pdfinfo.clone(),
            pdfimages: config.pdfimages.clone(),
            pdfseparate: config.pdfseparate.clone(),
        }
    }

    fn run(&self, program: &str, args: &[&OsStr]) -> Result<Output> {
        debug!("running {} {:?}", program, args);
        let output = Command::new(program).args(args).output().map_err(|source| {
            if source.kind() == io::ErrorKind::NotFound {
                ToolError::MissingBinary {
                    program: program.to_string(),
                }
            } else {
                ToolError::Io {
                    program: program.to_string(),
                    source,
                }
            }
        })?;

        if !output.status.success() {
            return Err(ToolError::NonZeroExit {
                program: program.to_string(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output)
    }
}

impl ToolRunner for SystemTools {
    fn extract_info(&self, path: &Path) -> Result<PdfInfo> {
        let output = self.run(&self.pdfinfo, &[path.as_os_str()])?;
        let stdout = String::from_utf8(output.stdout).map_err(|err| {
            ToolError::UnreadableOutput {
                program: self.pdfinfo.clone(),
                reason: err.to_string(),
            }
        })?;
        Ok(parse_pdfinfo(&stdout))
    }

    fn rasterize_cover(&self, path: &Path, prefix: &Path) -> Result<Option<PathBuf>> {
        if let Some(parent) = prefix.parent() {
            fs::create_dir_all(parent).map_err(|source| ToolError::Io {
                program: self.pdfimages.clone(),
                source,
            })?;
        }
        self.run(
            &self.pdfimages,
            &[
                OsStr::new("-p"),
                OsStr::new("-png"),
                OsStr::new("-f"),
                OsStr::new("1"),
                OsStr::new("-l"),
                OsStr::new("2"),
                path.as_os_str(),
                prefix.as_os_str(),
            ],
        )?;

        let cover = cover_image_path(prefix);
        if cover.exists() {
            Ok(Some(cover))
        } else {
            debug!("pdfimages wrote no first-page image for {}", path.display());
            Ok(None)
        }
    }

    fn split_pages(&self, path: &Path, out_dir: &Path) -> Result<()> {
        let pattern = out_dir.join("%d.pdf");
        self.run(&self.pdfseparate, &[path.as_os_str(), pattern.as_os_str()])?;
        Ok(())
    }

    fn unzip_archive(&self, archive: &Path, dest: &Path) -> Result<()> {
        extract_zip(archive, dest)
    }
}

/// Where `pdfimages -p` puts the first image of page one for `prefix`.
pub fn cover_image_path(prefix: &Path) -> PathBuf {
    let mut name = prefix.as_os_str().to_os_string();
    name.push("-001-000.png");
    PathBuf::from(name)
}

pub fn parse_pdfinfo(output: &str) -> PdfInfo {
    let lines: Vec<&str> = output.lines().collect();
    PdfInfo {
        title: field_value(&lines, "Title"),
        author: field_value(&lines, "Author"),
        pages: field_value(&lines, "Pages"),
    }
}

/// Value of the first `Key:  value` line, or an empty string.
fn field_value(lines: &[&str], key: &str) -> String {
    lines
        .iter()
        .find(|line| line.starts_with(key))
        .and_then(|line| line.split_once(':'))
        .map(|(_, value)| value.trim().to_string())
        .unwrap_or_default()
}

/// Unpacks `archive` into `dest`. Entries whose names would land outside
/// `dest` are skipped.
pub fn extract_zip(archive: &Path, dest: &Path) -> Result<()> {
    let to_archive_error = |reason: String| ToolError::Archive {
        path: archive.to_path_buf(),
        reason,
    };

    let file = File::open(archive).map_err(|err| to_archive_error(err.to_string()))?;
    let mut zip = ZipArchive::new(file).map_err(|err| to_archive_error(err.to_string()))?;
    fs::create_dir_all(dest).map_err(|err| to_archive_error(err.to_string()))?;

    for i in 0..zip.len() {
        let mut entry = zip
            .by_index(i)
            .map_err(|err| to_archive_error(err.to_string()))?;
        let Some(relative) = entry.enclosed_name() else {
            warn!("skipping unsafe archive entry {:?}", entry.name());
            continue;
        };
        let target = dest.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&target).map_err(|err| to_archive_error(err.to_string()))?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|err| to_archive_error(err.to_string()))?;
        }
        let mut out = File::create(&target).map_err(|err| to_archive_error(err.to_string()))?;
        io::copy(&mut entry, &mut out).map_err(|err| to_archive_error(err.to_string()))?;
    }
    Ok(())
}
