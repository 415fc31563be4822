use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub type BookId = i64;
pub type OwnerId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookFormat {
    Pdf,
    Epub,
}

impl BookFormat {
    pub fn from_content_type(content_type: &str) -> Option<Self> {
        match content_type.trim().to_lowercase().as_str() {
            "application/pdf" => Some(BookFormat::Pdf),
            "application/epub+zip" => Some(BookFormat::Epub),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BookFormat::Pdf => "pdf",
            BookFormat::Epub => "epub",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            BookFormat::Pdf => ".pdf",
            BookFormat::Epub => ".epub",
        }
    }
}

impl fmt::Display for BookFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BookFormat {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pdf" => Ok(BookFormat::Pdf),
            "epub" => Ok(BookFormat::Epub),
            other => Err(format!("unknown book format: {}", other)),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Book {
    pub id: BookId,
    pub owner_id: OwnerId,
    pub title: String,
    pub author: String,
    pub filename: String,
    /// Local path: the upload for PDF, the package directory for EPUB.
    pub file_path: String,
    pub url: String,
    pub cover: String,
    pub pages: i64,
    pub format: BookFormat,
    pub file_hash: Option<String>,
    pub uploaded_on: i64,
}

#[derive(Debug, Clone)]
pub struct NewBook {
    pub owner_id: OwnerId,
    pub title: String,
    pub author: String,
    pub filename: String,
    pub file_path: String,
    pub url: String,
    pub cover: String,
    pub pages: i64,
    pub format: BookFormat,
    pub file_hash: Option<String>,
    pub uploaded_on: i64,
}

/// Row shape used by library listings.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct BookSummary {
    pub id: BookId,
    pub title: String,
    pub url: String,
    pub cover: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct BookMetadata {
    pub title: String,
    pub author: String,
    pub cover: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Next,
    Previous,
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "next" => Ok(Direction::Next),
            "previous" | "prev" => Ok(Direction::Previous),
            other => Err(format!("unknown direction: {}", other)),
        }
    }
}

/// Result of a fragment navigation. A zero `current_page` means the
/// position could not be resolved and the viewer must not navigate.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
pub struct HrefData {
    pub current_page: i64,
    pub href_path: String,
    pub left_none: bool,
    pub right_none: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
pub struct CurrentPage {
    pub current_page: i64,
    pub left_none: bool,
    pub right_none: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ReaderView {
    pub format: BookFormat,
    pub file_name: String,
    pub current_page: i64,
    pub total_pages: i64,
    pub id_ref: String,
    pub href_path: String,
    pub package_path: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_type_maps_to_format() {
        assert_eq!(
            BookFormat::from_content_type("application/pdf"),
            Some(BookFormat::Pdf)
        );
        assert_eq!(
            BookFormat::from_content_type("application/epub+zip"),
            Some(BookFormat::Epub)
        );
        assert_eq!(BookFormat::from_content_type("text/plain"), None);
    }

    #[test]
    fn direction_parses_route_values() {
        assert_eq!("next".parse::<Direction>(), Ok(Direction::Next));
        assert_eq!("prev".parse::<Direction>(), Ok(Direction::Previous));
        assert!("sideways".parse::<Direction>().is_err());
    }
}
