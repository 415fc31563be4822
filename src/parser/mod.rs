pub mod epub;

pub use epub::{EpubPackage, ManifestItem};
