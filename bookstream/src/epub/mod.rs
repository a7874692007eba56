//! EPUB streaming: metadata first, then chapters on demand.

mod chapters;
mod manifest;
mod metadata;

pub use chapters::{chapter_key, ChapterManager, ChapterSource, PreloadReport};
pub use manifest::{resolve, HttpChapterSource, ManifestStructureReader, MANIFEST_FILE};
pub use metadata::{
    metadata_key, toc_key, DocumentMetadata, MetadataExtractor, RawSpineItem, RawStructure,
    SpineItem, StructureReader, TocEntry, UNKNOWN_AUTHOR, UNKNOWN_LANGUAGE, UNKNOWN_TITLE,
};
