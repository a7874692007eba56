//! PDF streaming: range probe, chunked reads, page-level preloading.

mod chunks;
mod engine;
mod loader;

pub use chunks::{chunk_key, ChunkReader};
pub use engine::{
    BasicPdfEngine, DocumentSource, EngineError, PageInfo, PdfDocument, PdfEngine, RangeReader,
    DEFAULT_PAGE_SIZE,
};
pub use loader::{
    document_key, page_key, structure_key, LoadMode, PdfInfo, PdfStructureRecord, RangeLoader,
};
