//! Search-first memory retrieval: BM25 + embedding hybrid fused with
//! reciprocal ranks, gated by the confidence decay model.

pub mod bm25;
pub mod confidence;
pub mod embed;
pub mod retriever;
pub mod rrf;

pub use bm25::Bm25Index;
pub use confidence::{confidence_at, current_confidence};
pub use embed::EmbeddingIndex;
pub use retriever::{
    CorpusDoc, HitSource, MemoryRetriever, RetrievalStats, RetrieveOptions, SearchHit,
    SearchResults,
};
