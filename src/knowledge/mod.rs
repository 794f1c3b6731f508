//! Knowledge 모듈 - 하이브리드 검색 코어
//!
//! - SQLite: 청크 저장 + FTS5 키워드 검색 (sparse)
//! - LanceDB: 벡터 검색 (dense)
//! - Fusion: RRF 알고리즘으로 두 순위 목록 통합
//! - Pipeline: 표준/디버그/dense 검색 경로

mod candidate;
mod fusion;
mod index;
mod lance;
mod pipeline;
mod store;

// Re-exports
pub use candidate::{Candidate, ChunkPayload, PageIndex, SourceTag};
pub use fusion::{
    FusedResult, FusionEngine, FusionError, Origin, Provenance, RankedList, SourceHit,
    DEFAULT_RRF_K,
};
pub use index::{
    fuse_surviving, load_chunk_records, FusedSearch, HybridIndex, IndexStats, LocalHybridIndex,
    RetrievalError, SourceFailure,
};
pub use lance::{LanceVectorStore, VectorEntry, EMBEDDING_DIMENSION};
pub use pipeline::{
    PostFilter, RetrievalOutput, RetrievalPipeline, RetrievalRequest, RetrievalStrategy,
    DEFAULT_PREFETCH_LIMIT, DEFAULT_TOP_K,
};
pub use store::{get_data_dir, ChunkStore, StoreStats};
