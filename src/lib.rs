//! ragbench - RAG 검색/답변 품질 벤치마크
//!
//! 로컬 하이브리드 검색(LanceDB 벡터 + SQLite FTS5 키워드, RRF 통합)과
//! 관리형 RAG 백엔드(Kendra, Bedrock, Vertex AI, OpenAI)를 같은 질문 세트로
//! 평가하고, 중단된 실행은 체크포인트에서 재개합니다.

pub mod adapters;
pub mod cli;
pub mod config;
pub mod embedding;
pub mod eval;
pub mod generation;
pub mod http;
pub mod knowledge;

// Re-exports
pub use adapters::{
    build_adapter, AdapterError, AdapterResponse, EvalMode, EvaluatorAdapter, Page, SourceRef,
};
pub use config::EvalConfig;
pub use embedding::{get_api_key, has_api_key, EmbeddingProvider, GeminiEmbedding};
pub use eval::{
    BatchEvaluator, EvalError, EvaluationQuestion, EvaluationResult, RunArtifactWriter, RunOptions,
    RunOutcome, RunState, RunSummary, StopSignal,
};
pub use generation::{GeminiGenerator, Generator};
pub use knowledge::{
    Candidate, FusedResult, FusionEngine, HybridIndex, LocalHybridIndex, RetrievalError,
    RetrievalOutput, RetrievalPipeline, RetrievalRequest, SourceTag,
};
