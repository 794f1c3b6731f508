//! 평가 어댑터 - 검색 모드별 공통 질의 계약
//!
//! 모든 모드가 `query(question, debug) -> {answer, sources, response_time_ms}`
//! 하나의 형태로 응답합니다.
//!
//! - hybrid / dense: 로컬 인덱스 + Gemini 생성
//! - kendra: Kendra Retrieve + Gemini 생성
//! - bedrock: Bedrock Knowledge Base RetrieveAndGenerate
//! - vertex: Vertex AI RAG Engine (Gemini + retrieval tool)
//! - openai: OpenAI Responses API + file_search
//!
//! 출처는 항상 백엔드의 구조화된 인용 필드에서 가져옵니다.
//! 페이지 번호는 여기서 한 번만 1-based로 변환됩니다.

pub mod conversation;
pub mod models;

mod bedrock;
mod kendra;
mod local;
mod openai;
mod vertex;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::config::EvalConfig;
use crate::embedding::{env_value, GeminiEmbedding};
use crate::generation::GeminiGenerator;
use crate::http::HttpError;
use crate::knowledge::{
    FusionEngine, LocalHybridIndex, PageIndex, RetrievalError, RetrievalPipeline,
};

pub use bedrock::{BedrockAdapter, BEDROCK_REQUIRED_PLACEHOLDERS};
pub use conversation::{new_thread_id, ThreadStore, Turn};
pub use kendra::KendraAdapter;
pub use local::LocalAdapter;
pub use models::{resolve_from_catalog, resolve_model_id, EndpointCatalog, ModelCatalog};
pub use openai::OpenAiAdapter;
pub use vertex::VertexAdapter;

// ============================================================================
// Mode
// ============================================================================

/// 검색 모드 (닫힌 집합)
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum EvalMode {
    Hybrid,
    Dense,
    Kendra,
    Bedrock,
    Vertex,
    Openai,
}

impl EvalMode {
    pub const ALL: [EvalMode; 6] = [
        EvalMode::Hybrid,
        EvalMode::Dense,
        EvalMode::Kendra,
        EvalMode::Bedrock,
        EvalMode::Vertex,
        EvalMode::Openai,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EvalMode::Hybrid => "hybrid",
            EvalMode::Dense => "dense",
            EvalMode::Kendra => "kendra",
            EvalMode::Bedrock => "bedrock",
            EvalMode::Vertex => "vertex",
            EvalMode::Openai => "openai",
        }
    }
}

impl std::fmt::Display for EvalMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("missing credential: set the {0} environment variable")]
    MissingCredential(&'static str),

    #[error("no {backend} model matches '{requested}'")]
    ModelNotFound { backend: String, requested: String },

    #[error("failed to list {backend} models: {message}")]
    Catalog { backend: String, message: String },

    #[error(transparent)]
    Http(#[from] HttpError),

    #[error("malformed {backend} response: {message}")]
    MalformedResponse {
        backend: &'static str,
        message: String,
    },

    #[error("generation failed: {0}")]
    Generation(String),

    #[error(transparent)]
    Retrieval(#[from] RetrievalError),

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl AdapterError {
    pub fn generation(error: anyhow::Error) -> Self {
        AdapterError::Generation(format!("{:#}", error))
    }

    pub fn malformed(backend: &'static str, error: impl std::fmt::Display) -> Self {
        AdapterError::MalformedResponse {
            backend,
            message: error.to_string(),
        }
    }
}

/// 필수 환경변수 (없으면 설정 에러)
pub fn require_env(name: &'static str) -> Result<String, AdapterError> {
    env_value(name).ok_or(AdapterError::MissingCredential(name))
}

/// 필수 설정 값
pub fn require_config<'a>(value: &'a Option<String>, key: &str) -> Result<&'a str, AdapterError> {
    value
        .as_deref()
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| AdapterError::Config(format!("{} is not set", key)))
}

// ============================================================================
// Response Types
// ============================================================================

/// 사용자에게 노출되는 페이지 번호 (1-based 또는 "N/A")
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Page {
    Number(u32),
    Label(String),
}

impl Page {
    pub fn not_available() -> Self {
        Page::Label("N/A".to_string())
    }

    /// 이미 1-based인 백엔드 값 (Kendra `_excerpt_page_number`)
    pub fn one_based(page: u32) -> Self {
        Page::Number(page)
    }
}

/// 내부 0-based 페이지 → 1-based
impl From<PageIndex> for Page {
    fn from(page: PageIndex) -> Self {
        Page::Number(page.0 + 1)
    }
}

impl From<Option<PageIndex>> for Page {
    fn from(page: Option<PageIndex>) -> Self {
        page.map(Page::from).unwrap_or_else(Page::not_available)
    }
}

impl std::fmt::Display for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Page::Number(n) => write!(f, "{}", n),
            Page::Label(label) => f.write_str(label),
        }
    }
}

/// 인용 출처
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRef {
    pub doc: String,
    pub page: Page,
    #[serde(default)]
    pub url: String,
}

/// (doc, page) 기준 중복 제거, 순서 유지
pub fn dedup_sources(sources: Vec<SourceRef>) -> Vec<SourceRef> {
    let mut seen = HashSet::new();
    sources
        .into_iter()
        .filter(|s| seen.insert((s.doc.clone(), s.page.clone())))
        .collect()
}

/// URI/경로의 마지막 구성요소 (문서 ID 표시용)
pub fn doc_name_from_uri(uri: &str) -> String {
    uri.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(uri)
        .to_string()
}

/// 어댑터 응답
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterResponse {
    pub answer: String,
    pub sources: Vec<SourceRef>,
    pub response_time_ms: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug_info: Option<Value>,
}

// ============================================================================
// EvaluatorAdapter Trait
// ============================================================================

/// 검색 모드별 질의 인터페이스
#[async_trait]
pub trait EvaluatorAdapter: Send + Sync {
    fn mode(&self) -> EvalMode;

    /// 해석된 모델 ID (리포트용)
    fn model(&self) -> &str;

    /// 스레드 기록을 이어가는 질의
    async fn query_in_thread(
        &self,
        thread_id: &str,
        question: &str,
        debug: bool,
    ) -> Result<AdapterResponse, AdapterError>;

    /// 단발 질의 (매번 새 스레드)
    async fn query(&self, question: &str, debug: bool) -> Result<AdapterResponse, AdapterError> {
        let thread_id = new_thread_id();
        self.query_in_thread(&thread_id, question, debug).await
    }
}

/// Gemini API 키 (embedding과 같은 우선순위)
fn gemini_api_key() -> Result<String, AdapterError> {
    env_value("GEMINI_API_KEY")
        .or_else(|| env_value("GOOGLE_AI_API_KEY"))
        .ok_or(AdapterError::MissingCredential("GEMINI_API_KEY"))
}

/// 모드별 어댑터 생성
///
/// 모델 ID 해석과 자격 증명 확인이 모두 여기서 끝나므로
/// 잘못된 설정은 첫 질문 전에 실패합니다.
pub async fn build_adapter(
    mode: EvalMode,
    config: &EvalConfig,
) -> Result<Arc<dyn EvaluatorAdapter>, AdapterError> {
    tracing::info!("Building {} adapter", mode);

    let adapter: Arc<dyn EvaluatorAdapter> = match mode {
        EvalMode::Hybrid | EvalMode::Dense => {
            let api_key = gemini_api_key()?;
            let embedder = GeminiEmbedding::new(api_key.clone())
                .map_err(|e| AdapterError::Config(format!("{:#}", e)))?;
            let engine = FusionEngine::new(config.retrieval.rrf_k);
            let index = LocalHybridIndex::open(
                &config.retrieval.data_dir(),
                Arc::new(embedder),
                engine,
            )
            .await
            .map_err(|e| AdapterError::Config(format!("{:#}", e)))?;

            let pipeline = RetrievalPipeline::new(Arc::new(index), engine)
                .with_filter(config.retrieval.post_filter());
            let generator = GeminiGenerator::resolve(api_key, &config.generation.model).await?;

            Arc::new(LocalAdapter::new(
                mode,
                pipeline,
                Arc::new(generator),
                &config.retrieval,
                config.generation.max_history_turns,
            )?)
        }
        EvalMode::Kendra => {
            let generator =
                GeminiGenerator::resolve(gemini_api_key()?, &config.generation.model).await?;
            Arc::new(KendraAdapter::from_config(
                &config.kendra,
                Arc::new(generator),
                config.generation.max_history_turns,
            )?)
        }
        EvalMode::Bedrock => Arc::new(BedrockAdapter::from_config(&config.bedrock).await?),
        EvalMode::Vertex => Arc::new(
            VertexAdapter::from_config(&config.vertex, config.generation.max_history_turns)
                .await?,
        ),
        EvalMode::Openai => Arc::new(OpenAiAdapter::from_config(&config.openai).await?),
    };

    tracing::info!("{} adapter ready (model: {})", mode, adapter.model());
    Ok(adapter)
}

// ============================================================================
// Tests
// ============================================================================
