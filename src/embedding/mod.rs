//! 임베딩 모듈 - Gemini API를 통한 텍스트 벡터화
//!
//! 쿼리와 문서는 서로 다른 task type으로 임베딩합니다.
//! (RETRIEVAL_QUERY / RETRIEVAL_DOCUMENT)
//!
//! ## 사용법
//! ```rust,ignore
//! let embedder = GeminiEmbedding::from_env()?;
//! let embedding = embedder.embed("Hello, world!", EmbedTask::Query).await?;
//! ```

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::http::{Auth, JsonTransport};

// ============================================================================
// EmbeddingProvider Trait
// ============================================================================

/// 임베딩 용도
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbedTask {
    Query,
    Document,
}

impl EmbedTask {
    fn as_gemini(&self) -> &'static str {
        match self {
            EmbedTask::Query => "RETRIEVAL_QUERY",
            EmbedTask::Document => "RETRIEVAL_DOCUMENT",
        }
    }
}

/// 임베딩 프로바이더 트레이트
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// 단일 텍스트 임베딩
    async fn embed(&self, text: &str, task: EmbedTask) -> Result<Vec<f32>>;

    /// 임베딩 차원 수
    fn dimension(&self) -> usize;

    /// 프로바이더 이름
    fn name(&self) -> &str;
}

// ============================================================================
// Google Gemini Embedding
// ============================================================================

/// Gemini API 베이스 URL
/// source: https://ai.google.dev/gemini-api/docs/embeddings
pub const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/";

const EMBED_MODEL: &str = "gemini-embedding-001";

/// 임베딩 차원 (LanceDB 스키마의 벡터 길이와 같아야 함)
pub const DEFAULT_DIMENSION: usize = crate::knowledge::EMBEDDING_DIMENSION as usize;

/// Rate Limiter 설정 (Gemini 무료 티어: 60 RPM)
const RATE_LIMIT_RPM: u32 = 60;
const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);
const MIN_DELAY_MS: u64 = 1000;

/// Google Gemini 임베딩 구현체
#[derive(Debug)]
pub struct GeminiEmbedding {
    transport: JsonTransport,
    dimension: usize,
}

impl GeminiEmbedding {
    pub fn new(api_key: String) -> Result<Self> {
        let transport = JsonTransport::new(
            GEMINI_API_BASE,
            Auth::Header {
                name: "x-goog-api-key",
                value: api_key,
            },
            Duration::from_secs(30),
        )
        .context("Failed to create embedding transport")?
        .with_rate_limit(
            RATE_LIMIT_RPM,
            RATE_LIMIT_WINDOW,
            Duration::from_millis(MIN_DELAY_MS),
        );

        Ok(Self {
            transport,
            dimension: DEFAULT_DIMENSION,
        })
    }

    /// 환경변수에서 API 키를 읽어 생성
    pub fn from_env() -> Result<Self> {
        Self::new(get_api_key()?)
    }
}

/// Gemini API 요청 본문
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EmbedRequest<'a> {
    model: String,
    content: EmbedContent<'a>,
    task_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    output_dimensionality: Option<usize>,
}

#[derive(Debug, Serialize)]
struct EmbedContent<'a> {
    parts: Vec<EmbedPart<'a>>,
}

#[derive(Debug, Serialize)]
struct EmbedPart<'a> {
    text: &'a str,
}

/// Gemini API 응답
#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embedding: EmbeddingValues,
}

#[derive(Debug, Deserialize)]
struct EmbeddingValues {
    values: Vec<f32>,
}

#[async_trait]
impl EmbeddingProvider for GeminiEmbedding {
    async fn embed(&self, text: &str, task: EmbedTask) -> Result<Vec<f32>> {
        if text.trim().is_empty() {
            return Ok(vec![0.0; self.dimension]);
        }

        let request = EmbedRequest {
            model: format!("models/{}", EMBED_MODEL),
            content: EmbedContent {
                parts: vec![EmbedPart { text }],
            },
            task_type: task.as_gemini(),
            output_dimensionality: Some(self.dimension),
        };

        let response: EmbedResponse = self
            .transport
            .post_json(&format!("models/{}:embedContent", EMBED_MODEL), &request)
            .await
            .context("Gemini embedding request failed")?;

        if response.embedding.values.len() != self.dimension {
            anyhow::bail!(
                "Gemini returned {} dimensions, expected {}",
                response.embedding.values.len(),
                self.dimension
            );
        }

        Ok(response.embedding.values)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn name(&self) -> &str {
        EMBED_MODEL
    }
}

// ============================================================================
// API Key Management
// ============================================================================

/// 환경변수 값 (비어 있으면 None)
pub fn env_value(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Gemini API 키 로드
///
/// 우선순위:
/// 1. `GEMINI_API_KEY` 환경변수
/// 2. `GOOGLE_AI_API_KEY` 환경변수
pub fn get_api_key() -> Result<String> {
    if let Some(key) = env_value("GEMINI_API_KEY") {
        tracing::debug!("Using API key from GEMINI_API_KEY");
        return Ok(key);
    }

    if let Some(key) = env_value("GOOGLE_AI_API_KEY") {
        tracing::debug!("Using API key from GOOGLE_AI_API_KEY");
        return Ok(key);
    }

    anyhow::bail!(
        "API key not found. Set GEMINI_API_KEY or GOOGLE_AI_API_KEY environment variable.\n\
         Get your API key at: https://aistudio.google.com/app/apikey"
    )
}

/// API 키 존재 여부 확인
pub fn has_api_key() -> bool {
    env_value("GEMINI_API_KEY").is_some() || env_value("GOOGLE_AI_API_KEY").is_some()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dimension_matches_vector_schema() {
        let embedder = GeminiEmbedding::new("fake_key".to_string()).unwrap();
        assert_eq!(
            embedder.dimension(),
            crate::knowledge::EMBEDDING_DIMENSION as usize
        );
    }

    #[tokio::test]
    async fn test_empty_text_short_circuits() {
        let embedder = GeminiEmbedding::new("fake_key".to_string()).unwrap();
        let embedding = embedder.embed("   ", EmbedTask::Query).await.unwrap();
        assert_eq!(embedding.len(), DEFAULT_DIMENSION);
        assert!(embedding.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_request_shape() {
        let request = EmbedRequest {
            model: "models/gemini-embedding-001".to_string(),
            content: EmbedContent {
                parts: vec![EmbedPart { text: "hi" }],
            },
            task_type: EmbedTask::Query.as_gemini(),
            output_dimensionality: Some(768),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["taskType"], "RETRIEVAL_QUERY");
        assert_eq!(json["outputDimensionality"], 768);
        assert_eq!(json["content"]["parts"][0]["text"], "hi");
    }
}
