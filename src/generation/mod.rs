//! 생성 모듈 - Gemini generateContent를 통한 답변 생성
//!
//! 로컬 검색 모드(hybrid/dense), Kendra, 그리고 채점(judge)이 모두
//! `Generator` 트레이트 하나만 바라봅니다.
//!
//! ## 사용법
//! ```rust,ignore
//! let generator = GeminiGenerator::resolve(api_key, "2.5-flash").await?;
//! let answer = generator.generate("질문...").await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::adapters::{resolve_from_catalog, AdapterError, EndpointCatalog, ModelCatalog};
use crate::adapters::models::ids_from_array;
use crate::embedding::GEMINI_API_BASE;
use crate::http::{Auth, JsonEndpoint, JsonTransport};

/// 생성 요청 타임아웃
const GENERATE_TIMEOUT: Duration = Duration::from_secs(120);

// ============================================================================
// Generator Trait
// ============================================================================

/// 텍스트 생성기 트레이트
#[async_trait]
pub trait Generator: Send + Sync {
    /// 프롬프트 → 생성 텍스트
    async fn generate(&self, prompt: &str) -> Result<String>;

    /// 해석된 전체 모델 ID
    fn model(&self) -> &str;
}

// ============================================================================
// Gemini Generator
// ============================================================================

/// Gemini generateContent 구현체
pub struct GeminiGenerator {
    endpoint: Arc<dyn JsonEndpoint>,
    model: String,
    temperature: Option<f32>,
}

impl GeminiGenerator {
    /// 이미 해석된 모델 ID로 생성
    pub fn new(endpoint: Arc<dyn JsonEndpoint>, model: impl Into<String>) -> Self {
        Self {
            endpoint,
            model: model.into(),
            temperature: None,
        }
    }

    /// 짧은 모델 ID를 카탈로그에서 해석한 뒤 생성
    pub async fn resolve(api_key: String, requested: &str) -> Result<Self, AdapterError> {
        let endpoint: Arc<dyn JsonEndpoint> = Arc::new(gemini_transport(api_key)?);
        let catalog = gemini_catalog(endpoint.clone());
        let model = resolve_from_catalog(&catalog, requested).await?;
        Ok(Self::new(endpoint, model))
    }

    /// 채점용 (결정적 출력)
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

/// Gemini REST 전송기 (API 키 헤더)
pub fn gemini_transport(api_key: String) -> Result<JsonTransport, AdapterError> {
    Ok(JsonTransport::new(
        GEMINI_API_BASE,
        Auth::Header {
            name: "x-goog-api-key",
            value: api_key,
        },
        GENERATE_TIMEOUT,
    )?)
}

/// generateContent를 지원하는 Gemini 모델 목록
pub fn gemini_catalog(endpoint: Arc<dyn JsonEndpoint>) -> impl ModelCatalog {
    EndpointCatalog::new(endpoint, "gemini", "models?pageSize=1000", |response| {
        let generative = serde_json::json!({
            "models": response
                .get("models")
                .and_then(|m| m.as_array())
                .map(|models| {
                    models
                        .iter()
                        .filter(|m| supports_generate(m))
                        .cloned()
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default()
        });
        ids_from_array(&generative, "models", "name", "/")
    })
}

fn supports_generate(model: &serde_json::Value) -> bool {
    model
        .get("supportedGenerationMethods")
        .and_then(|m| m.as_array())
        .map(|methods| methods.iter().any(|m| m == "generateContent"))
        .unwrap_or(true)
}

/// generateContent 요청 본문
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GenerateRequest<'a> {
    pub contents: Vec<Content<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,
}

#[derive(Debug, Serialize)]
pub(crate) struct Content<'a> {
    pub role: &'static str,
    pub parts: Vec<TextPart<'a>>,
}

#[derive(Debug, Serialize)]
pub(crate) struct TextPart<'a> {
    pub text: &'a str,
}

#[derive(Debug, Serialize)]
pub(crate) struct GenerationConfig {
    pub temperature: f32,
}

/// generateContent 응답 (필요한 필드만)
#[derive(Debug, Deserialize)]
pub(crate) struct GenerateResponse {
    #[serde(default)]
    pub candidates: Vec<ResponseCandidate>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ResponseCandidate {
    #[serde(default)]
    pub content: Option<ResponseContent>,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ResponseContent {
    #[serde(default)]
    pub parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ResponsePart {
    #[serde(default)]
    pub text: Option<String>,
}

impl GenerateResponse {
    /// 첫 후보의 텍스트 파트를 이어붙인 결과
    pub fn text(&self) -> Option<String> {
        let candidate = self.candidates.first()?;
        let text: String = candidate
            .content
            .as_ref()?
            .parts
            .iter()
            .filter_map(|p| p.text.as_deref())
            .collect();
        if text.is_empty() {
            None
        } else {
            Some(text)
        }
    }
}

#[async_trait]
impl Generator for GeminiGenerator {
    async fn generate(&self, prompt: &str) -> Result<String> {
        let request = GenerateRequest {
            contents: vec![Content {
                role: "user",
                parts: vec![TextPart { text: prompt }],
            }],
            generation_config: self
                .temperature
                .map(|temperature| GenerationConfig { temperature }),
        };

        let body = serde_json::to_value(&request)?;
        let response = self
            .endpoint
            .post(&format!("models/{}:generateContent", self.model), &body)
            .await
            .context("Gemini generateContent request failed")?;

        let response: GenerateResponse =
            serde_json::from_value(response).context("Unexpected generateContent response")?;

        response.text().with_context(|| {
            let reason = response
                .candidates
                .first()
                .and_then(|c| c.finish_reason.clone())
                .unwrap_or_else(|| "no candidates".to_string());
            format!("Gemini returned no text (finish reason: {})", reason)
        })
    }

    fn model(&self) -> &str {
        &self.model
    }
}

// ============================================================================
// Tests
// ============================================================================
