//! AWS Kendra 어댑터 - Retrieve API + Gemini 생성
//!
//! Kendra 호출은 SigV4 서명 게이트웨이(`kendra.endpoint`)를 거칩니다.
//! `_excerpt_page_number`는 이미 1-based이므로 변환하지 않습니다.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::KendraConfig;
use crate::embedding::env_value;
use crate::generation::Generator;
use crate::http::{Auth, JsonEndpoint, JsonTransport};

use super::conversation::{History, Turn};
use super::local::build_prompt;
use super::{
    dedup_sources, doc_name_from_uri, require_config, AdapterError, AdapterResponse, EvalMode,
    EvaluatorAdapter, Page, SourceRef,
};

const KENDRA_TARGET: &str = "AWSKendraFrontendService.Retrieve";
const PAGE_ATTRIBUTE: &str = "_excerpt_page_number";

pub struct KendraAdapter {
    endpoint: Arc<dyn JsonEndpoint>,
    index_id: String,
    page_size: u32,
    generator: Arc<dyn Generator>,
    history: History,
    max_history_turns: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct RetrieveRequest<'a> {
    index_id: &'a str,
    query_text: &'a str,
    page_size: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RetrieveResponse {
    #[serde(default)]
    result_items: Vec<ResultItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ResultItem {
    #[serde(default)]
    document_id: Option<String>,
    #[serde(default)]
    document_title: Option<String>,
    #[serde(default)]
    document_uri: Option<String>,
    #[serde(default)]
    content: String,
    #[serde(default)]
    document_attributes: Vec<DocumentAttribute>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DocumentAttribute {
    key: String,
    value: AttributeValue,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AttributeValue {
    #[serde(default)]
    long_value: Option<i64>,
}

impl ResultItem {
    fn doc(&self) -> String {
        self.document_title
            .clone()
            .filter(|t| !t.is_empty())
            .or_else(|| self.document_id.as_deref().map(doc_name_from_uri))
            .unwrap_or_else(|| "unknown".to_string())
    }

    fn page(&self) -> Page {
        self.document_attributes
            .iter()
            .find(|a| a.key == PAGE_ATTRIBUTE)
            .and_then(|a| a.value.long_value)
            .and_then(|n| u32::try_from(n).ok())
            .filter(|n| *n > 0)
            .map(Page::one_based)
            .unwrap_or_else(Page::not_available)
    }

    fn source(&self) -> SourceRef {
        SourceRef {
            doc: self.doc(),
            page: self.page(),
            url: self.document_uri.clone().unwrap_or_default(),
        }
    }
}

impl KendraAdapter {
    pub fn new(
        endpoint: Arc<dyn JsonEndpoint>,
        index_id: impl Into<String>,
        page_size: u32,
        generator: Arc<dyn Generator>,
        max_history_turns: usize,
    ) -> Self {
        Self {
            endpoint,
            index_id: index_id.into(),
            page_size,
            generator,
            history: History::new(),
            max_history_turns,
        }
    }

    pub fn from_config(
        config: &KendraConfig,
        generator: Arc<dyn Generator>,
        max_history_turns: usize,
    ) -> Result<Self, AdapterError> {
        let base = require_config(&config.endpoint, "kendra.endpoint")?;
        let index_id = require_config(&config.index_id, "kendra.index_id")?;

        let auth = env_value("AWS_GATEWAY_TOKEN")
            .map(Auth::Bearer)
            .unwrap_or(Auth::None);
        let transport = JsonTransport::new(base, auth, Duration::from_secs(60))?
            .with_header("X-Amz-Target", KENDRA_TARGET);

        Ok(Self::new(
            Arc::new(transport),
            index_id,
            config.page_size,
            generator,
            max_history_turns,
        ))
    }
}

#[async_trait]
impl EvaluatorAdapter for KendraAdapter {
    fn mode(&self) -> EvalMode {
        EvalMode::Kendra
    }

    fn model(&self) -> &str {
        self.generator.model()
    }

    async fn query_in_thread(
        &self,
        thread_id: &str,
        question: &str,
        debug: bool,
    ) -> Result<AdapterResponse, AdapterError> {
        let start = Instant::now();

        let request = RetrieveRequest {
            index_id: &self.index_id,
            query_text: question,
            page_size: self.page_size,
        };
        let body = serde_json::to_value(&request).map_err(|e| AdapterError::malformed("kendra", e))?;
        let raw = self.endpoint.post("", &body).await?;
        let response: RetrieveResponse =
            serde_json::from_value(raw).map_err(|e| AdapterError::malformed("kendra", e))?;

        tracing::debug!("Kendra returned {} result items", response.result_items.len());

        let turns = self.history.turns(thread_id);
        let prompt = build_prompt(
            question,
            response
                .result_items
                .iter()
                .map(|item| (format!("{} (page {})", item.doc(), item.page()), item.content.as_str())),
            &turns,
        );
        let answer = self
            .generator
            .generate(&prompt)
            .await
            .map_err(AdapterError::generation)?;

        self.history.push_turn(
            thread_id,
            Turn {
                question: question.to_string(),
                answer: answer.clone(),
            },
            self.max_history_turns,
        );

        let sources = dedup_sources(response.result_items.iter().map(ResultItem::source).collect());
        let debug_info = debug.then(|| {
            json!({
                "index_id": self.index_id,
                "result_items": response.result_items.len(),
                "model": self.generator.model(),
            })
        });

        Ok(AdapterResponse {
            answer,
            sources,
            response_time_ms: start.elapsed().as_secs_f64() * 1000.0,
            debug_info,
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
