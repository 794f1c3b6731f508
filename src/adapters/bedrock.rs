//! AWS Bedrock Knowledge Base 어댑터 - RetrieveAndGenerate
//!
//! 프롬프트 템플릿에 `$search_results$`와 `$output_format_instructions$`가
//! 없으면 Bedrock은 에러 없이 빈 citations를 돌려줍니다.
//! 그래서 요청을 만들 때마다 두 placeholder를 강제로 포함시킵니다.
//!
//! 페이지 메타데이터(`x-amz-bedrock-kb-document-page-number`)는 0-based입니다.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::BedrockConfig;
use crate::embedding::env_value;
use crate::http::{Auth, JsonEndpoint, JsonTransport};
use crate::knowledge::PageIndex;

use super::conversation::ThreadStore;
use super::models::{ids_from_array, resolve_from_catalog, EndpointCatalog};
use super::{
    dedup_sources, doc_name_from_uri, require_config, AdapterError, AdapterResponse, EvalMode,
    EvaluatorAdapter, Page, SourceRef,
};

/// citations 채움에 필요한 placeholder
pub const BEDROCK_REQUIRED_PLACEHOLDERS: [&str; 2] =
    ["$search_results$", "$output_format_instructions$"];

const DEFAULT_PROMPT_TEMPLATE: &str = "You are a question answering agent. \
Answer the user's question using only the search results below. \
If the search results do not contain the answer, say that you could not find it.\n\n\
Search results:\n$search_results$\n\n$output_format_instructions$";

const PAGE_METADATA: &str = "x-amz-bedrock-kb-document-page-number";
const SOURCE_URI_METADATA: &str = "x-amz-bedrock-kb-source-uri";

pub struct BedrockAdapter {
    endpoint: Arc<dyn JsonEndpoint>,
    knowledge_base_id: String,
    model_id: String,
    model_arn: String,
    number_of_results: u32,
    prompt_template: String,
    /// 스레드 ID → Bedrock sessionId
    sessions: ThreadStore<String>,
}

/// 템플릿에 빠진 필수 placeholder를 뒤에 덧붙임
pub fn ensure_placeholders(template: &str) -> String {
    let mut template = template.to_string();
    for placeholder in BEDROCK_REQUIRED_PLACEHOLDERS {
        if !template.contains(placeholder) {
            tracing::warn!("Bedrock prompt template lacks {}, appending it", placeholder);
            template.push_str("\n\n");
            template.push_str(placeholder);
        }
    }
    template
}

// ============================================================================
// Wire Types
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RetrieveAndGenerateRequest<'a> {
    input: TextInput<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    session_id: Option<String>,
    retrieve_and_generate_configuration: Value,
}

#[derive(Debug, Serialize)]
struct TextInput<'a> {
    text: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RetrieveAndGenerateResponse {
    output: Output,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    citations: Vec<Citation>,
}

#[derive(Debug, Deserialize)]
struct Output {
    text: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Citation {
    #[serde(default)]
    retrieved_references: Vec<RetrievedReference>,
}

#[derive(Debug, Deserialize)]
struct RetrievedReference {
    #[serde(default)]
    location: Value,
    #[serde(default)]
    metadata: serde_json::Map<String, Value>,
}

impl RetrievedReference {
    fn uri(&self) -> Option<String> {
        self.metadata
            .get(SOURCE_URI_METADATA)
            .and_then(Value::as_str)
            .or_else(|| self.location.pointer("/s3Location/uri").and_then(Value::as_str))
            .or_else(|| self.location.pointer("/webLocation/url").and_then(Value::as_str))
            .map(str::to_string)
    }

    /// 0-based 메타데이터 → 1-based (숫자 또는 숫자 문자열)
    fn page(&self) -> Page {
        let raw = self.metadata.get(PAGE_METADATA);
        let index = raw
            .and_then(Value::as_f64)
            .or_else(|| raw.and_then(Value::as_str).and_then(|s| s.parse::<f64>().ok()))
            .filter(|n| n.is_finite() && *n >= 0.0)
            .map(|n| PageIndex(n as u32));
        Page::from(index)
    }

    fn source(&self) -> Option<SourceRef> {
        let uri = self.uri()?;
        Some(SourceRef {
            doc: doc_name_from_uri(&uri),
            page: self.page(),
            url: uri,
        })
    }
}

// ============================================================================
// Adapter
// ============================================================================

impl BedrockAdapter {
    pub fn new(
        endpoint: Arc<dyn JsonEndpoint>,
        knowledge_base_id: impl Into<String>,
        model_id: impl Into<String>,
        region: &str,
        number_of_results: u32,
        prompt_template: Option<&str>,
    ) -> Self {
        let model_id = model_id.into();
        Self {
            endpoint,
            knowledge_base_id: knowledge_base_id.into(),
            model_arn: format!("arn:aws:bedrock:{}::foundation-model/{}", region, model_id),
            model_id,
            number_of_results,
            prompt_template: ensure_placeholders(prompt_template.unwrap_or(DEFAULT_PROMPT_TEMPLATE)),
            sessions: ThreadStore::new(),
        }
    }

    /// 설정에서 생성 (모델 ID는 foundation-models 목록에서 해석)
    pub async fn from_config(config: &BedrockConfig) -> Result<Self, AdapterError> {
        let base = require_config(&config.endpoint, "bedrock.endpoint")?;
        let knowledge_base_id = require_config(&config.knowledge_base_id, "bedrock.knowledge_base_id")?;

        let auth = env_value("AWS_GATEWAY_TOKEN")
            .map(Auth::Bearer)
            .unwrap_or(Auth::None);
        let endpoint: Arc<dyn JsonEndpoint> =
            Arc::new(JsonTransport::new(base, auth, Duration::from_secs(120))?);

        let catalog = EndpointCatalog::new(endpoint.clone(), "bedrock", "foundation-models", |v| {
            ids_from_array(v, "modelSummaries", "modelId", "/")
        });
        let model_id = resolve_from_catalog(&catalog, &config.model).await?;

        Ok(Self::new(
            endpoint,
            knowledge_base_id,
            model_id,
            &config.region,
            config.number_of_results,
            config.prompt_template.as_deref(),
        ))
    }

    fn build_request<'a>(&self, question: &'a str, session_id: Option<String>) -> RetrieveAndGenerateRequest<'a> {
        RetrieveAndGenerateRequest {
            input: TextInput { text: question },
            session_id,
            retrieve_and_generate_configuration: json!({
                "type": "KNOWLEDGE_BASE",
                "knowledgeBaseConfiguration": {
                    "knowledgeBaseId": self.knowledge_base_id,
                    "modelArn": self.model_arn,
                    "retrievalConfiguration": {
                        "vectorSearchConfiguration": {
                            "numberOfResults": self.number_of_results
                        }
                    },
                    "generationConfiguration": {
                        "promptTemplate": {
                            "textPromptTemplate": self.prompt_template
                        }
                    }
                }
            }),
        }
    }
}

#[async_trait]
impl EvaluatorAdapter for BedrockAdapter {
    fn mode(&self) -> EvalMode {
        EvalMode::Bedrock
    }

    fn model(&self) -> &str {
        &self.model_id
    }

    async fn query_in_thread(
        &self,
        thread_id: &str,
        question: &str,
        debug: bool,
    ) -> Result<AdapterResponse, AdapterError> {
        let start = Instant::now();

        let request = self.build_request(question, self.sessions.get(thread_id));
        let body = serde_json::to_value(&request).map_err(|e| AdapterError::malformed("bedrock", e))?;
        let raw = self.endpoint.post("retrieveAndGenerate", &body).await?;
        let response: RetrieveAndGenerateResponse =
            serde_json::from_value(raw).map_err(|e| AdapterError::malformed("bedrock", e))?;

        if let Some(session_id) = &response.session_id {
            self.sessions.set(thread_id, session_id.clone());
        }

        let references: Vec<&RetrievedReference> = response
            .citations
            .iter()
            .flat_map(|c| c.retrieved_references.iter())
            .collect();
        if references.is_empty() {
            tracing::warn!("Bedrock returned no retrieved references for '{}'", question);
        }

        let sources = dedup_sources(references.iter().filter_map(|r| r.source()).collect());
        let debug_info = debug.then(|| {
            json!({
                "model_arn": self.model_arn,
                "session_id": response.session_id,
                "citation_count": response.citations.len(),
                "reference_count": references.len(),
            })
        });

        Ok(AdapterResponse {
            answer: response.output.text,
            sources,
            response_time_ms: start.elapsed().as_secs_f64() * 1000.0,
            debug_info,
        })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::HttpError;
    use std::sync::Mutex;

    struct FakeBedrock {
        requests: Mutex<Vec<(String, Value)>>,
        response: Value,
    }

    impl FakeBedrock {
        fn new(response: Value) -> Arc<Self> {
            Arc::new(Self {
                requests: Mutex::new(Vec::new()),
                response,
            })
        }
    }

    #[async_trait]
    impl JsonEndpoint for FakeBedrock {
        async fn post(&self, path: &str, body: &Value) -> Result<Value, HttpError> {
            self.requests
                .lock()
                .unwrap()
                .push((path.to_string(), body.clone()));
            Ok(self.response.clone())
        }

        async fn get(&self, _path: &str) -> Result<Value, HttpError> {
            Ok(json!({
                "modelSummaries": [
                    {"modelId": "anthropic.claude-sonnet-4-5-20250929-v1:0"},
                    {"modelId": "anthropic.claude-3-haiku-20240307-v1:0"}
                ]
            }))
        }
    }

    fn sample_response() -> Value {
        json!({
            "output": {"text": "Keep oil pressure above 25 psi."},
            "sessionId": "session-123",
            "citations": [{
                "retrievedReferences": [
                    {
                        "location": {"s3Location": {"uri": "s3://kb/manuals/engine.pdf"}},
                        "metadata": {
                            "x-amz-bedrock-kb-source-uri": "s3://kb/manuals/engine.pdf",
                            "x-amz-bedrock-kb-document-page-number": 2.0
                        }
                    },
                    {
                        "location": {"s3Location": {"uri": "s3://kb/manuals/engine.pdf"}},
                        "metadata": {"x-amz-bedrock-kb-document-page-number": 2.0}
                    },
                    {
                        "location": {"s3Location": {"uri": "s3://kb/manuals/faq.txt"}},
                        "metadata": {}
                    }
                ]
            }]
        })
    }

    fn adapter(fake: Arc<FakeBedrock>, template: Option<&str>) -> BedrockAdapter {
        BedrockAdapter::new(
            fake,
            "KB123",
            "anthropic.claude-sonnet-4-5-20250929-v1:0",
            "us-east-1",
            20,
            template,
        )
    }

    #[tokio::test]
    async fn test_request_always_includes_placeholders() {
        let fake = FakeBedrock::new(sample_response());
        // 사용자 템플릿에 placeholder가 없어도 요청에는 포함되어야 함
        let adapter = adapter(fake.clone(), Some("Answer briefly."));

        adapter.query("oil pressure?", false).await.unwrap();

        let requests = fake.requests.lock().unwrap();
        let (path, body) = &requests[0];
        assert_eq!(path, "retrieveAndGenerate");
        let template = body
            .pointer("/retrieveAndGenerateConfiguration/knowledgeBaseConfiguration/generationConfiguration/promptTemplate/textPromptTemplate")
            .and_then(Value::as_str)
            .unwrap();
        for placeholder in BEDROCK_REQUIRED_PLACEHOLDERS {
            assert!(template.contains(placeholder), "missing {}", placeholder);
        }
        assert!(template.starts_with("Answer briefly."));
        assert_eq!(
            body.pointer("/retrieveAndGenerateConfiguration/knowledgeBaseConfiguration/modelArn")
                .and_then(Value::as_str),
            Some("arn:aws:bedrock:us-east-1::foundation-model/anthropic.claude-sonnet-4-5-20250929-v1:0")
        );
    }

    #[test]
    fn test_default_template_untouched() {
        assert_eq!(ensure_placeholders(DEFAULT_PROMPT_TEMPLATE), DEFAULT_PROMPT_TEMPLATE);
    }

    #[tokio::test]
    async fn test_citations_from_references_with_one_based_pages() {
        let fake = FakeBedrock::new(sample_response());
        let response = adapter(fake, None).query("oil pressure?", false).await.unwrap();

        assert_eq!(response.answer, "Keep oil pressure above 25 psi.");
        assert_eq!(
            response.sources,
            vec![
                SourceRef {
                    doc: "engine.pdf".to_string(),
                    page: Page::Number(3),
                    url: "s3://kb/manuals/engine.pdf".to_string(),
                },
                SourceRef {
                    doc: "faq.txt".to_string(),
                    page: Page::not_available(),
                    url: "s3://kb/manuals/faq.txt".to_string(),
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_session_id_reused_per_thread() {
        let fake = FakeBedrock::new(sample_response());
        let adapter = adapter(fake.clone(), None);

        adapter.query_in_thread("t1", "first", false).await.unwrap();
        adapter.query_in_thread("t1", "second", false).await.unwrap();
        adapter.query_in_thread("t2", "other", false).await.unwrap();

        let requests = fake.requests.lock().unwrap();
        assert!(requests[0].1.get("sessionId").is_none());
        assert_eq!(requests[1].1["sessionId"], "session-123");
        assert!(requests[2].1.get("sessionId").is_none());
    }

    #[tokio::test]
    async fn test_model_resolved_from_catalog() {
        let fake = FakeBedrock::new(sample_response());
        let catalog = EndpointCatalog::new(fake, "bedrock", "foundation-models", |v| {
            ids_from_array(v, "modelSummaries", "modelId", "/")
        });
        assert_eq!(
            resolve_from_catalog(&catalog, "4-5").await.unwrap(),
            "anthropic.claude-sonnet-4-5-20250929-v1:0"
        );
        assert!(matches!(
            resolve_from_catalog(&catalog, "9-9").await,
            Err(AdapterError::ModelNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_missing_knowledge_base_is_config_error() {
        let config = BedrockConfig {
            endpoint: Some("https://gateway.example.com/".to_string()),
            ..Default::default()
        };
        let result = BedrockAdapter::from_config(&config).await;
        assert!(matches!(result, Err(AdapterError::Config(_))));
    }
}
