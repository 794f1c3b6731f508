//! OpenAI 어댑터 - Responses API + file_search
//!
//! 출처는 응답 메시지의 `file_citation` annotation에서 가져옵니다.
//! file_search는 페이지 정보를 주지 않으므로 페이지는 "N/A"입니다.
//! 다중 턴은 스레드별 직전 response id(`previous_response_id`)로 이어갑니다.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::OpenAiConfig;
use crate::http::{Auth, JsonEndpoint, JsonTransport};

use super::conversation::ThreadStore;
use super::models::{ids_from_array, resolve_from_catalog, EndpointCatalog};
use super::{
    dedup_sources, require_config, require_env, AdapterError, AdapterResponse, EvalMode,
    EvaluatorAdapter, Page, SourceRef,
};

pub struct OpenAiAdapter {
    endpoint: Arc<dyn JsonEndpoint>,
    model_id: String,
    vector_store_id: String,
    max_num_results: u32,
    /// 스레드 ID → 직전 response id
    previous: ThreadStore<String>,
}

#[derive(Debug, Serialize)]
struct ResponsesRequest<'a> {
    model: &'a str,
    input: &'a str,
    tools: Vec<FileSearchTool<'a>>,
    include: [&'static str; 1],
    #[serde(skip_serializing_if = "Option::is_none")]
    previous_response_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct FileSearchTool<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    vector_store_ids: [&'a str; 1],
    max_num_results: u32,
}

#[derive(Debug, Deserialize)]
struct ResponsesResponse {
    id: String,
    #[serde(default)]
    output: Vec<OutputItem>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OutputItem {
    Message {
        #[serde(default)]
        content: Vec<ContentPart>,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart {
    OutputText {
        text: String,
        #[serde(default)]
        annotations: Vec<Annotation>,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Annotation {
    FileCitation {
        file_id: String,
        #[serde(default)]
        filename: Option<String>,
    },
    #[serde(other)]
    Other,
}

impl ResponsesResponse {
    fn answer(&self) -> String {
        self.text_parts().map(|(text, _)| text).collect::<Vec<_>>().join("")
    }

    fn sources(&self) -> Vec<SourceRef> {
        let sources = self
            .text_parts()
            .flat_map(|(_, annotations)| annotations.iter())
            .filter_map(|a| match a {
                Annotation::FileCitation { file_id, filename } => Some(SourceRef {
                    doc: filename.clone().unwrap_or_else(|| file_id.clone()),
                    page: Page::not_available(),
                    url: String::new(),
                }),
                Annotation::Other => None,
            })
            .collect();
        dedup_sources(sources)
    }

    fn text_parts(&self) -> impl Iterator<Item = (&str, &[Annotation])> + '_ {
        self.output
            .iter()
            .filter_map(|item| match item {
                OutputItem::Message { content } => Some(content),
                OutputItem::Other => None,
            })
            .flatten()
            .filter_map(|part| match part {
                ContentPart::OutputText { text, annotations } => {
                    Some((text.as_str(), annotations.as_slice()))
                }
                ContentPart::Other => None,
            })
    }
}

impl OpenAiAdapter {
    pub fn new(
        endpoint: Arc<dyn JsonEndpoint>,
        model_id: impl Into<String>,
        vector_store_id: impl Into<String>,
        max_num_results: u32,
    ) -> Self {
        Self {
            endpoint,
            model_id: model_id.into(),
            vector_store_id: vector_store_id.into(),
            max_num_results,
            previous: ThreadStore::new(),
        }
    }

    pub async fn from_config(config: &OpenAiConfig) -> Result<Self, AdapterError> {
        let vector_store_id = require_config(&config.vector_store_id, "openai.vector_store_id")?;
        let api_key = require_env("OPENAI_API_KEY")?;

        let endpoint: Arc<dyn JsonEndpoint> = Arc::new(JsonTransport::new(
            &config.base_url,
            Auth::Bearer(api_key),
            Duration::from_secs(120),
        )?);

        let catalog = EndpointCatalog::new(endpoint.clone(), "openai", "models", |v| {
            ids_from_array(v, "data", "id", "/")
        });
        let model_id = resolve_from_catalog(&catalog, &config.model).await?;

        Ok(Self::new(
            endpoint,
            model_id,
            vector_store_id,
            config.max_num_results,
        ))
    }
}

#[async_trait]
impl EvaluatorAdapter for OpenAiAdapter {
    fn mode(&self) -> EvalMode {
        EvalMode::Openai
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

        let request = ResponsesRequest {
            model: &self.model_id,
            input: question,
            tools: vec![FileSearchTool {
                kind: "file_search",
                vector_store_ids: [self.vector_store_id.as_str()],
                max_num_results: self.max_num_results,
            }],
            include: ["file_search_call.results"],
            previous_response_id: self.previous.get(thread_id),
        };
        let body = serde_json::to_value(&request).map_err(|e| AdapterError::malformed("openai", e))?;
        let raw = self.endpoint.post("responses", &body).await?;
        let response: ResponsesResponse =
            serde_json::from_value(raw).map_err(|e| AdapterError::malformed("openai", e))?;

        self.previous.set(thread_id, response.id.clone());

        let sources = response.sources();
        let debug_info = debug.then(|| {
            json!({
                "response_id": response.id,
                "model": self.model_id,
                "vector_store_id": self.vector_store_id,
            })
        });

        Ok(AdapterResponse {
            answer: response.answer(),
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

    struct FakeOpenAi {
        requests: Mutex<Vec<Value>>,
        counter: Mutex<u32>,
    }

    impl FakeOpenAi {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                requests: Mutex::new(Vec::new()),
                counter: Mutex::new(0),
            })
        }
    }

    #[async_trait]
    impl JsonEndpoint for FakeOpenAi {
        async fn post(&self, _path: &str, body: &Value) -> Result<Value, HttpError> {
            self.requests.lock().unwrap().push(body.clone());
            let mut counter = self.counter.lock().unwrap();
            *counter += 1;
            Ok(json!({
                "id": format!("resp_{}", counter),
                "output": [
                    {"type": "file_search_call", "id": "fs_1", "status": "completed"},
                    {
                        "type": "message",
                        "role": "assistant",
                        "content": [{
                            "type": "output_text",
                            "text": "Keep it above 25 psi.",
                            "annotations": [
                                {"type": "file_citation", "file_id": "file-1", "filename": "engine.pdf", "index": 10},
                                {"type": "file_citation", "file_id": "file-1", "filename": "engine.pdf", "index": 20},
                                {"type": "file_citation", "file_id": "file-2", "index": 21},
                                {"type": "url_citation", "url": "https://example.com"}
                            ]
                        }]
                    }
                ]
            }))
        }

        async fn get(&self, _path: &str) -> Result<Value, HttpError> {
            Ok(json!({"data": [{"id": "gpt-4.1"}, {"id": "gpt-4.1-mini"}, {"id": "gpt-4o"}]}))
        }
    }

    #[tokio::test]
    async fn test_citations_from_annotations() {
        let fake = FakeOpenAi::new();
        let adapter = OpenAiAdapter::new(fake.clone(), "gpt-4.1", "vs_123", 20);

        let response = adapter.query("oil pressure?", false).await.unwrap();

        assert_eq!(response.answer, "Keep it above 25 psi.");
        let docs: Vec<&str> = response.sources.iter().map(|s| s.doc.as_str()).collect();
        assert_eq!(docs, vec!["engine.pdf", "file-2"]);
        assert!(response.sources.iter().all(|s| s.page == Page::not_available()));

        let requests = fake.requests.lock().unwrap();
        assert_eq!(requests[0]["tools"][0]["type"], "file_search");
        assert_eq!(requests[0]["tools"][0]["vector_store_ids"][0], "vs_123");
        assert!(requests[0].get("previous_response_id").is_none());
    }

    #[tokio::test]
    async fn test_previous_response_id_per_thread() {
        let fake = FakeOpenAi::new();
        let adapter = OpenAiAdapter::new(fake.clone(), "gpt-4.1", "vs_123", 20);

        adapter.query_in_thread("t1", "first", false).await.unwrap();
        adapter.query_in_thread("t2", "other", false).await.unwrap();
        adapter.query_in_thread("t1", "follow up", false).await.unwrap();

        let requests = fake.requests.lock().unwrap();
        assert!(requests[1].get("previous_response_id").is_none());
        assert_eq!(requests[2]["previous_response_id"], "resp_1");
    }

    #[tokio::test]
    async fn test_model_resolution_prefers_plain_variant() {
        let catalog = EndpointCatalog::new(FakeOpenAi::new(), "openai", "models", |v| {
            ids_from_array(v, "data", "id", "/")
        });
        assert_eq!(resolve_from_catalog(&catalog, "4.1").await.unwrap(), "gpt-4.1");
    }
}
