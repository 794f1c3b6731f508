//! Vertex AI RAG Engine 어댑터
//!
//! Gemini generateContent 요청에 Vertex RAG retrieval tool을 붙여 호출합니다.
//! 출처는 `groundingMetadata.groundingChunks[].retrievedContext`에서 가져오며
//! RAG Engine은 페이지 정보를 주지 않으므로 항상 "N/A"입니다.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::VertexConfig;
use crate::http::{Auth, JsonEndpoint, JsonTransport};

use super::conversation::{History, Turn};
use super::models::{ids_from_array, resolve_from_catalog, EndpointCatalog};
use super::{
    dedup_sources, doc_name_from_uri, require_config, require_env, AdapterError, AdapterResponse,
    EvalMode, EvaluatorAdapter, Page, SourceRef,
};

pub struct VertexAdapter {
    endpoint: Arc<dyn JsonEndpoint>,
    model_path: String,
    model_id: String,
    corpus: String,
    similarity_top_k: u32,
    history: History,
    max_history_turns: usize,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VertexResponse {
    #[serde(default)]
    candidates: Vec<VertexCandidate>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VertexCandidate {
    #[serde(default)]
    content: Option<VertexContent>,
    #[serde(default)]
    grounding_metadata: Option<GroundingMetadata>,
}

#[derive(Debug, Deserialize)]
struct VertexContent {
    #[serde(default)]
    parts: Vec<VertexPart>,
}

#[derive(Debug, Deserialize)]
struct VertexPart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GroundingMetadata {
    #[serde(default)]
    grounding_chunks: Vec<GroundingChunk>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GroundingChunk {
    #[serde(default)]
    retrieved_context: Option<RetrievedContext>,
}

#[derive(Debug, Deserialize)]
struct RetrievedContext {
    #[serde(default)]
    uri: Option<String>,
    #[serde(default)]
    title: Option<String>,
}

impl RetrievedContext {
    fn source(&self) -> Option<SourceRef> {
        let doc = self
            .title
            .clone()
            .filter(|t| !t.is_empty())
            .or_else(|| self.uri.as_deref().map(doc_name_from_uri))?;
        Some(SourceRef {
            doc,
            page: Page::not_available(),
            url: self.uri.clone().unwrap_or_default(),
        })
    }
}

impl VertexAdapter {
    pub fn new(
        endpoint: Arc<dyn JsonEndpoint>,
        project: &str,
        location: &str,
        model_id: impl Into<String>,
        corpus: impl Into<String>,
        similarity_top_k: u32,
        max_history_turns: usize,
    ) -> Self {
        let model_id = model_id.into();
        Self {
            endpoint,
            model_path: format!(
                "projects/{}/locations/{}/publishers/google/models/{}",
                project, location, model_id
            ),
            model_id,
            corpus: corpus.into(),
            similarity_top_k,
            history: History::new(),
            max_history_turns,
        }
    }

    pub async fn from_config(
        config: &VertexConfig,
        max_history_turns: usize,
    ) -> Result<Self, AdapterError> {
        let project = require_config(&config.project, "vertex.project")?;
        let corpus = require_config(&config.corpus, "vertex.corpus")?;
        let token = require_env("VERTEX_ACCESS_TOKEN")?;

        let base = format!("https://{}-aiplatform.googleapis.com/v1beta1/", config.location);
        let endpoint: Arc<dyn JsonEndpoint> = Arc::new(JsonTransport::new(
            &base,
            Auth::Bearer(token),
            Duration::from_secs(120),
        )?);

        let catalog = EndpointCatalog::new(endpoint.clone(), "vertex", "publishers/google/models", |v| {
            ids_from_array(v, "publisherModels", "name", "/")
        });
        let model_id = resolve_from_catalog(&catalog, &config.model).await?;

        Ok(Self::new(
            endpoint,
            project,
            &config.location,
            model_id,
            corpus,
            config.similarity_top_k,
            max_history_turns,
        ))
    }

    fn build_request(&self, history: &[Turn], question: &str) -> Value {
        let mut contents: Vec<Value> = Vec::with_capacity(history.len() * 2 + 1);
        for turn in history {
            contents.push(json!({"role": "user", "parts": [{"text": turn.question}]}));
            contents.push(json!({"role": "model", "parts": [{"text": turn.answer}]}));
        }
        contents.push(json!({"role": "user", "parts": [{"text": question}]}));

        json!({
            "contents": contents,
            "tools": [{
                "retrieval": {
                    "vertexRagStore": {
                        "ragResources": [{"ragCorpus": self.corpus}],
                        "similarityTopK": self.similarity_top_k
                    }
                }
            }]
        })
    }
}

#[async_trait]
impl EvaluatorAdapter for VertexAdapter {
    fn mode(&self) -> EvalMode {
        EvalMode::Vertex
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

        let body = self.build_request(&self.history.turns(thread_id), question);
        let raw = self
            .endpoint
            .post(&format!("{}:generateContent", self.model_path), &body)
            .await?;
        let response: VertexResponse =
            serde_json::from_value(raw).map_err(|e| AdapterError::malformed("vertex", e))?;

        let candidate = response
            .candidates
            .first()
            .ok_or_else(|| AdapterError::malformed("vertex", "response has no candidates"))?;

        let answer: String = candidate
            .content
            .as_ref()
            .map(|c| c.parts.iter().filter_map(|p| p.text.as_deref()).collect())
            .unwrap_or_default();

        let chunks = candidate
            .grounding_metadata
            .as_ref()
            .map(|g| g.grounding_chunks.as_slice())
            .unwrap_or_default();
        let sources = dedup_sources(
            chunks
                .iter()
                .filter_map(|c| c.retrieved_context.as_ref())
                .filter_map(RetrievedContext::source)
                .collect(),
        );

        self.history.push_turn(
            thread_id,
            Turn {
                question: question.to_string(),
                answer: answer.clone(),
            },
            self.max_history_turns,
        );

        let debug_info = debug.then(|| {
            json!({
                "model": self.model_id,
                "corpus": self.corpus,
                "grounding_chunks": chunks.len(),
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::HttpError;
    use std::sync::Mutex;

    struct FakeVertex {
        requests: Mutex<Vec<(String, Value)>>,
        response: Value,
    }

    #[async_trait]
    impl JsonEndpoint for FakeVertex {
        async fn post(&self, path: &str, body: &Value) -> Result<Value, HttpError> {
            self.requests
                .lock()
                .unwrap()
                .push((path.to_string(), body.clone()));
            Ok(self.response.clone())
        }

        async fn get(&self, _path: &str) -> Result<Value, HttpError> {
            Ok(json!({"publisherModels": [{"name": "publishers/google/models/gemini-2.5-flash"}]}))
        }
    }

    fn fake(response: Value) -> Arc<FakeVertex> {
        Arc::new(FakeVertex {
            requests: Mutex::new(Vec::new()),
            response,
        })
    }

    fn adapter(fake: Arc<FakeVertex>) -> VertexAdapter {
        VertexAdapter::new(
            fake,
            "proj",
            "us-central1",
            "gemini-2.5-flash",
            "projects/proj/locations/us-central1/ragCorpora/42",
            20,
            10,
        )
    }

    fn grounded_response() -> Value {
        json!({
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": "Above 25 psi."}]},
                "groundingMetadata": {
                    "groundingChunks": [
                        {"retrievedContext": {"uri": "gs://bucket/engine.pdf", "title": "engine.pdf", "text": "..."}},
                        {"retrievedContext": {"uri": "gs://bucket/engine.pdf", "title": "engine.pdf", "text": "..."}},
                        {"retrievedContext": {"uri": "gs://bucket/faq.txt"}},
                        {"web": {"uri": "https://example.com"}}
                    ]
                }
            }]
        })
    }

    #[tokio::test]
    async fn test_sources_from_grounding_chunks() {
        let fake = fake(grounded_response());
        let response = adapter(fake.clone()).query("oil pressure?", false).await.unwrap();

        assert_eq!(response.answer, "Above 25 psi.");
        let docs: Vec<&str> = response.sources.iter().map(|s| s.doc.as_str()).collect();
        assert_eq!(docs, vec!["engine.pdf", "faq.txt"]);
        assert!(response.sources.iter().all(|s| s.page == Page::not_available()));

        let requests = fake.requests.lock().unwrap();
        assert_eq!(
            requests[0].0,
            "projects/proj/locations/us-central1/publishers/google/models/gemini-2.5-flash:generateContent"
        );
        assert_eq!(
            requests[0].1["tools"][0]["retrieval"]["vertexRagStore"]["ragResources"][0]["ragCorpus"],
            "projects/proj/locations/us-central1/ragCorpora/42"
        );
    }

    #[tokio::test]
    async fn test_history_sent_as_contents() {
        let fake = fake(grounded_response());
        let adapter = adapter(fake.clone());

        adapter.query_in_thread("t1", "first", false).await.unwrap();
        adapter.query_in_thread("t1", "second", false).await.unwrap();
        adapter.query_in_thread("t2", "fresh", false).await.unwrap();

        let requests = fake.requests.lock().unwrap();
        assert_eq!(requests[1].1["contents"].as_array().unwrap().len(), 3);
        assert_eq!(requests[1].1["contents"][1]["role"], "model");
        assert_eq!(requests[2].1["contents"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_no_candidates_is_malformed() {
        let err = adapter(fake(json!({"candidates": []})))
            .query("q", false)
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::MalformedResponse { backend: "vertex", .. }));
    }
}
