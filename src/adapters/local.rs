//! 로컬 검색 어댑터 (hybrid / dense)
//!
//! 검색 파이프라인으로 청크를 모은 뒤 Gemini로 답변을 생성합니다.
//! 출처는 생성된 텍스트가 아니라 검색된 청크 메타데이터에서 옵니다.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::json;

use crate::config::RetrievalConfig;
use crate::generation::Generator;
use crate::knowledge::{
    ChunkPayload, RetrievalOutput, RetrievalPipeline, RetrievalRequest, RetrievalStrategy,
};

use super::conversation::{render_history, History, Turn};
use super::{
    dedup_sources, AdapterError, AdapterResponse, EvalMode, EvaluatorAdapter, Page, SourceRef,
};

pub struct LocalAdapter {
    mode: EvalMode,
    strategy: RetrievalStrategy,
    pipeline: RetrievalPipeline,
    generator: Arc<dyn Generator>,
    top_k: usize,
    prefetch_limit: usize,
    history: History,
    max_history_turns: usize,
}

impl LocalAdapter {
    pub fn new(
        mode: EvalMode,
        pipeline: RetrievalPipeline,
        generator: Arc<dyn Generator>,
        retrieval: &RetrievalConfig,
        max_history_turns: usize,
    ) -> Result<Self, AdapterError> {
        let strategy = match mode {
            EvalMode::Hybrid => RetrievalStrategy::Hybrid,
            EvalMode::Dense => RetrievalStrategy::DenseOnly,
            other => {
                return Err(AdapterError::Config(format!(
                    "{} is not a local retrieval mode",
                    other
                )))
            }
        };

        Ok(Self {
            mode,
            strategy,
            pipeline,
            generator,
            top_k: retrieval.top_k,
            prefetch_limit: retrieval.prefetch_limit,
            history: History::new(),
            max_history_turns,
        })
    }
}

/// 청크 → 출처 (검색 순위 순서, (doc, page) 중복 제거)
fn sources_from_chunks<'a>(chunks: impl Iterator<Item = &'a ChunkPayload>) -> Vec<SourceRef> {
    dedup_sources(
        chunks
            .map(|chunk| SourceRef {
                doc: chunk.doc_id.clone(),
                page: Page::from(chunk.page),
                url: chunk.url.clone().unwrap_or_default(),
            })
            .collect(),
    )
}

/// 검색된 청크로 답변 프롬프트 구성
pub(crate) fn build_prompt<'a>(
    question: &str,
    excerpts: impl Iterator<Item = (String, &'a str)>,
    history: &[Turn],
) -> String {
    let mut context = String::new();
    for (i, (label, text)) in excerpts.enumerate() {
        context.push_str(&format!("[{}] {}\n{}\n\n", i + 1, label, text.trim()));
    }
    if context.is_empty() {
        context.push_str("(no relevant documents were retrieved)\n");
    }

    let mut prompt = String::from(
        "Answer the question using only the document excerpts below. \
         If the excerpts do not contain the answer, say so.\n\n",
    );
    if !history.is_empty() {
        prompt.push_str("Previous conversation:\n");
        prompt.push_str(&render_history(history));
        prompt.push_str("\n\n");
    }
    prompt.push_str("Excerpts:\n");
    prompt.push_str(&context);
    prompt.push_str(&format!("Question: {}\nAnswer:", question));
    prompt
}

fn excerpt_label(chunk: &ChunkPayload) -> String {
    format!("{} (page {})", chunk.doc_id, Page::from(chunk.page))
}

fn local_debug_info(output: &RetrievalOutput, debug: bool, model: &str) -> Option<serde_json::Value> {
    if debug {
        let mut info = output.debug_info();
        info["model"] = json!(model);
        Some(info)
    } else if output.is_partial() {
        Some(json!({
            "partial_sources": true,
            "failed_sources": output.failed_sources,
        }))
    } else {
        None
    }
}

#[async_trait]
impl EvaluatorAdapter for LocalAdapter {
    fn mode(&self) -> EvalMode {
        self.mode
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

        let request = RetrievalRequest::new(question)
            .limits(self.top_k, self.prefetch_limit)
            .strategy(self.strategy)
            .debug(debug);
        let output = self.pipeline.retrieve(&request).await?;

        let turns = self.history.turns(thread_id);
        let prompt = build_prompt(
            question,
            output
                .chunks()
                .map(|c| (excerpt_label(c), c.text.as_str())),
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

        Ok(AdapterResponse {
            sources: sources_from_chunks(output.chunks()),
            debug_info: local_debug_info(&output, debug, self.generator.model()),
            answer,
            response_time_ms: start.elapsed().as_secs_f64() * 1000.0,
        })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::{
        fuse_surviving, Candidate, FusedSearch, FusionEngine, HybridIndex, PageIndex,
        RetrievalError, SourceTag,
    };
    use std::sync::Mutex;

    struct FakeIndex {
        sparse_fails: bool,
    }

    fn chunk(id: &str, doc: &str, page: Option<u32>) -> ChunkPayload {
        ChunkPayload {
            chunk_id: id.to_string(),
            doc_id: doc.to_string(),
            page: page.map(PageIndex),
            url: None,
            text: format!("excerpt {}", id),
        }
    }

    #[async_trait]
    impl HybridIndex for FakeIndex {
        async fn search_source(
            &self,
            tag: SourceTag,
            _query: &str,
            _limit: usize,
        ) -> anyhow::Result<Vec<Candidate>> {
            match tag {
                SourceTag::Dense => Ok(Candidate::ranked(
                    tag,
                    vec![
                        (0.9, chunk("c1", "engine.pdf", Some(0))),
                        (0.8, chunk("c2", "engine.pdf", Some(0))),
                        (0.7, chunk("c3", "notes.txt", None)),
                    ],
                )),
                SourceTag::Sparse if self.sparse_fails => anyhow::bail!("fts unavailable"),
                SourceTag::Sparse => Ok(Candidate::ranked(
                    tag,
                    vec![(5.0, chunk("c2", "engine.pdf", Some(0)))],
                )),
            }
        }

        async fn fused_search(
            &self,
            query: &str,
            prefetch_limit: usize,
            top_k: usize,
        ) -> Result<FusedSearch, RetrievalError> {
            let dense = self.search_source(SourceTag::Dense, query, prefetch_limit).await;
            let sparse = self.search_source(SourceTag::Sparse, query, prefetch_limit).await;
            let mut fused = fuse_surviving(
                &FusionEngine::default(),
                vec![(SourceTag::Dense, dense), (SourceTag::Sparse, sparse)],
                false,
            )?;
            fused.results.truncate(top_k);
            Ok(fused)
        }
    }

    #[derive(Default)]
    struct EchoGenerator {
        prompts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Generator for EchoGenerator {
        async fn generate(&self, prompt: &str) -> anyhow::Result<String> {
            let mut prompts = self.prompts.lock().unwrap();
            prompts.push(prompt.to_string());
            Ok(format!("answer #{}", prompts.len()))
        }

        fn model(&self) -> &str {
            "gemini-2.5-flash"
        }
    }

    fn adapter(mode: EvalMode, sparse_fails: bool, generator: Arc<EchoGenerator>) -> LocalAdapter {
        let pipeline = RetrievalPipeline::new(
            Arc::new(FakeIndex { sparse_fails }),
            FusionEngine::default(),
        );
        LocalAdapter::new(mode, pipeline, generator, &RetrievalConfig::default(), 10).unwrap()
    }

    #[tokio::test]
    async fn test_sources_from_chunks_one_based_and_deduped() {
        let generator = Arc::new(EchoGenerator::default());
        let response = adapter(EvalMode::Hybrid, false, generator)
            .query("oil pressure?", false)
            .await
            .unwrap();

        assert_eq!(response.answer, "answer #1");
        assert_eq!(
            response.sources,
            vec![
                SourceRef {
                    doc: "engine.pdf".to_string(),
                    page: Page::Number(1),
                    url: String::new(),
                },
                SourceRef {
                    doc: "notes.txt".to_string(),
                    page: Page::not_available(),
                    url: String::new(),
                },
            ]
        );
        assert!(response.debug_info.is_none());
    }

    #[tokio::test]
    async fn test_partial_sources_surface_in_debug_info() {
        let generator = Arc::new(EchoGenerator::default());
        let response = adapter(EvalMode::Hybrid, true, generator)
            .query("oil pressure?", false)
            .await
            .unwrap();

        let info = response.debug_info.unwrap();
        assert_eq!(info["partial_sources"], true);
        assert_eq!(info["failed_sources"][0]["tag"], "sparse");
    }

    #[tokio::test]
    async fn test_debug_includes_provenance() {
        let generator = Arc::new(EchoGenerator::default());
        let response = adapter(EvalMode::Hybrid, false, generator)
            .query("oil pressure?", true)
            .await
            .unwrap();

        let info = response.debug_info.unwrap();
        assert_eq!(info["model"], "gemini-2.5-flash");
        assert_eq!(info["results"][0]["id"], "c2");
        assert_eq!(info["results"][0]["provenance"]["origin"], "both");
    }

    #[tokio::test]
    async fn test_threads_do_not_share_history() {
        let generator = Arc::new(EchoGenerator::default());
        let adapter = adapter(EvalMode::Dense, false, generator.clone());

        adapter.query_in_thread("t1", "first question", false).await.unwrap();
        adapter.query_in_thread("t2", "unrelated", false).await.unwrap();
        adapter.query_in_thread("t1", "follow up", false).await.unwrap();

        let prompts = generator.prompts.lock().unwrap();
        assert!(!prompts[1].contains("first question"));
        assert!(prompts[2].contains("User: first question"));
        assert!(!prompts[2].contains("unrelated"));
    }

    #[test]
    fn test_managed_mode_rejected() {
        let pipeline = RetrievalPipeline::new(
            Arc::new(FakeIndex { sparse_fails: false }),
            FusionEngine::default(),
        );
        let result = LocalAdapter::new(
            EvalMode::Bedrock,
            pipeline,
            Arc::new(EchoGenerator::default()),
            &RetrievalConfig::default(),
            10,
        );
        assert!(matches!(result, Err(AdapterError::Config(_))));
    }
}
