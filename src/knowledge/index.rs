//! 하이브리드 인덱스 - FTS5 (sparse) + LanceDB (dense)
//!
//! 표준 경로는 `fused_search` 한 번의 호출로 prefetch + RRF + top-K 절단을
//! 인덱스 경계 안에서 끝냅니다. 디버그 경로와 dense 모드는 `search_source`로
//! 개별 소스를 직접 조회합니다.
//!
//! 소스 하나가 실패하면 남은 소스로 통합하고 결과를 partial로 표시합니다.
//! 모든 소스가 실패하면 빈 결과 대신 에러를 반환합니다.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::embedding::{EmbedTask, EmbeddingProvider};

use super::candidate::{Candidate, ChunkPayload, SourceTag};
use super::fusion::{FusedResult, FusionEngine, FusionError, RankedList};
use super::lance::{LanceVectorStore, VectorEntry};
use super::store::{ChunkStore, StoreStats};

/// 인덱싱 시 임베딩 배치 크기
const INDEX_BATCH_SIZE: usize = 64;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("invalid retrieval limits: top_k={top_k}, prefetch_limit={prefetch_limit} (need 0 < top_k <= prefetch_limit)")]
    InvalidLimits { top_k: usize, prefetch_limit: usize },

    #[error("all candidate sources failed: {}", describe_failures(.0))]
    AllSourcesFailed(Vec<SourceFailure>),

    #[error(transparent)]
    Fusion(#[from] FusionError),
}

/// 실패한 후보 소스
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceFailure {
    pub tag: SourceTag,
    pub message: String,
}

/// 통합 검색 결과
#[derive(Debug, Clone)]
pub struct FusedSearch {
    pub results: Vec<FusedResult>,
    /// 실패해서 통합에서 빠진 소스 (비어 있으면 전체 소스 사용)
    pub failed_sources: Vec<SourceFailure>,
}

impl FusedSearch {
    pub fn is_partial(&self) -> bool {
        !self.failed_sources.is_empty()
    }
}

fn describe_failures(failures: &[SourceFailure]) -> String {
    if failures.is_empty() {
        return "no sources queried".to_string();
    }
    failures
        .iter()
        .map(|f| format!("{}: {}", f.tag, f.message))
        .collect::<Vec<_>>()
        .join("; ")
}

/// 살아남은 소스만으로 통합
///
/// 하나 이상 성공하면 나머지 실패는 `failed_sources`에 기록합니다.
pub fn fuse_surviving(
    engine: &FusionEngine,
    outcomes: Vec<(SourceTag, Result<Vec<Candidate>>)>,
    provenance: bool,
) -> Result<FusedSearch, RetrievalError> {
    let mut lists = Vec::with_capacity(outcomes.len());
    let mut failed_sources = Vec::new();

    for (tag, outcome) in outcomes {
        match outcome {
            Ok(candidates) => lists.push(RankedList::new(tag, candidates)),
            Err(e) => {
                tracing::warn!("{} source failed, degrading: {:#}", tag, e);
                failed_sources.push(SourceFailure {
                    tag,
                    message: format!("{:#}", e),
                });
            }
        }
    }

    if lists.is_empty() {
        return Err(RetrievalError::AllSourcesFailed(failed_sources));
    }

    let results = if provenance {
        engine.fuse_with_provenance(&lists)?
    } else {
        engine.fuse(&lists)?
    };

    Ok(FusedSearch {
        results,
        failed_sources,
    })
}

// ============================================================================
// HybridIndex Trait
// ============================================================================

/// 검색 인덱스의 공통 인터페이스
#[async_trait]
pub trait HybridIndex: Send + Sync {
    /// 단일 후보 소스 조회 (1-based 순위)
    async fn search_source(&self, tag: SourceTag, query: &str, limit: usize)
        -> Result<Vec<Candidate>>;

    /// 표준 경로: 소스별 `prefetch_limit`개 prefetch → RRF → `top_k` 절단
    async fn fused_search(
        &self,
        query: &str,
        prefetch_limit: usize,
        top_k: usize,
    ) -> Result<FusedSearch, RetrievalError>;
}

// ============================================================================
// LocalHybridIndex
// ============================================================================

/// 로컬 하이브리드 인덱스
///
/// SQLite FTS5 (키워드) + LanceDB (벡터)
pub struct LocalHybridIndex {
    store: ChunkStore,
    vector: LanceVectorStore,
    embedder: Arc<dyn EmbeddingProvider>,
    engine: FusionEngine,
}

/// 인덱스 통계
#[derive(Debug, Clone, Serialize)]
pub struct IndexStats {
    pub store: StoreStats,
    pub vector_count: usize,
}

impl LocalHybridIndex {
    /// 데이터 디렉토리에서 열기 (chunks.db + vectors.lance)
    pub async fn open(
        data_dir: &Path,
        embedder: Arc<dyn EmbeddingProvider>,
        engine: FusionEngine,
    ) -> Result<Self> {
        if !data_dir.exists() {
            std::fs::create_dir_all(data_dir).context("Failed to create data directory")?;
        }

        let store = ChunkStore::open(&data_dir.join("chunks.db"))
            .context("Failed to open chunk store")?;
        let vector = LanceVectorStore::open(&data_dir.join("vectors.lance"))
            .await
            .context("Failed to open vector store")?;

        Ok(Self {
            store,
            vector,
            embedder,
            engine,
        })
    }

    /// 청크 인덱싱 (자동 임베딩)
    ///
    /// 추출/청킹은 외부에서 끝난 상태로 들어옵니다.
    pub async fn index_chunks(&self, chunks: &[ChunkPayload]) -> Result<usize> {
        let mut indexed = 0;

        for batch in chunks.chunks(INDEX_BATCH_SIZE) {
            let mut entries = Vec::with_capacity(batch.len());
            for chunk in batch {
                let embedding = self
                    .embedder
                    .embed(&chunk.text, EmbedTask::Document)
                    .await
                    .with_context(|| format!("Failed to embed chunk {}", chunk.chunk_id))?;

                self.store.upsert_chunk(chunk)?;
                entries.push(VectorEntry {
                    payload: chunk.clone(),
                    embedding,
                });
            }

            indexed += self
                .vector
                .insert_batch(&entries)
                .await
                .context("Failed to insert vectors")?;

            tracing::info!("Indexed {}/{} chunks", indexed, chunks.len());
        }

        Ok(indexed)
    }

    /// 문서 삭제 (SQLite + LanceDB)
    pub async fn delete_document(&self, doc_id: &str) -> Result<usize> {
        let ids = self.store.delete_document(doc_id)?;
        let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        self.vector.delete_by_chunk_ids(&refs).await?;
        Ok(ids.len())
    }

    pub async fn stats(&self) -> Result<IndexStats> {
        Ok(IndexStats {
            store: self.store.stats()?,
            vector_count: self.vector.count().await?,
        })
    }
}

#[async_trait]
impl HybridIndex for LocalHybridIndex {
    async fn search_source(
        &self,
        tag: SourceTag,
        query: &str,
        limit: usize,
    ) -> Result<Vec<Candidate>> {
        match tag {
            SourceTag::Dense => {
                let embedding = self.embedder.embed(query, EmbedTask::Query).await?;
                self.vector.search_dense(&embedding, limit).await
            }
            SourceTag::Sparse => self.store.search_sparse(query, limit),
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
            &self.engine,
            vec![(SourceTag::Dense, dense), (SourceTag::Sparse, sparse)],
            false,
        )?;
        fused.results.truncate(top_k);
        Ok(fused)
    }
}

/// JSONL 청크 레코드 로드 (한 줄에 ChunkPayload 하나)
pub fn load_chunk_records(path: &Path) -> Result<Vec<ChunkPayload>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read chunk file: {:?}", path))?;

    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            serde_json::from_str::<ChunkPayload>(line)
                .with_context(|| format!("Invalid chunk record on line {}", i + 1))
        })
        .collect()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::candidate::PageIndex;
    use crate::knowledge::lance::EMBEDDING_DIMENSION;
    use tempfile::TempDir;

    /// 단어 해시 기반 결정적 임베딩
    struct BagOfWordsEmbedding;

    #[async_trait]
    impl EmbeddingProvider for BagOfWordsEmbedding {
        async fn embed(&self, text: &str, _task: EmbedTask) -> Result<Vec<f32>> {
            let mut v = vec![0.0f32; EMBEDDING_DIMENSION as usize];
            for word in text.split_whitespace() {
                let slot = word
                    .to_lowercase()
                    .bytes()
                    .fold(7usize, |h, b| h.wrapping_mul(31).wrapping_add(b as usize));
                let len = v.len();
                v[slot % len] += 1.0;
            }
            Ok(v)
        }

        fn dimension(&self) -> usize {
            EMBEDDING_DIMENSION as usize
        }

        fn name(&self) -> &str {
            "bag-of-words"
        }
    }

    fn chunk(id: &str, text: &str) -> ChunkPayload {
        ChunkPayload {
            chunk_id: id.to_string(),
            doc_id: format!("{}.pdf", id),
            page: Some(PageIndex(0)),
            url: None,
            text: text.to_string(),
        }
    }

    fn ranked(tag: SourceTag, ids: &[&str]) -> Vec<Candidate> {
        Candidate::ranked(tag, ids.iter().map(|id| (1.0, chunk(id, ""))).collect())
    }

    #[test]
    fn test_fuse_surviving_partial() {
        let engine = FusionEngine::default();
        let fused = fuse_surviving(
            &engine,
            vec![
                (SourceTag::Dense, Err(anyhow::anyhow!("timeout"))),
                (SourceTag::Sparse, Ok(ranked(SourceTag::Sparse, &["a", "b"]))),
            ],
            false,
        )
        .unwrap();

        assert!(fused.is_partial());
        assert_eq!(fused.failed_sources[0].tag, SourceTag::Dense);
        assert_eq!(fused.results.len(), 2);
        assert_eq!(fused.results[0].id, "a");
    }

    #[test]
    fn test_fuse_surviving_all_failed() {
        let engine = FusionEngine::default();
        let err = fuse_surviving(
            &engine,
            vec![
                (SourceTag::Dense, Err(anyhow::anyhow!("timeout"))),
                (SourceTag::Sparse, Err(anyhow::anyhow!("malformed response"))),
            ],
            false,
        )
        .unwrap_err();

        match err {
            RetrievalError::AllSourcesFailed(failures) => assert_eq!(failures.len(), 2),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_fuse_surviving_empty_but_successful() {
        let engine = FusionEngine::default();
        let fused = fuse_surviving(
            &engine,
            vec![
                (SourceTag::Dense, Ok(vec![])),
                (SourceTag::Sparse, Ok(vec![])),
            ],
            false,
        )
        .unwrap();

        assert!(!fused.is_partial());
        assert!(fused.results.is_empty());
    }

    #[tokio::test]
    async fn test_local_index_fused_search() {
        let dir = TempDir::new().unwrap();
        let index = LocalHybridIndex::open(
            dir.path(),
            Arc::new(BagOfWordsEmbedding),
            FusionEngine::default(),
        )
        .await
        .unwrap();

        let indexed = index
            .index_chunks(&[
                chunk("c1", "engine oil pressure limits"),
                chunk("c2", "cabin temperature control"),
                chunk("c3", "oil filter replacement"),
            ])
            .await
            .unwrap();
        assert_eq!(indexed, 3);

        let sparse = index
            .search_source(SourceTag::Sparse, "oil pressure", 10)
            .await
            .unwrap();
        assert_eq!(sparse[0].id, "c1");

        let fused = index.fused_search("oil pressure", 10, 2).await.unwrap();
        assert!(!fused.is_partial());
        assert_eq!(fused.results.len(), 2);
        assert_eq!(fused.results[0].id, "c1");
        assert_eq!(fused.results[0].contributing_sources.len(), 2);

        let stats = index.stats().await.unwrap();
        assert_eq!(stats.store.chunk_count, 3);
        assert_eq!(stats.vector_count, 3);

        assert_eq!(index.delete_document("c2.pdf").await.unwrap(), 1);
        assert_eq!(index.stats().await.unwrap().vector_count, 2);
    }

    #[test]
    fn test_load_chunk_records() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("chunks.jsonl");
        std::fs::write(
            &path,
            "{\"chunk_id\":\"c1\",\"doc_id\":\"a.pdf\",\"page\":0,\"text\":\"hello\"}\n\n\
             {\"chunk_id\":\"c2\",\"doc_id\":\"a.pdf\",\"text\":\"world\"}\n",
        )
        .unwrap();

        let records = load_chunk_records(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].page, Some(PageIndex(0)));
        assert_eq!(records[1].page, None);

        std::fs::write(&path, "not json\n").unwrap();
        let err = load_chunk_records(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("line 1"));
    }
}
