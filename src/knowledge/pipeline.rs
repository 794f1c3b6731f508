//! 검색 파이프라인 - 질문 → 상위 K개 청크
//!
//! - 표준 경로: 인덱스의 통합 검색을 한 번 호출
//! - 디버그 경로: dense/sparse를 병렬로 조회한 뒤 로컬에서 통합 (출처 포함)
//! - dense 모드: 임베딩 검색만 사용
//!
//! 점수 하한/문서 허용 목록 필터는 통합 목록 전체에 먼저 적용한 뒤 `top_k`로 절단합니다.
//! 필터가 있으면 표준 경로도 절단 전 전체 통합 목록을 받아옵니다.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::{json, Value};

use super::candidate::{ChunkPayload, SourceTag};
use super::fusion::{FusedResult, FusionEngine};
use super::index::{fuse_surviving, FusedSearch, HybridIndex, RetrievalError, SourceFailure};

/// 기본 반환 개수
pub const DEFAULT_TOP_K: usize = 20;
/// 소스별 기본 prefetch 개수
pub const DEFAULT_PREFETCH_LIMIT: usize = 100;

// ============================================================================
// Types
// ============================================================================

/// 후보 소스 선택
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrievalStrategy {
    /// dense + sparse RRF 통합
    Hybrid,
    /// 임베딩 검색만
    DenseOnly,
}

/// 검색 요청
#[derive(Debug, Clone)]
pub struct RetrievalRequest<'a> {
    pub query: &'a str,
    pub top_k: usize,
    pub prefetch_limit: usize,
    pub debug: bool,
    pub strategy: RetrievalStrategy,
}

impl<'a> RetrievalRequest<'a> {
    pub fn new(query: &'a str) -> Self {
        Self {
            query,
            top_k: DEFAULT_TOP_K,
            prefetch_limit: DEFAULT_PREFETCH_LIMIT,
            debug: false,
            strategy: RetrievalStrategy::Hybrid,
        }
    }

    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn strategy(mut self, strategy: RetrievalStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn limits(mut self, top_k: usize, prefetch_limit: usize) -> Self {
        self.top_k = top_k;
        self.prefetch_limit = prefetch_limit;
        self
    }
}

/// 통합 후 적용되는 필터
#[derive(Debug, Clone, Default)]
pub struct PostFilter {
    /// 통합 점수 하한
    pub min_fused_score: Option<f64>,
    /// 허용 문서 ID (None이면 전체 허용)
    pub allowed_docs: Option<BTreeSet<String>>,
}

impl PostFilter {
    fn is_active(&self) -> bool {
        self.min_fused_score.is_some() || self.allowed_docs.is_some()
    }

    fn keep(&self, result: &FusedResult) -> bool {
        if let Some(min) = self.min_fused_score {
            if result.fused_score < min {
                return false;
            }
        }
        match &self.allowed_docs {
            Some(docs) => docs.contains(&result.payload.doc_id),
            None => true,
        }
    }
}

/// 검색 결과
#[derive(Debug, Clone)]
pub struct RetrievalOutput {
    pub results: Vec<FusedResult>,
    pub failed_sources: Vec<SourceFailure>,
    pub debug: bool,
}

impl RetrievalOutput {
    pub fn is_partial(&self) -> bool {
        !self.failed_sources.is_empty()
    }

    pub fn chunks(&self) -> impl Iterator<Item = &ChunkPayload> {
        self.results.iter().map(|r| &r.payload)
    }

    /// 디버그 정보 (출처 포함 순위 목록)
    pub fn debug_info(&self) -> Value {
        json!({
            "partial_sources": self.is_partial(),
            "failed_sources": self.failed_sources,
            "results": self.results,
        })
    }
}

// ============================================================================
// RetrievalPipeline
// ============================================================================

pub struct RetrievalPipeline {
    index: Arc<dyn HybridIndex>,
    engine: FusionEngine,
    filter: PostFilter,
}

impl RetrievalPipeline {
    pub fn new(index: Arc<dyn HybridIndex>, engine: FusionEngine) -> Self {
        Self {
            index,
            engine,
            filter: PostFilter::default(),
        }
    }

    pub fn with_filter(mut self, filter: PostFilter) -> Self {
        self.filter = filter;
        self
    }

    /// 질문에 대한 상위 `top_k`개 청크
    pub async fn retrieve(
        &self,
        request: &RetrievalRequest<'_>,
    ) -> Result<RetrievalOutput, RetrievalError> {
        let RetrievalRequest {
            query,
            top_k,
            prefetch_limit,
            debug,
            strategy,
        } = *request;

        if top_k == 0 || prefetch_limit < top_k {
            return Err(RetrievalError::InvalidLimits {
                top_k,
                prefetch_limit,
            });
        }

        let fused = match (strategy, debug) {
            (RetrievalStrategy::Hybrid, false) => {
                // 소스 2개 × prefetch가 통합 목록의 최대 길이
                let fetch_k = if self.filter.is_active() {
                    prefetch_limit.saturating_mul(2)
                } else {
                    top_k
                };
                self.index.fused_search(query, prefetch_limit, fetch_k).await?
            }
            (RetrievalStrategy::Hybrid, true) => {
                let (dense, sparse) = tokio::join!(
                    self.index.search_source(SourceTag::Dense, query, prefetch_limit),
                    self.index.search_source(SourceTag::Sparse, query, prefetch_limit),
                );
                fuse_surviving(
                    &self.engine,
                    vec![(SourceTag::Dense, dense), (SourceTag::Sparse, sparse)],
                    true,
                )?
            }
            (RetrievalStrategy::DenseOnly, _) => {
                let dense = self
                    .index
                    .search_source(SourceTag::Dense, query, prefetch_limit)
                    .await;
                fuse_surviving(&self.engine, vec![(SourceTag::Dense, dense)], debug)?
            }
        };

        let FusedSearch {
            mut results,
            failed_sources,
        } = fused;

        results.retain(|r| self.filter.keep(r));
        results.truncate(top_k);

        if !failed_sources.is_empty() {
            tracing::warn!(
                "Partial retrieval for '{}': {} source(s) failed",
                query,
                failed_sources.len()
            );
        }
        let debug_flag = debug;
        tracing::debug!("Retrieved {} chunks (debug={})", results.len(), debug_flag);

        Ok(RetrievalOutput {
            results,
            failed_sources,
            debug,
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
