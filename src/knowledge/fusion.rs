//! RRF 통합 엔진 - 여러 순위 목록을 하나로 병합
//!
//! RRF (Reciprocal Rank Fusion) 알고리즘으로
//! 키워드 검색(FTS5)과 벡터 검색(LanceDB) 결과를 통합합니다.
//!
//! ref: https://www.elastic.co/blog/hybrid-search-rrf
//!
//! RRF Score = sum(1 / (k + rank)), rank는 1부터 시작
//!
//! 동점 처리: 통합 점수 내림차순 → 소스별 최소 순위 오름차순 → ID 오름차순

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use serde::Serialize;
use thiserror::Error;

use super::candidate::{Candidate, ChunkPayload, SourceTag};

/// RRF 기본 상수
pub const DEFAULT_RRF_K: f64 = 60.0;

// ============================================================================
// Types
// ============================================================================

/// 통합 계약 위반
#[derive(Debug, Error, Clone, PartialEq)]
pub enum FusionError {
    #[error("duplicate candidate id '{id}' in {tag} results")]
    DuplicateCandidate { tag: SourceTag, id: String },

    #[error("{tag} ranks must be contiguous from 1 (position {position} has rank {rank})")]
    NonContiguousRank {
        tag: SourceTag,
        position: usize,
        rank: usize,
    },

    #[error("source {0} supplied more than once")]
    DuplicateSource(SourceTag),

    #[error("candidate '{id}' is tagged {found} but listed under {expected}")]
    MislabelledCandidate {
        expected: SourceTag,
        found: SourceTag,
        id: String,
    },
}

/// 단일 소스의 순위 목록
#[derive(Debug, Clone)]
pub struct RankedList {
    pub tag: SourceTag,
    pub candidates: Vec<Candidate>,
}

impl RankedList {
    pub fn new(tag: SourceTag, candidates: Vec<Candidate>) -> Self {
        Self { tag, candidates }
    }
}

/// 결과 출처 분류 (디버그 모드)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Both,
    DenseOnly,
    SparseOnly,
}

/// 소스별 원 순위/점수
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SourceHit {
    pub rank: usize,
    pub score: f64,
}

/// 디버그 모드에서 추가되는 출처 정보
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Provenance {
    pub hits: BTreeMap<SourceTag, SourceHit>,
    pub origin: Origin,
}

/// 통합 결과
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FusedResult {
    /// 청크 ID
    pub id: String,
    /// RRF 통합 스코어 (높을수록 좋음)
    pub fused_score: f64,
    /// 기여한 소스
    pub contributing_sources: BTreeSet<SourceTag>,
    /// 소스별 순위
    pub per_source_rank: BTreeMap<SourceTag, usize>,
    /// 디버그 모드에서만 채워짐
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provenance: Option<Provenance>,
    pub payload: ChunkPayload,
}

impl FusedResult {
    /// 소스별 순위 중 가장 좋은(작은) 값
    pub fn min_rank(&self) -> usize {
        self.per_source_rank
            .values()
            .copied()
            .min()
            .unwrap_or(usize::MAX)
    }
}

// ============================================================================
// FusionEngine
// ============================================================================

/// RRF 통합 엔진
#[derive(Debug, Clone, Copy)]
pub struct FusionEngine {
    k: f64,
}

impl Default for FusionEngine {
    fn default() -> Self {
        Self { k: DEFAULT_RRF_K }
    }
}

struct Accum {
    score: f64,
    hits: BTreeMap<SourceTag, SourceHit>,
    payload: ChunkPayload,
}

impl FusionEngine {
    /// `k`는 양수여야 합니다 (설정 검증에서 보장).
    /// 작을수록 상위 순위에 더 큰 가중치를 줍니다.
    pub fn new(k: f64) -> Self {
        Self { k }
    }

    pub fn k(&self) -> f64 {
        self.k
    }

    /// 1-based 순위 하나의 기여분
    pub fn contribution(&self, rank: usize) -> f64 {
        1.0 / (self.k + rank as f64)
    }

    /// 순위 목록들을 RRF로 통합
    pub fn fuse(&self, lists: &[RankedList]) -> Result<Vec<FusedResult>, FusionError> {
        self.fuse_inner(lists, false)
    }

    /// 통합 + 소스별 순위/점수/출처 분류 첨부
    ///
    /// 정렬 순서는 `fuse`와 동일합니다.
    pub fn fuse_with_provenance(
        &self,
        lists: &[RankedList],
    ) -> Result<Vec<FusedResult>, FusionError> {
        self.fuse_inner(lists, true)
    }

    fn fuse_inner(
        &self,
        lists: &[RankedList],
        provenance: bool,
    ) -> Result<Vec<FusedResult>, FusionError> {
        let mut seen_tags = BTreeSet::new();
        let mut scores: HashMap<String, Accum> = HashMap::new();

        for list in lists {
            if !seen_tags.insert(list.tag) {
                return Err(FusionError::DuplicateSource(list.tag));
            }

            let mut ids: HashSet<&str> = HashSet::with_capacity(list.candidates.len());
            for (position, candidate) in list.candidates.iter().enumerate() {
                if candidate.source != list.tag {
                    return Err(FusionError::MislabelledCandidate {
                        expected: list.tag,
                        found: candidate.source,
                        id: candidate.id.clone(),
                    });
                }
                if candidate.rank != position + 1 {
                    return Err(FusionError::NonContiguousRank {
                        tag: list.tag,
                        position: position + 1,
                        rank: candidate.rank,
                    });
                }
                if !ids.insert(candidate.id.as_str()) {
                    return Err(FusionError::DuplicateCandidate {
                        tag: list.tag,
                        id: candidate.id.clone(),
                    });
                }

                let entry = scores
                    .entry(candidate.id.clone())
                    .or_insert_with(|| Accum {
                        score: 0.0,
                        hits: BTreeMap::new(),
                        payload: candidate.payload.clone(),
                    });
                entry.score += self.contribution(candidate.rank);
                entry.hits.insert(
                    list.tag,
                    SourceHit {
                        rank: candidate.rank,
                        score: candidate.score,
                    },
                );
            }
        }

        let mut results: Vec<FusedResult> = scores
            .into_iter()
            .map(|(id, acc)| {
                let per_source_rank = acc.hits.iter().map(|(tag, hit)| (*tag, hit.rank)).collect();
                let contributing_sources: BTreeSet<SourceTag> = acc.hits.keys().copied().collect();
                let provenance = provenance.then(|| Provenance {
                    origin: classify(&contributing_sources),
                    hits: acc.hits.clone(),
                });

                FusedResult {
                    id,
                    fused_score: acc.score,
                    contributing_sources,
                    per_source_rank,
                    provenance,
                    payload: acc.payload,
                }
            })
            .collect();

        results.sort_by(|a, b| {
            b.fused_score
                .total_cmp(&a.fused_score)
                .then_with(|| a.min_rank().cmp(&b.min_rank()))
                .then_with(|| a.id.cmp(&b.id))
        });

        Ok(results)
    }
}

fn classify(sources: &BTreeSet<SourceTag>) -> Origin {
    match (
        sources.contains(&SourceTag::Dense),
        sources.contains(&SourceTag::Sparse),
    ) {
        (true, false) => Origin::DenseOnly,
        (false, true) => Origin::SparseOnly,
        _ => Origin::Both,
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn list(tag: SourceTag, ids: &[&str]) -> RankedList {
        let scored = ids
            .iter()
            .enumerate()
            .map(|(i, id)| {
                (
                    1.0 - i as f64 * 0.1,
                    ChunkPayload {
                        chunk_id: id.to_string(),
                        doc_id: format!("{}.pdf", id),
                        page: None,
                        url: None,
                        text: String::new(),
                    },
                )
            })
            .collect();
        RankedList::new(tag, Candidate::ranked(tag, scored))
    }

    fn ids(results: &[FusedResult]) -> Vec<&str> {
        results.iter().map(|r| r.id.as_str()).collect()
    }

    #[test]
    fn test_dense_sparse_scenario() {
        let engine = FusionEngine::default();
        let dense = list(SourceTag::Dense, &["A", "B", "C"]);
        let sparse = list(SourceTag::Sparse, &["C", "A"]);

        let fused = engine.fuse(&[dense, sparse]).unwrap();

        // A: 1/61 + 1/62, C: 1/63 + 1/61, B: 1/62
        assert_eq!(ids(&fused), vec!["A", "C", "B"]);
        assert!((fused[0].fused_score - (1.0 / 61.0 + 1.0 / 62.0)).abs() < 1e-12);
        assert!((fused[1].fused_score - (1.0 / 63.0 + 1.0 / 61.0)).abs() < 1e-12);
        assert!((fused[2].fused_score - 1.0 / 62.0).abs() < 1e-12);
    }

    #[test]
    fn test_multi_source_boost() {
        let engine = FusionEngine::default();
        let fused = engine
            .fuse(&[
                list(SourceTag::Dense, &["x", "y"]),
                list(SourceTag::Sparse, &["z", "y"]),
            ])
            .unwrap();

        let y = fused.iter().find(|r| r.id == "y").unwrap();
        let expected = engine.contribution(2) + engine.contribution(2);
        assert!((y.fused_score - expected).abs() < 1e-12);
        assert!(y.fused_score > engine.contribution(2));
        assert_eq!(y.contributing_sources.len(), 2);
        assert_eq!(fused[0].id, "y");
    }

    #[test]
    fn test_scores_non_increasing() {
        let engine = FusionEngine::new(10.0);
        let fused = engine
            .fuse(&[
                list(SourceTag::Dense, &["a", "b", "c", "d", "e"]),
                list(SourceTag::Sparse, &["e", "d", "f", "a"]),
            ])
            .unwrap();

        assert!(fused
            .windows(2)
            .all(|w| w[0].fused_score >= w[1].fused_score));
    }

    #[test]
    fn test_empty_source_list() {
        let engine = FusionEngine::default();
        let fused = engine
            .fuse(&[
                list(SourceTag::Dense, &["a", "b"]),
                list(SourceTag::Sparse, &[]),
            ])
            .unwrap();

        assert_eq!(ids(&fused), vec!["a", "b"]);
        assert!((fused[0].fused_score - 1.0 / 61.0).abs() < 1e-12);
        assert_eq!(fused[1].per_source_rank.get(&SourceTag::Dense), Some(&2));
        assert_eq!(fused[1].per_source_rank.get(&SourceTag::Sparse), None);
    }

    #[test]
    fn test_duplicate_id_within_source_fails() {
        let engine = FusionEngine::default();
        let mut dense = list(SourceTag::Dense, &["a", "b"]);
        dense.candidates[1].id = "a".to_string();

        let err = engine.fuse(&[dense]).unwrap_err();
        assert_eq!(
            err,
            FusionError::DuplicateCandidate {
                tag: SourceTag::Dense,
                id: "a".to_string()
            }
        );
    }

    #[test]
    fn test_non_contiguous_rank_fails() {
        let engine = FusionEngine::default();
        let mut sparse = list(SourceTag::Sparse, &["a", "b"]);
        sparse.candidates[1].rank = 3;

        assert!(matches!(
            engine.fuse(&[sparse]),
            Err(FusionError::NonContiguousRank { rank: 3, .. })
        ));
    }

    #[test]
    fn test_duplicate_source_fails() {
        let engine = FusionEngine::default();
        let result = engine.fuse(&[
            list(SourceTag::Dense, &["a"]),
            list(SourceTag::Dense, &["b"]),
        ]);
        assert_eq!(result.unwrap_err(), FusionError::DuplicateSource(SourceTag::Dense));
    }

    #[test]
    fn test_mislabelled_candidate_fails() {
        let engine = FusionEngine::default();
        let mut dense = list(SourceTag::Dense, &["a", "b"]);
        dense.candidates[1].source = SourceTag::Sparse;

        assert_eq!(
            engine.fuse(&[dense]).unwrap_err(),
            FusionError::MislabelledCandidate {
                expected: SourceTag::Dense,
                found: SourceTag::Sparse,
                id: "b".to_string(),
            }
        );
    }

    #[test]
    fn test_tie_broken_by_id() {
        let engine = FusionEngine::default();
        let fused = engine
            .fuse(&[
                list(SourceTag::Sparse, &["beta"]),
                list(SourceTag::Dense, &["alpha"]),
            ])
            .unwrap();

        assert_eq!(fused[0].fused_score, fused[1].fused_score);
        assert_eq!(ids(&fused), vec!["alpha", "beta"]);
    }

    #[test]
    fn test_fuse_is_deterministic() {
        let engine = FusionEngine::default();
        let lists = [
            list(SourceTag::Dense, &["a", "b", "c", "d"]),
            list(SourceTag::Sparse, &["d", "c", "b", "a"]),
        ];

        let first = engine.fuse(&lists).unwrap();
        for _ in 0..20 {
            assert_eq!(engine.fuse(&lists).unwrap(), first);
        }
    }

    #[test]
    fn test_provenance_is_additive() {
        let engine = FusionEngine::default();
        let lists = [
            list(SourceTag::Dense, &["A", "B", "C"]),
            list(SourceTag::Sparse, &["C", "A", "D"]),
        ];

        let plain = engine.fuse(&lists).unwrap();
        let debug = engine.fuse_with_provenance(&lists).unwrap();

        assert_eq!(ids(&plain), ids(&debug));
        assert!(plain.iter().all(|r| r.provenance.is_none()));

        let origin = |id: &str| {
            debug
                .iter()
                .find(|r| r.id == id)
                .and_then(|r| r.provenance.as_ref())
                .map(|p| p.origin)
        };
        assert_eq!(origin("A"), Some(Origin::Both));
        assert_eq!(origin("B"), Some(Origin::DenseOnly));
        assert_eq!(origin("D"), Some(Origin::SparseOnly));

        let c = debug.iter().find(|r| r.id == "C").unwrap();
        let hits = &c.provenance.as_ref().unwrap().hits;
        assert_eq!(hits[&SourceTag::Dense].rank, 3);
        assert_eq!(hits[&SourceTag::Sparse].rank, 1);
        assert!((hits[&SourceTag::Sparse].score - 1.0).abs() < 1e-12);
    }
}
