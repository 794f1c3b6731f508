//! 후보(Candidate) 타입 - 단일 검색 소스의 순위 결과
//!
//! dense(임베딩) / sparse(FTS5 BM25) 검색이 공통으로 반환하는 형태입니다.
//! `id`는 청크 ID이므로 두 소스에서 같은 청크가 나오면 하나로 통합됩니다.

use serde::{Deserialize, Serialize};

// ============================================================================
// Types
// ============================================================================

/// 후보 소스 구분
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceTag {
    /// 임베딩 유사도 검색 (LanceDB)
    Dense,
    /// 키워드 검색 (SQLite FTS5)
    Sparse,
}

impl SourceTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceTag::Dense => "dense",
            SourceTag::Sparse => "sparse",
        }
    }
}

impl std::fmt::Display for SourceTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 내부 페이지 번호 (0부터 시작)
///
/// 저장소와 일부 백엔드는 0-based 페이지를 사용합니다.
/// 사용자에게 노출할 때는 어댑터 경계에서 한 번만 1-based로 변환합니다.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PageIndex(pub u32);

/// 청크 페이로드
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkPayload {
    /// 청크 ID (소스 간 공통 키)
    pub chunk_id: String,
    /// 원본 문서 ID (파일명 등)
    pub doc_id: String,
    /// 페이지 (0-based, 없으면 None)
    #[serde(default)]
    pub page: Option<PageIndex>,
    /// 원본 URL
    #[serde(default)]
    pub url: Option<String>,
    /// 청크 텍스트
    pub text: String,
}

/// 단일 소스의 순위 후보
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    /// 청크 ID
    pub id: String,
    /// 소스 내 순위 (1부터 시작, 연속)
    pub rank: usize,
    /// 소스 원점수 (dense: 유사도, sparse: -bm25)
    pub score: f64,
    /// 소스 구분
    pub source: SourceTag,
    pub payload: ChunkPayload,
}

impl Candidate {
    /// 점수순으로 정렬된 페이로드 목록에 1-based 순위를 부여
    pub fn ranked(source: SourceTag, scored: Vec<(f64, ChunkPayload)>) -> Vec<Candidate> {
        scored
            .into_iter()
            .enumerate()
            .map(|(i, (score, payload))| Candidate {
                id: payload.chunk_id.clone(),
                rank: i + 1,
                score,
                source,
                payload,
            })
            .collect()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(id: &str) -> ChunkPayload {
        ChunkPayload {
            chunk_id: id.to_string(),
            doc_id: "manual.pdf".to_string(),
            page: Some(PageIndex(0)),
            url: None,
            text: format!("text of {}", id),
        }
    }

    #[test]
    fn test_ranked_assigns_contiguous_ranks() {
        let candidates = Candidate::ranked(
            SourceTag::Sparse,
            vec![(3.0, payload("a")), (2.0, payload("b")), (1.0, payload("c"))],
        );

        let ranks: Vec<usize> = candidates.iter().map(|c| c.rank).collect();
        assert_eq!(ranks, vec![1, 2, 3]);
        assert_eq!(candidates[1].id, "b");
        assert!(candidates.iter().all(|c| c.source == SourceTag::Sparse));
    }

    #[test]
    fn test_source_tag_serde() {
        assert_eq!(serde_json::to_string(&SourceTag::Dense).unwrap(), "\"dense\"");
        let tag: SourceTag = serde_json::from_str("\"sparse\"").unwrap();
        assert_eq!(tag, SourceTag::Sparse);
    }
}
