//! LanceDB Vector Store - dense 후보 소스
//!
//! ANN (Approximate Nearest Neighbor) 검색으로 청크 임베딩을 조회합니다.
//! ref: https://lancedb.github.io/lancedb/

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{
    Array, FixedSizeListArray, Float32Array, Int32Array, RecordBatch, RecordBatchIterator,
    StringArray,
};
use arrow_schema::{DataType, Field, Schema};
use futures::TryStreamExt;
use lancedb::connection::Connection;
use lancedb::query::{ExecutableQuery, QueryBase};

use super::candidate::{Candidate, ChunkPayload, PageIndex, SourceTag};

/// 벡터 임베딩 차원 (Gemini gemini-embedding-001 기본값)
/// source: https://ai.google.dev/gemini-api/docs/embeddings
pub const EMBEDDING_DIMENSION: i32 = 768;

/// 벡터 테이블 이름
const TABLE_NAME: &str = "chunks";

/// 저장용 벡터 엔트리
#[derive(Debug, Clone)]
pub struct VectorEntry {
    pub payload: ChunkPayload,
    pub embedding: Vec<f32>,
}

// ============================================================================
// LanceVectorStore
// ============================================================================

/// LanceDB 벡터 저장소
pub struct LanceVectorStore {
    db: Connection,
}

impl LanceVectorStore {
    /// LanceDB 저장소 열기
    ///
    /// # Arguments
    /// * `path` - .lance 디렉토리 경로
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .context("Failed to create LanceDB directory")?;
            }
        }

        let path_str = path
            .to_str()
            .ok_or_else(|| anyhow::anyhow!("Invalid path encoding"))?;

        let db = lancedb::connect(path_str)
            .execute()
            .await
            .context("Failed to connect to LanceDB")?;

        Ok(Self { db })
    }

    fn create_schema() -> Schema {
        Schema::new(vec![
            Field::new("chunk_id", DataType::Utf8, false),
            Field::new("doc_id", DataType::Utf8, false),
            Field::new("page", DataType::Int32, true),
            Field::new("url", DataType::Utf8, true),
            Field::new("text", DataType::Utf8, false),
            Field::new(
                "embedding",
                DataType::FixedSizeList(
                    Arc::new(Field::new("item", DataType::Float32, true)),
                    EMBEDDING_DIMENSION,
                ),
                false,
            ),
        ])
    }

    /// 엔트리들을 Arrow RecordBatch로 변환
    fn entries_to_batch(entries: &[VectorEntry]) -> Result<RecordBatch> {
        if entries.is_empty() {
            anyhow::bail!("Cannot create batch from empty entries");
        }

        if let Some(bad) = entries
            .iter()
            .find(|e| e.embedding.len() != EMBEDDING_DIMENSION as usize)
        {
            anyhow::bail!(
                "Embedding for chunk {} has dimension {}, expected {}",
                bad.payload.chunk_id,
                bad.embedding.len(),
                EMBEDDING_DIMENSION
            );
        }

        let chunk_ids: Vec<&str> = entries.iter().map(|e| e.payload.chunk_id.as_str()).collect();
        let doc_ids: Vec<&str> = entries.iter().map(|e| e.payload.doc_id.as_str()).collect();
        let pages: Vec<Option<i32>> = entries
            .iter()
            .map(|e| e.payload.page.and_then(|p| i32::try_from(p.0).ok()))
            .collect();
        let urls: Vec<Option<&str>> = entries.iter().map(|e| e.payload.url.as_deref()).collect();
        let texts: Vec<&str> = entries.iter().map(|e| e.payload.text.as_str()).collect();

        let embeddings_flat: Vec<f32> = entries
            .iter()
            .flat_map(|e| e.embedding.iter().copied())
            .collect();

        let values = Float32Array::from(embeddings_flat);
        let field = Arc::new(Field::new("item", DataType::Float32, true));
        let embeddings_list = FixedSizeListArray::try_new(
            field,
            EMBEDDING_DIMENSION,
            Arc::new(values) as Arc<dyn Array>,
            None,
        )
        .context("Failed to create embedding array")?;

        let batch = RecordBatch::try_new(
            Arc::new(Self::create_schema()),
            vec![
                Arc::new(StringArray::from(chunk_ids)),
                Arc::new(StringArray::from(doc_ids)),
                Arc::new(Int32Array::from(pages)),
                Arc::new(StringArray::from(urls)),
                Arc::new(StringArray::from(texts)),
                Arc::new(embeddings_list),
            ],
        )
        .context("Failed to create RecordBatch")?;

        Ok(batch)
    }

    async fn table_exists(&self) -> bool {
        self.db
            .table_names()
            .execute()
            .await
            .map(|names| names.contains(&TABLE_NAME.to_string()))
            .unwrap_or(false)
    }

    async fn open_table(&self) -> Result<lancedb::table::Table> {
        self.db
            .open_table(TABLE_NAME)
            .execute()
            .await
            .context("Failed to open table")
    }

    /// 벡터 배치 삽입 (같은 chunk_id는 교체)
    ///
    /// 소스 내 ID 중복은 통합 계약 위반이므로 삽입 전에 기존 행을 지웁니다.
    pub async fn insert_batch(&self, entries: &[VectorEntry]) -> Result<usize> {
        if entries.is_empty() {
            return Ok(0);
        }

        let batch = Self::entries_to_batch(entries)?;
        let schema = batch.schema();
        let batches = RecordBatchIterator::new(vec![Ok(batch)], schema);

        if self.table_exists().await {
            let ids: Vec<&str> = entries.iter().map(|e| e.payload.chunk_id.as_str()).collect();
            self.delete_by_chunk_ids(&ids).await?;

            self.open_table()
                .await?
                .add(batches)
                .execute()
                .await
                .context("Failed to add vectors to table")?;
        } else {
            self.db
                .create_table(TABLE_NAME, batches)
                .execute()
                .await
                .context("Failed to create table")?;
        }

        Ok(entries.len())
    }

    /// dense 검색
    ///
    /// 거리 오름차순으로 1-based 순위를 매긴 후보를 반환합니다.
    /// 원점수는 1 / (1 + distance) 입니다.
    pub async fn search_dense(&self, query_embedding: &[f32], limit: usize) -> Result<Vec<Candidate>> {
        if limit == 0 || !self.table_exists().await {
            return Ok(vec![]);
        }

        let results = self
            .open_table()
            .await?
            .vector_search(query_embedding.to_vec())
            .context("Failed to create vector search")?
            .limit(limit)
            .execute()
            .await
            .context("Failed to execute vector search")?;

        let batches: Vec<RecordBatch> = results.try_collect().await?;

        let mut rows: Vec<(f32, ChunkPayload)> = Vec::new();
        for batch in batches {
            let chunk_ids: &StringArray = typed_column(&batch, "chunk_id")?;
            let doc_ids: &StringArray = typed_column(&batch, "doc_id")?;
            let pages: &Int32Array = typed_column(&batch, "page")?;
            let urls: &StringArray = typed_column(&batch, "url")?;
            let texts: &StringArray = typed_column(&batch, "text")?;
            // _distance 컬럼 (LanceDB가 자동 추가)
            let distances: &Float32Array = typed_column(&batch, "_distance")?;

            for i in 0..batch.num_rows() {
                let page = if pages.is_null(i) {
                    None
                } else {
                    u32::try_from(pages.value(i)).ok().map(PageIndex)
                };
                let url = if urls.is_null(i) {
                    None
                } else {
                    Some(urls.value(i).to_string())
                };

                rows.push((
                    distances.value(i),
                    ChunkPayload {
                        chunk_id: chunk_ids.value(i).to_string(),
                        doc_id: doc_ids.value(i).to_string(),
                        page,
                        url,
                        text: texts.value(i).to_string(),
                    },
                ));
            }
        }

        Ok(rank_by_distance(rows))
    }

    /// chunk_id 목록으로 벡터 삭제
    pub async fn delete_by_chunk_ids(&self, chunk_ids: &[&str]) -> Result<()> {
        if chunk_ids.is_empty() || !self.table_exists().await {
            return Ok(());
        }

        let filter = format!(
            "chunk_id IN ({})",
            chunk_ids
                .iter()
                .map(|id| format!("'{}'", id.replace('\'', "''")))
                .collect::<Vec<_>>()
                .join(", ")
        );

        self.open_table()
            .await?
            .delete(&filter)
            .await
            .context("Failed to delete vectors")?;

        Ok(())
    }

    /// 벡터 개수 조회
    pub async fn count(&self) -> Result<usize> {
        if !self.table_exists().await {
            return Ok(0);
        }

        let count = self
            .open_table()
            .await?
            .count_rows(None)
            .await
            .context("Failed to count rows")?;
        Ok(count)
    }
}

fn typed_column<'a, T: Array + 'static>(batch: &'a RecordBatch, name: &str) -> Result<&'a T> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<T>())
        .ok_or_else(|| anyhow::anyhow!("Missing or mistyped {} column", name))
}

/// 거리 오름차순(동점은 chunk_id) 정렬 후 중복 제거, 1-based 순위 부여
fn rank_by_distance(mut rows: Vec<(f32, ChunkPayload)>) -> Vec<Candidate> {
    rows.sort_by(|a, b| {
        a.0.total_cmp(&b.0)
            .then_with(|| a.1.chunk_id.cmp(&b.1.chunk_id))
    });

    let mut seen = HashSet::new();
    let scored = rows
        .into_iter()
        .filter(|(_, payload)| seen.insert(payload.chunk_id.clone()))
        .map(|(distance, payload)| (1.0 / (1.0 + distance as f64), payload))
        .collect();

    Candidate::ranked(SourceTag::Dense, scored)
}

// ============================================================================
// Tests
// ============================================================================
