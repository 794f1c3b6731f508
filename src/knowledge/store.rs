//! Chunk Store - rusqlite 기반 청크 저장소 + FTS5 sparse 검색
//!
//! 인덱싱된 청크 텍스트를 저장하고 BM25 키워드 검색을 제공합니다.
//! 저장 위치: <data_dir>/chunks.db

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OpenFlags};
use serde::Serialize;

use super::candidate::{Candidate, ChunkPayload, PageIndex, SourceTag};

// ============================================================================
// Data Directory
// ============================================================================

/// 데이터 디렉토리 경로 (<data_local_dir>/.ragbench/)
pub fn get_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".ragbench")
}

// ============================================================================
// Types
// ============================================================================

/// 저장소 통계
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub chunk_count: usize,
    pub document_count: usize,
    pub total_text_bytes: usize,
    pub db_path: PathBuf,
}

// ============================================================================
// ChunkStore
// ============================================================================

/// 청크 저장소
///
/// SQLite에 청크를 저장하고 FTS5로 키워드 검색을 제공합니다.
pub struct ChunkStore {
    conn: Arc<Mutex<Connection>>,
    db_path: PathBuf,
}

impl ChunkStore {
    /// 저장소 열기 (없으면 생성)
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)
                    .context("Failed to create database directory")?;
            }
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .context("Failed to open SQLite database")?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path: path.to_path_buf(),
        };

        store.initialize()?;
        Ok(store)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))
    }

    /// 스키마 초기화
    fn initialize(&self) -> Result<()> {
        let conn = self.lock()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS chunks (
                chunk_id TEXT NOT NULL UNIQUE,
                doc_id TEXT NOT NULL,
                page INTEGER,
                url TEXT,
                text TEXT NOT NULL
            )",
            [],
        )
        .context("Failed to create chunks table")?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_chunks_doc ON chunks(doc_id)",
            [],
        )
        .context("Failed to create doc index")?;

        // sparse 검색은 선택이 아니므로 FTS5 생성 실패는 에러
        // source: https://www.sqlite.org/fts5.html
        conn.execute_batch(
            r#"
            CREATE VIRTUAL TABLE IF NOT EXISTS chunks_fts USING fts5(
                text,
                content=chunks,
                content_rowid=rowid
            );

            CREATE TRIGGER IF NOT EXISTS chunks_ai AFTER INSERT ON chunks BEGIN
                INSERT INTO chunks_fts(rowid, text) VALUES (new.rowid, new.text);
            END;

            CREATE TRIGGER IF NOT EXISTS chunks_ad AFTER DELETE ON chunks BEGIN
                INSERT INTO chunks_fts(chunks_fts, rowid, text)
                VALUES('delete', old.rowid, old.text);
            END;

            CREATE TRIGGER IF NOT EXISTS chunks_au AFTER UPDATE ON chunks BEGIN
                INSERT INTO chunks_fts(chunks_fts, rowid, text)
                VALUES('delete', old.rowid, old.text);
                INSERT INTO chunks_fts(rowid, text) VALUES (new.rowid, new.text);
            END;
            "#,
        )
        .context("Failed to create FTS5 index")?;

        tracing::debug!("Chunk store initialized at {:?}", self.db_path);
        Ok(())
    }

    /// 청크 저장 (chunk_id가 같으면 업데이트)
    pub fn upsert_chunk(&self, chunk: &ChunkPayload) -> Result<()> {
        let conn = self.lock()?;

        conn.execute(
            "INSERT INTO chunks (chunk_id, doc_id, page, url, text)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(chunk_id) DO UPDATE SET
                doc_id = excluded.doc_id,
                page = excluded.page,
                url = excluded.url,
                text = excluded.text",
            params![
                chunk.chunk_id,
                chunk.doc_id,
                chunk.page.map(|p| p.0 as i64),
                chunk.url,
                chunk.text
            ],
        )
        .context("Failed to upsert chunk")?;

        Ok(())
    }

    /// ID로 청크 조회 (upsert 검증용)
    #[cfg(test)]
    fn get_chunk(&self, chunk_id: &str) -> Result<Option<ChunkPayload>> {
        use rusqlite::OptionalExtension;

        let conn = self.lock()?;

        let chunk = conn
            .query_row(
                "SELECT chunk_id, doc_id, page, url, text FROM chunks WHERE chunk_id = ?1",
                params![chunk_id],
                row_to_payload,
            )
            .optional()
            .context("Failed to load chunk")?;

        Ok(chunk)
    }

    /// 문서 단위 삭제, 삭제된 청크 ID 반환
    pub fn delete_document(&self, doc_id: &str) -> Result<Vec<String>> {
        let conn = self.lock()?;

        let mut stmt = conn.prepare("SELECT chunk_id FROM chunks WHERE doc_id = ?1")?;
        let ids = stmt
            .query_map(params![doc_id], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        conn.execute("DELETE FROM chunks WHERE doc_id = ?1", params![doc_id])?;
        Ok(ids)
    }

    /// FTS5 sparse 검색
    ///
    /// BM25 순서대로 1-based 순위를 매긴 후보를 반환합니다.
    /// 원점수는 -bm25 (높을수록 좋음) 입니다.
    /// source: https://www.sqlite.org/fts5.html#the_bm25_function
    pub fn search_sparse(&self, query: &str, limit: usize) -> Result<Vec<Candidate>> {
        let conn = self.lock()?;

        let escaped_query = escape_fts5_query(query);
        if escaped_query.is_empty() || limit == 0 {
            return Ok(vec![]);
        }

        let mut stmt = conn.prepare(
            r#"
            SELECT c.chunk_id, c.doc_id, c.page, c.url, c.text, bm25(chunks_fts) AS score
            FROM chunks_fts
            JOIN chunks c ON c.rowid = chunks_fts.rowid
            WHERE chunks_fts MATCH ?1
            ORDER BY bm25(chunks_fts), c.chunk_id
            LIMIT ?2
            "#,
        )?;

        let scored = stmt
            .query_map(params![escaped_query, limit as i64], |row| {
                let payload = row_to_payload(row)?;
                let bm25: f64 = row.get(5)?;
                Ok((-bm25, payload))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read FTS5 results")?;

        Ok(Candidate::ranked(SourceTag::Sparse, scored))
    }

    /// 저장소 통계
    pub fn stats(&self) -> Result<StoreStats> {
        let conn = self.lock()?;

        let (chunks, docs, bytes): (i64, i64, i64) = conn.query_row(
            "SELECT COUNT(*), COUNT(DISTINCT doc_id), COALESCE(SUM(LENGTH(text)), 0) FROM chunks",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;

        Ok(StoreStats {
            chunk_count: chunks as usize,
            document_count: docs as usize,
            total_text_bytes: bytes as usize,
            db_path: self.db_path.clone(),
        })
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

fn row_to_payload(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChunkPayload> {
    let page: Option<i64> = row.get(2)?;
    Ok(ChunkPayload {
        chunk_id: row.get(0)?,
        doc_id: row.get(1)?,
        page: page
            .and_then(|p| u32::try_from(p).ok())
            .map(PageIndex),
        url: row.get(3)?,
        text: row.get(4)?,
    })
}

/// FTS5 쿼리 이스케이프
///
/// 특수 문자를 제거하고 단어를 OR로 결합합니다.
/// (AND 결합은 긴 자연어 질문에서 거의 항상 0건이 됩니다)
/// source: https://www.sqlite.org/fts5.html#full_text_query_syntax
fn escape_fts5_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(|w| {
            w.chars()
                .filter(|c| c.is_alphanumeric() || *c == '_')
                .collect::<String>()
        })
        .filter(|w| !w.is_empty())
        .map(|w| format!("\"{}\"", w))
        .collect::<Vec<_>>()
        .join(" OR ")
}

// ============================================================================
// Tests
// ============================================================================
