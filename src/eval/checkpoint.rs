//! 체크포인트 - 중단된 실행의 재개 지점
//!
//! 위치: `<output_dir>/checkpoints/<mode>.json`
//!
//! 수명:
//! - 실행 시작 시 생성, 질문 하나가 끝날 때마다 갱신 (tmp + rename)
//! - 정상 완료 시 삭제. 남아 있는 체크포인트는 재개 대상
//! - 읽을 수 없거나 질문 세트와 맞지 않으면 버리고 처음부터 시작

use std::collections::{BTreeSet, HashMap};
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::adapters::EvalMode;

use super::artifacts::atomic_write;
use super::question::EvaluationQuestion;
use super::result::EvaluationResult;
use super::EvalError;

const CHECKPOINT_VERSION: u32 = 1;

/// 실행 진행 상태
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunCheckpoint {
    pub version: u32,
    pub run_id: String,
    pub mode: EvalMode,
    /// 모드 + 질문 세트 지문
    pub fingerprint: String,
    /// 결과 파일 디렉토리 (재개 시 같은 곳에 이어서 기록)
    pub run_dir: PathBuf,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_question_ids: BTreeSet<String>,
    /// 입력 순서대로 정렬된 결과
    pub partial_results: Vec<EvaluationResult>,
}

impl RunCheckpoint {
    pub fn new(mode: EvalMode, fingerprint: String, run_dir: PathBuf) -> Self {
        let now = Utc::now();
        Self {
            version: CHECKPOINT_VERSION,
            run_id: uuid::Uuid::new_v4().to_string(),
            mode,
            fingerprint,
            run_dir,
            started_at: now,
            updated_at: now,
            completed_question_ids: BTreeSet::new(),
            partial_results: Vec::new(),
        }
    }

    pub fn is_completed(&self, question_id: &str) -> bool {
        self.completed_question_ids.contains(question_id)
    }

    pub fn record(&mut self, result: EvaluationResult) {
        self.completed_question_ids.insert(result.question_id.clone());
        self.partial_results.push(result);
        self.updated_at = Utc::now();
    }

    /// 질문 세트와의 일관성 확인
    fn validate(&self, questions: &[EvaluationQuestion]) -> Result<(), String> {
        if self.version != CHECKPOINT_VERSION {
            return Err(format!("unsupported checkpoint version {}", self.version));
        }

        let positions: HashMap<&str, usize> = questions
            .iter()
            .enumerate()
            .map(|(i, q)| (q.id.as_str(), i))
            .collect();

        let mut last_position = None;
        for result in &self.partial_results {
            let position = *positions
                .get(result.question_id.as_str())
                .ok_or_else(|| format!("unknown question id '{}'", result.question_id))?;
            if last_position.is_some_and(|last| position <= last) {
                return Err(format!(
                    "result for '{}' is out of order or duplicated",
                    result.question_id
                ));
            }
            last_position = Some(position);
        }

        let recorded: BTreeSet<String> = self
            .partial_results
            .iter()
            .map(|r| r.question_id.clone())
            .collect();
        if recorded != self.completed_question_ids {
            return Err("completed ids do not match recorded results".to_string());
        }

        Ok(())
    }
}

/// 체크포인트 로드 결과
#[derive(Debug)]
pub enum CheckpointLoad {
    /// 체크포인트 없음
    Fresh,
    /// 이어서 실행
    Resumed(RunCheckpoint),
    /// 있었지만 사용할 수 없어 삭제함
    Discarded { reason: String },
}

/// 모드별 체크포인트 파일
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(output_dir: &Path, mode: EvalMode) -> Self {
        Self {
            path: output_dir.join("checkpoints").join(format!("{}.json", mode)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    fn io_error(&self, source: io::Error) -> EvalError {
        EvalError::Checkpoint {
            path: self.path.clone(),
            source,
        }
    }

    /// 재개 가능한 체크포인트 찾기
    ///
    /// 손상/불일치 체크포인트는 추측해서 이어가지 않고 삭제합니다.
    pub fn load(
        &self,
        mode: EvalMode,
        fingerprint: &str,
        questions: &[EvaluationQuestion],
    ) -> Result<CheckpointLoad, EvalError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(CheckpointLoad::Fresh),
            Err(e) => return self.discard(format!("unreadable: {}", e)),
        };

        let checkpoint: RunCheckpoint = match serde_json::from_str(&content) {
            Ok(checkpoint) => checkpoint,
            Err(e) => return self.discard(format!("corrupt: {}", e)),
        };

        if checkpoint.mode != mode {
            return self.discard(format!("belongs to mode {}", checkpoint.mode));
        }
        if checkpoint.fingerprint != fingerprint {
            return self.discard("question set changed since the checkpoint was written".to_string());
        }
        if let Err(reason) = checkpoint.validate(questions) {
            return self.discard(format!("inconsistent: {}", reason));
        }
        if checkpoint.completed_question_ids.is_empty() {
            self.delete()?;
            return Ok(CheckpointLoad::Fresh);
        }

        tracing::info!(
            "Resuming run {} ({}/{} questions already completed)",
            checkpoint.run_id,
            checkpoint.completed_question_ids.len(),
            questions.len()
        );
        Ok(CheckpointLoad::Resumed(checkpoint))
    }

    /// 체크포인트 삭제 후 Discarded 반환
    pub fn discard(&self, reason: String) -> Result<CheckpointLoad, EvalError> {
        tracing::warn!("Discarding checkpoint {:?}: {}", self.path, reason);
        self.delete()?;
        Ok(CheckpointLoad::Discarded { reason })
    }

    pub fn save(&self, checkpoint: &RunCheckpoint) -> Result<(), EvalError> {
        let json = serde_json::to_string_pretty(checkpoint)
            .map_err(|e| self.io_error(io::Error::other(e)))?;
        atomic_write(&self.path, json.as_bytes()).map_err(|e| self.io_error(e))
    }

    pub fn delete(&self) -> Result<(), EvalError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.io_error(e)),
        }
    }
}
