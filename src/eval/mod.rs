//! 평가 모듈 - 질문 세트 배치 실행, 채점, 체크포인트/재개, 결과 파일
//!
//! 실행 흐름:
//! 질문 로드 → 체크포인트 확인 → 질문별 어댑터 호출 + 채점 → 체크포인트 갱신
//! → 요약/리포트 작성 → (완료 시) 체크포인트 삭제

mod artifacts;
mod checkpoint;
mod judge;
mod question;
mod result;
mod runner;

use std::path::PathBuf;

use thiserror::Error;

pub use artifacts::{RunArtifactWriter, RESULTS_FILE, REPORT_FILE, SUMMARY_FILE};
pub use checkpoint::{CheckpointLoad, CheckpointStore, RunCheckpoint};
pub use judge::{Judge, JudgeVerdict, LlmJudge};
pub use question::{fingerprint, load_questions, parse_questions, EvaluationQuestion};
pub use result::{
    CategoryStats, EvaluationResult, ResultStatus, RunSummary, JUDGE_FAILED_SCORE,
};
pub use runner::{BatchEvaluator, RunOptions, RunOutcome, RunState, StopSignal};

#[derive(Debug, Error)]
pub enum EvalError {
    #[error("failed to load questions from {path:?}: {message}")]
    Questions { path: PathBuf, message: String },

    #[error("invalid question set: {0}")]
    InvalidQuestions(String),

    #[error("checkpoint I/O failed at {path:?}: {source}")]
    Checkpoint {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write run artifacts to {path:?}: {source}")]
    Artifacts {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Adapter(#[from] crate::adapters::AdapterError),
}
