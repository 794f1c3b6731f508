//! 배치 평가 실행기
//!
//! 상태 전이: `Init -> Running -> {Completed, Failed, Interrupted}`
//!
//! - 질문은 입력 순서대로 하나씩 처리 (질문 간 병렬 없음)
//! - 질문 하나가 끝날 때마다 체크포인트 저장
//! - 중단 신호는 질문 사이에서만 확인 (진행 중인 호출은 끝까지 기다림)
//! - 어댑터 실패는 점수 0으로 기록하고 계속 진행 (`stop_on_fail`이면 즉시 Failed)

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, Utc};
use serde::{Deserialize, Serialize};

use crate::adapters::{AdapterError, AdapterResponse, EvaluatorAdapter};
use crate::config::EvalConfig;

use super::artifacts::RunArtifactWriter;
use super::checkpoint::{CheckpointLoad, CheckpointStore, RunCheckpoint};
use super::judge::{Judge, JudgeVerdict};
use super::question::{fingerprint, EvaluationQuestion};
use super::result::{EvaluationResult, ResultStatus, RunInfo, RunSummary, JUDGE_FAILED_SCORE};
use super::EvalError;

/// 실행 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Init,
    Running,
    Completed,
    Failed,
    Interrupted,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Completed | RunState::Failed | RunState::Interrupted)
    }
}

/// 협조적 중단 신호 (Ctrl-C 등에서 설정)
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// 실행 옵션
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub debug: bool,
    /// false면 기존 체크포인트를 지우고 새로 시작
    pub resume: bool,
    pub stop_on_fail: bool,
    /// 어댑터/채점 호출 각각의 제한 시간
    pub question_timeout: Duration,
    pub pass_threshold: f64,
    pub output_dir: PathBuf,
}

impl RunOptions {
    pub fn from_config(config: &EvalConfig) -> Self {
        Self {
            debug: false,
            resume: true,
            stop_on_fail: false,
            question_timeout: Duration::from_secs(config.run.question_timeout_secs),
            pass_threshold: config.judge.pass_threshold,
            output_dir: config.run.output_dir.clone(),
        }
    }
}

/// 실행 결과
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub state: RunState,
    pub run_id: String,
    pub run_dir: PathBuf,
    pub summary: RunSummary,
    /// 입력 순서
    pub results: Vec<EvaluationResult>,
    /// 이전 실행에서 이어받은 결과 수
    pub resumed_from: usize,
}

pub struct BatchEvaluator {
    adapter: Arc<dyn EvaluatorAdapter>,
    judge: Arc<dyn Judge>,
    options: RunOptions,
    stop: StopSignal,
    state: RunState,
}

impl BatchEvaluator {
    pub fn new(adapter: Arc<dyn EvaluatorAdapter>, judge: Arc<dyn Judge>, options: RunOptions) -> Self {
        Self {
            adapter,
            judge,
            options,
            stop: StopSignal::new(),
            state: RunState::Init,
        }
    }

    pub fn with_stop_signal(mut self, stop: StopSignal) -> Self {
        self.stop = stop;
        self
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    fn transition(&mut self, next: RunState) {
        tracing::info!("Run state: {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    /// 질문 세트 실행
    ///
    /// 체크포인트/결과 파일 I/O 실패만 `Err`로 반환합니다 (상태는 Failed).
    /// 질문별 실패는 결과에 기록됩니다.
    pub async fn run(&mut self, questions: &[EvaluationQuestion]) -> Result<RunOutcome, EvalError> {
        self.state = RunState::Init;
        match self.execute(questions).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                tracing::error!("Run aborted: {}", e);
                self.transition(RunState::Failed);
                Err(e)
            }
        }
    }

    async fn execute(&mut self, questions: &[EvaluationQuestion]) -> Result<RunOutcome, EvalError> {
        let mode = self.adapter.mode();
        let fingerprint = fingerprint(mode, questions);
        let store = CheckpointStore::new(&self.options.output_dir, mode);

        if !self.options.resume && store.exists() {
            tracing::info!("Resume disabled, removing checkpoint {:?}", store.path());
            store.delete()?;
        }

        let mut checkpoint = match store.load(mode, &fingerprint, questions)? {
            CheckpointLoad::Resumed(checkpoint) => checkpoint,
            CheckpointLoad::Fresh | CheckpointLoad::Discarded { .. } => {
                let run_dir = RunArtifactWriter::run_dir(&self.options.output_dir, mode, Local::now());
                RunCheckpoint::new(mode, fingerprint, run_dir)
            }
        };
        let resumed_from = checkpoint.partial_results.len();
        let writer = RunArtifactWriter::new(checkpoint.run_dir.clone());
        store.save(&checkpoint)?;

        tracing::info!(
            "Run {} ({} mode, model {}): {} questions, results in {:?}",
            checkpoint.run_id,
            mode,
            self.adapter.model(),
            questions.len(),
            writer.dir()
        );
        self.transition(RunState::Running);

        let total = questions.len();
        let mut final_state = RunState::Completed;
        let mut failure = None;
        // stop_on_fail로 중단된 질문 (체크포인트에는 넣지 않아 재개 시 다시 시도)
        let mut failed_question = None;

        for (i, question) in questions.iter().enumerate() {
            if checkpoint.is_completed(&question.id) {
                continue;
            }
            if self.stop.is_stop_requested() {
                tracing::warn!("Stop requested, interrupting before question {}", question.id);
                final_state = RunState::Interrupted;
                break;
            }

            tracing::info!("[{}/{}] {}", i + 1, total, question.id);
            let result = self.evaluate(question).await;
            writer.append_result(&result)?;

            if result.status == ResultStatus::AdapterFailed && self.options.stop_on_fail {
                failure = Some(format!(
                    "question {} failed: {}",
                    result.question_id,
                    result.error.as_deref().unwrap_or("unknown error")
                ));
                failed_question = Some(result);
                final_state = RunState::Failed;
                break;
            }

            checkpoint.record(result);
            store.save(&checkpoint)?;
        }

        let mut results = checkpoint.partial_results.clone();
        results.extend(failed_question);

        let summary = RunSummary::compute(
            RunInfo {
                run_id: &checkpoint.run_id,
                mode,
                model: self.adapter.model(),
                status: final_state,
                total_questions: total,
                pass_threshold: self.options.pass_threshold,
                resumed_results: resumed_from,
                started_at: checkpoint.started_at,
                failure,
            },
            &results,
        );
        writer.write_all(&results, &summary)?;

        if final_state == RunState::Completed {
            store.delete()?;
        } else {
            tracing::info!(
                "Checkpoint kept at {:?} ({} questions completed)",
                store.path(),
                checkpoint.completed_question_ids.len()
            );
        }
        self.transition(final_state);

        tracing::info!(
            "Pass rate {:.1}% ({}/{}), mean score {:.1}",
            summary.pass_rate,
            summary.passed,
            summary.evaluated,
            summary.mean_score
        );

        Ok(RunOutcome {
            state: final_state,
            run_id: checkpoint.run_id.clone(),
            run_dir: checkpoint.run_dir.clone(),
            summary,
            results,
            resumed_from,
        })
    }

    /// 질문 하나: 어댑터 호출 → 채점 (항상 결과를 반환)
    async fn evaluate(&self, question: &EvaluationQuestion) -> EvaluationResult {
        let timeout = self.options.question_timeout;
        let started = std::time::Instant::now();

        let response = tokio::time::timeout(timeout, self.adapter.query(&question.question, self.options.debug))
            .await
            .unwrap_or(Err(AdapterError::Timeout(timeout)));

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!("Question {} failed: {}", question.id, e);
                let elapsed = started.elapsed().as_secs_f64() * 1000.0;
                return failed_result(question, self, e.to_string(), elapsed);
            }
        };

        let verdict = match tokio::time::timeout(
            timeout,
            self.judge.judge(&question.question, &question.expected, &response.answer),
        )
        .await
        {
            Ok(Ok(verdict)) => Ok(verdict),
            Ok(Err(e)) => Err(format!("judge failed: {:#}", e)),
            Err(_) => Err(format!("judge timed out after {:?}", timeout)),
        };

        match verdict {
            Ok(verdict) => scored_result(question, self, response, verdict),
            Err(message) => {
                tracing::warn!("Question {}: {}", question.id, message);
                let mut result = scored_result(
                    question,
                    self,
                    response,
                    JudgeVerdict {
                        score: JUDGE_FAILED_SCORE,
                        correctness: None,
                        completeness: None,
                        reasoning: String::new(),
                    },
                );
                result.status = ResultStatus::JudgeFailed;
                result.passed = false;
                result.judge_breakdown = None;
                result.error = Some(message);
                result
            }
        }
    }
}

fn scored_result(
    question: &EvaluationQuestion,
    evaluator: &BatchEvaluator,
    response: AdapterResponse,
    verdict: JudgeVerdict,
) -> EvaluationResult {
    EvaluationResult {
        question_id: question.id.clone(),
        mode: evaluator.adapter.mode(),
        question: question.question.clone(),
        expected: question.expected.clone(),
        category: question.category.clone(),
        answer: response.answer,
        sources: response.sources,
        score: verdict.score,
        passed: verdict.score >= evaluator.options.pass_threshold,
        status: ResultStatus::Scored,
        judge_breakdown: Some(verdict),
        error: None,
        response_time_ms: response.response_time_ms,
        timestamp: Utc::now(),
        debug_info: response.debug_info,
    }
}

fn failed_result(
    question: &EvaluationQuestion,
    evaluator: &BatchEvaluator,
    error: String,
    elapsed_ms: f64,
) -> EvaluationResult {
    EvaluationResult {
        question_id: question.id.clone(),
        mode: evaluator.adapter.mode(),
        question: question.question.clone(),
        expected: question.expected.clone(),
        category: question.category.clone(),
        answer: String::new(),
        sources: Vec::new(),
        score: 0.0,
        passed: false,
        status: ResultStatus::AdapterFailed,
        judge_breakdown: None,
        error: Some(error),
        response_time_ms: elapsed_ms,
        timestamp: Utc::now(),
        debug_info: None,
    }
}
