//! 질문별 결과와 실행 요약

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::adapters::{EvalMode, SourceRef};

use super::judge::JudgeVerdict;
use super::runner::RunState;

/// 채점 실패 시 기록하는 점수
pub const JUDGE_FAILED_SCORE: f64 = 0.0;

/// 분류 없는 질문의 카테고리 이름
const UNCATEGORIZED: &str = "uncategorized";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    /// 정상 채점
    Scored,
    /// 어댑터 호출 실패 (점수 0)
    AdapterFailed,
    /// 채점 호출 실패 (JUDGE_FAILED_SCORE)
    JudgeFailed,
}

/// 질문 하나의 평가 결과 (기록 후 불변)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub question_id: String,
    pub mode: EvalMode,
    pub question: String,
    pub expected: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    pub answer: String,
    pub sources: Vec<SourceRef>,
    /// 0-100
    pub score: f64,
    pub passed: bool,
    pub status: ResultStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub judge_breakdown: Option<JudgeVerdict>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub response_time_ms: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug_info: Option<Value>,
}

impl EvaluationResult {
    pub fn is_failure(&self) -> bool {
        self.status != ResultStatus::Scored
    }
}

/// 카테고리별 통계
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CategoryStats {
    pub total: usize,
    pub passed: usize,
    pub mean_score: f64,
}

/// 실행 요약 (실행 종료 시 한 번 계산)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub mode: EvalMode,
    pub model: String,
    pub status: RunState,
    pub total_questions: usize,
    pub evaluated: usize,
    pub passed: usize,
    pub adapter_failures: usize,
    pub judge_failures: usize,
    /// 0-100 (%)
    pub pass_rate: f64,
    pub mean_score: f64,
    pub mean_response_time_ms: f64,
    pub pass_threshold: f64,
    /// 재개 시 이전 실행에서 이어받은 결과 수
    pub resumed_results: usize,
    pub by_category: BTreeMap<String, CategoryStats>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

/// 요약 계산에 필요한 실행 정보
#[derive(Debug, Clone)]
pub struct RunInfo<'a> {
    pub run_id: &'a str,
    pub mode: EvalMode,
    pub model: &'a str,
    pub status: RunState,
    pub total_questions: usize,
    pub pass_threshold: f64,
    pub resumed_results: usize,
    pub started_at: DateTime<Utc>,
    pub failure: Option<String>,
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = values.fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

impl RunSummary {
    pub fn compute(info: RunInfo<'_>, results: &[EvaluationResult]) -> Self {
        let evaluated = results.len();
        let passed = results.iter().filter(|r| r.passed).count();

        let mut grouped: BTreeMap<String, Vec<&EvaluationResult>> = BTreeMap::new();
        for result in results {
            let key = result
                .category
                .clone()
                .unwrap_or_else(|| UNCATEGORIZED.to_string());
            grouped.entry(key).or_default().push(result);
        }
        let by_category = grouped
            .into_iter()
            .map(|(category, items)| {
                let stats = CategoryStats {
                    total: items.len(),
                    passed: items.iter().filter(|r| r.passed).count(),
                    mean_score: mean(items.iter().map(|r| r.score)),
                };
                (category, stats)
            })
            .collect();

        Self {
            run_id: info.run_id.to_string(),
            mode: info.mode,
            model: info.model.to_string(),
            status: info.status,
            total_questions: info.total_questions,
            evaluated,
            passed,
            adapter_failures: results
                .iter()
                .filter(|r| r.status == ResultStatus::AdapterFailed)
                .count(),
            judge_failures: results
                .iter()
                .filter(|r| r.status == ResultStatus::JudgeFailed)
                .count(),
            pass_rate: if evaluated == 0 {
                0.0
            } else {
                passed as f64 / evaluated as f64 * 100.0
            },
            mean_score: mean(results.iter().map(|r| r.score)),
            mean_response_time_ms: mean(
                results
                    .iter()
                    .filter(|r| r.status != ResultStatus::AdapterFailed)
                    .map(|r| r.response_time_ms),
            ),
            pass_threshold: info.pass_threshold,
            resumed_results: info.resumed_results,
            by_category,
            started_at: info.started_at,
            finished_at: Utc::now(),
            failure: info.failure,
        }
    }
}
