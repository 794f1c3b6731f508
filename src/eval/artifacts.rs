//! 실행 결과 파일
//!
//! `<output_dir>/<mode>_<YYYYmmdd_HHMMSS>/`
//! - results.jsonl : 질문별 결과 (한 줄에 하나, 입력 순서)
//! - summary.json  : 실행 요약
//! - report.txt    : 사람이 읽는 리포트

use std::fmt::Write as _;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};

use crate::adapters::EvalMode;

use super::result::{EvaluationResult, ResultStatus, RunSummary};
use super::EvalError;

pub const RESULTS_FILE: &str = "results.jsonl";
pub const SUMMARY_FILE: &str = "summary.json";
pub const REPORT_FILE: &str = "report.txt";

/// tmp 파일에 쓴 뒤 rename
pub(crate) fn atomic_write(path: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)
}

pub struct RunArtifactWriter {
    dir: PathBuf,
}

impl RunArtifactWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// 모드 + 시작 시각 기준 실행 디렉토리
    pub fn run_dir(output_dir: &Path, mode: EvalMode, started_at: DateTime<Local>) -> PathBuf {
        output_dir.join(format!("{}_{}", mode, started_at.format("%Y%m%d_%H%M%S")))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn io_error(&self, source: io::Error) -> EvalError {
        EvalError::Artifacts {
            path: self.dir.clone(),
            source,
        }
    }

    /// 진행 중 결과 한 줄 추가 (종료 시 전체 파일로 다시 씀)
    pub fn append_result(&self, result: &EvaluationResult) -> Result<(), EvalError> {
        std::fs::create_dir_all(&self.dir).map_err(|e| self.io_error(e))?;
        let line = serde_json::to_string(result).map_err(|e| self.io_error(io::Error::other(e)))?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join(RESULTS_FILE))
            .map_err(|e| self.io_error(e))?;
        writeln!(file, "{}", line).map_err(|e| self.io_error(e))?;
        file.flush().map_err(|e| self.io_error(e))
    }

    /// 최종 파일 3종 작성
    pub fn write_all(&self, results: &[EvaluationResult], summary: &RunSummary) -> Result<(), EvalError> {
        let mut jsonl = String::new();
        for result in results {
            let line = serde_json::to_string(result).map_err(|e| self.io_error(io::Error::other(e)))?;
            jsonl.push_str(&line);
            jsonl.push('\n');
        }
        atomic_write(&self.dir.join(RESULTS_FILE), jsonl.as_bytes()).map_err(|e| self.io_error(e))?;

        let summary_json =
            serde_json::to_string_pretty(summary).map_err(|e| self.io_error(io::Error::other(e)))?;
        atomic_write(&self.dir.join(SUMMARY_FILE), summary_json.as_bytes())
            .map_err(|e| self.io_error(e))?;

        atomic_write(&self.dir.join(REPORT_FILE), render_report(summary, results).as_bytes())
            .map_err(|e| self.io_error(e))?;

        tracing::info!("Wrote run artifacts to {:?}", self.dir);
        Ok(())
    }
}

fn status_label(result: &EvaluationResult) -> &'static str {
    match result.status {
        ResultStatus::Scored if result.passed => "PASS",
        ResultStatus::Scored => "FAIL",
        ResultStatus::AdapterFailed => "ERROR",
        ResultStatus::JudgeFailed => "JUDGE-ERROR",
    }
}

/// 사람이 읽는 리포트
pub fn render_report(summary: &RunSummary, results: &[EvaluationResult]) -> String {
    let rule = "=".repeat(72);
    let mut out = String::new();

    // String에 대한 write!는 실패하지 않음
    let _ = writeln!(out, "{}", rule);
    let _ = writeln!(out, "RAG Evaluation Report - {} ({})", summary.mode, summary.model);
    let _ = writeln!(out, "{}", rule);
    let _ = writeln!(out, "Run ID:         {}", summary.run_id);
    let _ = writeln!(out, "Status:         {:?}", summary.status);
    let _ = writeln!(out, "Started:        {}", summary.started_at.to_rfc3339());
    let _ = writeln!(out, "Finished:       {}", summary.finished_at.to_rfc3339());
    let _ = writeln!(
        out,
        "Questions:      {}/{} evaluated ({} resumed)",
        summary.evaluated, summary.total_questions, summary.resumed_results
    );
    let _ = writeln!(
        out,
        "Pass rate:      {:.1}% ({} passed, threshold {:.0})",
        summary.pass_rate, summary.passed, summary.pass_threshold
    );
    let _ = writeln!(out, "Mean score:     {:.1}", summary.mean_score);
    let _ = writeln!(out, "Mean latency:   {:.0} ms", summary.mean_response_time_ms);
    let _ = writeln!(
        out,
        "Failures:       {} adapter, {} judge",
        summary.adapter_failures, summary.judge_failures
    );
    if let Some(failure) = &summary.failure {
        let _ = writeln!(out, "Run failure:    {}", failure);
    }

    if !summary.by_category.is_empty() {
        let _ = writeln!(out, "\nBy category");
        let _ = writeln!(out, "{}", "-".repeat(72));
        for (category, stats) in &summary.by_category {
            let _ = writeln!(
                out,
                "{:<30} {:>3}/{:<3} passed  mean {:>5.1}",
                category, stats.passed, stats.total, stats.mean_score
            );
        }
    }

    let failures: Vec<&EvaluationResult> = results.iter().filter(|r| r.is_failure()).collect();
    if !failures.is_empty() {
        let _ = writeln!(out, "\nFailed questions");
        let _ = writeln!(out, "{}", "-".repeat(72));
        for result in failures {
            let _ = writeln!(
                out,
                "[{}] {}: {}",
                status_label(result),
                result.question_id,
                result.error.as_deref().unwrap_or("unknown error")
            );
        }
    }

    let _ = writeln!(out, "\nPer question");
    let _ = writeln!(out, "{}", "-".repeat(72));
    for result in results {
        let sources = result
            .sources
            .iter()
            .map(|s| format!("{} p.{}", s.doc, s.page))
            .collect::<Vec<_>>()
            .join(", ");
        let _ = writeln!(
            out,
            "{:<8} {:<12} {:>5.1}  {:>7.0} ms  {}",
            result.question_id,
            status_label(result),
            result.score,
            result.response_time_ms,
            if sources.is_empty() { "-".to_string() } else { sources }
        );
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::result::tests::result;
    use crate::eval::result::RunInfo;
    use crate::eval::runner::RunState;
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    fn summary(results: &[EvaluationResult]) -> RunSummary {
        RunSummary::compute(
            RunInfo {
                run_id: "run-1",
                mode: EvalMode::Bedrock,
                model: "claude",
                status: RunState::Completed,
                total_questions: results.len(),
                pass_threshold: 70.0,
                resumed_results: 0,
                started_at: Utc::now(),
                failure: None,
            },
            results,
        )
    }

    #[test]
    fn test_run_dir_layout() {
        let started = Local.with_ymd_and_hms(2025, 3, 14, 9, 5, 7).unwrap();
        let dir = RunArtifactWriter::run_dir(Path::new("eval_results"), EvalMode::Bedrock, started);
        assert_eq!(dir, PathBuf::from("eval_results/bedrock_20250314_090507"));
    }

    #[test]
    fn test_write_all_creates_three_files() {
        let tmp = TempDir::new().unwrap();
        let writer = RunArtifactWriter::new(tmp.path().join("run"));
        let results = vec![
            result("q1", Some("engine"), 90.0, ResultStatus::Scored),
            result("q2", None, 0.0, ResultStatus::AdapterFailed),
        ];

        writer.append_result(&results[0]).unwrap();
        writer.write_all(&results, &summary(&results)).unwrap();

        let jsonl = std::fs::read_to_string(writer.dir().join(RESULTS_FILE)).unwrap();
        let ids: Vec<String> = jsonl
            .lines()
            .map(|l| serde_json::from_str::<EvaluationResult>(l).unwrap().question_id)
            .collect();
        assert_eq!(ids, vec!["q1", "q2"]);

        let summary: RunSummary =
            serde_json::from_str(&std::fs::read_to_string(writer.dir().join(SUMMARY_FILE)).unwrap())
                .unwrap();
        assert_eq!(summary.evaluated, 2);

        let report = std::fs::read_to_string(writer.dir().join(REPORT_FILE)).unwrap();
        assert!(report.contains("Pass rate:      50.0%"));
        assert!(report.contains("[ERROR] q2"));
        assert!(!writer.dir().join("results.tmp").exists());
    }

    #[test]
    fn test_report_lists_sources() {
        let results = vec![result("q1", None, 90.0, ResultStatus::Scored)];
        let report = render_report(&summary(&results), &results);
        assert!(report.contains("engine.pdf p.1"));
        assert!(report.contains("PASS"));
    }
}
