//! 채점 - 기대 답변과 실제 답변 비교
//!
//! 채점 모델은 JSON 한 개만 출력하도록 요청합니다.
//! 코드 펜스나 앞뒤 설명이 붙어도 첫 `{`부터 마지막 `}`까지만 파싱합니다.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::generation::Generator;

/// 채점 결과
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgeVerdict {
    /// 종합 점수 (0-100)
    pub score: f64,
    #[serde(default)]
    pub correctness: Option<f64>,
    #[serde(default)]
    pub completeness: Option<f64>,
    #[serde(default)]
    pub reasoning: String,
}

/// 채점기 트레이트
#[async_trait]
pub trait Judge: Send + Sync {
    async fn judge(&self, question: &str, expected: &str, actual: &str) -> Result<JudgeVerdict>;

    fn model(&self) -> &str;
}

/// LLM 채점기
pub struct LlmJudge {
    generator: Arc<dyn Generator>,
}

impl LlmJudge {
    pub fn new(generator: Arc<dyn Generator>) -> Self {
        Self { generator }
    }
}

fn judge_prompt(question: &str, expected: &str, actual: &str) -> String {
    format!(
        "You are grading an answer produced by a document question answering system.\n\
         Compare the ACTUAL answer with the EXPECTED answer.\n\n\
         QUESTION:\n{question}\n\n\
         EXPECTED:\n{expected}\n\n\
         ACTUAL:\n{actual}\n\n\
         Score from 0 to 100:\n\
         - correctness: facts in ACTUAL agree with EXPECTED (no contradictions)\n\
         - completeness: ACTUAL covers the key points of EXPECTED\n\
         - score: overall grade\n\n\
         Respond with a single JSON object and nothing else:\n\
         {{\"score\": <0-100>, \"correctness\": <0-100>, \"completeness\": <0-100>, \"reasoning\": \"<one or two sentences>\"}}"
    )
}

/// 채점 응답 파싱 (점수는 0-100으로 제한)
pub fn parse_verdict(raw: &str) -> Result<JudgeVerdict> {
    let start = raw.find('{').context("Judge response contains no JSON object")?;
    let end = raw.rfind('}').context("Judge response contains no JSON object")?;
    if end < start {
        anyhow::bail!("Judge response contains no JSON object");
    }

    let mut verdict: JudgeVerdict =
        serde_json::from_str(&raw[start..=end]).context("Judge response is not valid JSON")?;

    if !verdict.score.is_finite() {
        anyhow::bail!("Judge returned a non-finite score");
    }
    verdict.score = verdict.score.clamp(0.0, 100.0);
    verdict.correctness = verdict.correctness.filter(|v| v.is_finite()).map(|v| v.clamp(0.0, 100.0));
    verdict.completeness = verdict.completeness.filter(|v| v.is_finite()).map(|v| v.clamp(0.0, 100.0));
    Ok(verdict)
}

#[async_trait]
impl Judge for LlmJudge {
    async fn judge(&self, question: &str, expected: &str, actual: &str) -> Result<JudgeVerdict> {
        if actual.trim().is_empty() {
            return Ok(JudgeVerdict {
                score: 0.0,
                correctness: Some(0.0),
                completeness: Some(0.0),
                reasoning: "empty answer".to_string(),
            });
        }

        let raw = self
            .generator
            .generate(&judge_prompt(question, expected, actual))
            .await
            .context("Judge generation failed")?;

        parse_verdict(&raw)
    }

    fn model(&self) -> &str {
        self.generator.model()
    }
}
