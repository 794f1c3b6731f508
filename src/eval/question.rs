//! 질문 세트 로드
//!
//! 지원 형식:
//! - JSON 배열: `[{"question": ..., "expected_answer": ...}, ...]`
//! - `{"questions": [...]}` 객체
//! - JSONL: 한 줄에 질문 하나
//!
//! `id`가 없으면 입력 순서대로 `q1`, `q2`, ... 를 부여합니다.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::adapters::EvalMode;

use super::EvalError;

/// 평가 질문 (실행 중 불변)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationQuestion {
    pub id: String,
    pub question: String,
    pub expected: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

/// 입력 레코드 (필드 별칭 허용)
#[derive(Debug, Deserialize)]
struct RawQuestion {
    #[serde(default)]
    id: Option<Value>,
    #[serde(alias = "question_text", alias = "query")]
    question: String,
    #[serde(alias = "expected_answer", alias = "answer", alias = "ground_truth")]
    expected: String,
    #[serde(default)]
    category: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QuestionFile {
    questions: Vec<RawQuestion>,
}

pub fn load_questions(path: &Path) -> Result<Vec<EvaluationQuestion>, EvalError> {
    let content = std::fs::read_to_string(path).map_err(|e| EvalError::Questions {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    let questions = parse_questions(&content).map_err(|e| match e {
        EvalError::InvalidQuestions(message) => EvalError::Questions {
            path: path.to_path_buf(),
            message,
        },
        other => other,
    })?;

    tracing::info!("Loaded {} questions from {:?}", questions.len(), path);
    Ok(questions)
}

pub fn parse_questions(content: &str) -> Result<Vec<EvaluationQuestion>, EvalError> {
    let trimmed = content.trim_start();

    let raw: Vec<RawQuestion> = if trimmed.starts_with('[') {
        serde_json::from_str(trimmed).map_err(|e| EvalError::InvalidQuestions(e.to_string()))?
    } else if trimmed.starts_with('{') && serde_json::from_str::<QuestionFile>(trimmed).is_ok() {
        serde_json::from_str::<QuestionFile>(trimmed)
            .map_err(|e| EvalError::InvalidQuestions(e.to_string()))?
            .questions
    } else {
        content
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(i, line)| {
                serde_json::from_str(line)
                    .map_err(|e| EvalError::InvalidQuestions(format!("line {}: {}", i + 1, e)))
            })
            .collect::<Result<_, _>>()?
    };

    if raw.is_empty() {
        return Err(EvalError::InvalidQuestions("question set is empty".to_string()));
    }

    let mut seen = HashSet::new();
    raw.into_iter()
        .enumerate()
        .map(|(i, q)| {
            let id = match q.id {
                Some(Value::String(s)) if !s.trim().is_empty() => s,
                Some(Value::Number(n)) => n.to_string(),
                _ => format!("q{}", i + 1),
            };
            if !seen.insert(id.clone()) {
                return Err(EvalError::InvalidQuestions(format!("duplicate question id '{}'", id)));
            }
            Ok(EvaluationQuestion {
                id,
                question: q.question,
                expected: q.expected,
                category: q.category,
            })
        })
        .collect()
}

/// 실행 식별용 지문 (모드 + 순서 있는 질문 세트)
///
/// 질문 내용이나 순서가 바뀌면 지문이 달라져 체크포인트를 재사용하지 않습니다.
pub fn fingerprint(mode: EvalMode, questions: &[EvaluationQuestion]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(mode.as_str().as_bytes());
    for q in questions {
        for field in [&q.id, &q.question, &q.expected] {
            hasher.update([0u8]);
            hasher.update(field.as_bytes());
        }
    }
    format!("{:x}", hasher.finalize())
}
