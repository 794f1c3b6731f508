//! 설정 - `ragbench.toml`
//!
//! 파일이 없으면 기본값을 사용합니다. API 키 등 비밀 값은 파일이 아닌
//! 환경변수에서만 읽습니다.
//!
//! ```toml
//! [retrieval]
//! top_k = 20
//! prefetch_limit = 100
//!
//! [bedrock]
//! endpoint = "https://bedrock-gateway.internal/"
//! knowledge_base_id = "KB123"
//! model = "4-5"
//! ```

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::knowledge::{get_data_dir, PostFilter, DEFAULT_PREFETCH_LIMIT, DEFAULT_RRF_K, DEFAULT_TOP_K};

/// 기본 설정 파일 이름
pub const DEFAULT_CONFIG_FILE: &str = "ragbench.toml";

// ============================================================================
// Sections
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EvalConfig {
    pub retrieval: RetrievalConfig,
    pub generation: GenerationConfig,
    pub judge: JudgeConfig,
    pub run: RunConfig,
    pub kendra: KendraConfig,
    pub bedrock: BedrockConfig,
    pub vertex: VertexConfig,
    pub openai: OpenAiConfig,
}

/// 로컬 하이브리드 검색
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// 인덱스 디렉토리 (기본: `<data_local_dir>/.ragbench`)
    pub data_dir: Option<PathBuf>,
    pub top_k: usize,
    pub prefetch_limit: usize,
    pub rrf_k: f64,
    /// 통합 점수 하한
    pub min_score: Option<f64>,
    /// 허용 문서 ID (비어 있으면 전체)
    pub allowed_docs: Vec<String>,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            top_k: DEFAULT_TOP_K,
            prefetch_limit: DEFAULT_PREFETCH_LIMIT,
            rrf_k: DEFAULT_RRF_K,
            min_score: None,
            allowed_docs: Vec::new(),
        }
    }
}

impl RetrievalConfig {
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(get_data_dir)
    }

    pub fn post_filter(&self) -> PostFilter {
        PostFilter {
            min_fused_score: self.min_score,
            allowed_docs: if self.allowed_docs.is_empty() {
                None
            } else {
                Some(self.allowed_docs.iter().cloned().collect::<BTreeSet<_>>())
            },
        }
    }
}

/// 답변 생성 (hybrid/dense/kendra)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// 짧은 모델 ID ("2.5-flash")
    pub model: String,
    /// 스레드당 유지할 대화 턴 수
    pub max_history_turns: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            model: "2.5-flash".to_string(),
            max_history_turns: 10,
        }
    }
}

/// 채점 모델
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JudgeConfig {
    pub model: String,
    /// 합격 점수 (0-100)
    pub pass_threshold: f64,
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            model: "2.5-flash".to_string(),
            pass_threshold: 70.0,
        }
    }
}

/// 배치 실행
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// 결과/체크포인트 루트
    pub output_dir: PathBuf,
    /// 질문당 어댑터 호출 제한 시간
    pub question_timeout_secs: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("eval_results"),
            question_timeout_secs: 180,
        }
    }
}

/// AWS Kendra (서명 게이트웨이 경유)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KendraConfig {
    pub endpoint: Option<String>,
    pub index_id: Option<String>,
    pub page_size: u32,
}

impl Default for KendraConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            index_id: None,
            page_size: 10,
        }
    }
}

/// AWS Bedrock Knowledge Base (서명 게이트웨이 경유)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BedrockConfig {
    pub endpoint: Option<String>,
    pub region: String,
    pub knowledge_base_id: Option<String>,
    pub model: String,
    pub number_of_results: u32,
    /// 사용자 프롬프트 템플릿 (필수 placeholder는 자동 보완)
    pub prompt_template: Option<String>,
}

impl Default for BedrockConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            region: "us-east-1".to_string(),
            knowledge_base_id: None,
            model: "4-5".to_string(),
            number_of_results: 20,
            prompt_template: None,
        }
    }
}

/// Vertex AI RAG Engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VertexConfig {
    pub project: Option<String>,
    pub location: String,
    /// `projects/.../locations/.../ragCorpora/...`
    pub corpus: Option<String>,
    pub model: String,
    pub similarity_top_k: u32,
}

impl Default for VertexConfig {
    fn default() -> Self {
        Self {
            project: None,
            location: "us-central1".to_string(),
            corpus: None,
            model: "2.5-flash".to_string(),
            similarity_top_k: 20,
        }
    }
}

/// OpenAI Responses API + file_search
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenAiConfig {
    pub base_url: String,
    pub vector_store_id: Option<String>,
    pub model: String,
    pub max_num_results: u32,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1/".to_string(),
            vector_store_id: None,
            model: "4.1".to_string(),
            max_num_results: 20,
        }
    }
}

// ============================================================================
// Loading
// ============================================================================

impl EvalConfig {
    /// 설정 로드
    ///
    /// 경로를 지정했는데 파일이 없으면 에러, 지정하지 않았으면
    /// `ragbench.toml`이 있을 때만 읽고 없으면 기본값을 사용합니다.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, required) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
        };

        if !path.exists() {
            if required {
                anyhow::bail!("Config file not found: {:?}", path);
            }
            tracing::debug!("No {} found, using defaults", DEFAULT_CONFIG_FILE);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config: {:?}", path))?;
        let config = Self::from_toml(&content)
            .with_context(|| format!("Invalid config: {:?}", path))?;

        tracing::info!("Loaded config from {:?}", path);
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let r = &self.retrieval;
        if r.top_k == 0 {
            anyhow::bail!("retrieval.top_k must be greater than 0");
        }
        if r.prefetch_limit < r.top_k {
            anyhow::bail!(
                "retrieval.prefetch_limit ({}) must be >= retrieval.top_k ({})",
                r.prefetch_limit,
                r.top_k
            );
        }
        if !r.rrf_k.is_finite() || r.rrf_k <= 0.0 {
            anyhow::bail!("retrieval.rrf_k must be a positive finite number (got {})", r.rrf_k);
        }
        if !(0.0..=100.0).contains(&self.judge.pass_threshold) {
            anyhow::bail!(
                "judge.pass_threshold must be within 0-100 (got {})",
                self.judge.pass_threshold
            );
        }
        if self.run.question_timeout_secs == 0 {
            anyhow::bail!("run.question_timeout_secs must be greater than 0");
        }
        if self.generation.max_history_turns == 0 {
            anyhow::bail!("generation.max_history_turns must be greater than 0");
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
