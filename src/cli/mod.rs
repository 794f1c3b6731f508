//! CLI 모듈
//!
//! ragbench 명령어 정의 및 구현

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use crate::adapters::{build_adapter, EvalMode, Page};
use crate::config::EvalConfig;
use crate::embedding::{get_api_key, has_api_key, GeminiEmbedding};
use crate::eval::{
    load_questions, BatchEvaluator, CheckpointStore, LlmJudge, RunOptions, RunOutcome, RunState,
    StopSignal,
};
use crate::generation::GeminiGenerator;
use crate::knowledge::{
    load_chunk_records, ChunkStore, FusedResult, FusionEngine, LanceVectorStore, LocalHybridIndex,
    RetrievalPipeline, RetrievalRequest, RetrievalStrategy, SourceTag,
};

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Parser)]
#[command(name = "ragbench")]
#[command(version, about = "RAG 검색/답변 품질 벤치마크", long_about = None)]
pub struct Cli {
    /// 설정 파일 (기본: ./ragbench.toml, 없으면 기본값)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// 질문 세트로 평가 실행 (중단 시 체크포인트에서 재개)
    Eval {
        /// 평가 모드
        #[arg(value_enum)]
        mode: EvalMode,

        /// 질문 파일 (JSON 배열 또는 JSONL)
        #[arg(short, long)]
        questions: PathBuf,

        /// 앞에서부터 N개 질문만 실행
        #[arg(short, long)]
        limit: Option<usize>,

        /// 검색 출처(provenance)를 결과에 포함
        #[arg(long)]
        debug: bool,

        /// 기존 체크포인트를 무시하고 처음부터 실행
        #[arg(long)]
        no_resume: bool,

        /// 첫 질문 실패 시 실행 중단
        #[arg(long)]
        stop_on_fail: bool,
    },

    /// 로컬 인덱스 검색
    Query {
        /// 검색 쿼리
        query: String,

        /// 결과 개수
        #[arg(short = 'k', long)]
        top_k: Option<usize>,

        /// 벡터 검색만 사용
        #[arg(long)]
        dense_only: bool,

        /// 소스별 순위/점수 표시
        #[arg(long)]
        debug: bool,
    },

    /// JSONL 청크 파일을 로컬 인덱스에 추가
    Index {
        /// 청크 파일 (한 줄에 chunk_id, doc_id, page, url, text)
        chunks: PathBuf,
    },

    /// 문서의 청크 삭제
    Delete {
        /// 삭제할 문서 ID
        doc_id: String,
    },

    /// 상태 확인
    Status,
}

// ============================================================================
// CLI Runner
// ============================================================================

/// CLI 명령어 실행
pub async fn run(cli: Cli) -> Result<()> {
    let config = EvalConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Eval {
            mode,
            questions,
            limit,
            debug,
            no_resume,
            stop_on_fail,
        } => {
            let mut options = RunOptions::from_config(&config);
            options.debug = debug;
            options.resume = !no_resume;
            options.stop_on_fail = stop_on_fail;
            cmd_eval(&config, mode, questions, limit, options).await
        }
        Commands::Query {
            query,
            top_k,
            dense_only,
            debug,
        } => cmd_query(&config, &query, top_k, dense_only, debug).await,
        Commands::Index { chunks } => cmd_index(&config, chunks).await,
        Commands::Delete { doc_id } => cmd_delete(&config, &doc_id).await,
        Commands::Status => cmd_status(&config).await,
    }
}

// ============================================================================
// Command Implementations
// ============================================================================

fn require_api_key() -> Result<String> {
    if !has_api_key() {
        bail!(
            "API 키가 설정되지 않았습니다.\n\n\
             설정 방법:\n  \
             export GEMINI_API_KEY=your-api-key\n  \
             또는\n  \
             export GOOGLE_AI_API_KEY=your-api-key"
        );
    }
    get_api_key()
}

async fn open_index(config: &EvalConfig) -> Result<LocalHybridIndex> {
    let embedder = GeminiEmbedding::new(require_api_key()?)?;
    LocalHybridIndex::open(
        &config.retrieval.data_dir(),
        Arc::new(embedder),
        FusionEngine::new(config.retrieval.rrf_k),
    )
    .await
    .context("로컬 인덱스 열기 실패")
}

/// 평가 실행 명령어 (eval)
///
/// Ctrl-C는 현재 질문이 끝난 뒤 실행을 멈추고 체크포인트를 남깁니다.
async fn cmd_eval(
    config: &EvalConfig,
    mode: EvalMode,
    questions_path: PathBuf,
    limit: Option<usize>,
    options: RunOptions,
) -> Result<()> {
    let mut questions = load_questions(&questions_path)?;
    if let Some(limit) = limit {
        questions.truncate(limit);
    }
    if questions.is_empty() {
        bail!("실행할 질문이 없습니다 (--limit 확인)");
    }

    println!("[*] 어댑터 준비 중: {}", mode);
    let adapter = build_adapter(mode, config).await?;

    let judge_generator = GeminiGenerator::resolve(require_api_key()?, &config.judge.model)
        .await?
        .with_temperature(0.0);
    let judge = LlmJudge::new(Arc::new(judge_generator));

    let stop = StopSignal::new();
    {
        let stop = stop.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("\n[!] 중단 요청: 현재 질문이 끝나면 멈춥니다");
                stop.request_stop();
            }
        });
    }

    println!(
        "[*] 평가 시작: {} 질문, 모델 {}, 채점 {}",
        questions.len(),
        adapter.model(),
        config.judge.model
    );

    let outcome = BatchEvaluator::new(adapter, Arc::new(judge), options)
        .with_stop_signal(stop)
        .run(&questions)
        .await?;

    print_outcome(&outcome);

    match outcome.state {
        RunState::Completed => Ok(()),
        RunState::Interrupted => {
            println!("[!] 중단됨: 같은 명령을 다시 실행하면 이어서 진행합니다");
            Ok(())
        }
        _ => bail!(
            "평가 실패: {}",
            outcome.summary.failure.as_deref().unwrap_or("unknown error")
        ),
    }
}

fn print_outcome(outcome: &RunOutcome) {
    let summary = &outcome.summary;
    println!();
    println!("[OK] 실행 {} ({:?})", outcome.run_id, outcome.state);
    if outcome.resumed_from > 0 {
        println!("     이어받은 결과: {} 건", outcome.resumed_from);
    }
    println!(
        "     평가: {}/{}, 합격률 {:.1}%, 평균 점수 {:.1}",
        summary.evaluated, summary.total_questions, summary.pass_rate, summary.mean_score
    );
    if summary.adapter_failures + summary.judge_failures > 0 {
        println!(
            "     실패: 어댑터 {} 건, 채점 {} 건",
            summary.adapter_failures, summary.judge_failures
        );
    }
    println!("     결과: {}", outcome.run_dir.display());
}

/// 검색 명령어 (query)
async fn cmd_query(
    config: &EvalConfig,
    query: &str,
    top_k: Option<usize>,
    dense_only: bool,
    debug: bool,
) -> Result<()> {
    let index = open_index(config).await?;
    let pipeline = RetrievalPipeline::new(Arc::new(index), FusionEngine::new(config.retrieval.rrf_k))
        .with_filter(config.retrieval.post_filter());

    let top_k = top_k.unwrap_or(config.retrieval.top_k);
    let strategy = if dense_only {
        RetrievalStrategy::DenseOnly
    } else {
        RetrievalStrategy::Hybrid
    };
    let request = RetrievalRequest::new(query)
        .limits(top_k, config.retrieval.prefetch_limit.max(top_k))
        .strategy(strategy)
        .debug(debug);

    println!("[*] 검색 중: \"{}\"", query);
    let output = pipeline.retrieve(&request).await?;

    for failure in &output.failed_sources {
        println!("[!] {} 검색 실패: {}", failure.tag, failure.message);
    }

    if output.results.is_empty() {
        println!("\n[!] 검색 결과가 없습니다.");
        return Ok(());
    }

    println!("\n[OK] 검색 결과 ({} 건):\n", output.results.len());
    for (i, result) in output.results.iter().enumerate() {
        println!(
            "{}. [점수: {:.5}] {} p.{}  ({})",
            i + 1,
            result.fused_score,
            result.payload.doc_id,
            Page::from(result.payload.page),
            result.id
        );
        if debug {
            println!("   {}", provenance_line(result));
        }
        println!("   내용: {}", truncate_text(&result.payload.text, 200));
        println!();
    }

    Ok(())
}

/// 소스별 순위/점수 한 줄 요약
fn provenance_line(result: &FusedResult) -> String {
    let Some(provenance) = &result.provenance else {
        return "출처 정보 없음".to_string();
    };

    let hit = |tag: SourceTag| {
        provenance
            .hits
            .get(&tag)
            .map(|h| format!("{} #{} ({:.4})", tag, h.rank, h.score))
            .unwrap_or_else(|| format!("{} -", tag))
    };

    format!(
        "[{:?}] {} | {}",
        provenance.origin,
        hit(SourceTag::Dense),
        hit(SourceTag::Sparse)
    )
}

/// 인덱싱 명령어 (index)
async fn cmd_index(config: &EvalConfig, chunks_path: PathBuf) -> Result<()> {
    let chunks = load_chunk_records(&chunks_path)?;
    if chunks.is_empty() {
        println!("[!] 추가할 청크가 없습니다.");
        return Ok(());
    }

    let index = open_index(config).await?;
    println!("[*] {} 청크 임베딩 및 저장 중...", chunks.len());
    let indexed = index.index_chunks(&chunks).await?;

    let stats = index.stats().await?;
    println!("[OK] {} 청크 추가됨", indexed);
    println!(
        "     전체: 문서 {} 건, 청크 {} 건, 벡터 {} 건",
        stats.store.document_count, stats.store.chunk_count, stats.vector_count
    );
    Ok(())
}

/// 문서 삭제 명령어 (delete)
async fn cmd_delete(config: &EvalConfig, doc_id: &str) -> Result<()> {
    let index = open_index(config).await?;
    let removed = index.delete_document(doc_id).await?;

    if removed == 0 {
        println!("[!] 삭제할 문서를 찾을 수 없습니다: {}", doc_id);
    } else {
        println!("[OK] 문서 {} 삭제됨 ({} 청크)", doc_id, removed);
    }
    Ok(())
}

/// 상태 확인 명령어 (status)
async fn cmd_status(config: &EvalConfig) -> Result<()> {
    println!("ragbench v{}", env!("CARGO_PKG_VERSION"));
    println!();

    let data_dir = config.retrieval.data_dir();
    println!("[*] 데이터 디렉토리: {}", data_dir.display());

    if has_api_key() {
        println!("[OK] API 키: 설정됨");
    } else {
        println!("[!] API 키: 미설정");
        println!("    설정: export GEMINI_API_KEY=your-key");
    }

    let db_path = data_dir.join("chunks.db");
    if db_path.exists() {
        match ChunkStore::open(&db_path).and_then(|store| store.stats()) {
            Ok(stats) => {
                println!("[OK] 저장된 청크: {} 건 (문서 {} 건)", stats.chunk_count, stats.document_count);
                println!("     텍스트 크기: {}", format_bytes(stats.total_text_bytes));
            }
            Err(e) => println!("[!] 청크 저장소 조회 실패: {:#}", e),
        }
    } else {
        println!("[!] 인덱스 없음 (ragbench index <chunks.jsonl>)");
    }

    let lance_path = data_dir.join("vectors.lance");
    if lance_path.exists() {
        match LanceVectorStore::open(&lance_path).await {
            Ok(store) => match store.count().await {
                Ok(count) => println!("[OK] 벡터 인덱스: {} 청크", count),
                Err(e) => println!("[!] 벡터 통계 조회 실패: {:#}", e),
            },
            Err(e) => println!("[!] 벡터 인덱스 열기 실패: {:#}", e),
        }
    }

    let output_dir = &config.run.output_dir;
    let pending: Vec<EvalMode> = EvalMode::ALL
        .into_iter()
        .filter(|mode| CheckpointStore::new(output_dir, *mode).exists())
        .collect();
    if pending.is_empty() {
        println!("[OK] 미완료 평가 없음");
    } else {
        for mode in pending {
            println!("[!] 미완료 평가: {} (ragbench eval {} ... 로 재개)", mode, mode);
        }
    }

    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

/// 텍스트 자르기 (UTF-8 안전)
fn truncate_text(text: &str, max_chars: usize) -> String {
    let cleaned = text.replace('\n', " ").replace('\r', "");
    let cleaned = cleaned.trim();

    if cleaned.chars().count() <= max_chars {
        cleaned.to_string()
    } else {
        let truncated: String = cleaned.chars().take(max_chars).collect();
        format!("{}...", truncated)
    }
}

/// 바이트 크기 포맷팅
fn format_bytes(bytes: usize) -> String {
    const KB: usize = 1024;
    const MB: usize = KB * 1024;

    if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

// ============================================================================
// Tests
// ============================================================================
