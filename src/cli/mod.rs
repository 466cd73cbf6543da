//! CLI 모듈
//!
//! pustaka-rag CLI 명령어 정의 및 구현.
//! 업로드 전송 계층 역할도 겸합니다: 수집한 파일을 uploads
//! 디렉토리에 uuid 접두사 저장명으로 복사하고, 원본 파일명을
//! doc_id로 넘깁니다.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use uuid::Uuid;

use crate::agent::{create_language_model, AnswerMode, LanguageModel, QaAgent};
use crate::classifier::TopicClassifier;
use crate::collector::{CollectionStats, CollectorConfig, FileCollector, FileType};
use crate::embedding::{create_embedder, has_api_key};
use crate::knowledge::{get_data_dir, Hit, KnowledgeStore};

/// 질문 최소 길이 (문자)
const MIN_QUESTION_CHARS: usize = 4;

/// top_k 허용 범위
const TOP_K_RANGE: std::ops::RangeInclusive<usize> = 1..=10;

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Parser)]
#[command(name = "pustaka-rag")]
#[command(version, about = "문서 QA 지식 저장소", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// 파일 또는 폴더를 지식베이스에 추가
    Ingest {
        /// 수집할 파일 경로
        #[arg(long)]
        file: Option<PathBuf>,

        /// 수집할 폴더 경로 (재귀)
        #[arg(short, long)]
        dir: Option<PathBuf>,

        /// 문서 ID (단일 파일만, 기본값은 원본 파일명)
        #[arg(long)]
        doc_id: Option<String>,

        /// PDF 파일 건너뛰기
        #[arg(long)]
        skip_pdfs: bool,

        /// 데이터 디렉토리 (기본값: ~/.pustaka-rag)
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },

    /// 질문에 답변
    Ask {
        /// 질문 (4자 이상)
        question: String,

        /// 검색할 청크 수 (1..=10)
        #[arg(short, long, default_value = "5")]
        top_k: usize,

        /// 언어모델로 답변 생성 (실패 시 추출 요약 폴백)
        #[arg(long)]
        llm: bool,

        /// 데이터 디렉토리 (기본값: ~/.pustaka-rag)
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },

    /// 지식베이스 검색 (원시 결과)
    Search {
        /// 검색 쿼리
        query: String,

        /// 결과 개수 제한
        #[arg(short, long, default_value = "5")]
        limit: usize,

        /// 데이터 디렉토리 (기본값: ~/.pustaka-rag)
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },

    /// 업로드된 문서 목록
    List {
        /// 데이터 디렉토리 (기본값: ~/.pustaka-rag)
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },

    /// 상태 확인
    Status {
        /// 데이터 디렉토리 (기본값: ~/.pustaka-rag)
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
}

// ============================================================================
// CLI Runner
// ============================================================================

/// CLI 명령어 실행
pub async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Ingest {
            file,
            dir,
            doc_id,
            skip_pdfs,
            data_dir,
        } => cmd_ingest(file, dir, doc_id, skip_pdfs, resolve_data_dir(data_dir)).await,
        Commands::Ask {
            question,
            top_k,
            llm,
            data_dir,
        } => cmd_ask(&question, top_k, llm, resolve_data_dir(data_dir)).await,
        Commands::Search {
            query,
            limit,
            data_dir,
        } => cmd_search(&query, limit, resolve_data_dir(data_dir)).await,
        Commands::List { data_dir } => cmd_list(resolve_data_dir(data_dir)),
        Commands::Status { data_dir } => cmd_status(resolve_data_dir(data_dir)).await,
    }
}

/// 데이터 디렉토리 결정 (플래그 > 기본값)
fn resolve_data_dir(data_dir: Option<PathBuf>) -> PathBuf {
    data_dir.unwrap_or_else(get_data_dir)
}

/// 지식 저장소 생성 (API 키 필요)
fn open_store(data_dir: &Path) -> Result<Arc<KnowledgeStore>> {
    if !has_api_key() {
        bail!(
            "API 키가 설정되지 않았습니다.\n\n\
             설정 방법:\n  \
             export GEMINI_API_KEY=your-api-key\n  \
             또는\n  \
             export GOOGLE_AI_API_KEY=your-api-key\n\n\
             API 키 발급: https://aistudio.google.com/app/apikey"
        );
    }

    let embedder = Arc::new(create_embedder()?);
    Ok(Arc::new(
        KnowledgeStore::new(data_dir, embedder).context("KnowledgeStore 초기화 실패")?,
    ))
}

// ============================================================================
// Command Implementations
// ============================================================================

/// 문서 수집 명령어 (ingest)
///
/// 파일을 uploads 디렉토리에 복사한 뒤 청킹/임베딩/인덱싱합니다.
async fn cmd_ingest(
    file: Option<PathBuf>,
    dir: Option<PathBuf>,
    doc_id: Option<String>,
    skip_pdfs: bool,
    data_dir: PathBuf,
) -> Result<()> {
    let store = open_store(&data_dir)?;

    let collector = FileCollector::new(CollectorConfig {
        skip_pdfs,
        ..Default::default()
    });

    // 파일 수집
    let files = if let Some(ref file_path) = file {
        // 단일 파일
        match collector.collect_file(file_path)? {
            Some(f) => vec![f],
            None => {
                println!("[!] 지원하지 않는 파일 형식: {:?}", file_path);
                return Ok(());
            }
        }
    } else if let Some(ref dir_path) = dir {
        // 폴더 재귀
        if doc_id.is_some() {
            bail!("--doc-id는 --file과 함께만 사용할 수 있습니다");
        }
        collector.collect_directory(dir_path)?
    } else {
        bail!("--file 또는 --dir를 지정해야 합니다");
    };

    if files.is_empty() {
        println!("[!] 수집할 파일이 없습니다.");
        return Ok(());
    }

    // 통계 표시
    let stats = CollectionStats::from_files(&files);
    println!("[*] 수집 대상: {} 파일", stats.total_files);
    println!("    텍스트: {}, PDF: {}", stats.text_files, stats.pdf_files);
    println!("    총 크기: {}", format_bytes(stats.total_size as usize));
    println!();

    // 파일별 처리
    let mut success_count = 0;
    let mut error_count = 0;
    let mut total_chunks = 0;

    for (i, collected_file) in files.iter().enumerate() {
        let original_name = collected_file
            .path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("document");

        let type_str = match collected_file.file_type {
            FileType::Text => "TXT",
            FileType::Pdf => "PDF",
        };

        print!(
            "[{}/{}] [{}] {}... ",
            i + 1,
            files.len(),
            type_str,
            original_name
        );

        // uploads 디렉토리로 복사 (저장명 = uuid 접두사 + 정제된 원본명)
        let stored_name = format!("{}_{}", Uuid::new_v4().simple(), sanitize_filename(original_name));
        let destination = store.uploads_dir().join(&stored_name);

        if let Err(e) = std::fs::copy(&collected_file.path, &destination) {
            println!("복사 실패: {}", e);
            error_count += 1;
            continue;
        }

        // doc_id는 원본 파일명 (단일 파일이면 --doc-id로 재정의 가능)
        let document_id = doc_id.as_deref().unwrap_or(original_name);

        match store.add_file(&destination, document_id).await {
            Ok(0) => {
                println!("텍스트 없음 (0 청크)");
                success_count += 1;
            }
            Ok(chunks) => {
                println!("완료 ({} 청크)", chunks);
                success_count += 1;
                total_chunks += chunks;
            }
            Err(e) => {
                println!("실패: {}", e);
                error_count += 1;
            }
        }
    }

    println!();
    println!(
        "[OK] 완료: 성공 {}, 실패 {}, 인덱싱된 청크 {}",
        success_count, error_count, total_chunks
    );

    Ok(())
}

/// 질문 명령어 (ask)
///
/// 검색 → 답변 합성 → 토픽 분류 파이프라인을 실행합니다.
async fn cmd_ask(question: &str, top_k: usize, use_llm: bool, data_dir: PathBuf) -> Result<()> {
    if question.trim().chars().count() < MIN_QUESTION_CHARS {
        bail!("질문은 {}자 이상이어야 합니다", MIN_QUESTION_CHARS);
    }
    if !TOP_K_RANGE.contains(&top_k) {
        bail!(
            "top_k는 {}..={} 범위여야 합니다",
            TOP_K_RANGE.start(),
            TOP_K_RANGE.end()
        );
    }

    let store = open_store(&data_dir)?;

    if store.is_empty().await {
        println!("[!] 지식베이스가 비어 있습니다. 먼저 문서를 추가하세요:");
        println!("    pustaka-rag ingest --file <문서>");
        return Ok(());
    }

    let llm: Option<Arc<dyn LanguageModel>> = if use_llm {
        match create_language_model() {
            Ok(model) => Some(Arc::new(model)),
            Err(e) => {
                // 프로바이더 없이도 답변은 폴백으로 계속된다
                tracing::warn!("language model unavailable: {}", e);
                None
            }
        }
    } else {
        None
    };

    let classifier = TopicClassifier::new(&data_dir.join("models"))?;
    let agent = QaAgent::new(store, classifier, llm);

    println!("[*] 질문: \"{}\"", question);

    let outcome = agent.ask(question, top_k, use_llm).await?;

    let mode_str = match outcome.mode {
        AnswerMode::Llm => "llm",
        AnswerMode::Extractive => "extractive",
        AnswerMode::LlmFallback => "llm_fallback",
        AnswerMode::Empty => "empty",
    };

    println!();
    println!("[OK] 답변 (모드: {}):", mode_str);
    println!("{}", outcome.answer);

    if let Some(ref classification) = outcome.classification {
        let flag = if outcome.provisional_model {
            " (임시 모델)"
        } else {
            ""
        };
        println!();
        println!(
            "[*] 분류: {} (확신도: {:.2}){}",
            classification.label, classification.score, flag
        );
    }

    if !outcome.context.is_empty() {
        println!();
        println!("[*] 근거 ({} 건):", outcome.context.len());
        print_hits(&outcome.context);
    }

    Ok(())
}

/// 검색 명령어 (search)
async fn cmd_search(query: &str, limit: usize, data_dir: PathBuf) -> Result<()> {
    let store = open_store(&data_dir)?;

    println!("[*] 검색 중: \"{}\"", query);

    let hits = store.search(query, limit).await.context("검색 실패")?;

    if hits.is_empty() {
        println!("\n[!] 검색 결과가 없습니다.");
        return Ok(());
    }

    println!("\n[OK] 검색 결과 ({} 건):\n", hits.len());
    print_hits(&hits);

    Ok(())
}

/// 검색 결과 출력 (위치 메타데이터 포함)
fn print_hits(hits: &[Hit]) {
    for (i, hit) in hits.iter().enumerate() {
        let mut position = String::new();
        if let Some(page) = hit.meta.page {
            position.push_str(&format!(" p.{}", page));
        }
        if let Some(section) = hit.meta.section {
            position.push_str(&format!(" §{}", section));
        }
        if let Some(part) = hit.meta.section_chunk {
            position.push_str(&format!("/{}", part));
        }

        println!(
            "{}. [점수: {:.4}] {} #{}{}",
            i + 1,
            hit.score,
            hit.meta.doc_id,
            hit.meta.chunk_index,
            position
        );
        println!("   내용: {}", truncate_text(&hit.text, 200));
        println!();
    }
}

/// 목록 명령어 (list)
///
/// uploads 디렉토리의 저장된 파일을 나열합니다.
fn cmd_list(data_dir: PathBuf) -> Result<()> {
    let uploads_dir = data_dir.join("uploads");

    if !uploads_dir.exists() {
        println!("[!] 업로드된 문서가 없습니다.");
        return Ok(());
    }

    let mut entries: Vec<_> = std::fs::read_dir(&uploads_dir)
        .context("uploads 디렉토리 읽기 실패")?
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_file())
        .collect();
    entries.sort_by_key(|e| e.file_name());

    if entries.is_empty() {
        println!("[!] 업로드된 문서가 없습니다.");
        return Ok(());
    }

    println!("[OK] 업로드된 문서 ({} 건):\n", entries.len());

    for entry in entries {
        let name = entry.file_name();
        let metadata = entry.metadata().ok();

        let size = metadata
            .as_ref()
            .map(|m| format_bytes(m.len() as usize))
            .unwrap_or_else(|| "-".to_string());

        let modified = metadata
            .and_then(|m| m.modified().ok())
            .map(|t| {
                let dt: chrono::DateTime<chrono::Local> = t.into();
                dt.format("%Y-%m-%d %H:%M").to_string()
            })
            .unwrap_or_else(|| "-".to_string());

        println!("  {} | {} | {}", name.to_string_lossy(), size, modified);
    }

    Ok(())
}

/// 상태 명령어 (status)
async fn cmd_status(data_dir: PathBuf) -> Result<()> {
    println!("pustaka-rag v{}", env!("CARGO_PKG_VERSION"));
    println!();

    // 데이터 디렉토리
    println!("[*] 데이터 디렉토리: {}", data_dir.display());

    // API 키 상태
    if has_api_key() {
        println!("[OK] API 키: 설정됨");
    } else {
        println!("[!] API 키: 미설정");
        println!("    설정: export GEMINI_API_KEY=your-key");
    }

    // 인덱스 상태 (임베더가 필요하므로 API 키가 있을 때만)
    if has_api_key() {
        match open_store(&data_dir) {
            Ok(store) => {
                let count = store.chunk_count().await;
                if count == 0 {
                    println!("[!] 벡터 인덱스: 비어 있음");
                } else {
                    println!("[OK] 벡터 인덱스: {} 청크", count);
                }
            }
            Err(e) => {
                println!("[!] KnowledgeStore 열기 실패: {}", e);
            }
        }
    }

    // 분류기 모델 상태
    match TopicClassifier::new(&data_dir.join("models")) {
        Ok(classifier) => {
            if classifier.has_model() {
                println!("[OK] 토픽 모델: 존재함");
            } else {
                println!("[!] 토픽 모델: 없음 (첫 질문 시 부트스트랩)");
            }
        }
        Err(e) => {
            println!("[!] 분류기 상태 확인 실패: {}", e);
        }
    }

    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

/// 파일명 정제: 영숫자와 "._-"만 유지, 나머지는 '_'
fn sanitize_filename(name: &str) -> String {
    let clean: String = name
        .chars()
        .map(|ch| {
            if ch.is_alphanumeric() || "._-".contains(ch) {
                ch
            } else {
                '_'
            }
        })
        .collect();

    let clean = clean.trim_matches(|c| c == '.' || c == '_');
    if clean.is_empty() {
        "upload".to_string()
    } else {
        clean.to_string()
    }
}

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
