//! 문서 청킹 모듈
//!
//! 업로드된 문서(txt/md/pdf)를 검색 단위 청크로 분할합니다.
//! 같은 파일은 항상 같은 청크 시퀀스를 생성합니다 (결정적).
//! 위치 메타데이터(페이지/문단/조각)는 원본 형식이 제공하는 만큼만 채웁니다.

use std::path::Path;

use regex::Regex;
use thiserror::Error;

use crate::collector::FileType;

// ============================================================================
// Errors
// ============================================================================

/// 문서 수집 단계 에러
#[derive(Debug, Error)]
pub enum IngestError {
    /// 지원하지 않는 파일 형식
    #[error("unsupported file format: {0}")]
    UnsupportedFormat(String),

    /// 파일 읽기 실패
    #[error("failed to read file: {0}")]
    Io(#[from] std::io::Error),

    /// PDF 텍스트 추출 실패
    #[error("failed to extract PDF text: {0}")]
    Pdf(String),
}

// ============================================================================
// Chunk Configuration
// ============================================================================

/// 청킹 설정
#[derive(Debug, Clone)]
pub struct ChunkConfig {
    /// 최대 청크 크기 (문자 수). 문단이 이 크기를 넘으면 단어 경계에서 분할.
    pub max_characters: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            max_characters: 1200,
        }
    }
}

// ============================================================================
// Chunk
// ============================================================================

/// 문서 청크
///
/// 값을 알 수 없는 위치 필드는 None으로 둡니다 (0이 아님).
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    /// 문서 ID (업로드된 원본 파일명)
    pub doc_id: String,
    /// 청크 텍스트
    pub text: String,
    /// 페이지 번호 (PDF만, 1부터)
    pub page: Option<usize>,
    /// 페이지(또는 문서) 내 문단 순번 (1부터)
    pub section: Option<usize>,
    /// 문단이 분할된 경우 조각 순번 (1부터)
    pub section_chunk: Option<usize>,
    /// 문서 전체 기준 순번 (1부터 단조 증가)
    pub chunk_index: usize,
}

// ============================================================================
// DocumentChunker
// ============================================================================

/// 문서 청커
///
/// 텍스트 형식은 빈 줄 기준 문단을, PDF는 페이지별 문단을
/// 하나의 청크로 만듭니다. 문단이 `max_characters`를 넘으면
/// 단어 경계에서 분할하고 각 조각에 `section_chunk` 순번을 부여합니다.
pub struct DocumentChunker {
    config: ChunkConfig,
}

impl DocumentChunker {
    /// 설정으로 생성
    pub fn new(config: ChunkConfig) -> Self {
        Self { config }
    }

    /// 기본 설정으로 생성
    pub fn with_defaults() -> Self {
        Self::new(ChunkConfig::default())
    }

    /// 파일을 청크 시퀀스로 변환
    ///
    /// 추출 가능한 텍스트가 없으면 빈 벡터를 반환합니다 (에러 아님).
    pub fn chunk_file(&self, path: &Path, doc_id: &str) -> Result<Vec<Chunk>, IngestError> {
        let file_type = FileType::from_path(path).ok_or_else(|| {
            let label = path
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("(no extension)");
            IngestError::UnsupportedFormat(label.to_string())
        })?;

        match file_type {
            FileType::Text => {
                let text = std::fs::read_to_string(path)?;
                Ok(self.chunk_text(&text, doc_id))
            }
            FileType::Pdf => self.chunk_pdf(path, doc_id),
        }
    }

    /// 일반 텍스트 청킹 (페이지 없음)
    fn chunk_text(&self, text: &str, doc_id: &str) -> Vec<Chunk> {
        let mut chunks = Vec::new();
        let mut chunk_index = 1;
        self.push_paragraphs(text, doc_id, None, &mut chunk_index, &mut chunks);
        chunks
    }

    /// PDF 청킹 (페이지별 문단)
    fn chunk_pdf(&self, path: &Path, doc_id: &str) -> Result<Vec<Chunk>, IngestError> {
        let bytes = std::fs::read(path)?;
        let text = pdf_extract::extract_text_from_mem(&bytes)
            .map_err(|e| IngestError::Pdf(e.to_string()))?;

        if text.trim().is_empty() {
            tracing::warn!(
                "no text extracted from PDF {:?}, might be a scanned document",
                path
            );
            return Ok(vec![]);
        }

        let mut chunks = Vec::new();
        let mut chunk_index = 1;

        for (page_no, page_text) in split_pdf_pages(&text).into_iter().enumerate() {
            self.push_paragraphs(
                &page_text,
                doc_id,
                Some(page_no + 1),
                &mut chunk_index,
                &mut chunks,
            );
        }

        Ok(chunks)
    }

    /// 문단을 순회하며 청크 생성
    fn push_paragraphs(
        &self,
        text: &str,
        doc_id: &str,
        page: Option<usize>,
        chunk_index: &mut usize,
        out: &mut Vec<Chunk>,
    ) {
        for (section_no, para) in split_paragraphs(text).into_iter().enumerate() {
            let parts = split_long_paragraph(&para, self.config.max_characters);
            let was_split = parts.len() > 1;

            for (part_no, part) in parts.into_iter().enumerate() {
                out.push(Chunk {
                    doc_id: doc_id.to_string(),
                    text: part,
                    page,
                    section: Some(section_no + 1),
                    section_chunk: if was_split { Some(part_no + 1) } else { None },
                    chunk_index: *chunk_index,
                });
                *chunk_index += 1;
            }
        }
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// 빈 줄 기준 문단 분할
fn split_paragraphs(text: &str) -> Vec<String> {
    let blank_line = Regex::new(r"\n\s*\n").expect("invalid paragraph regex");

    blank_line
        .split(text)
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .map(|p| p.to_string())
        .collect()
}

/// 긴 문단을 단어 경계에서 분할
///
/// 단어 하나가 max를 넘는 경우 그 단어는 자르지 않고
/// 단독 조각으로 유지합니다.
fn split_long_paragraph(para: &str, max_characters: usize) -> Vec<String> {
    if para.chars().count() <= max_characters {
        return vec![para.to_string()];
    }

    let mut parts = Vec::new();
    let mut current = String::new();
    let mut current_chars = 0usize;

    for word in para.split_whitespace() {
        let word_chars = word.chars().count();

        if current_chars > 0 && current_chars + 1 + word_chars > max_characters {
            parts.push(current.clone());
            current.clear();
            current_chars = 0;
        }

        if current_chars > 0 {
            current.push(' ');
            current_chars += 1;
        }
        current.push_str(word);
        current_chars += word_chars;
    }

    if !current.is_empty() {
        parts.push(current);
    }

    parts
}

/// PDF 텍스트를 페이지 단위로 분리
///
/// 폼피드 문자를 우선 사용하고, 없으면 페이지 구분자 패턴을 시도합니다.
/// 둘 다 없으면 전체를 1페이지로 취급합니다.
fn split_pdf_pages(text: &str) -> Vec<String> {
    let pages: Vec<String> = text
        .split('\x0c')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

    if pages.len() > 1 {
        return pages;
    }

    // 일부 PDF는 "--- Page N ---" 형태의 구분자를 사용
    let page_pattern = Regex::new(r"(?m)^[\s]*[-=]+[\s]*(?:Page[\s]*)?(\d+)[\s]*[-=]+[\s]*$")
        .expect("invalid page regex");

    if page_pattern.is_match(text) {
        let pages: Vec<String> = page_pattern
            .split(text)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        if pages.len() > 1 {
            return pages;
        }
    }

    vec![text.trim().to_string()]
}

// ============================================================================
// Factory Function
// ============================================================================

/// 기본 설정으로 파일을 청킹
pub fn build_chunks(path: &Path, doc_id: &str) -> Result<Vec<Chunk>, IngestError> {
    DocumentChunker::with_defaults().chunk_file(path, doc_id)
}

// ============================================================================
// Tests
// ============================================================================
