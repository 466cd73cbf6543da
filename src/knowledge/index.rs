//! 벡터 인덱스 - 브루트포스 코사인 검색 + JSON 스냅샷
//!
//! 임베딩을 삽입 시점에 L2 정규화하여 메모리에 보관하고,
//! 검색 시 쿼리도 동일하게 정규화한 뒤 내적(= 코사인 유사도)으로
//! 전수 비교합니다. 영속성은 save()/load() 스냅샷 파일 하나입니다.
//!
//! 불변식: embeddings.len() == metadatas.len(). 추가는 전체가
//! 성공하거나 아무것도 추가하지 않습니다 (부분 쓰기 금지).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::embedding::EmbeddingProvider;

use super::chunker::Chunk;

/// 스냅샷 파일명 (저장 디렉토리 내)
const SNAPSHOT_FILE: &str = "index.json";

/// 스냅샷 포맷 버전
const SNAPSHOT_VERSION: u32 = 1;

// ============================================================================
// Errors
// ============================================================================

/// 벡터 인덱스 에러
#[derive(Debug, Error)]
pub enum IndexError {
    /// 임베딩 차원이 인덱스 차원과 다름 (치명적, 추가 중단)
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// 텍스트 수와 메타데이터 수가 다름
    #[error("texts/metadata length mismatch: {texts} texts, {metadatas} metadata records")]
    MetadataMismatch { texts: usize, metadatas: usize },

    /// 임베딩 호출 실패
    #[error("embedding request failed: {0}")]
    Embedding(anyhow::Error),

    /// 스냅샷 손상 (로드 시 인덱스는 빈 상태로 리셋됨)
    #[error("snapshot corrupted: {0}")]
    CorruptSnapshot(String),

    /// 스냅샷 I/O 실패
    #[error("snapshot I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// 스냅샷 직렬화 실패
    #[error("snapshot encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

// ============================================================================
// Types
// ============================================================================

/// 인덱스 레코드의 메타데이터
///
/// 값이 없는 위치 필드는 직렬화에서 생략됩니다 (0이 아니라 부재).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMeta {
    /// 문서 ID (원본 파일명)
    pub doc_id: String,
    /// 청크 텍스트
    pub text: String,
    /// 저장된 파일명
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// 페이지 번호 (1부터)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<usize>,
    /// 문단 순번 (1부터)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<usize>,
    /// 문단 내 조각 순번 (1부터)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section_chunk: Option<usize>,
    /// 문서 전체 기준 순번 (1부터)
    pub chunk_index: usize,
}

impl ChunkMeta {
    /// 청크에서 메타데이터 생성
    pub fn from_chunk(chunk: &Chunk, source: Option<String>) -> Self {
        Self {
            doc_id: chunk.doc_id.clone(),
            text: chunk.text.clone(),
            source,
            page: chunk.page,
            section: chunk.section,
            section_chunk: chunk.section_chunk,
            chunk_index: chunk.chunk_index,
        }
    }
}

/// 스냅샷 파일 구조
///
/// checksum은 임베딩 바이트의 SHA-256으로,
/// "손상된 파일"과 "정상적으로 비어있는 인덱스"를 구분합니다.
#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    dim: usize,
    saved_at: DateTime<Utc>,
    checksum: String,
    embeddings: Vec<Vec<f32>>,
    metadatas: Vec<ChunkMeta>,
}

// ============================================================================
// VectorIndex
// ============================================================================

/// 벡터 인덱스
///
/// 차원은 주입된 임베딩 프로바이더가 결정하며 인덱스 수명 동안 고정됩니다.
/// 메모리만 변경하므로 내구성이 필요하면 save()를 호출해야 합니다.
pub struct VectorIndex {
    dim: usize,
    snapshot_path: PathBuf,
    embedder: Arc<dyn EmbeddingProvider>,
    embeddings: Vec<Vec<f32>>,
    metadatas: Vec<ChunkMeta>,
}

impl VectorIndex {
    /// 새 인덱스 생성 (저장 디렉토리는 없으면 만든다)
    ///
    /// 디스크의 기존 스냅샷은 읽지 않습니다. load()를 따로 호출하세요.
    pub fn new(storage_dir: &Path, embedder: Arc<dyn EmbeddingProvider>) -> Result<Self, IndexError> {
        std::fs::create_dir_all(storage_dir)?;

        Ok(Self {
            dim: embedder.dimension(),
            snapshot_path: storage_dir.join(SNAPSHOT_FILE),
            embedder,
            embeddings: Vec::new(),
            metadatas: Vec::new(),
        })
    }

    /// 텍스트 배치를 임베딩하여 추가
    ///
    /// 전체 임베딩을 먼저 생성해 차원을 검증한 뒤에만 추가합니다.
    /// 하나라도 실패하면 인덱스는 변경되지 않습니다.
    pub async fn add_texts(
        &mut self,
        texts: &[String],
        metadatas: Vec<ChunkMeta>,
    ) -> Result<usize, IndexError> {
        if texts.len() != metadatas.len() {
            return Err(IndexError::MetadataMismatch {
                texts: texts.len(),
                metadatas: metadatas.len(),
            });
        }

        if texts.is_empty() {
            return Ok(0);
        }

        let mut vectors = self
            .embedder
            .embed_batch(texts)
            .await
            .map_err(IndexError::Embedding)?;

        for vector in &vectors {
            if vector.len() != self.dim {
                return Err(IndexError::DimensionMismatch {
                    expected: self.dim,
                    actual: vector.len(),
                });
            }
        }

        for vector in &mut vectors {
            l2_normalize(vector);
        }

        self.embeddings.extend(vectors);
        self.metadatas.extend(metadatas);

        Ok(texts.len())
    }

    /// 쿼리와 가장 유사한 상위 k개 레코드 검색
    ///
    /// 빈 인덱스는 임베딩 호출 없이 빈 결과를 반환합니다.
    /// 레코드가 k개 미만이면 전부 반환하고,
    /// 동점은 먼저 삽입된 레코드가 앞섭니다.
    pub async fn search(&self, query: &str, k: usize) -> Result<Vec<(f32, ChunkMeta)>, IndexError> {
        if self.embeddings.is_empty() || k == 0 {
            return Ok(vec![]);
        }

        let mut query_vec = self
            .embedder
            .embed(query)
            .await
            .map_err(IndexError::Embedding)?;

        if query_vec.len() != self.dim {
            return Err(IndexError::DimensionMismatch {
                expected: self.dim,
                actual: query_vec.len(),
            });
        }

        l2_normalize(&mut query_vec);

        let scores: Vec<f32> = self
            .embeddings
            .iter()
            .map(|row| dot(row, &query_vec))
            .collect();

        // 안정 정렬이므로 동점은 삽입 순서를 유지한다
        let mut order: Vec<usize> = (0..scores.len()).collect();
        order.sort_by(|&a, &b| {
            scores[b]
                .partial_cmp(&scores[a])
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        Ok(order
            .into_iter()
            .take(k)
            .map(|i| (scores[i], self.metadatas[i].clone()))
            .collect())
    }

    /// 스냅샷 저장 (임시 파일에 쓴 뒤 rename으로 교체)
    pub fn save(&self) -> Result<(), IndexError> {
        let snapshot = Snapshot {
            version: SNAPSHOT_VERSION,
            dim: self.dim,
            saved_at: Utc::now(),
            checksum: embedding_checksum(&self.embeddings),
            embeddings: self.embeddings.clone(),
            metadatas: self.metadatas.clone(),
        };

        let json = serde_json::to_string(&snapshot)?;

        let tmp_path = self.snapshot_path.with_extension("json.tmp");
        std::fs::write(&tmp_path, json)?;
        std::fs::rename(&tmp_path, &self.snapshot_path)?;

        tracing::debug!(
            "saved vector index snapshot ({} chunks) to {:?}",
            self.metadatas.len(),
            self.snapshot_path
        );
        Ok(())
    }

    /// 스냅샷 로드
    ///
    /// 파일이 없으면 빈 인덱스로 Ok(0). 파일이 있지만 읽을 수 없으면
    /// 인덱스를 유효한 빈 상태로 리셋하고 에러를 반환합니다.
    /// 로깅은 호출자 책임입니다.
    pub fn load(&mut self) -> Result<usize, IndexError> {
        if !self.snapshot_path.exists() {
            return Ok(0);
        }

        match self.read_snapshot() {
            Ok(snapshot) => {
                let count = snapshot.embeddings.len();
                self.embeddings = snapshot.embeddings;
                self.metadatas = snapshot.metadatas;
                Ok(count)
            }
            Err(e) => {
                self.embeddings.clear();
                self.metadatas.clear();
                Err(e)
            }
        }
    }

    /// 스냅샷 파일 읽기 및 검증
    fn read_snapshot(&self) -> Result<Snapshot, IndexError> {
        let raw = std::fs::read_to_string(&self.snapshot_path)?;

        let snapshot: Snapshot = serde_json::from_str(&raw)
            .map_err(|e| IndexError::CorruptSnapshot(format!("invalid JSON: {}", e)))?;

        if snapshot.version != SNAPSHOT_VERSION {
            return Err(IndexError::CorruptSnapshot(format!(
                "unsupported snapshot version {}",
                snapshot.version
            )));
        }

        if snapshot.dim != self.dim {
            return Err(IndexError::CorruptSnapshot(format!(
                "snapshot dimension {} does not match index dimension {}",
                snapshot.dim, self.dim
            )));
        }

        if snapshot.embeddings.len() != snapshot.metadatas.len() {
            return Err(IndexError::CorruptSnapshot(format!(
                "{} embeddings but {} metadata records",
                snapshot.embeddings.len(),
                snapshot.metadatas.len()
            )));
        }

        if let Some((i, row)) = snapshot
            .embeddings
            .iter()
            .enumerate()
            .find(|(_, row)| row.len() != snapshot.dim)
        {
            return Err(IndexError::CorruptSnapshot(format!(
                "row {} has dimension {}, expected {}",
                i,
                row.len(),
                snapshot.dim
            )));
        }

        if embedding_checksum(&snapshot.embeddings) != snapshot.checksum {
            return Err(IndexError::CorruptSnapshot(
                "embedding checksum mismatch".to_string(),
            ));
        }

        Ok(snapshot)
    }

    /// 레코드 수
    pub fn len(&self) -> usize {
        self.metadatas.len()
    }

    /// 비어있는지 여부 (O(1))
    pub fn is_empty(&self) -> bool {
        self.metadatas.is_empty()
    }

    /// 인덱스 차원
    pub fn dimension(&self) -> usize {
        self.dim
    }

    /// 스냅샷 파일 경로
    pub fn snapshot_path(&self) -> &Path {
        &self.snapshot_path
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// L2 정규화 (제자리). 영벡터는 그대로 둔다.
fn l2_normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in vector.iter_mut() {
            *x /= norm;
        }
    }
}

/// 내적
fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// 임베딩 행렬의 SHA-256 체크섬 (리틀엔디언 바이트 기준)
fn embedding_checksum(rows: &[Vec<f32>]) -> String {
    let mut hasher = Sha256::new();
    for row in rows {
        for value in row {
            hasher.update(value.to_le_bytes());
        }
    }
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

// ============================================================================
// Tests
// ============================================================================
