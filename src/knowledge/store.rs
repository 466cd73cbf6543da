//! Knowledge Store - 단일 락으로 직렬화된 지식 저장소
//!
//! 벡터 인덱스 하나를 소유하고, 모든 인덱스 작업(임베딩 포함)을
//! 하나의 비동기 뮤텍스로 직렬화합니다. 검색과 수집은 절대
//! 교차 실행되지 않으므로 검색이 부분 추가 상태를 볼 수 없습니다.
//! 읽기 동시성(rwlock, 스냅샷 읽기)은 이후 최적화 과제로 남겨둡니다.
//!
//! 저장 위치: {data_dir}/index/ (스냅샷), {data_dir}/uploads/ (원본 파일)

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::sync::Mutex;

use crate::embedding::EmbeddingProvider;

use super::chunker::{ChunkConfig, DocumentChunker};
use super::index::{ChunkMeta, VectorIndex};

// ============================================================================
// Data Directory
// ============================================================================

/// 기본 데이터 디렉토리 경로 (~/.pustaka-rag/)
pub fn get_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".pustaka-rag")
}

// ============================================================================
// Types
// ============================================================================

/// 검색 결과 (일시적, 저장되지 않음)
#[derive(Debug, Clone, Serialize)]
pub struct Hit {
    /// 유사도 점수 (높을수록 관련)
    pub score: f32,
    /// 청크 텍스트
    pub text: String,
    /// 인덱스 메타데이터
    pub meta: ChunkMeta,
}

// ============================================================================
// KnowledgeStore
// ============================================================================

/// Knowledge Store
///
/// 명시적으로 생성하여 필요한 곳에 주입합니다 (전역 싱글톤 없음).
/// 인덱스는 첫 사용 시 지연 생성되며, 그때 디스크 스냅샷을 로드합니다.
/// 각 작업은 시작부터 끝까지 같은 락을 잡으므로 작업 도중 취소되지
/// 않습니다. 타임아웃은 호출자 몫이며, 타임아웃이 나도 진행 중이던
/// 변경은 완료되고 저장됩니다.
pub struct KnowledgeStore {
    index_dir: PathBuf,
    uploads_dir: PathBuf,
    chunk_config: ChunkConfig,
    embedder: Arc<dyn EmbeddingProvider>,
    index: Mutex<Option<VectorIndex>>,
}

impl KnowledgeStore {
    /// 기본 청킹 설정으로 생성
    ///
    /// # Arguments
    /// * `data_dir` - 이 저장소 전용 데이터 디렉토리
    /// * `embedder` - 임베딩 프로바이더 (인덱스 차원을 결정)
    pub fn new(data_dir: &Path, embedder: Arc<dyn EmbeddingProvider>) -> Result<Self> {
        Self::with_chunk_config(data_dir, embedder, ChunkConfig::default())
    }

    /// 청킹 설정을 지정하여 생성
    pub fn with_chunk_config(
        data_dir: &Path,
        embedder: Arc<dyn EmbeddingProvider>,
        chunk_config: ChunkConfig,
    ) -> Result<Self> {
        let index_dir = data_dir.join("index");
        let uploads_dir = data_dir.join("uploads");

        std::fs::create_dir_all(&index_dir).context("Failed to create index directory")?;
        std::fs::create_dir_all(&uploads_dir).context("Failed to create uploads directory")?;

        Ok(Self {
            index_dir,
            uploads_dir,
            chunk_config,
            embedder,
            index: Mutex::new(None),
        })
    }

    /// 업로드 디렉토리 경로
    pub fn uploads_dir(&self) -> &Path {
        &self.uploads_dir
    }

    /// 파일을 청킹하여 인덱스에 추가하고 저장
    ///
    /// 청크가 하나도 나오지 않으면 인덱스를 건드리지 않고 0을 반환합니다.
    /// 지식베이스를 키우는 유일한 경로입니다.
    ///
    /// # Returns
    /// 인덱싱된 청크 수
    pub async fn add_file(&self, path: &Path, doc_id: &str) -> Result<usize> {
        // 청킹(PDF 추출 포함)은 CPU 바운드이므로 blocking 스레드에서
        let chunk_config = self.chunk_config.clone();
        let chunk_path = path.to_path_buf();
        let chunk_doc_id = doc_id.to_string();

        let chunks = tokio::task::spawn_blocking(move || {
            DocumentChunker::new(chunk_config).chunk_file(&chunk_path, &chunk_doc_id)
        })
        .await
        .context("chunking task failed")??;

        if chunks.is_empty() {
            tracing::info!("no text content in {:?}, nothing indexed", path);
            return Ok(0);
        }

        let source = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|s| s.to_string());

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let metas: Vec<ChunkMeta> = chunks
            .iter()
            .map(|c| ChunkMeta::from_chunk(c, source.clone()))
            .collect();

        let mut slot = self.index.lock().await;
        let index = self.ensure_index(&mut slot)?;

        let added = index.add_texts(&texts, metas).await?;
        index.save()?;

        tracing::info!("indexed {} chunks from document '{}'", added, doc_id);
        Ok(added)
    }

    /// 쿼리로 상위 k개 청크 검색
    pub async fn search(&self, query: &str, k: usize) -> Result<Vec<Hit>> {
        let mut slot = self.index.lock().await;
        let index = self.ensure_index(&mut slot)?;

        let results = index.search(query, k).await?;

        Ok(results
            .into_iter()
            .map(|(score, meta)| Hit {
                score,
                text: meta.text.clone(),
                meta,
            })
            .collect())
    }

    /// 인덱스가 비어있는지 여부
    pub async fn is_empty(&self) -> bool {
        let mut slot = self.index.lock().await;
        match self.ensure_index(&mut slot) {
            Ok(index) => index.is_empty(),
            Err(e) => {
                tracing::warn!("failed to initialize vector index: {}", e);
                true
            }
        }
    }

    /// 인덱싱된 청크 수
    pub async fn chunk_count(&self) -> usize {
        let mut slot = self.index.lock().await;
        match self.ensure_index(&mut slot) {
            Ok(index) => index.len(),
            Err(_) => 0,
        }
    }

    /// 인덱스 지연 생성 + 스냅샷 로드 (락을 잡은 상태에서만 호출)
    ///
    /// 손상된 스냅샷은 빈 인덱스로 복구하고 warn으로 남깁니다.
    /// "원래 비어있음"은 debug로만 남겨 둘을 구분합니다.
    fn ensure_index<'a>(&self, slot: &'a mut Option<VectorIndex>) -> Result<&'a mut VectorIndex> {
        if slot.is_none() {
            let mut index = VectorIndex::new(&self.index_dir, Arc::clone(&self.embedder))
                .context("Failed to create vector index")?;

            match index.load() {
                Ok(0) => tracing::debug!("vector index starting empty"),
                Ok(n) => tracing::info!("loaded vector index with {} chunks", n),
                Err(e) => tracing::warn!(
                    "vector index snapshot unusable, starting empty: {}",
                    e
                ),
            }

            *slot = Some(index);
        }

        slot.as_mut().context("vector index not initialized")
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::mock::MockEmbedding;
    use crate::knowledge::chunker::IngestError;
    use tempfile::TempDir;

    fn create_test_store(dir: &TempDir) -> KnowledgeStore {
        let embedder = Arc::new(MockEmbedding::new(256));
        KnowledgeStore::new(dir.path(), embedder).unwrap()
    }

    fn write_doc(dir: &TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[tokio::test]
    async fn test_add_file_then_search_finds_chunk() {
        let dir = TempDir::new().unwrap();
        let store = create_test_store(&dir);

        let path = write_doc(
            &dir,
            "perda.txt",
            "Pasal 1: Ketentuan umum mengenai pajak daerah.\n\n\
             Pasal 2: Retribusi ditetapkan sebesar 2 persen.",
        );

        let added = store.add_file(&path, "perda-1").await.unwrap();
        assert_eq!(added, 2);
        assert!(!store.is_empty().await);

        let hits = store.search("Pasal 2", 1).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].meta.doc_id, "perda-1");
        assert_eq!(hits[0].meta.chunk_index, 2);
        assert!(hits[0].text.contains("Pasal 2"));
    }

    #[tokio::test]
    async fn test_search_respects_k_and_record_count() {
        let dir = TempDir::new().unwrap();
        let store = create_test_store(&dir);

        let path = write_doc(&dir, "doc.txt", "Alinea satu.\n\nAlinea dua.\n\nAlinea tiga.");
        store.add_file(&path, "doc").await.unwrap();

        let hits = store.search("alinea", 2).await.unwrap();
        assert_eq!(hits.len(), 2);

        let hits = store.search("alinea", 10).await.unwrap();
        assert_eq!(hits.len(), 3);
    }

    #[tokio::test]
    async fn test_empty_store_search_returns_nothing() {
        let dir = TempDir::new().unwrap();
        let embedder = Arc::new(MockEmbedding::new(64));
        let store = KnowledgeStore::new(dir.path(), embedder.clone()).unwrap();

        assert!(store.is_empty().await);

        let hits = store.search("apapun", 5).await.unwrap();
        assert!(hits.is_empty());
        assert_eq!(embedder.call_count(), 0);
    }

    #[tokio::test]
    async fn test_empty_document_returns_zero_without_mutation() {
        let dir = TempDir::new().unwrap();
        let store = create_test_store(&dir);

        let path = write_doc(&dir, "blank.txt", "  \n\n  ");
        let added = store.add_file(&path, "blank").await.unwrap();

        assert_eq!(added, 0);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_unsupported_format_propagates() {
        let dir = TempDir::new().unwrap();
        let store = create_test_store(&dir);

        let path = write_doc(&dir, "binary.exe", "MZ");
        let err = store.add_file(&path, "binary").await.unwrap_err();

        assert!(matches!(
            err.downcast_ref::<IngestError>(),
            Some(IngestError::UnsupportedFormat(_))
        ));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_restart_reproduces_scores() {
        let dir = TempDir::new().unwrap();
        let embedder = Arc::new(MockEmbedding::new(128));

        let path = write_doc(
            &dir,
            "laporan.txt",
            "Anggaran tahunan daerah.\n\nLaporan realisasi keuangan.",
        );

        let before = {
            let store = KnowledgeStore::new(dir.path(), embedder.clone()).unwrap();
            store.add_file(&path, "laporan").await.unwrap();
            store.search("laporan keuangan", 2).await.unwrap()
        };

        // 같은 디렉토리로 새 저장소를 열면 스냅샷에서 복원된다
        let store = KnowledgeStore::new(dir.path(), embedder).unwrap();
        assert!(!store.is_empty().await);
        assert_eq!(store.chunk_count().await, 2);

        let after = store.search("laporan keuangan", 2).await.unwrap();
        assert_eq!(before.len(), after.len());
        for (a, b) in before.iter().zip(after.iter()) {
            assert_eq!(a.score, b.score);
            assert_eq!(a.meta, b.meta);
        }
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_recovers_to_empty() {
        let dir = TempDir::new().unwrap();
        let embedder = Arc::new(MockEmbedding::new(64));

        {
            let store = KnowledgeStore::new(dir.path(), embedder.clone()).unwrap();
            let path = write_doc(&dir, "doc.txt", "Isi dokumen.");
            store.add_file(&path, "doc").await.unwrap();
        }

        std::fs::write(dir.path().join("index").join("index.json"), "garbage").unwrap();

        let store = KnowledgeStore::new(dir.path(), embedder).unwrap();
        assert!(store.is_empty().await);

        // 복구된 저장소는 계속 쓸 수 있어야 한다
        let path = write_doc(&dir, "doc2.txt", "Dokumen baru.");
        let added = store.add_file(&path, "doc2").await.unwrap();
        assert_eq!(added, 1);
    }

    #[tokio::test]
    async fn test_concurrent_adds_serialize() {
        let dir = TempDir::new().unwrap();
        let store = create_test_store(&dir);

        let path_a = write_doc(&dir, "a.txt", "Dokumen alpha satu.\n\nDokumen alpha dua.");
        let path_b = write_doc(&dir, "b.txt", "Dokumen beta satu.");

        let (a, b) = tokio::join!(store.add_file(&path_a, "a"), store.add_file(&path_b, "b"));
        assert_eq!(a.unwrap() + b.unwrap(), 3);
        assert_eq!(store.chunk_count().await, 3);

        let hits = store.search("dokumen", 10).await.unwrap();
        assert_eq!(hits.len(), 3);
    }

    #[tokio::test]
    async fn test_search_hit_text_defaults_to_metadata_text() {
        let dir = TempDir::new().unwrap();
        let store = create_test_store(&dir);

        let path = write_doc(&dir, "doc.txt", "Kalimat tunggal.");
        store.add_file(&path, "doc").await.unwrap();

        let hits = store.search("kalimat", 1).await.unwrap();
        assert_eq!(hits[0].text, hits[0].meta.text);
        assert_eq!(hits[0].meta.source.as_deref(), Some("doc.txt"));
    }
}
