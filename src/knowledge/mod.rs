//! Knowledge 모듈 - 문서 QA 지식 저장소
//!
//! - Chunker: 문서를 위치 메타데이터가 붙은 청크로 분할
//! - VectorIndex: 브루트포스 코사인 검색 + JSON 스냅샷 영속성
//! - KnowledgeStore: 단일 락으로 직렬화된 저장소 파사드

mod chunker;
mod index;
mod store;

// Re-exports
pub use chunker::{build_chunks, Chunk, ChunkConfig, DocumentChunker, IngestError};
pub use index::{ChunkMeta, IndexError, VectorIndex};
pub use store::{get_data_dir, Hit, KnowledgeStore};
