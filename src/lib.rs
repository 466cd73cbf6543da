//! pustaka-rag - 문서 QA 지식 저장소
//!
//! 업로드된 문서를 청킹/임베딩하여 벡터 인덱스로 검색하고,
//! 검색 결과로 답변을 합성(선택적으로 Gemini 언어모델 사용)하며,
//! 토픽 분류기로 검색 결과에 라벨을 부여하는 로컬 RAG 시스템입니다.

pub mod agent;
pub mod classifier;
pub mod cli;
pub mod collector;
pub mod embedding;
pub mod knowledge;

// Re-exports
pub use agent::{answer_query, AnswerMode, AskOutcome, LanguageModel, QaAgent, QaResult};
pub use classifier::{TopicClassifier, TopicModel, LABELS};
pub use embedding::{get_api_key, has_api_key, EmbeddingProvider, GeminiEmbedding};
pub use knowledge::{
    build_chunks, get_data_dir, Chunk, ChunkConfig, ChunkMeta, DocumentChunker, Hit, IndexError,
    IngestError, KnowledgeStore, VectorIndex,
};
