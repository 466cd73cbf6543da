//! 임베딩 모듈 - Gemini API를 통한 텍스트 벡터화
//!
//! 텍스트를 고정 차원 벡터로 변환합니다. 같은 텍스트는 항상
//! 같은 벡터가 나와야 하며(프로바이더 계약), 차원은 인덱스
//! 수명 동안 고정됩니다.
//!
//! ## 사용법
//! ```rust,ignore
//! let embedder = GeminiEmbedding::from_env()?;
//! let embedding = embedder.embed("Halo dunia").await?;
//! ```

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

// ============================================================================
// EmbeddingProvider Trait
// ============================================================================

/// 임베딩 프로바이더 트레이트
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// 단일 텍스트 임베딩
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// 배치 임베딩 (기본 구현: 순차 호출)
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut results = Vec::with_capacity(texts.len());
        for (i, text) in texts.iter().enumerate() {
            tracing::debug!("embedding batch {}/{}", i + 1, texts.len());
            results.push(self.embed(text).await?);
        }
        Ok(results)
    }

    /// 임베딩 차원 수
    fn dimension(&self) -> usize;

    /// 프로바이더 이름
    fn name(&self) -> &str;
}

// ============================================================================
// Google Gemini Embedding
// ============================================================================

/// Gemini 임베딩 API 엔드포인트 (gemini-embedding-001)
/// source: https://ai.google.dev/gemini-api/docs/embeddings
const GEMINI_EMBED_URL: &str =
    "https://generativelanguage.googleapis.com/v1beta/models/gemini-embedding-001:embedContent";

/// 기본 임베딩 차원
pub const DEFAULT_DIMENSION: usize = 768;

/// 호출 간 최소 딜레이 (무료 티어 60 RPM 준수)
const MIN_DELAY: Duration = Duration::from_millis(1000);
/// 429 에러 시 최대 재시도 횟수
const MAX_RETRIES: u32 = 3;
/// 재시도 초기 백오프
const INITIAL_BACKOFF_MS: u64 = 2000;

/// Google Gemini 임베딩 구현체
///
/// 문서와 쿼리에 같은 호출 형태를 사용하므로 인덱스 구축과
/// 검색 시점의 벡터 공간이 항상 일치합니다.
#[derive(Debug)]
pub struct GeminiEmbedding {
    api_key: String,
    client: reqwest::Client,
    dimension: usize,
    last_request: Mutex<Option<Instant>>,
}

impl GeminiEmbedding {
    /// 기본 차원으로 생성
    pub fn new(api_key: String) -> Result<Self> {
        Self::with_dimension(api_key, DEFAULT_DIMENSION)
    }

    /// 차원을 지정하여 생성
    ///
    /// # Arguments
    /// * `api_key` - Google AI API 키
    /// * `dimension` - 임베딩 차원 (768, 1536, 3072 중 선택)
    pub fn with_dimension(api_key: String, dimension: usize) -> Result<Self> {
        if ![768, 1536, 3072].contains(&dimension) {
            anyhow::bail!(
                "Invalid dimension: {}. Must be 768, 1536, or 3072",
                dimension
            );
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            api_key,
            client,
            dimension,
            last_request: Mutex::new(None),
        })
    }

    /// 환경변수에서 API 키를 읽어 생성
    ///
    /// 우선순위: GEMINI_API_KEY > GOOGLE_AI_API_KEY
    pub fn from_env() -> Result<Self> {
        Self::new(get_api_key()?)
    }

    /// 환경변수에서 API 키를 읽어 차원 지정하여 생성
    pub fn from_env_with_dimension(dimension: usize) -> Result<Self> {
        Self::with_dimension(get_api_key()?, dimension)
    }

    /// 호출 간 최소 간격 유지 (버스트 방지)
    async fn pace(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(at) = *last {
            let elapsed = at.elapsed();
            if elapsed < MIN_DELAY {
                tokio::time::sleep(MIN_DELAY - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }

    /// 임베딩 API 1회 호출
    ///
    /// 429는 Retry 로, 그 외 에러는 Fatal 로 구분해 반환합니다.
    async fn request_embedding(&self, request: &EmbedRequest) -> RequestOutcome {
        let response = match self
            .client
            .post(GEMINI_EMBED_URL)
            .header("x-goog-api-key", &self.api_key)
            .json(request)
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) => {
                return RequestOutcome::Retry(anyhow::anyhow!(
                    "Failed to send embedding request: {}",
                    e
                ))
            }
        };

        let status = response.status();
        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                return RequestOutcome::Retry(anyhow::anyhow!(
                    "Failed to read response body: {}",
                    e
                ))
            }
        };

        if status.is_success() {
            return match serde_json::from_str::<EmbedResponse>(&body) {
                Ok(parsed) => RequestOutcome::Done(parsed.embedding.values),
                Err(e) => RequestOutcome::Fatal(anyhow::anyhow!(
                    "Failed to parse embedding response: {}",
                    e
                )),
            };
        }

        if status.as_u16() == 429 {
            return RequestOutcome::Retry(anyhow::anyhow!("Rate limit exceeded (429)"));
        }

        if let Ok(error) = serde_json::from_str::<GeminiError>(&body) {
            return RequestOutcome::Fatal(anyhow::anyhow!(
                "Gemini API error ({}): {}",
                error.error.status,
                error.error.message
            ));
        }
        RequestOutcome::Fatal(anyhow::anyhow!("Gemini API error ({}): {}", status, body))
    }
}

/// 1회 호출 결과
enum RequestOutcome {
    Done(Vec<f32>),
    Retry(anyhow::Error),
    Fatal(anyhow::Error),
}

/// Gemini API 요청 본문
/// source: https://ai.google.dev/gemini-api/docs/embeddings
#[derive(Debug, Serialize)]
struct EmbedRequest {
    model: String,
    content: EmbedContent,
    #[serde(rename = "outputDimensionality")]
    output_dimensionality: usize,
}

#[derive(Debug, Serialize)]
struct EmbedContent {
    parts: Vec<EmbedPart>,
}

#[derive(Debug, Serialize)]
struct EmbedPart {
    text: String,
}

/// Gemini API 응답
#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embedding: EmbeddingValues,
}

#[derive(Debug, Deserialize)]
struct EmbeddingValues {
    values: Vec<f32>,
}

/// Gemini API 에러 응답
#[derive(Debug, Deserialize)]
struct GeminiError {
    error: GeminiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct GeminiErrorDetail {
    message: String,
    #[serde(default)]
    status: String,
}

#[async_trait]
impl EmbeddingProvider for GeminiEmbedding {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        // 빈 텍스트는 API를 부르지 않고 영벡터로
        if text.trim().is_empty() {
            return Ok(vec![0.0; self.dimension]);
        }

        let request = EmbedRequest {
            model: "models/gemini-embedding-001".to_string(),
            content: EmbedContent {
                parts: vec![EmbedPart {
                    text: text.to_string(),
                }],
            },
            output_dimensionality: self.dimension,
        };

        let mut last_error: Option<anyhow::Error> = None;

        for attempt in 0..=MAX_RETRIES {
            self.pace().await;

            match self.request_embedding(&request).await {
                RequestOutcome::Done(values) => return Ok(values),
                RequestOutcome::Fatal(e) => return Err(e),
                RequestOutcome::Retry(e) => {
                    last_error = Some(e);
                    if attempt < MAX_RETRIES {
                        let backoff =
                            Duration::from_millis(INITIAL_BACKOFF_MS * 2u64.pow(attempt));
                        tracing::warn!(
                            "embedding request failed, retrying in {:?} (attempt {}/{})",
                            backoff,
                            attempt + 1,
                            MAX_RETRIES
                        );
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| anyhow::anyhow!("Embedding failed after {} retries", MAX_RETRIES)))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn name(&self) -> &str {
        "gemini-embedding-001"
    }
}

// ============================================================================
// API Key Management
// ============================================================================

/// API 키 로드 (환경변수에서)
///
/// 우선순위:
/// 1. `GEMINI_API_KEY` 환경변수
/// 2. `GOOGLE_AI_API_KEY` 환경변수
pub fn get_api_key() -> Result<String> {
    if let Ok(key) = std::env::var("GEMINI_API_KEY") {
        if !key.is_empty() {
            tracing::debug!("Using API key from GEMINI_API_KEY");
            return Ok(key);
        }
    }

    if let Ok(key) = std::env::var("GOOGLE_AI_API_KEY") {
        if !key.is_empty() {
            tracing::debug!("Using API key from GOOGLE_AI_API_KEY");
            return Ok(key);
        }
    }

    anyhow::bail!(
        "API key not found. Set GEMINI_API_KEY or GOOGLE_AI_API_KEY environment variable.\n\
         Get your API key at: https://aistudio.google.com/app/apikey"
    )
}

/// API 키 존재 여부 확인
pub fn has_api_key() -> bool {
    get_api_key().is_ok()
}

// ============================================================================
// Factory Function
// ============================================================================

/// 임베딩 프로바이더 생성 (Gemini API)
pub fn create_embedder() -> Result<GeminiEmbedding> {
    create_embedder_with_dimension(DEFAULT_DIMENSION)
}

/// 차원을 지정하여 임베딩 프로바이더 생성
pub fn create_embedder_with_dimension(dimension: usize) -> Result<GeminiEmbedding> {
    let embedder = GeminiEmbedding::from_env_with_dimension(dimension)?;
    tracing::info!(
        "Using Gemini API embedding (dimension: {})",
        embedder.dimension
    );
    Ok(embedder)
}

// ============================================================================
// Test Support
// ============================================================================

/// 테스트용 결정적 임베딩
#[cfg(test)]
pub(crate) mod mock {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    use std::sync::atomic::{AtomicUsize, Ordering};

    use anyhow::Result;
    use async_trait::async_trait;

    use super::EmbeddingProvider;

    /// 토큰 해시 bag-of-words 임베딩
    ///
    /// DefaultHasher는 고정 키로 생성되므로 같은 텍스트는
    /// 실행마다 항상 같은 벡터가 된다.
    pub(crate) struct MockEmbedding {
        dim: usize,
        emit_dim: AtomicUsize,
        calls: AtomicUsize,
    }

    impl MockEmbedding {
        pub(crate) fn new(dim: usize) -> Self {
            Self {
                dim,
                emit_dim: AtomicUsize::new(dim),
                calls: AtomicUsize::new(0),
            }
        }

        /// 선언한 차원과 다른 길이의 벡터를 반환하도록 전환
        pub(crate) fn set_emit_dimension(&self, dim: usize) {
            self.emit_dim.store(dim, Ordering::SeqCst);
        }

        /// embed 호출 횟수
        pub(crate) fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EmbeddingProvider for MockEmbedding {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            self.calls.fetch_add(1, Ordering::SeqCst);

            let dim = self.emit_dim.load(Ordering::SeqCst);
            let mut vector = vec![0.0f32; dim];

            for token in text.to_lowercase().split_whitespace() {
                let token: String = token.chars().filter(|c| c.is_alphanumeric()).collect();
                if token.is_empty() {
                    continue;
                }
                let mut hasher = DefaultHasher::new();
                token.hash(&mut hasher);
                vector[(hasher.finish() as usize) % dim] += 1.0;
            }

            Ok(vector)
        }

        fn dimension(&self) -> usize {
            self.dim
        }

        fn name(&self) -> &str {
            "mock-hash-embedding"
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_dimension() {
        let result = GeminiEmbedding::with_dimension("fake_key".to_string(), 999);
        assert!(result.is_err());
        assert!(result
            .err()
            .map(|e| e.to_string().contains("Invalid dimension"))
            .unwrap_or(false));
    }

    #[test]
    fn test_valid_dimensions() {
        for dim in [768, 1536, 3072] {
            let result = GeminiEmbedding::with_dimension("fake_key".to_string(), dim);
            assert!(result.is_ok());
        }
    }

    #[tokio::test]
    async fn test_blank_text_embeds_to_zero_vector() {
        let embedder = GeminiEmbedding::with_dimension("fake_key".to_string(), 768).unwrap();

        // 빈 텍스트는 네트워크 없이 처리된다
        let vector = embedder.embed("   ").await.unwrap();
        assert_eq!(vector.len(), 768);
        assert!(vector.iter().all(|v| *v == 0.0));
    }

    #[tokio::test]
    async fn test_mock_embedding_is_deterministic() {
        let embedder = mock::MockEmbedding::new(64);

        let a = embedder.embed("pajak daerah").await.unwrap();
        let b = embedder.embed("pajak daerah").await.unwrap();
        let c = embedder.embed("teks lain").await.unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(embedder.call_count(), 3);
    }
}
