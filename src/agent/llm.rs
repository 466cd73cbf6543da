//! 언어모델 호출 모듈
//!
//! Gemini generateContent API로 질문 + 검색 컨텍스트에서 답변을
//! 생성합니다. 호출 실패는 answer_query의 폴백 경로가 처리하므로
//! 여기서는 에러를 그대로 반환합니다.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::embedding::get_api_key;

/// Gemini 텍스트 생성 API 엔드포인트
const GEMINI_CHAT_URL: &str =
    "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.0-flash-exp:generateContent";

// ============================================================================
// LanguageModel Trait
// ============================================================================

/// 언어모델 트레이트
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// 질문과 컨텍스트 텍스트(검색 순위 순)로 답변 생성
    async fn complete(&self, question: &str, context: &[String]) -> Result<String>;

    /// 모델 이름
    fn name(&self) -> &str;
}

// ============================================================================
// Google Gemini Chat
// ============================================================================

/// Gemini 언어모델 구현체
#[derive(Debug)]
pub struct GeminiChat {
    api_key: String,
    client: reqwest::Client,
}

impl GeminiChat {
    /// API 키로 생성
    pub fn new(api_key: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { api_key, client })
    }

    /// 환경변수에서 API 키를 읽어 생성
    pub fn from_env() -> Result<Self> {
        Self::new(get_api_key()?)
    }
}

/// 질문과 컨텍스트로 프롬프트 구성
///
/// 컨텍스트는 검색 순위 순으로 번호를 붙여 나열합니다.
fn build_prompt(question: &str, context: &[String]) -> String {
    let mut prompt = String::from(
        "Jawablah pertanyaan berikut hanya berdasarkan konteks yang diberikan.\n\
         Jika konteks tidak memuat jawabannya, katakan demikian.\n\n\
         Konteks:\n",
    );

    for (i, text) in context.iter().enumerate() {
        prompt.push_str(&format!("[{}] {}\n", i + 1, text));
    }

    prompt.push_str(&format!("\nPertanyaan: {}\n\nJawaban:", question));
    prompt
}

#[async_trait]
impl LanguageModel for GeminiChat {
    async fn complete(&self, question: &str, context: &[String]) -> Result<String> {
        let request = ChatRequest {
            contents: vec![ChatContent {
                parts: vec![ChatPart {
                    text: build_prompt(question, context),
                }],
            }],
            generation_config: GenerationConfig {
                temperature: 0.2,
                max_output_tokens: 2048,
            },
        };

        let response = self
            .client
            .post(GEMINI_CHAT_URL)
            .header("x-goog-api-key", &self.api_key)
            .json(&request)
            .send()
            .await
            .context("Failed to send generateContent request")?;

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            anyhow::bail!("Gemini API error ({}): {}", status, body);
        }

        let chat_response: ChatResponse =
            serde_json::from_str(&body).context("Failed to parse generateContent response")?;

        let text = chat_response
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content.parts.into_iter().next())
            .map(|p| p.text)
            .unwrap_or_default();

        if text.trim().is_empty() {
            anyhow::bail!("Gemini returned an empty answer");
        }

        Ok(text.trim().to_string())
    }

    fn name(&self) -> &str {
        "gemini-2.0-flash-exp"
    }
}

// ============================================================================
// API Types
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatRequest {
    contents: Vec<ChatContent>,
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct ChatContent {
    parts: Vec<ChatPart>,
}

#[derive(Debug, Serialize)]
struct ChatPart {
    text: String,
}

#[derive(Debug, Serialize)]
struct GenerationConfig {
    temperature: f32,
    #[serde(rename = "maxOutputTokens")]
    max_output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: CandidateContent,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    parts: Vec<TextPart>,
}

#[derive(Debug, Deserialize)]
struct TextPart {
    text: String,
}

// ============================================================================
// Factory Function
// ============================================================================

/// 언어모델 생성 (Gemini API)
pub fn create_language_model() -> Result<GeminiChat> {
    let model = GeminiChat::from_env()?;
    tracing::info!("Using Gemini language model ({})", model.name());
    Ok(model)
}

// ============================================================================
// Tests
// ============================================================================
