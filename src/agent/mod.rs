//! QA 에이전트 - 검색 결과를 답변으로 합성
//!
//! answer_query는 순위가 매겨진 검색 결과를 최종 답변 문자열과
//! 모드 태그로 바꿉니다. 언어모델 실패는 절대 호출자에게 에러로
//! 전파되지 않고 추출 요약 폴백으로 흡수됩니다.
//!
//! QaAgent는 검색 → 답변 → 분류를 잇는 파이프라인이며,
//! 분류기 부트스트랩(모델 없음 + 검색 결과 있음 → 순환 약라벨 학습)을
//! 소유합니다.

pub mod llm;

use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;

use crate::classifier::{cyclic_labels, TopicClassifier};
use crate::knowledge::{Hit, KnowledgeStore};

pub use llm::{create_language_model, GeminiChat, LanguageModel};

/// 검색 결과가 없을 때의 고정 답변
const NO_RESULTS_MESSAGE: &str = "Tidak ada hasil yang ditemukan.";

/// 추출 요약에 쓰는 상위 결과 수
const SUMMARY_HITS: usize = 3;

/// 추출 요약에서 결과당 최대 문자 수
const SUMMARY_FRAGMENT_CHARS: usize = 300;

/// 분류 예측에 쓰는 상위 결과 수
const CLASSIFY_HITS: usize = 3;

// ============================================================================
// Answer Synthesis
// ============================================================================

/// 답변 생성 모드
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnswerMode {
    /// 언어모델이 생성한 답변
    Llm,
    /// 검색 결과에서 추출한 요약
    Extractive,
    /// 언어모델 실패 후 추출 요약으로 폴백
    LlmFallback,
    /// 검색 결과 없음
    Empty,
}

/// 답변 합성 결과
#[derive(Debug, Clone, Serialize)]
pub struct QaResult {
    pub answer: String,
    pub mode: AnswerMode,
}

/// 검색 결과를 답변으로 합성
///
/// use_llm이 켜져 있고 프로바이더 호출이 성공하면 그 답변을 쓰고,
/// 프로바이더가 없거나 실패하면 같은 결과로 만든 추출 요약으로
/// 폴백합니다 (모드: llm_fallback). use_llm이 꺼져 있으면 처음부터
/// 추출 요약입니다.
pub async fn answer_query(
    question: &str,
    hits: &[Hit],
    use_llm: bool,
    llm: Option<&dyn LanguageModel>,
) -> QaResult {
    if hits.is_empty() {
        return QaResult {
            answer: NO_RESULTS_MESSAGE.to_string(),
            mode: AnswerMode::Empty,
        };
    }

    if !use_llm {
        return QaResult {
            answer: extractive_summary(hits),
            mode: AnswerMode::Extractive,
        };
    }

    if let Some(llm) = llm {
        let context: Vec<String> = hits.iter().map(|h| h.text.clone()).collect();
        match llm.complete(question, &context).await {
            Ok(answer) if !answer.trim().is_empty() => {
                return QaResult {
                    answer,
                    mode: AnswerMode::Llm,
                };
            }
            Ok(_) => {
                tracing::warn!("language model returned a blank answer, using fallback");
            }
            Err(e) => {
                tracing::warn!("language model call failed, using fallback: {}", e);
            }
        }
    } else {
        tracing::warn!("LLM requested but no language model configured, using fallback");
    }

    QaResult {
        answer: extractive_summary(hits),
        mode: AnswerMode::LlmFallback,
    }
}

/// 결정적 추출 요약
///
/// 상위 결과(최대 SUMMARY_HITS개)의 텍스트를 단어 경계에서 잘라
/// 출처와 함께 이어 붙입니다. 순수 함수: 같은 결과 목록은 항상
/// 같은 요약을 만듭니다.
fn extractive_summary(hits: &[Hit]) -> String {
    hits.iter()
        .take(SUMMARY_HITS)
        .map(|hit| {
            format!(
                "- {} (sumber: {})",
                truncate_at_word(&hit.text, SUMMARY_FRAGMENT_CHARS),
                hit.meta.doc_id
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// 단어 경계에서 자르기 (UTF-8 안전)
fn truncate_at_word(text: &str, max_chars: usize) -> String {
    let cleaned = text.split_whitespace().collect::<Vec<_>>().join(" ");

    if cleaned.chars().count() <= max_chars {
        return cleaned;
    }

    let cut: String = cleaned.chars().take(max_chars).collect();
    let trimmed = match cut.rfind(' ') {
        Some(pos) if pos > 0 => &cut[..pos],
        _ => cut.as_str(),
    };
    format!("{}...", trimmed)
}

// ============================================================================
// QaAgent
// ============================================================================

/// 분류 결과
#[derive(Debug, Clone, Serialize)]
pub struct Classification {
    pub label: String,
    pub score: f64,
}

/// ask 파이프라인의 결과
#[derive(Debug, Serialize)]
pub struct AskOutcome {
    /// 최종 답변
    pub answer: String,
    /// 답변 생성 모드
    pub mode: AnswerMode,
    /// 답변 근거로 쓰인 검색 결과 (순위 순)
    pub context: Vec<Hit>,
    /// 토픽 분류 (모델이 있거나 부트스트랩된 경우)
    pub classification: Option<Classification>,
    /// 이번 호출에서 약라벨로 부트스트랩된 모델인지 여부
    pub provisional_model: bool,
}

/// QA 에이전트
///
/// 지식 저장소 검색, 답변 합성, 토픽 분류를 하나의 ask 호출로
/// 묶습니다. 분류기는 인덱스 락 밖에서 동작하므로 동시 첫 질문이
/// 부트스트랩을 중복 수행할 수 있지만, 모델 저장이 원자적이라
/// 데이터가 깨지지는 않습니다.
pub struct QaAgent {
    store: Arc<KnowledgeStore>,
    classifier: TopicClassifier,
    llm: Option<Arc<dyn LanguageModel>>,
}

impl QaAgent {
    /// 생성
    pub fn new(
        store: Arc<KnowledgeStore>,
        classifier: TopicClassifier,
        llm: Option<Arc<dyn LanguageModel>>,
    ) -> Self {
        Self {
            store,
            classifier,
            llm,
        }
    }

    /// 질문에 답변
    ///
    /// 검색 → 답변 합성 → 분류 순서로 진행합니다. 분류기에 모델이
    /// 없고 검색 결과가 있으면 순환 약라벨로 모델을 학습/저장한 뒤
    /// 즉시 다시 로드해 이번 예측에 사용하고, 결과를 임시 모델로
    /// 표시합니다. 분류 실패는 답변 경로를 막지 않습니다.
    pub async fn ask(&self, question: &str, top_k: usize, use_llm: bool) -> Result<AskOutcome> {
        let hits = self.store.search(question, top_k).await?;

        let qa_result = answer_query(question, &hits, use_llm, self.llm.as_deref()).await;

        let (classification, provisional_model) = self.classify(&hits);

        Ok(AskOutcome {
            answer: qa_result.answer,
            mode: qa_result.mode,
            context: hits,
            classification,
            provisional_model,
        })
    }

    /// 상위 결과 텍스트 분류 (필요 시 부트스트랩)
    fn classify(&self, hits: &[Hit]) -> (Option<Classification>, bool) {
        let mut model = self.classifier.load_model();
        let mut bootstrapped = false;

        if model.is_none() && !hits.is_empty() {
            let texts: Vec<String> = hits.iter().map(|h| h.text.clone()).collect();
            let labels = cyclic_labels(texts.len());

            match self.classifier.fit_and_save(&texts, &labels) {
                Ok(()) => {
                    model = self.classifier.load_model();
                    bootstrapped = true;
                    tracing::info!(
                        "bootstrapped topic model from {} retrieved chunks (weak labels)",
                        texts.len()
                    );
                }
                Err(e) => {
                    tracing::warn!("topic model bootstrap failed: {}", e);
                }
            }
        }

        let classification = model.and_then(|model| {
            if hits.is_empty() {
                return None;
            }
            let joined = hits
                .iter()
                .take(CLASSIFY_HITS)
                .map(|h| h.text.as_str())
                .collect::<Vec<_>>()
                .join(" ");
            let pred = model.predict(&joined);
            Some(Classification {
                label: pred.label,
                score: pred.proba,
            })
        });

        (classification, bootstrapped)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::mock::MockEmbedding;
    use crate::knowledge::ChunkMeta;
    use async_trait::async_trait;
    use tempfile::TempDir;

    /// 스크립트된 테스트용 언어모델
    struct ScriptedModel {
        answer: Option<String>,
    }

    impl ScriptedModel {
        fn answering(text: &str) -> Self {
            Self {
                answer: Some(text.to_string()),
            }
        }

        fn failing() -> Self {
            Self { answer: None }
        }
    }

    #[async_trait]
    impl LanguageModel for ScriptedModel {
        async fn complete(&self, _question: &str, _context: &[String]) -> Result<String> {
            match &self.answer {
                Some(answer) => Ok(answer.clone()),
                None => anyhow::bail!("model unavailable"),
            }
        }

        fn name(&self) -> &str {
            "scripted-model"
        }
    }

    fn hit(doc_id: &str, text: &str, chunk_index: usize) -> Hit {
        Hit {
            score: 0.9,
            text: text.to_string(),
            meta: ChunkMeta {
                doc_id: doc_id.to_string(),
                text: text.to_string(),
                source: None,
                page: None,
                section: None,
                section_chunk: None,
                chunk_index,
            },
        }
    }

    #[tokio::test]
    async fn test_empty_hits_is_empty_mode_regardless_of_llm() {
        let llm = ScriptedModel::answering("tidak boleh dipakai");

        let result = answer_query("pertanyaan", &[], true, Some(&llm)).await;
        assert_eq!(result.mode, AnswerMode::Empty);
        assert_eq!(result.answer, NO_RESULTS_MESSAGE);

        let result = answer_query("pertanyaan", &[], false, None).await;
        assert_eq!(result.mode, AnswerMode::Empty);
    }

    #[tokio::test]
    async fn test_llm_success_uses_model_answer() {
        let llm = ScriptedModel::answering("Jawaban dari model.");
        let hits = vec![hit("doc", "Pasal 1 isi.", 1)];

        let result = answer_query("pertanyaan", &hits, true, Some(&llm)).await;
        assert_eq!(result.mode, AnswerMode::Llm);
        assert_eq!(result.answer, "Jawaban dari model.");
    }

    #[tokio::test]
    async fn test_llm_failure_falls_back_to_extractive() {
        let llm = ScriptedModel::failing();
        let hits = vec![
            hit("perda-1", "Pasal 1: Ketentuan umum.", 1),
            hit("perda-1", "Pasal 2: Retribusi daerah.", 2),
        ];

        let result = answer_query("pertanyaan", &hits, true, Some(&llm)).await;
        assert_eq!(result.mode, AnswerMode::LlmFallback);
        assert!(!result.answer.is_empty());
        assert!(result.answer.contains("Pasal 1"));
        assert!(result.answer.contains("perda-1"));
    }

    #[tokio::test]
    async fn test_llm_requested_without_provider_falls_back() {
        let hits = vec![hit("doc", "Isi dokumen.", 1)];

        let result = answer_query("pertanyaan", &hits, true, None).await;
        assert_eq!(result.mode, AnswerMode::LlmFallback);
        assert!(result.answer.contains("Isi dokumen."));
    }

    #[tokio::test]
    async fn test_extractive_mode_without_llm_request() {
        let hits = vec![hit("doc", "Isi dokumen.", 1)];

        let result = answer_query("pertanyaan", &hits, false, None).await;
        assert_eq!(result.mode, AnswerMode::Extractive);
        assert!(result.answer.contains("Isi dokumen."));
    }

    #[test]
    fn test_extractive_summary_is_deterministic_and_limited() {
        let hits: Vec<Hit> = (1..=5)
            .map(|i| hit("doc", &format!("Alinea nomor {}.", i), i))
            .collect();

        let a = extractive_summary(&hits);
        let b = extractive_summary(&hits);
        assert_eq!(a, b);

        // 상위 3개만 포함
        assert!(a.contains("Alinea nomor 1."));
        assert!(a.contains("Alinea nomor 3."));
        assert!(!a.contains("Alinea nomor 4."));
    }

    #[test]
    fn test_truncate_at_word() {
        assert_eq!(truncate_at_word("satu dua", 20), "satu dua");
        assert_eq!(truncate_at_word("satu  dua\ntiga", 20), "satu dua tiga");

        let long = "kata ".repeat(100);
        let cut = truncate_at_word(&long, 30);
        assert!(cut.chars().count() <= 34);
        assert!(cut.ends_with("..."));
        assert!(!cut.contains("  "));
    }

    // ------------------------------------------------------------------
    // QaAgent pipeline
    // ------------------------------------------------------------------

    async fn seeded_agent(dir: &TempDir, llm: Option<Arc<dyn LanguageModel>>) -> QaAgent {
        let embedder = Arc::new(MockEmbedding::new(128));
        let store = Arc::new(KnowledgeStore::new(dir.path(), embedder).unwrap());

        let doc = dir.path().join("perda.txt");
        std::fs::write(
            &doc,
            "Pasal 1: Ketentuan umum pajak daerah.\n\n\
             Pasal 2: Retribusi ditetapkan sebesar 2 persen.\n\n\
             Pasal 3: Ketentuan penutup.",
        )
        .unwrap();
        store.add_file(&doc, "perda-1").await.unwrap();

        let classifier = TopicClassifier::new(&dir.path().join("models")).unwrap();
        QaAgent::new(store, classifier, llm)
    }

    #[tokio::test]
    async fn test_ask_bootstraps_classifier_on_first_query() {
        let dir = TempDir::new().unwrap();
        let agent = seeded_agent(&dir, None).await;

        let outcome = agent.ask("retribusi daerah", 3, false).await.unwrap();

        assert_eq!(outcome.mode, AnswerMode::Extractive);
        assert!(!outcome.context.is_empty());
        assert!(outcome.provisional_model);

        let classification = outcome.classification.unwrap();
        assert!(crate::classifier::LABELS.contains(&classification.label.as_str()));
        assert!(classification.score > 0.0 && classification.score <= 1.0);
    }

    #[tokio::test]
    async fn test_ask_reuses_persisted_model_on_second_query() {
        let dir = TempDir::new().unwrap();
        let agent = seeded_agent(&dir, None).await;

        let first = agent.ask("retribusi daerah", 3, false).await.unwrap();
        assert!(first.provisional_model);

        let second = agent.ask("ketentuan umum", 3, false).await.unwrap();
        assert!(!second.provisional_model);
        assert!(second.classification.is_some());
    }

    #[tokio::test]
    async fn test_ask_with_llm_uses_model_answer() {
        let dir = TempDir::new().unwrap();
        let llm: Arc<dyn LanguageModel> = Arc::new(ScriptedModel::answering("Jawaban model."));
        let agent = seeded_agent(&dir, Some(llm)).await;

        let outcome = agent.ask("retribusi", 2, true).await.unwrap();
        assert_eq!(outcome.mode, AnswerMode::Llm);
        assert_eq!(outcome.answer, "Jawaban model.");
        assert_eq!(outcome.context.len(), 2);
    }

    #[tokio::test]
    async fn test_ask_with_failing_llm_still_answers() {
        let dir = TempDir::new().unwrap();
        let llm: Arc<dyn LanguageModel> = Arc::new(ScriptedModel::failing());
        let agent = seeded_agent(&dir, Some(llm)).await;

        let outcome = agent.ask("retribusi", 2, true).await.unwrap();
        assert_eq!(outcome.mode, AnswerMode::LlmFallback);
        assert!(!outcome.answer.is_empty());
    }

    #[tokio::test]
    async fn test_ask_on_empty_store_returns_empty_mode() {
        let dir = TempDir::new().unwrap();
        let embedder = Arc::new(MockEmbedding::new(64));
        let store = Arc::new(KnowledgeStore::new(dir.path(), embedder).unwrap());
        let classifier = TopicClassifier::new(&dir.path().join("models")).unwrap();
        let agent = QaAgent::new(store, classifier, None);

        let outcome = agent.ask("pertanyaan", 5, false).await.unwrap();
        assert_eq!(outcome.mode, AnswerMode::Empty);
        assert!(outcome.context.is_empty());
        assert!(outcome.classification.is_none());
        assert!(!outcome.provisional_model);
    }
}
