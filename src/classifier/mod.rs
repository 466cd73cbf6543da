//! 토픽 분류기 - 검색 결과 텍스트에 주제 라벨 부여
//!
//! 멀티노미얼 나이브 베이즈 모델을 JSON 파일로 영속화합니다.
//! 모델이 없을 때의 부트스트랩(순환 약라벨 학습)은 분류기가 아니라
//! 호출자(QaAgent)가 수행합니다. 순환 라벨은 검색 순서의 산물일 뿐
//! 실제 주제를 반영하지 않으므로, 결과는 임시(provisional)로
//! 표시되어야 합니다. 지도 학습 파이프라인으로 교체할 수 있도록
//! 학습/저장/예측을 이 타입 뒤에 격리해 둡니다.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 모델 파일명 (models 디렉토리 내)
const MODEL_FILE: &str = "topic_model.json";

/// 고정 라벨 어휘
///
/// 순환 약라벨 부트스트랩은 이 순서를 그대로 사용합니다.
pub const LABELS: [&str; 4] = ["peraturan", "keuangan", "operasional", "umum"];

/// 순환 약라벨 생성: i번째 텍스트는 LABELS[i % LABELS.len()]
pub fn cyclic_labels(count: usize) -> Vec<String> {
    (0..count).map(|i| LABELS[i % LABELS.len()].to_string()).collect()
}

// ============================================================================
// Types
// ============================================================================

/// 예측 결과
#[derive(Debug, Clone, Serialize)]
pub struct Prediction {
    /// 최적 라벨
    pub label: String,
    /// 정규화된 사후 확률
    pub proba: f64,
}

/// 영속화되는 나이브 베이즈 모델
///
/// 토큰은 소문자 영숫자 기준, 스무딩은 add-one입니다.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicModel {
    /// 학습에 등장한 라벨 (등장 순서 유지)
    labels: Vec<String>,
    /// 라벨별 학습 문서 수
    doc_counts: Vec<usize>,
    /// 라벨별 총 토큰 수
    token_totals: Vec<usize>,
    /// 토큰 -> 라벨별 등장 횟수
    token_counts: HashMap<String, Vec<usize>>,
    /// 학습 시각
    trained_at: DateTime<Utc>,
}

impl TopicModel {
    /// 텍스트/라벨 쌍으로 학습
    ///
    /// 라벨 집합은 학습 데이터에 등장한 라벨로 결정됩니다.
    fn fit(texts: &[String], labels: &[String]) -> Result<Self> {
        if texts.is_empty() {
            anyhow::bail!("cannot train topic model on empty data");
        }
        if texts.len() != labels.len() {
            anyhow::bail!(
                "texts/labels length mismatch: {} texts, {} labels",
                texts.len(),
                labels.len()
            );
        }

        let mut label_set: Vec<String> = Vec::new();
        for label in labels {
            if !label_set.contains(label) {
                label_set.push(label.clone());
            }
        }

        let n = label_set.len();
        let mut doc_counts = vec![0usize; n];
        let mut token_totals = vec![0usize; n];
        let mut token_counts: HashMap<String, Vec<usize>> = HashMap::new();

        for (text, label) in texts.iter().zip(labels.iter()) {
            let li = label_set
                .iter()
                .position(|l| l == label)
                .context("label disappeared from label set")?;
            doc_counts[li] += 1;

            for token in tokenize(text) {
                token_totals[li] += 1;
                token_counts.entry(token).or_insert_with(|| vec![0; n])[li] += 1;
            }
        }

        Ok(Self {
            labels: label_set,
            doc_counts,
            token_totals,
            token_counts,
            trained_at: Utc::now(),
        })
    }

    /// 최적 라벨과 그 사후 확률 예측
    pub fn predict(&self, text: &str) -> Prediction {
        let total_docs: usize = self.doc_counts.iter().sum();
        let vocab = self.token_counts.len();
        let tokens = tokenize(text);

        // 라벨별 로그 사후 확률 (prior + likelihood, add-one 스무딩)
        let log_posteriors: Vec<f64> = (0..self.labels.len())
            .map(|li| {
                let mut score =
                    ((self.doc_counts[li] as f64) / (total_docs as f64)).ln();
                let denom = (self.token_totals[li] + vocab + 1) as f64;

                for token in &tokens {
                    let count = self
                        .token_counts
                        .get(token)
                        .map(|c| c[li])
                        .unwrap_or(0);
                    score += (((count + 1) as f64) / denom).ln();
                }
                score
            })
            .collect();

        // 소프트맥스 정규화 (최댓값 빼기로 오버플로 방지)
        let max = log_posteriors
            .iter()
            .cloned()
            .fold(f64::NEG_INFINITY, f64::max);
        let exps: Vec<f64> = log_posteriors.iter().map(|s| (s - max).exp()).collect();
        let sum: f64 = exps.iter().sum();

        let (best, _) = log_posteriors
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
            .unwrap_or((0, &0.0));

        Prediction {
            label: self.labels[best].clone(),
            proba: exps[best] / sum,
        }
    }

    /// 모델의 라벨 집합
    pub fn labels(&self) -> &[String] {
        &self.labels
    }
}

/// 소문자 영숫자 토큰화
fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split_whitespace()
        .map(|w| w.chars().filter(|c| c.is_alphanumeric()).collect::<String>())
        .filter(|w| !w.is_empty())
        .collect()
}

// ============================================================================
// TopicClassifier
// ============================================================================

/// 토픽 분류기 - 모델 파일 관리
///
/// 동시 부트스트랩 경합은 허용됩니다. 저장이 임시 파일 + rename이므로
/// 두 호출이 겹쳐도 각 모델 파일은 항상 완전한 상태이며,
/// 마지막에 쓴 쪽이 남습니다.
pub struct TopicClassifier {
    model_path: PathBuf,
}

impl TopicClassifier {
    /// models 디렉토리를 지정하여 생성 (없으면 만든다)
    pub fn new(models_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(models_dir).context("Failed to create models directory")?;
        Ok(Self {
            model_path: models_dir.join(MODEL_FILE),
        })
    }

    /// 영속화된 모델 로드
    ///
    /// 파일이 없으면 None. 읽을 수 없는 파일도 warn만 남기고 None으로
    /// 처리하여 호출자가 부트스트랩 경로를 타게 합니다.
    pub fn load_model(&self) -> Option<TopicModel> {
        if !self.model_path.exists() {
            return None;
        }

        let raw = match std::fs::read_to_string(&self.model_path) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!("failed to read topic model {:?}: {}", self.model_path, e);
                return None;
            }
        };

        match serde_json::from_str(&raw) {
            Ok(model) => Some(model),
            Err(e) => {
                tracing::warn!(
                    "topic model {:?} unreadable, treating as absent: {}",
                    self.model_path,
                    e
                );
                None
            }
        }
    }

    /// 학습 후 저장 (임시 파일에 쓴 뒤 rename으로 교체)
    pub fn fit_and_save(&self, texts: &[String], labels: &[String]) -> Result<()> {
        let model = TopicModel::fit(texts, labels)?;
        let json = serde_json::to_string(&model).context("Failed to encode topic model")?;

        let tmp_path = self.model_path.with_extension("json.tmp");
        std::fs::write(&tmp_path, json).context("Failed to write topic model")?;
        std::fs::rename(&tmp_path, &self.model_path)
            .context("Failed to replace topic model file")?;

        tracing::info!(
            "trained topic model on {} texts ({} labels), saved to {:?}",
            texts.len(),
            model.labels.len(),
            self.model_path
        );
        Ok(())
    }

    /// 영속화된 모델이 존재하는지 여부
    pub fn has_model(&self) -> bool {
        self.model_path.exists()
    }

    /// 모델 파일 경로
    pub fn model_path(&self) -> &Path {
        &self.model_path
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn owned(texts: &[&str]) -> Vec<String> {
        texts.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn test_cyclic_labels_wrap_around() {
        let labels = cyclic_labels(6);
        assert_eq!(labels.len(), 6);
        assert_eq!(labels[0], "peraturan");
        assert_eq!(labels[3], "umum");
        assert_eq!(labels[4], "peraturan");
        assert_eq!(labels[5], "keuangan");
    }

    #[test]
    fn test_tokenize_lowercases_and_strips_punctuation() {
        let tokens = tokenize("Pasal 1: Retribusi Daerah.");
        assert_eq!(tokens, vec!["pasal", "1", "retribusi", "daerah"]);
    }

    #[test]
    fn test_fit_rejects_empty_and_mismatched_input() {
        assert!(TopicModel::fit(&[], &[]).is_err());
        assert!(TopicModel::fit(&owned(&["a"]), &owned(&["x", "y"])).is_err());
    }

    #[test]
    fn test_predict_separates_distinct_vocabularies() {
        let texts = owned(&[
            "pajak retribusi daerah pajak",
            "anggaran belanja keuangan anggaran",
        ]);
        let labels = owned(&["peraturan", "keuangan"]);
        let model = TopicModel::fit(&texts, &labels).unwrap();

        let pred = model.predict("retribusi pajak");
        assert_eq!(pred.label, "peraturan");
        assert!(pred.proba > 0.5);
        assert!(pred.proba <= 1.0);

        let pred = model.predict("anggaran belanja");
        assert_eq!(pred.label, "keuangan");
    }

    #[test]
    fn test_predict_on_unseen_tokens_still_returns_a_label() {
        let texts = owned(&["satu dua", "tiga empat"]);
        let labels = owned(&["peraturan", "umum"]);
        let model = TopicModel::fit(&texts, &labels).unwrap();

        let pred = model.predict("kata yang belum pernah dilihat");
        assert!(model.labels().contains(&pred.label));
        assert!(pred.proba > 0.0 && pred.proba <= 1.0);
    }

    #[test]
    fn test_load_missing_model_is_none() {
        let dir = TempDir::new().unwrap();
        let classifier = TopicClassifier::new(dir.path()).unwrap();

        assert!(classifier.load_model().is_none());
        assert!(!classifier.has_model());
    }

    #[test]
    fn test_fit_save_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let classifier = TopicClassifier::new(dir.path()).unwrap();

        let texts = owned(&["pajak daerah", "laporan anggaran"]);
        classifier.fit_and_save(&texts, &cyclic_labels(2)).unwrap();
        assert!(classifier.has_model());

        let model = classifier.load_model().unwrap();
        let pred = model.predict("pajak daerah");
        assert_eq!(pred.label, "peraturan");
    }

    #[test]
    fn test_corrupt_model_file_treated_as_absent() {
        let dir = TempDir::new().unwrap();
        let classifier = TopicClassifier::new(dir.path()).unwrap();

        std::fs::write(classifier.model_path(), "not a model").unwrap();
        assert!(classifier.load_model().is_none());
    }

    #[test]
    fn test_save_removes_tmp_file() {
        let dir = TempDir::new().unwrap();
        let classifier = TopicClassifier::new(dir.path()).unwrap();

        let texts = owned(&["isi dokumen"]);
        classifier.fit_and_save(&texts, &cyclic_labels(1)).unwrap();

        assert!(classifier.model_path().exists());
        assert!(!classifier.model_path().with_extension("json.tmp").exists());
    }
}
