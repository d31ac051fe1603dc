use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::LazyLock;

use anyhow::Context;
use otw_core::{Column, ListingRecord, RelevanceLabel};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::driver::AcceptedListing;

static RE_PUNCT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^\w\s]").expect("invalid regex: punctuation"));
static RE_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\w\w+\b").expect("invalid regex: token"));

const ALPHA: f64 = 1.0;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ClassifierError {
    #[error("relevance seeds need at least one {0} phrase")]
    MissingClass(&'static str),
    #[error("relevance seeds contain no usable tokens")]
    EmptyVocabulary,
}

/// Seed phrases from `rules/relevance.yaml`.
#[derive(Debug, Clone, Deserialize)]
pub struct RelevanceSeeds {
    #[allow(dead_code)]
    #[serde(default)]
    version: u32,
    pub relevant: Vec<String>,
    pub irrelevant: Vec<String>,
}

impl RelevanceSeeds {
    pub fn new(relevant: Vec<String>, irrelevant: Vec<String>) -> Self {
        Self {
            version: 1,
            relevant,
            irrelevant,
        }
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredListing {
    pub keyword: String,
    pub record: ListingRecord,
    pub score: f64,
    pub label: RelevanceLabel,
}

pub trait RelevanceClassifier: Send + Sync {
    /// Probability in `[0, 1]` that `text` describes a relevant listing.
    fn score(&self, text: &str) -> f64;

    fn classify(&self, listings: &[AcceptedListing]) -> Vec<ScoredListing> {
        listings
            .iter()
            .map(|listing| {
                let score = round2(self.score(&listing_text(&listing.record)));
                ScoredListing {
                    keyword: listing.keyword.clone(),
                    record: listing.record.clone(),
                    score,
                    label: RelevanceLabel::from_score(score),
                }
            })
            .collect()
    }
}

fn round2(score: f64) -> f64 {
    (score.clamp(0.0, 1.0) * 100.0).round() / 100.0
}

fn listing_text(record: &ListingRecord) -> String {
    format!("{} {}", record.title(), record.get(Column::DomainCategory))
}

pub fn preprocess(text: &str) -> String {
    RE_PUNCT
        .replace_all(text, " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn tokenize(text: &str) -> Vec<String> {
    let cleaned = preprocess(text);
    RE_TOKEN
        .find_iter(&cleaned)
        .map(|m| m.as_str().to_string())
        .collect()
}

/// TF-IDF features (smoothed idf, L2-normalized rows) feeding a two-class
/// multinomial naive Bayes model.
#[derive(Debug, Clone)]
pub struct NaiveBayesClassifier {
    vocabulary: HashMap<String, usize>,
    idf: Vec<f64>,
    // index 0: irrelevant, 1: relevant
    class_log_prior: [f64; 2],
    feature_log_prob: [Vec<f64>; 2],
}

impl NaiveBayesClassifier {
    pub fn train(seeds: &RelevanceSeeds) -> Result<Self, ClassifierError> {
        if seeds.relevant.is_empty() {
            return Err(ClassifierError::MissingClass("relevant"));
        }
        if seeds.irrelevant.is_empty() {
            return Err(ClassifierError::MissingClass("irrelevant"));
        }

        let docs: Vec<(Vec<String>, usize)> = seeds
            .irrelevant
            .iter()
            .map(|t| (tokenize(t), 0))
            .chain(seeds.relevant.iter().map(|t| (tokenize(t), 1)))
            .collect();

        let terms: BTreeSet<&str> = docs
            .iter()
            .flat_map(|(tokens, _)| tokens.iter().map(String::as_str))
            .collect();
        if terms.is_empty() {
            return Err(ClassifierError::EmptyVocabulary);
        }
        let vocabulary: HashMap<String, usize> = terms
            .into_iter()
            .enumerate()
            .map(|(i, t)| (t.to_string(), i))
            .collect();
        let n_features = vocabulary.len();

        let mut doc_freq = vec![0usize; n_features];
        for (tokens, _) in &docs {
            let unique: BTreeSet<usize> = tokens.iter().filter_map(|t| vocabulary.get(t).copied()).collect();
            for idx in unique {
                doc_freq[idx] += 1;
            }
        }
        let n_docs = docs.len() as f64;
        let idf: Vec<f64> = doc_freq
            .iter()
            .map(|&df| ((1.0 + n_docs) / (1.0 + df as f64)).ln() + 1.0)
            .collect();

        let mut model = Self {
            vocabulary,
            idf,
            class_log_prior: [0.0; 2],
            feature_log_prob: [vec![0.0; n_features], vec![0.0; n_features]],
        };

        let mut feature_count = [vec![0.0; n_features], vec![0.0; n_features]];
        let mut class_count = [0usize; 2];
        for (tokens, class) in &docs {
            class_count[*class] += 1;
            for (idx, weight) in model.features(tokens) {
                feature_count[*class][idx] += weight;
            }
        }

        for class in 0..2 {
            model.class_log_prior[class] = (class_count[class] as f64 / n_docs).ln();
            let total: f64 = feature_count[class].iter().sum::<f64>() + ALPHA * n_features as f64;
            model.feature_log_prob[class] = feature_count[class]
                .iter()
                .map(|count| ((count + ALPHA) / total).ln())
                .collect();
        }
        Ok(model)
    }

    /// Sparse TF-IDF row; unknown tokens are ignored.
    fn features(&self, tokens: &[String]) -> Vec<(usize, f64)> {
        let mut counts: HashMap<usize, f64> = HashMap::new();
        for token in tokens {
            if let Some(&idx) = self.vocabulary.get(token) {
                *counts.entry(idx).or_default() += 1.0;
            }
        }
        let mut row: Vec<(usize, f64)> = counts
            .into_iter()
            .map(|(idx, tf)| (idx, tf * self.idf[idx]))
            .collect();
        let norm = row.iter().map(|(_, w)| w * w).sum::<f64>().sqrt();
        if norm > 0.0 {
            for (_, w) in &mut row {
                *w /= norm;
            }
        }
        row
    }
}

impl RelevanceClassifier for NaiveBayesClassifier {
    fn score(&self, text: &str) -> f64 {
        let row = self.features(&tokenize(text));
        let joint: Vec<f64> = (0..2)
            .map(|class| {
                self.class_log_prior[class]
                    + row
                        .iter()
                        .map(|(idx, w)| w * self.feature_log_prob[class][*idx])
                        .sum::<f64>()
            })
            .collect();
        let max = joint[0].max(joint[1]);
        let relevant = (joint[1] - max).exp();
        let irrelevant = (joint[0] - max).exp();
        relevant / (relevant + irrelevant)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use otw_core::RawFields;

    fn seeds() -> RelevanceSeeds {
        RelevanceSeeds::new(
            vec![
                "تنظيم هاكاثون".into(),
                "تنظيم فعاليات ومؤتمرات".into(),
                "مسابقة ابتكار".into(),
                "hackathon event management".into(),
            ],
            vec![
                "توريد مواد غذائية".into(),
                "صيانة مباني".into(),
                "خدمات نظافة".into(),
                "office supplies".into(),
            ],
        )
    }

    #[test]
    fn preprocessing_strips_punctuation_and_case() {
        assert_eq!(preprocess("  Hackathon,  (2026)!  "), "hackathon 2026");
        assert_eq!(tokenize("تنظيم: هاكاثون - a"), vec!["تنظيم", "هاكاثون"]);
    }

    #[test]
    fn seeds_separate_the_classes() {
        let model = NaiveBayesClassifier::train(&seeds()).unwrap();
        assert!(model.score("تنظيم هاكاثون الابتكار") > 0.5);
        assert!(model.score("Hackathon Event") > 0.5);
        assert!(model.score("توريد مواد غذائية للمستشفى") < 0.5);
        assert!((model.score("نص غير معروف") - 0.5).abs() < 1e-9);
    }

    #[test]
    fn classify_rounds_and_labels() {
        let model = NaiveBayesClassifier::train(&seeds()).unwrap();
        let record = ListingRecord::from_fields(
            &RawFields::new()
                .with(Column::Title, "منافسة عامة")
                .with(Column::Url, "https://portal.etimad.sa/t/1"),
        )
        .unwrap();
        let scored = model.classify(&[AcceptedListing {
            keyword: "فعالية".into(),
            record,
        }]);
        assert_eq!(scored.len(), 1);
        assert_eq!(scored[0].score, 0.5);
        assert_eq!(scored[0].label, RelevanceLabel::Medium);
    }

    #[test]
    fn both_classes_are_required() {
        let missing = RelevanceSeeds::new(vec!["هاكاثون".into()], vec![]);
        assert_eq!(
            NaiveBayesClassifier::train(&missing).unwrap_err(),
            ClassifierError::MissingClass("irrelevant")
        );
    }

    #[test]
    fn shipped_rules_train() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../rules/relevance.yaml");
        let seeds = RelevanceSeeds::load(&path).unwrap();
        assert!(NaiveBayesClassifier::train(&seeds).is_ok());
    }
}
