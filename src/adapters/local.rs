//! Offline collaborators: no network, deterministic output.
//!
//! Useful for the CLI demo and for tests; each one is a drop-in for the
//! corresponding HTTP-backed provider.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::{
    AdapterError, Classification, ContentClassifier, EmbeddingProvider, EntityRecognizer,
    EscalationNotifier, GenerationProvider, TokenReceiver,
};
use crate::config::ConfigError;
use crate::core::text::terms;
use crate::domain::{EscalationEvent, Prompt};

/// Terms shorter than this only match exactly
const STEM_CHARS: usize = 4;

fn stem(term: &str) -> &str {
    match term.char_indices().nth(STEM_CHARS) {
        Some((idx, _)) => &term[..idx],
        None => term,
    }
}

// ============================================================================
// Embeddings
// ============================================================================

/// Feature-hashing embedder over content terms and their stems
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimensions: usize,
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self { dimensions: 256 }
    }
}

impl HashingEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    fn add_feature(&self, vector: &mut [f32], feature: &str, weight: f32) {
        let digest = Sha256::digest(feature.as_bytes());
        let mut bucket = [0u8; 8];
        bucket.copy_from_slice(&digest[..8]);
        let index = (u64::from_le_bytes(bucket) % self.dimensions as u64) as usize;
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        vector[index] += sign * weight;
    }

    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];
        for term in terms(text) {
            self.add_feature(&mut vector, &term, 1.0);
            if term.chars().count() >= STEM_CHARS {
                self.add_feature(&mut vector, &format!("stem:{}", stem(&term)), 0.5);
            }
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|v| *v /= norm);
        }
        vector
    }
}

#[async_trait]
impl EmbeddingProvider for HashingEmbedder {
    fn name(&self) -> &str {
        "hashing"
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, AdapterError> {
        Ok(self.embed_sync(text))
    }
}

// ============================================================================
// Entity recognition
// ============================================================================

/// Matches a fixed vocabulary of entity phrases against the query.
///
/// A phrase matches when each of its terms matches a query term exactly or
/// by stem.
#[derive(Debug, Clone)]
pub struct KeywordEntityRecognizer {
    vocabulary: Vec<(String, BTreeSet<String>)>,
    fallback: Option<String>,
}

impl KeywordEntityRecognizer {
    pub fn new(vocabulary: impl IntoIterator<Item = String>) -> Self {
        Self {
            vocabulary: vocabulary
                .into_iter()
                .map(|phrase| {
                    let t = terms(&phrase);
                    (phrase, t)
                })
                .filter(|(_, t)| !t.is_empty())
                .collect(),
            fallback: None,
        }
    }

    /// Entity returned when nothing in the vocabulary matches
    pub fn with_fallback(mut self, entity: impl Into<String>) -> Self {
        self.fallback = Some(entity.into());
        self
    }

    pub fn recognize_sync(&self, text: &str) -> Vec<String> {
        let query_terms = terms(text);
        let query_stems: BTreeSet<&str> = query_terms
            .iter()
            .filter(|t| t.chars().count() >= STEM_CHARS)
            .map(|t| stem(t))
            .collect();

        let term_matches = |term: &String| {
            query_terms.contains(term)
                || (term.chars().count() >= STEM_CHARS && query_stems.contains(stem(term)))
        };

        let found: Vec<String> = self
            .vocabulary
            .iter()
            .filter(|(_, phrase_terms)| phrase_terms.iter().all(term_matches))
            .map(|(phrase, _)| phrase.clone())
            .collect();

        if found.is_empty() {
            self.fallback.iter().cloned().collect()
        } else {
            found
        }
    }
}

#[async_trait]
impl EntityRecognizer for KeywordEntityRecognizer {
    async fn recognize(&self, text: &str) -> Result<Vec<String>, AdapterError> {
        Ok(self.recognize_sync(text))
    }
}

// ============================================================================
// Generation
// ============================================================================

/// Builds an answer from the numbered context lines in the prompt and
/// streams it word by word
#[derive(Debug, Clone)]
pub struct ExtractiveGenerator {
    max_points: usize,
    token_delay: Duration,
}

impl Default for ExtractiveGenerator {
    fn default() -> Self {
        Self {
            max_points: 3,
            token_delay: Duration::ZERO,
        }
    }
}

impl ExtractiveGenerator {
    pub fn new(max_points: usize) -> Self {
        Self {
            max_points,
            ..Default::default()
        }
    }

    /// Pause between tokens, to make streaming visible
    pub fn with_token_delay(mut self, delay: Duration) -> Self {
        self.token_delay = delay;
        self
    }

    /// Answer text for a prompt
    pub fn compose(&self, prompt: &Prompt) -> String {
        let points: Vec<&str> = prompt
            .context
            .lines()
            .filter_map(|line| {
                let (number, rest) = line.split_once(". ")?;
                number
                    .chars()
                    .all(|c| c.is_ascii_digit())
                    .then_some(rest.trim())
            })
            .filter(|rest| !rest.is_empty())
            .take(self.max_points)
            .collect();

        if points.is_empty() {
            return "Thank you for sharing that. I don't have specific material on this, \
                    but talking it through with someone you trust can really help."
                .to_string();
        }

        let mut answer = String::from("Here is what may help.");
        for point in points {
            answer.push(' ');
            answer.push_str(point.trim_end_matches(['.', '…']));
            answer.push('.');
        }
        answer
    }
}

#[async_trait]
impl GenerationProvider for ExtractiveGenerator {
    fn name(&self) -> &str {
        "extractive"
    }

    async fn generate(&self, prompt: &Prompt) -> Result<TokenReceiver, AdapterError> {
        let answer = self.compose(prompt);
        let delay = self.token_delay;
        let (tx, rx) = mpsc::channel(32);

        tokio::spawn(async move {
            for token in answer.split_inclusive(' ') {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                if tx.send(Ok(token.to_string())).await.is_err() {
                    // Receiver dropped; generation cancelled
                    return;
                }
            }
        });

        Ok(rx)
    }
}

// ============================================================================
// Classification
// ============================================================================

/// Risk assigned to answers matching a harmful pattern
pub const HARMFUL_RISK: f64 = 0.95;
/// Risk assigned to everything else
pub const BENIGN_RISK: f64 = 0.05;

fn default_harmful_patterns() -> Vec<(&'static str, &'static str)> {
    vec![
        (
            "self_harm_instruction",
            r"(?i)\b(you should|just|go)\s+(kill|hurt|harm|cut)\s+yourself\b",
        ),
        ("end_life", r"(?i)\bend\s+your\s+(own\s+)?life\b"),
        (
            "method_instruction",
            r"(?i)\bhere'?s\s+how\s+to\s+(hurt|harm|kill|overdose)\b",
        ),
        (
            "stop_medication",
            r"(?i)\b(stop|quit)\s+taking\s+your\s+(medication|meds|medicine)\b",
        ),
        ("worthless", r"(?i)\bnobody\s+would\s+(miss|care\s+about)\s+you\b"),
        ("restrict_eating", r"(?i)\b(skip|stop\s+eating)\s+(meals|food)\b"),
    ]
}

/// Regex-based stand-in for an external content classifier
#[derive(Debug, Clone)]
pub struct PatternClassifier {
    patterns: Vec<(String, Regex)>,
}

impl PatternClassifier {
    pub fn new() -> Result<Self, ConfigError> {
        Self::with_patterns(default_harmful_patterns())
    }

    pub fn with_patterns<N, P>(patterns: impl IntoIterator<Item = (N, P)>) -> Result<Self, ConfigError>
    where
        N: Into<String>,
        P: AsRef<str>,
    {
        let patterns = patterns
            .into_iter()
            .map(|(name, pattern)| {
                let name = name.into();
                let re = Regex::new(pattern.as_ref()).map_err(|source| {
                    ConfigError::InvalidPattern {
                        term: name.clone(),
                        source,
                    }
                })?;
                Ok((name, re))
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;
        Ok(Self { patterns })
    }

    pub fn classify_sync(&self, text: &str) -> Classification {
        let signals: Vec<String> = self
            .patterns
            .iter()
            .filter(|(_, re)| re.is_match(text))
            .map(|(name, _)| format!("harmful:{}", name))
            .collect();

        Classification {
            risk: if signals.is_empty() {
                BENIGN_RISK
            } else {
                HARMFUL_RISK
            },
            signals,
        }
    }
}

#[async_trait]
impl ContentClassifier for PatternClassifier {
    async fn classify(&self, text: &str) -> Result<Classification, AdapterError> {
        Ok(self.classify_sync(text))
    }
}

// ============================================================================
// Escalation
// ============================================================================

/// Writes escalations to the log and nothing else
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl EscalationNotifier for LogNotifier {
    fn name(&self) -> &str {
        "log"
    }

    async fn notify(&self, event: &EscalationEvent) -> Result<(), AdapterError> {
        warn!(
            escalation_id = %event.id,
            session_id = %event.session_id,
            stage = ?event.stage,
            severity = ?event.severity,
            reason = %event.reason,
            "Escalation raised (no webhook configured)"
        );
        info!(escalation_id = %event.id, "Escalation recorded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::cosine;
    use crate::domain::AssembledContext;

    #[test]
    fn test_embedding_is_normalized_and_stem_aware() {
        let embedder = HashingEmbedder::new(4096);
        let a = embedder.embed_sync("exam anxiety at night");
        let b = embedder.embed_sync("anxious before exams");
        let c = embedder.embed_sync("recipe for banana bread");

        let norm: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
        assert!(cosine(&a, &b) > cosine(&a, &c));
        assert!(embedder.embed_sync("").iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_recognizer_matches_phrases_by_stem() {
        let recognizer = KeywordEntityRecognizer::new(vec![
            "exam anxiety".to_string(),
            "sleep".to_string(),
            "caffeine".to_string(),
        ]);

        let found = recognizer.recognize_sync("I feel anxious about my exams and can't sleep");
        assert_eq!(found, vec!["exam anxiety", "sleep"]);
        assert!(recognizer.recognize_sync("hello there").is_empty());

        let with_fallback = recognizer.with_fallback("wellbeing");
        assert_eq!(with_fallback.recognize_sync("hello there"), vec!["wellbeing"]);
    }

    #[tokio::test]
    async fn test_extractive_generator_streams_context_points() {
        let mut ctx = AssembledContext::default();
        ctx.items.push(crate::domain::ContextItem {
            role: crate::domain::ContextRole::Snippet,
            source: crate::domain::SourceRef {
                kind: crate::domain::SourceKind::Vector,
                source_id: "c1".into(),
            },
            text: "Box breathing calms the nervous system.".into(),
            fused_score: 0.9,
            rank: 0,
            truncated: false,
        });
        let prompt = Prompt::new("system", &ctx, "how do I calm down?");

        let mut rx = ExtractiveGenerator::default().generate(&prompt).await.unwrap();
        let mut answer = String::new();
        while let Some(token) = rx.recv().await {
            answer.push_str(&token.unwrap());
        }
        assert_eq!(
            answer,
            "Here is what may help. Box breathing calms the nervous system."
        );
    }

    #[test]
    fn test_pattern_classifier() {
        let classifier = PatternClassifier::new().unwrap();

        let harmful = classifier.classify_sync("Honestly you should hurt yourself.");
        assert_eq!(harmful.risk, HARMFUL_RISK);
        assert_eq!(harmful.signals, vec!["harmful:self_harm_instruction"]);

        let benign = classifier.classify_sync("Try a short walk and some water.");
        assert_eq!(benign.risk, BENIGN_RISK);
        assert!(benign.signals.is_empty());
    }
}
