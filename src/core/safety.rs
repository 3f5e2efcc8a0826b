//! Two-tier safety gate.
//!
//! - Tier 1 (prefilter): lexicon match on the raw query, before retrieval.
//!   `critical` blocks the request and escalates.
//! - Tier 2 (postfilter): content classifier on the generated answer, under
//!   a hard timeout. Risk above the escalation threshold substitutes the
//!   answer and escalates.
//!
//! Escalations are handed to the `EscalationDispatcher` and never awaited.

use std::sync::Arc;
use std::time::Instant;

use regex::Regex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::adapters::ContentClassifier;
use crate::config::{ConfigError, Lexicon, PipelineConfig, SafetySettings};
use crate::core::escalation::EscalationDispatcher;
use crate::domain::{EscalationEvent, SafetyLevel, SafetyStage, SafetyVerdict, Severity};

/// Prefilter risk for a critical lexicon hit
pub const CRITICAL_RISK: f64 = 0.95;
/// Prefilter risk for a high-risk lexicon hit
pub const HIGH_RISK: f64 = 0.75;
/// Prefilter risk when nothing matched
pub const BASELINE_RISK: f64 = 0.1;

/// Signal recorded when the classifier errors or times out
pub const CLASSIFIER_UNAVAILABLE: &str = "classifier_unavailable";

/// Lexicon tiers compiled to word-boundary regexes
#[derive(Debug, Clone)]
pub struct CompiledLexicon {
    critical: Vec<(String, Regex)>,
    high_risk: Vec<(String, Regex)>,
}

/// Terms matched by a lexicon scan, in lexicon order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LexiconMatch {
    pub critical: Vec<String>,
    pub high_risk: Vec<String>,
}

impl LexiconMatch {
    pub fn is_empty(&self) -> bool {
        self.critical.is_empty() && self.high_risk.is_empty()
    }

    /// `tier:term` signals, critical first
    pub fn signals(&self) -> Vec<String> {
        self.critical
            .iter()
            .map(|t| format!("critical:{}", t))
            .chain(self.high_risk.iter().map(|t| format!("high_risk:{}", t)))
            .collect()
    }
}

impl CompiledLexicon {
    pub fn compile(lexicon: &Lexicon) -> Result<Self, ConfigError> {
        Ok(Self {
            critical: compile_tier(&lexicon.critical)?,
            high_risk: compile_tier(&lexicon.high_risk)?,
        })
    }

    pub fn scan(&self, text: &str) -> LexiconMatch {
        let hits = |tier: &[(String, Regex)]| {
            tier.iter()
                .filter(|(_, re)| re.is_match(text))
                .map(|(term, _)| term.clone())
                .collect::<Vec<_>>()
        };

        LexiconMatch {
            critical: hits(&self.critical),
            high_risk: hits(&self.high_risk),
        }
    }

    pub fn len(&self) -> usize {
        self.critical.len() + self.high_risk.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn compile_tier(terms: &[String]) -> Result<Vec<(String, Regex)>, ConfigError> {
    terms
        .iter()
        .map(|term| {
            let pattern = term_pattern(term)?;
            let re = Regex::new(&pattern).map_err(|source| ConfigError::InvalidPattern {
                term: term.clone(),
                source,
            })?;
            Ok((term.trim().to_lowercase(), re))
        })
        .collect()
}

/// `don't want-to live` -> `(?i)\bdon['’]?t[\s\-]+want[\s\-]+to[\s\-]+live\b`
fn term_pattern(term: &str) -> Result<String, ConfigError> {
    let words: Vec<String> = term
        .split(|c: char| c.is_whitespace() || c == '-')
        .filter(|w| !w.is_empty())
        .map(|w| {
            w.split(['\'', '\u{2019}'])
                .map(regex::escape)
                .collect::<Vec<_>>()
                .join("['\u{2019}]?")
        })
        .collect();

    if words.is_empty() {
        return Err(ConfigError::Invalid("lexicon terms must not be empty".into()));
    }

    Ok(format!(r"(?i)\b{}\b", words.join(r"[\s\-]+")))
}

/// Postfilter verdict when no usable classification is available
fn unavailable(review_threshold: f64) -> SafetyVerdict {
    SafetyVerdict::new(
        SafetyStage::Postfilter,
        SafetyLevel::Review,
        vec![CLASSIFIER_UNAVAILABLE.to_string()],
        review_threshold,
    )
}

/// Prefilter and postfilter over one immutable configuration
#[derive(Clone)]
pub struct SafetyGate {
    config: Arc<PipelineConfig>,
    lexicon: Arc<CompiledLexicon>,
    classifier: Arc<dyn ContentClassifier>,
    dispatcher: EscalationDispatcher,
}

impl SafetyGate {
    pub fn new(
        config: Arc<PipelineConfig>,
        classifier: Arc<dyn ContentClassifier>,
        dispatcher: EscalationDispatcher,
    ) -> Result<Self, ConfigError> {
        let lexicon = CompiledLexicon::compile(&config.safety.lexicon)?;
        debug!(terms = lexicon.len(), "Compiled safety lexicon");

        Ok(Self {
            config,
            lexicon: Arc::new(lexicon),
            classifier,
            dispatcher,
        })
    }

    fn settings(&self) -> &SafetySettings {
        &self.config.safety
    }

    /// Tier 1: lexicon scan of the raw query
    pub fn prefilter(&self, query: &str) -> SafetyVerdict {
        let started = Instant::now();
        let matched = self.lexicon.scan(query);

        let (level, risk) = if !matched.critical.is_empty() {
            (SafetyLevel::Critical, CRITICAL_RISK)
        } else if !matched.high_risk.is_empty() {
            (SafetyLevel::Review, HIGH_RISK)
        } else {
            (SafetyLevel::Safe, BASELINE_RISK)
        };

        let elapsed = started.elapsed();
        if elapsed > self.settings().prefilter_budget() {
            warn!(
                elapsed_ms = elapsed.as_millis() as u64,
                budget_ms = self.settings().prefilter_budget_ms,
                "Prefilter exceeded latency budget"
            );
        }

        let verdict =
            SafetyVerdict::new(SafetyStage::Prefilter, level, matched.signals(), risk);
        debug!(level = level.as_str(), signals = ?verdict.signals, "Prefilter verdict");
        verdict
    }

    /// Tier 2: classify the generated answer.
    ///
    /// `prefilter_level` of `review` lowers the review threshold. A classifier
    /// error, timeout or non-finite risk yields `review`, never `safe`.
    pub async fn postfilter(&self, answer: &str, prefilter_level: SafetyLevel) -> SafetyVerdict {
        let settings = self.settings();
        let review_threshold = if prefilter_level >= SafetyLevel::Review {
            settings.strict_review_threshold
        } else {
            settings.review_threshold
        };

        let outcome =
            tokio::time::timeout(settings.postfilter_timeout(), self.classifier.classify(answer))
                .await;

        let classification = match outcome {
            Ok(Ok(c)) => c,
            Ok(Err(e)) => {
                warn!(error = %e, "Content classifier failed, marking answer for review");
                return unavailable(review_threshold);
            }
            Err(_) => {
                warn!(
                    timeout_ms = settings.postfilter_timeout_ms,
                    "Content classifier timed out, marking answer for review"
                );
                return unavailable(review_threshold);
            }
        };

        if !classification.risk.is_finite() {
            warn!(
                risk = classification.risk,
                "Content classifier returned a non-finite risk, marking answer for review"
            );
            return unavailable(review_threshold);
        }

        let risk = classification.risk.clamp(0.0, 1.0);
        let level = if risk > settings.escalation_threshold {
            SafetyLevel::Critical
        } else if risk >= review_threshold {
            SafetyLevel::Review
        } else {
            SafetyLevel::Safe
        };

        debug!(level = level.as_str(), risk, review_threshold, "Postfilter verdict");
        SafetyVerdict::new(SafetyStage::Postfilter, level, classification.signals, risk)
    }

    /// Raise an escalation for a critical verdict and deliver it in the
    /// background. Returns the event as recorded (delivery pending).
    pub fn escalate(
        &self,
        session_id: &str,
        correlation_id: Uuid,
        verdict: &SafetyVerdict,
    ) -> EscalationEvent {
        let severity = match verdict.stage {
            SafetyStage::Prefilter => Severity::Critical,
            SafetyStage::Postfilter => Severity::High,
        };
        let reason = if verdict.signals.is_empty() {
            format!("risk:{:.2}", verdict.risk)
        } else {
            verdict.signals.join(",")
        };

        let event =
            EscalationEvent::new(session_id, correlation_id, verdict.stage, severity, reason);
        warn!(
            escalation_id = %event.id,
            correlation_id = %correlation_id,
            stage = ?verdict.stage,
            severity = ?severity,
            "Escalation raised"
        );

        self.dispatcher.dispatch(event.clone());
        event
    }

    /// Wait for background escalation deliveries to finish
    pub async fn drain_escalations(&self) -> Vec<EscalationEvent> {
        self.dispatcher.drain().await
    }

    pub fn fallback_message(&self) -> &str {
        &self.settings().fallback_message
    }

    pub fn substitution_message(&self) -> &str {
        &self.settings().substitution_message
    }
}
