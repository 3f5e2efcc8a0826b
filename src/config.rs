//! Pipeline configuration.
//!
//! Configuration sources (highest priority first):
//! 1. Explicit path (`--config`)
//! 2. Environment variable `HYBRID_RAG_CONFIG`
//! 3. `.hybrid-rag/config.yaml` in the current directory or any parent
//! 4. `~/.hybrid-rag/config.yaml`
//! 5. Built-in defaults
//!
//! The resulting `PipelineConfig` is immutable: it is validated once at
//! startup and shared by `Arc` with every component. Relative paths inside
//! the file are resolved against the directory containing `.hybrid-rag/`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::safety::CompiledLexicon;

/// Environment variable naming an explicit config file
pub const CONFIG_ENV: &str = "HYBRID_RAG_CONFIG";

const CONFIG_DIR: &str = ".hybrid-rag";
const CONFIG_FILE: &str = "config.yaml";

/// Configuration errors; always fatal at startup
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("scoring weights must sum to 1.0, got {sum}")]
    InvalidWeights { sum: f64 },

    #[error("scoring weight '{name}' must be a finite non-negative number, got {value}")]
    InvalidWeight { name: &'static str, value: f64 },

    #[error(
        "safety thresholds must satisfy 0 <= strict_review ({strict_review}) <= review ({review}) <= escalation ({escalation}) <= 1"
    )]
    InvalidThresholds {
        strict_review: f64,
        review: f64,
        escalation: f64,
    },

    #[error("lexicon term '{term}' does not compile: {source}")]
    InvalidPattern {
        term: String,
        #[source]
        source: regex::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration file schema
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub retrieval: RetrievalSettings,
    #[serde(default)]
    pub scoring: ScoringWeights,
    #[serde(default)]
    pub context: ContextSettings,
    #[serde(default)]
    pub safety: SafetySettings,
    #[serde(default)]
    pub generation: GenerationSettings,
    #[serde(default)]
    pub escalation: EscalationSettings,
    #[serde(default)]
    pub latency: LatencySettings,
    #[serde(default)]
    pub openai: OpenAiSettings,
}

// ============================================================================
// Retrieval
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalSettings {
    /// Vector candidates per query (default: 24)
    #[serde(default = "default_vector_top_k")]
    pub vector_top_k: usize,

    /// Graph expansion depth from seed nodes (default: 2)
    #[serde(default = "default_graph_max_hops")]
    pub graph_max_hops: u32,

    /// Cap on expanded graph nodes (default: 200)
    #[serde(default = "default_graph_max_nodes")]
    pub graph_max_nodes: usize,

    /// Vector fetch timeout in ms (default: 3000)
    #[serde(default = "default_vector_timeout")]
    pub vector_timeout_ms: u64,

    /// Graph fetch timeout in ms, seed lookup + expansion (default: 2000)
    #[serde(default = "default_graph_timeout")]
    pub graph_timeout_ms: u64,

    /// Embedding and entity recognition timeout in ms (default: 1000)
    #[serde(default = "default_query_analysis_timeout")]
    pub query_analysis_timeout_ms: u64,

    /// In-flight fetches allowed per store across requests (default: 16)
    #[serde(default = "default_max_concurrent_fetches")]
    pub max_concurrent_fetches: usize,
}

fn default_vector_top_k() -> usize {
    24
}
fn default_graph_max_hops() -> u32 {
    2
}
fn default_graph_max_nodes() -> usize {
    200
}
fn default_vector_timeout() -> u64 {
    3000
}
fn default_graph_timeout() -> u64 {
    2000
}
fn default_query_analysis_timeout() -> u64 {
    1000
}
fn default_max_concurrent_fetches() -> usize {
    16
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self {
            vector_top_k: default_vector_top_k(),
            graph_max_hops: default_graph_max_hops(),
            graph_max_nodes: default_graph_max_nodes(),
            vector_timeout_ms: default_vector_timeout(),
            graph_timeout_ms: default_graph_timeout(),
            query_analysis_timeout_ms: default_query_analysis_timeout(),
            max_concurrent_fetches: default_max_concurrent_fetches(),
        }
    }
}

impl RetrievalSettings {
    pub fn vector_timeout(&self) -> Duration {
        Duration::from_millis(self.vector_timeout_ms)
    }

    pub fn graph_timeout(&self) -> Duration {
        Duration::from_millis(self.graph_timeout_ms)
    }

    pub fn query_analysis_timeout(&self) -> Duration {
        Duration::from_millis(self.query_analysis_timeout_ms)
    }
}

// ============================================================================
// Scoring
// ============================================================================

/// Fusion weights; must sum to 1.0
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoringWeights {
    #[serde(default = "default_weight_vector")]
    pub vector: f64,
    #[serde(default = "default_weight_graph")]
    pub graph: f64,
    #[serde(default = "default_weight_node_similarity")]
    pub node_similarity: f64,
}

fn default_weight_vector() -> f64 {
    0.6
}
fn default_weight_graph() -> f64 {
    0.3
}
fn default_weight_node_similarity() -> f64 {
    0.1
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            vector: default_weight_vector(),
            graph: default_weight_graph(),
            node_similarity: default_weight_node_similarity(),
        }
    }
}

impl ScoringWeights {
    const SUM_TOLERANCE: f64 = 1e-6;

    pub fn new(vector: f64, graph: f64, node_similarity: f64) -> Result<Self, ConfigError> {
        let weights = Self {
            vector,
            graph,
            node_similarity,
        };
        weights.validate()?;
        Ok(weights)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("vector", self.vector),
            ("graph", self.graph),
            ("node_similarity", self.node_similarity),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::InvalidWeight { name, value });
            }
        }

        let sum = self.vector + self.graph + self.node_similarity;
        if (sum - 1.0).abs() > Self::SUM_TOLERANCE {
            return Err(ConfigError::InvalidWeights { sum });
        }
        Ok(())
    }
}

// ============================================================================
// Context
// ============================================================================

/// Section order in the assembled payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextOrder {
    #[default]
    FactsFirst,
    SnippetsFirst,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSettings {
    /// Vector-origin passages (default: 6)
    #[serde(default = "default_max_snippets")]
    pub max_snippets: usize,

    /// Graph-origin facts (default: 12)
    #[serde(default = "default_max_facts")]
    pub max_facts: usize,

    /// Estimated token budget for all item texts (default: 1800)
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,

    /// Per-item character cap (default: 300)
    #[serde(default = "default_max_item_chars")]
    pub max_item_chars: usize,

    /// Shortest text worth keeping when trimming to the budget (default: 40)
    #[serde(default = "default_min_item_chars")]
    pub min_item_chars: usize,

    /// Fill a short modality from the other one (default: false)
    #[serde(default)]
    pub cross_modal_substitution: bool,

    #[serde(default)]
    pub order: ContextOrder,
}

fn default_max_snippets() -> usize {
    6
}
fn default_max_facts() -> usize {
    12
}
fn default_max_tokens() -> usize {
    1800
}
fn default_max_item_chars() -> usize {
    300
}
fn default_min_item_chars() -> usize {
    40
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            max_snippets: default_max_snippets(),
            max_facts: default_max_facts(),
            max_tokens: default_max_tokens(),
            max_item_chars: default_max_item_chars(),
            min_item_chars: default_min_item_chars(),
            cross_modal_substitution: false,
            order: ContextOrder::default(),
        }
    }
}

// ============================================================================
// Safety
// ============================================================================

/// Tiered keyword lexicon for the prefilter.
///
/// Terms are phrases matched case-insensitively on word boundaries; spaces
/// and hyphens are interchangeable and apostrophes optional.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lexicon {
    #[serde(default = "default_critical_terms")]
    pub critical: Vec<String>,
    #[serde(default = "default_high_risk_terms")]
    pub high_risk: Vec<String>,
}

fn default_critical_terms() -> Vec<String> {
    [
        "suicide",
        "suicidal",
        "kill myself",
        "end my life",
        "want to die",
        "don't want to live",
        "no reason to live",
        "self harm",
        "cut myself",
        "hurt myself",
        "overdose",
        "abuse",
        "abused",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_high_risk_terms() -> Vec<String> {
    [
        "hopeless",
        "no hope",
        "worthless",
        "give up",
        "giving up",
        "can't go on",
        "terrified",
        "scared",
        "afraid",
        "panic attack",
        "violence",
        "violent",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for Lexicon {
    fn default() -> Self {
        Self {
            critical: default_critical_terms(),
            high_risk: default_high_risk_terms(),
        }
    }
}

/// When the postfilter runs relative to streaming
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum StreamPolicy {
    /// Classify the complete answer before the first token is released
    #[default]
    BufferAll,
    /// Classify the first `prefix_chars`, stream the rest, re-check at the end
    /// and retract on escalation
    ClassifyPrefix { prefix_chars: usize },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetySettings {
    #[serde(default)]
    pub lexicon: Lexicon,

    /// Postfilter risk strictly above this escalates (default: 0.9)
    #[serde(default = "default_escalation_threshold")]
    pub escalation_threshold: f64,

    /// Postfilter risk at or above this is `review` (default: 0.7)
    #[serde(default = "default_review_threshold")]
    pub review_threshold: f64,

    /// Review threshold used when the prefilter already said `review` (default: 0.5)
    #[serde(default = "default_strict_review_threshold")]
    pub strict_review_threshold: f64,

    /// Prefilter latency budget in ms (default: 50)
    #[serde(default = "default_prefilter_budget")]
    pub prefilter_budget_ms: u64,

    /// Postfilter classifier timeout in ms (default: 200)
    #[serde(default = "default_postfilter_timeout")]
    pub postfilter_timeout_ms: u64,

    #[serde(default)]
    pub stream_policy: StreamPolicy,

    /// Returned instead of an answer when the prefilter blocks
    #[serde(default = "default_fallback_message")]
    pub fallback_message: String,

    /// Replaces a generated answer the postfilter blocks
    #[serde(default = "default_substitution_message")]
    pub substitution_message: String,
}

fn default_escalation_threshold() -> f64 {
    0.9
}
fn default_review_threshold() -> f64 {
    0.7
}
fn default_strict_review_threshold() -> f64 {
    0.5
}
fn default_prefilter_budget() -> u64 {
    50
}
fn default_postfilter_timeout() -> u64 {
    200
}
fn default_fallback_message() -> String {
    "I'm really concerned about what you've shared, and your safety matters most right now. \
     Please reach out for immediate support: call or text 988 (Suicide & Crisis Lifeline, US), \
     text HOME to 741741, or contact your local emergency number. You're not alone, and a \
     person from our care team has been notified."
        .to_string()
}
fn default_substitution_message() -> String {
    "I want to make sure I respond to you safely, so I'm not able to share that answer. \
     If you're going through something difficult, please talk to someone you trust or call \
     or text 988 to reach a trained counselor any time."
        .to_string()
}

impl Default for SafetySettings {
    fn default() -> Self {
        Self {
            lexicon: Lexicon::default(),
            escalation_threshold: default_escalation_threshold(),
            review_threshold: default_review_threshold(),
            strict_review_threshold: default_strict_review_threshold(),
            prefilter_budget_ms: default_prefilter_budget(),
            postfilter_timeout_ms: default_postfilter_timeout(),
            stream_policy: StreamPolicy::default(),
            fallback_message: default_fallback_message(),
            substitution_message: default_substitution_message(),
        }
    }
}

impl SafetySettings {
    pub fn postfilter_timeout(&self) -> Duration {
        Duration::from_millis(self.postfilter_timeout_ms)
    }

    pub fn prefilter_budget(&self) -> Duration {
        Duration::from_millis(self.prefilter_budget_ms)
    }
}

// ============================================================================
// Generation
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationSettings {
    /// Whole-generation deadline in ms (default: 10000)
    #[serde(default = "default_generation_timeout")]
    pub timeout_ms: u64,

    /// Query length cap after rewriting (default: 2000 chars)
    #[serde(default = "default_max_query_chars")]
    pub max_query_chars: usize,

    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
}

fn default_generation_timeout() -> u64 {
    10_000
}
fn default_max_query_chars() -> usize {
    2000
}
fn default_system_prompt() -> String {
    "You are a supportive wellness assistant. Answer using the provided context, \
     be empathetic and age-appropriate, never diagnose or prescribe, and suggest \
     professional help for serious concerns."
        .to_string()
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            timeout_ms: default_generation_timeout(),
            max_query_chars: default_max_query_chars(),
            system_prompt: default_system_prompt(),
        }
    }
}

impl GenerationSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

// ============================================================================
// Escalation
// ============================================================================

/// Retry policy for escalation delivery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including first try)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay between retries in milliseconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Maximum delay between retries in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Backoff multiplier (delay *= multiplier after each retry)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_delay() -> u64 {
    500
}
fn default_max_delay() -> u64 {
    5000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryPolicy {
    /// Calculate delay for a specific attempt (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::from_millis(self.initial_delay_ms);
        }

        let delay = self.initial_delay_ms as f64
            * self.backoff_multiplier.powi((attempt - 1) as i32);

        let capped = delay.min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(capped)
    }

    /// Check if we should retry based on attempt count
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EscalationSettings {
    /// Reviewer webhook; escalations are only logged when unset
    #[serde(default)]
    pub webhook_url: Option<String>,

    /// JSONL audit log of delivery outcomes
    #[serde(default)]
    pub audit_log: Option<PathBuf>,

    #[serde(default)]
    pub retry: RetryPolicy,
}

// ============================================================================
// Latency targets & providers
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatencySettings {
    /// Warn when a request takes longer than this end to end (default: 2600)
    #[serde(default = "default_end_to_end_target")]
    pub end_to_end_target_ms: u64,
}

fn default_end_to_end_target() -> u64 {
    2600
}

impl Default for LatencySettings {
    fn default() -> Self {
        Self {
            end_to_end_target_ms: default_end_to_end_target(),
        }
    }
}

/// OpenAI-compatible endpoint settings; the key comes from `OPENAI_API_KEY`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiSettings {
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,
    #[serde(default = "default_chat_model")]
    pub chat_model: String,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_openai_max_tokens")]
    pub max_tokens: u32,
}

fn default_openai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_chat_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}
fn default_temperature() -> f32 {
    0.4
}
fn default_openai_max_tokens() -> u32 {
    1024
}

impl Default for OpenAiSettings {
    fn default() -> Self {
        Self {
            base_url: default_openai_base_url(),
            chat_model: default_chat_model(),
            embedding_model: default_embedding_model(),
            temperature: default_temperature(),
            max_tokens: default_openai_max_tokens(),
        }
    }
}

// ============================================================================
// Validation & loading
// ============================================================================

impl PipelineConfig {
    /// Parse from YAML content and validate
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: PipelineConfig =
            serde_yaml::from_str(content).map_err(|source| ConfigError::Parse {
                path: PathBuf::from("<inline>"),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Check every invariant the pipeline relies on
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.scoring.validate()?;

        let s = &self.safety;
        let ordered = 0.0 <= s.strict_review_threshold
            && s.strict_review_threshold <= s.review_threshold
            && s.review_threshold <= s.escalation_threshold
            && s.escalation_threshold <= 1.0;
        if !ordered {
            return Err(ConfigError::InvalidThresholds {
                strict_review: s.strict_review_threshold,
                review: s.review_threshold,
                escalation: s.escalation_threshold,
            });
        }
        if let StreamPolicy::ClassifyPrefix { prefix_chars: 0 } = s.stream_policy {
            return Err(ConfigError::Invalid(
                "safety.stream_policy.prefix_chars must be positive".into(),
            ));
        }
        CompiledLexicon::compile(&s.lexicon)?;

        let r = &self.retrieval;
        if r.vector_top_k == 0 || r.graph_max_nodes == 0 || r.max_concurrent_fetches == 0 {
            return Err(ConfigError::Invalid(
                "retrieval.vector_top_k, graph_max_nodes and max_concurrent_fetches must be positive"
                    .into(),
            ));
        }
        if r.vector_timeout_ms == 0 || r.graph_timeout_ms == 0 || r.query_analysis_timeout_ms == 0
        {
            return Err(ConfigError::Invalid("retrieval timeouts must be positive".into()));
        }

        let c = &self.context;
        if c.max_tokens == 0 || c.max_item_chars == 0 {
            return Err(ConfigError::Invalid(
                "context.max_tokens and max_item_chars must be positive".into(),
            ));
        }
        if c.min_item_chars > c.max_item_chars {
            return Err(ConfigError::Invalid(
                "context.min_item_chars cannot exceed max_item_chars".into(),
            ));
        }

        if self.generation.timeout_ms == 0 || self.generation.max_query_chars == 0 {
            return Err(ConfigError::Invalid(
                "generation.timeout_ms and max_query_chars must be positive".into(),
            ));
        }
        if self.escalation.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "escalation.retry.max_attempts must be at least 1".into(),
            ));
        }

        Ok(())
    }
}

/// A validated configuration and the file it came from (if any)
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: PipelineConfig,
    pub source: Option<PathBuf>,
}

/// Default home directory for state (`~/.hybrid-rag`)
pub fn default_home() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(CONFIG_DIR))
}

/// Find `.hybrid-rag/config.yaml` in `start` or any of its parents
pub fn find_config_file(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();

    loop {
        let config_path = current.join(CONFIG_DIR).join(CONFIG_FILE);
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and validate a config file
pub fn load_config_file(path: &Path) -> Result<PipelineConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let mut config: PipelineConfig =
        serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

    // Paths are relative to the project root (parent of .hybrid-rag/)
    let base_dir = path
        .parent()
        .and_then(|p| p.parent())
        .unwrap_or(Path::new("."));
    if let Some(audit_log) = config.escalation.audit_log.take() {
        config.escalation.audit_log = Some(resolve_path(base_dir, &audit_log));
    }

    config.validate()?;
    Ok(config)
}

/// Resolve a path that may be relative to the config file's project root
fn resolve_path(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// Load configuration from all sources
pub fn load(explicit: Option<&Path>) -> Result<LoadedConfig, ConfigError> {
    let source = explicit
        .map(Path::to_path_buf)
        .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from))
        .or_else(|| {
            std::env::current_dir()
                .ok()
                .and_then(|cwd| find_config_file(&cwd))
        })
        .or_else(|| {
            default_home()
                .map(|home| home.join(CONFIG_FILE))
                .filter(|p| p.exists())
        });

    let config = match source {
        Some(ref path) => load_config_file(path)?,
        None => {
            let config = PipelineConfig::default();
            config.validate()?;
            config
        }
    };

    Ok(LoadedConfig { config, source })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.retrieval.vector_top_k, 24);
        assert_eq!(config.retrieval.graph_max_hops, 2);
        assert_eq!(config.context.max_snippets, 6);
        assert_eq!(config.context.max_facts, 12);
        assert_eq!(config.safety.stream_policy, StreamPolicy::BufferAll);
    }

    #[test]
    fn test_weights_must_sum_to_one() {
        assert!(ScoringWeights::new(0.5, 0.3, 0.2).is_ok());
        assert!(matches!(
            ScoringWeights::new(0.6, 0.3, 0.3),
            Err(ConfigError::InvalidWeights { .. })
        ));
        assert!(matches!(
            ScoringWeights::new(1.2, -0.1, -0.1),
            Err(ConfigError::InvalidWeight { name: "graph", .. })
        ));
    }

    #[test]
    fn test_threshold_ordering_enforced() {
        let mut config = PipelineConfig::default();
        config.safety.review_threshold = 0.95;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidThresholds { .. })
        ));
    }

    #[test]
    fn test_yaml_partial_override() {
        let config = PipelineConfig::from_yaml(
            r#"
retrieval:
  vector_top_k: 10
scoring:
  vector: 0.5
  graph: 0.4
  node_similarity: 0.1
safety:
  stream_policy:
    mode: classify_prefix
    prefix_chars: 120
context:
  order: snippets_first
  cross_modal_substitution: true
"#,
        )
        .unwrap();

        assert_eq!(config.retrieval.vector_top_k, 10);
        assert_eq!(config.retrieval.graph_max_hops, 2);
        assert_eq!(config.scoring.graph, 0.4);
        assert_eq!(
            config.safety.stream_policy,
            StreamPolicy::ClassifyPrefix { prefix_chars: 120 }
        );
        assert_eq!(config.context.order, ContextOrder::SnippetsFirst);
        assert!(config.context.cross_modal_substitution);
        assert_eq!(config.safety.escalation_threshold, 0.9);
    }

    #[test]
    fn test_yaml_bad_weights_rejected() {
        let result = PipelineConfig::from_yaml("scoring:\n  vector: 0.9\n");
        assert!(matches!(result, Err(ConfigError::InvalidWeights { .. })));
    }

    #[test]
    fn test_find_config_file_in_parent() {
        let temp = TempDir::new().unwrap();
        let config_dir = temp.path().join(".hybrid-rag");
        std::fs::create_dir_all(&config_dir).unwrap();
        let config_path = config_dir.join("config.yaml");
        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(
            file,
            "escalation:\n  audit_log: logs/escalations.jsonl\n"
        )
        .unwrap();

        let nested = temp.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();

        let found = find_config_file(&nested).unwrap();
        assert_eq!(found, config_path);

        let config = load_config_file(&found).unwrap();
        assert_eq!(
            config.escalation.audit_log,
            Some(temp.path().join("logs/escalations.jsonl"))
        );
    }

    #[test]
    fn test_retry_policy_delays() {
        let policy = RetryPolicy {
            initial_delay_ms: 1000,
            backoff_multiplier: 2.0,
            max_delay_ms: 10000,
            ..Default::default()
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(4000));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(10000)); // Capped
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }
}
