//! Adapter interfaces for external collaborators.
//!
//! The pipeline never talks to a database or model directly; it goes through
//! these traits. Local implementations live in `memory` and `local`, HTTP
//! ones in `openai` and `webhook`.

pub mod local;
pub mod memory;
pub mod openai;
pub mod webhook;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::domain::{EscalationEvent, Prompt, Subgraph};

// Re-export the bundled implementations
pub use local::{ExtractiveGenerator, HashingEmbedder, KeywordEntityRecognizer, LogNotifier, PatternClassifier};
pub use memory::{Corpus, InMemoryGraphStore, InMemoryVectorStore};
pub use openai::OpenAiClient;
pub use webhook::WebhookNotifier;

/// Failure kinds shared by all collaborators
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AdapterError {
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("{operation} timed out after {elapsed_ms}ms")]
    Timeout { operation: String, elapsed_ms: u64 },

    #[error("provider error: {0}")]
    Provider(String),
}

/// A nearest-neighbour hit from the vector store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorHit {
    pub id: String,
    pub text: String,
    /// Similarity reported by the store (cosine for the in-memory store)
    pub score: f64,
}

/// Stream of generated tokens; dropping the receiver cancels generation
pub type TokenReceiver = mpsc::Receiver<Result<String, AdapterError>>;

/// Risk assessment from a content classifier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    /// Risk in [0, 1]
    pub risk: f64,
    pub signals: Vec<String>,
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    fn name(&self) -> &str;

    /// Top-`k` nearest chunks to `embedding`, best first
    async fn search(&self, embedding: &[f32], k: usize) -> Result<Vec<VectorHit>, AdapterError>;
}

#[async_trait]
pub trait GraphStore: Send + Sync {
    fn name(&self) -> &str;

    /// Resolve entity strings to node ids
    async fn seed_lookup(&self, entities: &[String]) -> Result<Vec<String>, AdapterError>;

    /// Nodes and edges within `hops` of `node_ids`, at most `max_nodes` nodes
    async fn expand(
        &self,
        node_ids: &[String],
        hops: u32,
        max_nodes: usize,
    ) -> Result<Subgraph, AdapterError>;
}

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, AdapterError>;
}

/// Upstream entity-recognition step producing graph seed entities
#[async_trait]
pub trait EntityRecognizer: Send + Sync {
    async fn recognize(&self, text: &str) -> Result<Vec<String>, AdapterError>;
}

#[async_trait]
pub trait GenerationProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Start generating; tokens arrive on the returned channel
    async fn generate(&self, prompt: &Prompt) -> Result<TokenReceiver, AdapterError>;
}

/// Tier-2 content classifier
#[async_trait]
pub trait ContentClassifier: Send + Sync {
    async fn classify(&self, text: &str) -> Result<Classification, AdapterError>;
}

/// Delivery of escalation events to human reviewers.
///
/// One call is one delivery attempt; retries and the resulting
/// `DeliveryStatus` are owned by the escalation dispatcher.
#[async_trait]
pub trait EscalationNotifier: Send + Sync {
    fn name(&self) -> &str;

    async fn notify(&self, event: &EscalationEvent) -> Result<(), AdapterError>;
}
