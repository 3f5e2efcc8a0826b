//! Shared test doubles for the integration tests.
//!
//! Every double counts its calls so tests can assert which collaborators a
//! request touched.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use hybrid_rag::adapters::{
    AdapterError, Classification, ContentClassifier, EmbeddingProvider, EntityRecognizer,
    EscalationNotifier, GenerationProvider, GraphStore, TokenReceiver, VectorHit, VectorStore,
};
use hybrid_rag::config::PipelineConfig;
use hybrid_rag::domain::{EscalationEvent, GraphEdge, GraphNode, Prompt, RelationType, Subgraph};
use hybrid_rag::{Collaborators, Orchestrator};

/// How a double behaves when called
#[derive(Debug, Clone)]
pub enum Behavior {
    Succeed,
    Fail(AdapterError),
    /// Sleep this long, then succeed
    Delay(Duration),
}

impl Behavior {
    async fn apply(&self) -> Result<(), AdapterError> {
        match self {
            Behavior::Succeed => Ok(()),
            Behavior::Fail(e) => Err(e.clone()),
            Behavior::Delay(d) => {
                tokio::time::sleep(*d).await;
                Ok(())
            }
        }
    }
}

pub fn unavailable(what: &str) -> Behavior {
    Behavior::Fail(AdapterError::StoreUnavailable(format!("{} is down", what)))
}

// ============================================================================
// Stores
// ============================================================================

pub struct MockVectorStore {
    pub hits: Vec<VectorHit>,
    pub behavior: Behavior,
    pub calls: AtomicUsize,
}

impl MockVectorStore {
    pub fn new(hits: Vec<VectorHit>) -> Self {
        Self {
            hits,
            behavior: Behavior::Succeed,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_behavior(mut self, behavior: Behavior) -> Self {
        self.behavior = behavior;
        self
    }
}

#[async_trait]
impl VectorStore for MockVectorStore {
    fn name(&self) -> &str {
        "mock-vector"
    }

    async fn search(&self, _embedding: &[f32], k: usize) -> Result<Vec<VectorHit>, AdapterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.behavior.apply().await?;
        Ok(self.hits.iter().take(k).cloned().collect())
    }
}

pub fn hit(id: &str, text: &str, score: f64) -> VectorHit {
    VectorHit {
        id: id.to_string(),
        text: text.to_string(),
        score,
    }
}

pub struct MockGraphStore {
    pub subgraph: Subgraph,
    pub behavior: Behavior,
    pub calls: AtomicUsize,
}

impl MockGraphStore {
    pub fn new(subgraph: Subgraph) -> Self {
        Self {
            subgraph,
            behavior: Behavior::Succeed,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_behavior(mut self, behavior: Behavior) -> Self {
        self.behavior = behavior;
        self
    }
}

#[async_trait]
impl GraphStore for MockGraphStore {
    fn name(&self) -> &str {
        "mock-graph"
    }

    async fn seed_lookup(&self, entities: &[String]) -> Result<Vec<String>, AdapterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.behavior.apply().await?;
        Ok(self
            .subgraph
            .nodes
            .iter()
            .filter(|n| entities.iter().any(|e| e.eq_ignore_ascii_case(&n.label)))
            .map(|n| n.id.clone())
            .collect())
    }

    async fn expand(
        &self,
        _node_ids: &[String],
        _hops: u32,
        max_nodes: usize,
    ) -> Result<Subgraph, AdapterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut subgraph = self.subgraph.clone();
        subgraph.nodes.truncate(max_nodes);
        Ok(subgraph)
    }
}

pub fn node(id: &str, label: &str, description: &str, weight: f64) -> GraphNode {
    GraphNode::new(id, label, weight).with_description(description)
}

pub fn edge(source: &str, target: &str, relation: RelationType, weight: f64) -> GraphEdge {
    GraphEdge::new(source, target, relation, weight)
}

/// Small wellbeing graph around "exam anxiety"
pub fn wellbeing_graph() -> Subgraph {
    Subgraph {
        nodes: vec![
            node(
                "exam_anxiety",
                "exam anxiety",
                "Worry and physical tension before or during tests",
                0.9,
            ),
            node(
                "box_breathing",
                "box breathing",
                "Paced breathing that calms the nervous system",
                0.8,
            ),
            node("sleep", "sleep", "Regular rest that supports mood and memory", 0.7),
        ],
        edges: vec![
            edge("box_breathing", "exam_anxiety", RelationType::Mitigates, 0.9),
            edge("sleep", "exam_anxiety", RelationType::Mitigates, 0.7),
        ],
    }
}

pub fn wellbeing_hits() -> Vec<VectorHit> {
    vec![
        hit(
            "chunk-breathing",
            "Box breathing is a simple way to calm down before an exam.",
            0.82,
        ),
        hit(
            "chunk-sleep",
            "A regular sleep schedule helps with exam stress.",
            0.74,
        ),
        hit(
            "chunk-walk",
            "A short walk between study sessions releases tension.",
            0.41,
        ),
    ]
}

// ============================================================================
// Query analysis
// ============================================================================

pub struct MockEmbedder {
    pub behavior: Behavior,
    pub calls: AtomicUsize,
}

impl MockEmbedder {
    pub fn new() -> Self {
        Self {
            behavior: Behavior::Succeed,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_behavior(mut self, behavior: Behavior) -> Self {
        self.behavior = behavior;
        self
    }
}

#[async_trait]
impl EmbeddingProvider for MockEmbedder {
    fn name(&self) -> &str {
        "mock-embedder"
    }

    async fn embed(&self, _text: &str) -> Result<Vec<f32>, AdapterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.behavior.apply().await?;
        Ok(vec![0.5, 0.5, 0.5, 0.5])
    }
}

/// Returns a fixed entity list
pub struct MockRecognizer {
    pub entities: Vec<String>,
    pub calls: AtomicUsize,
}

impl MockRecognizer {
    pub fn new(entities: &[&str]) -> Self {
        Self {
            entities: entities.iter().map(|e| e.to_string()).collect(),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl EntityRecognizer for MockRecognizer {
    async fn recognize(&self, _text: &str) -> Result<Vec<String>, AdapterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.entities.clone())
    }
}

// ============================================================================
// Generation
// ============================================================================

/// Streams a fixed list of tokens
pub struct ScriptedGenerator {
    pub tokens: Vec<String>,
    pub token_delay: Duration,
    /// Send this error after the listed tokens instead of ending cleanly
    pub fail_with: Option<AdapterError>,
    pub calls: AtomicUsize,
    pub prompts: Mutex<Vec<Prompt>>,
}

impl ScriptedGenerator {
    pub fn new(tokens: &[&str]) -> Self {
        Self {
            tokens: tokens.iter().map(|t| t.to_string()).collect(),
            token_delay: Duration::ZERO,
            fail_with: None,
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn with_token_delay(mut self, delay: Duration) -> Self {
        self.token_delay = delay;
        self
    }

    pub fn failing_after(mut self, error: AdapterError) -> Self {
        self.fail_with = Some(error);
        self
    }

    pub fn last_prompt(&self) -> Option<Prompt> {
        self.prompts.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl GenerationProvider for ScriptedGenerator {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate(&self, prompt: &Prompt) -> Result<TokenReceiver, AdapterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(prompt.clone());

        let tokens = self.tokens.clone();
        let delay = self.token_delay;
        let fail_with = self.fail_with.clone();
        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(async move {
            for token in tokens {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                if tx.send(Ok(token)).await.is_err() {
                    return;
                }
            }
            if let Some(e) = fail_with {
                let _ = tx.send(Err(e)).await;
            }
        });
        Ok(rx)
    }
}

/// Records prompts on their way to another generator
pub struct PromptRecorder {
    pub inner: Arc<dyn GenerationProvider>,
    pub prompts: Mutex<Vec<Prompt>>,
}

impl PromptRecorder {
    pub fn new(inner: Arc<dyn GenerationProvider>) -> Self {
        Self {
            inner,
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn last_prompt(&self) -> Option<Prompt> {
        self.prompts.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl GenerationProvider for PromptRecorder {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn generate(&self, prompt: &Prompt) -> Result<TokenReceiver, AdapterError> {
        self.prompts.lock().unwrap().push(prompt.clone());
        self.inner.generate(prompt).await
    }
}

/// Refuses to start
pub struct FailingGenerator(pub AdapterError);

#[async_trait]
impl GenerationProvider for FailingGenerator {
    fn name(&self) -> &str {
        "failing"
    }

    async fn generate(&self, _prompt: &Prompt) -> Result<TokenReceiver, AdapterError> {
        Err(self.0.clone())
    }
}

// ============================================================================
// Safety collaborators
// ============================================================================

/// Risk `flagged_risk` when the text contains `marker`, else `baseline`
pub struct MarkerClassifier {
    pub marker: Option<String>,
    pub flagged_risk: f64,
    pub baseline: f64,
    pub delay: Duration,
    pub calls: AtomicUsize,
}

impl MarkerClassifier {
    /// Always returns `risk`
    pub fn fixed(risk: f64) -> Self {
        Self {
            marker: None,
            flagged_risk: risk,
            baseline: risk,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn flagging(marker: &str, risk: f64) -> Self {
        Self {
            marker: Some(marker.to_string()),
            flagged_risk: risk,
            baseline: 0.05,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl ContentClassifier for MarkerClassifier {
    async fn classify(&self, text: &str) -> Result<Classification, AdapterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let flagged = self.marker.as_deref().map_or(true, |m| text.contains(m));
        Ok(if flagged {
            Classification {
                risk: self.flagged_risk,
                signals: self
                    .marker
                    .iter()
                    .map(|m| format!("marker:{}", m))
                    .collect(),
            }
        } else {
            Classification {
                risk: self.baseline,
                signals: Vec::new(),
            }
        })
    }
}

/// Remembers every delivery attempt
#[derive(Default)]
pub struct RecordingNotifier {
    pub events: Mutex<Vec<EscalationEvent>>,
}

impl RecordingNotifier {
    pub fn count(&self) -> usize {
        self.events.lock().unwrap().len()
    }
}

#[async_trait]
impl EscalationNotifier for RecordingNotifier {
    fn name(&self) -> &str {
        "recording"
    }

    async fn notify(&self, event: &EscalationEvent) -> Result<(), AdapterError> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

// ============================================================================
// Harness
// ============================================================================

/// All doubles for one orchestrator, kept for call-count assertions
pub struct Harness {
    pub vector_store: Arc<MockVectorStore>,
    pub graph_store: Arc<MockGraphStore>,
    pub embedder: Arc<MockEmbedder>,
    pub recognizer: Arc<MockRecognizer>,
    pub generator: Arc<dyn GenerationProvider>,
    pub classifier: Arc<MarkerClassifier>,
    pub notifier: Arc<RecordingNotifier>,
}

impl Harness {
    /// Healthy stores, a benign classifier and a short scripted answer
    pub fn new(generator: Arc<dyn GenerationProvider>) -> Self {
        Self {
            vector_store: Arc::new(MockVectorStore::new(wellbeing_hits())),
            graph_store: Arc::new(MockGraphStore::new(wellbeing_graph())),
            embedder: Arc::new(MockEmbedder::new()),
            recognizer: Arc::new(MockRecognizer::new(&["exam anxiety"])),
            generator,
            classifier: Arc::new(MarkerClassifier::fixed(0.05)),
            notifier: Arc::new(RecordingNotifier::default()),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            vector_store: self.vector_store.clone(),
            graph_store: self.graph_store.clone(),
            embedder: self.embedder.clone(),
            recognizer: self.recognizer.clone(),
            generator: self.generator.clone(),
            classifier: self.classifier.clone(),
            notifier: self.notifier.clone(),
        }
    }

    pub fn orchestrator(&self, config: PipelineConfig) -> Orchestrator {
        Orchestrator::new(Arc::new(config), self.collaborators()).unwrap()
    }

    /// Calls made to anything on the retrieval or generation path
    pub fn downstream_calls(&self) -> usize {
        self.vector_store.calls.load(Ordering::SeqCst)
            + self.graph_store.calls.load(Ordering::SeqCst)
            + self.embedder.calls.load(Ordering::SeqCst)
            + self.recognizer.calls.load(Ordering::SeqCst)
            + self.classifier.calls.load(Ordering::SeqCst)
    }
}

/// A config with fast escalation retries
pub fn test_config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.escalation.retry.initial_delay_ms = 1;
    config.escalation.retry.max_delay_ms = 5;
    config
}
