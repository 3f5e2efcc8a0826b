//! In-memory stores loaded from a YAML corpus.
//!
//! Corpus layout:
//!
//! ```yaml
//! chunks:
//!   - id: chunk-sleep
//!     text: A regular sleep schedule helps with exam stress.
//! nodes:
//!   - id: exam_anxiety
//!     label: exam anxiety
//!     description: Worry before or during tests
//!     weight: 0.9
//! edges:
//!   - source: breathing
//!     target: exam_anxiety
//!     relation: mitigates
//!     weight: 0.8
//! ```

use std::collections::{HashSet, VecDeque};
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{AdapterError, EmbeddingProvider, GraphStore, VectorHit, VectorStore};
use crate::domain::{GraphEdge, GraphNode, Subgraph};

/// A passage for the vector store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub text: String,
}

/// Everything the local stores are built from
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Corpus {
    #[serde(default)]
    pub chunks: Vec<Chunk>,
    #[serde(default)]
    pub nodes: Vec<GraphNode>,
    #[serde(default)]
    pub edges: Vec<GraphEdge>,
}

impl Corpus {
    pub fn from_yaml(content: &str) -> Result<Self> {
        let corpus: Corpus = serde_yaml::from_str(content).context("Failed to parse corpus")?;
        corpus.validate()?;
        Ok(corpus)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read corpus: {}", path.display()))?;
        Self::from_yaml(&content).with_context(|| format!("Invalid corpus: {}", path.display()))
    }

    /// Reject duplicate ids and edges pointing at unknown nodes
    fn validate(&self) -> Result<()> {
        let mut chunk_ids = HashSet::new();
        for chunk in &self.chunks {
            if !chunk_ids.insert(chunk.id.as_str()) {
                anyhow::bail!("Duplicate chunk id: {}", chunk.id);
            }
        }

        let mut node_ids = HashSet::new();
        for node in &self.nodes {
            if !node_ids.insert(node.id.as_str()) {
                anyhow::bail!("Duplicate node id: {}", node.id);
            }
        }

        for edge in &self.edges {
            for end in [&edge.source, &edge.target] {
                if !node_ids.contains(end.as_str()) {
                    anyhow::bail!(
                        "Edge {} -> {} references unknown node '{}'",
                        edge.source,
                        edge.target,
                        end
                    );
                }
            }
        }

        Ok(())
    }

    /// Node labels, used as the entity vocabulary
    pub fn labels(&self) -> Vec<String> {
        self.nodes.iter().map(|n| n.label.clone()).collect()
    }
}

struct IndexedChunk {
    id: String,
    text: String,
    embedding: Vec<f32>,
}

/// Brute-force cosine search over pre-embedded chunks
pub struct InMemoryVectorStore {
    chunks: Vec<IndexedChunk>,
}

impl InMemoryVectorStore {
    /// Embed every chunk with `embedder`
    pub async fn index(
        chunks: &[Chunk],
        embedder: &dyn EmbeddingProvider,
    ) -> Result<Self, AdapterError> {
        let mut indexed = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            indexed.push(IndexedChunk {
                id: chunk.id.clone(),
                text: chunk.text.clone(),
                embedding: embedder.embed(&chunk.text).await?,
            });
        }
        debug!(chunks = indexed.len(), embedder = embedder.name(), "Indexed vector store");
        Ok(Self { chunks: indexed })
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

/// Cosine similarity; 0.0 for mismatched or zero vectors
pub fn cosine(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b) {
        dot += f64::from(*x) * f64::from(*y);
        norm_a += f64::from(*x).powi(2);
        norm_b += f64::from(*y).powi(2);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    fn name(&self) -> &str {
        "memory-vector"
    }

    async fn search(&self, embedding: &[f32], k: usize) -> Result<Vec<VectorHit>, AdapterError> {
        let mut hits: Vec<VectorHit> = self
            .chunks
            .iter()
            .map(|c| VectorHit {
                id: c.id.clone(),
                text: c.text.clone(),
                score: cosine(embedding, &c.embedding),
            })
            .collect();

        hits.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
        hits.truncate(k);
        Ok(hits)
    }
}

/// Adjacency-list graph with label-based seed lookup
pub struct InMemoryGraphStore {
    nodes: Vec<GraphNode>,
    edges: Vec<GraphEdge>,
}

impl InMemoryGraphStore {
    pub fn new(nodes: Vec<GraphNode>, edges: Vec<GraphEdge>) -> Self {
        Self { nodes, edges }
    }

    pub fn from_corpus(corpus: &Corpus) -> Self {
        Self::new(corpus.nodes.clone(), corpus.edges.clone())
    }

    fn contains(&self, id: &str) -> bool {
        self.nodes.iter().any(|n| n.id == id)
    }
}

#[async_trait]
impl GraphStore for InMemoryGraphStore {
    fn name(&self) -> &str {
        "memory-graph"
    }

    async fn seed_lookup(&self, entities: &[String]) -> Result<Vec<String>, AdapterError> {
        let mut ids: Vec<String> = Vec::new();
        for entity in entities {
            let wanted = entity.trim().to_lowercase();
            for node in &self.nodes {
                let matches = node.id.to_lowercase() == wanted
                    || node.label.to_lowercase() == wanted;
                if matches && !ids.contains(&node.id) {
                    ids.push(node.id.clone());
                }
            }
        }
        Ok(ids)
    }

    async fn expand(
        &self,
        node_ids: &[String],
        hops: u32,
        max_nodes: usize,
    ) -> Result<Subgraph, AdapterError> {
        let mut visited: HashSet<String> = HashSet::new();
        let mut order: Vec<String> = Vec::new();
        let mut queue: VecDeque<(String, u32)> = VecDeque::new();

        for id in node_ids {
            if self.contains(id) && order.len() < max_nodes && visited.insert(id.clone()) {
                order.push(id.clone());
                queue.push_back((id.clone(), 0));
            }
        }

        while let Some((id, depth)) = queue.pop_front() {
            if depth >= hops {
                continue;
            }
            for edge in &self.edges {
                let Some(next) = edge.other_end(&id) else {
                    continue;
                };
                if order.len() >= max_nodes {
                    break;
                }
                if visited.insert(next.to_string()) {
                    order.push(next.to_string());
                    queue.push_back((next.to_string(), depth + 1));
                }
            }
        }

        let nodes: Vec<GraphNode> = order
            .iter()
            .filter_map(|id| self.nodes.iter().find(|n| &n.id == id).cloned())
            .collect();
        let edges: Vec<GraphEdge> = self
            .edges
            .iter()
            .filter(|e| visited.contains(&e.source) && visited.contains(&e.target))
            .cloned()
            .collect();

        Ok(Subgraph { nodes, edges })
    }
}
