//! Hybrid retrieval coordinator.
//!
//! Runs the vector branch (embed, then nearest-neighbour search) and the
//! graph branch (entity recognition, seed lookup, bounded expansion)
//! concurrently, each under its own timeouts, and joins both before
//! returning. A branch that fails or times out is reported in its
//! `ModalityStatus`; it never fails the other branch.
//!
//! Store access goes through one semaphore per store. A permit is held only
//! for the duration of the fetch itself.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tracing::{debug, instrument, warn};

use crate::adapters::{
    AdapterError, EmbeddingProvider, EntityRecognizer, GraphStore, VectorStore,
};
use crate::config::RetrievalSettings;
use crate::core::text::{jaccard, terms};
use crate::domain::{ModalityStatus, ScoredItem, Subgraph};

/// Everything retrieval learned about one query
#[derive(Debug, Clone)]
pub struct RetrievalOutcome {
    pub query_embedding: Option<Vec<f32>>,
    pub seed_entities: Vec<String>,
    pub vector_items: Vec<ScoredItem>,
    pub graph_items: Vec<ScoredItem>,
    pub vector_status: ModalityStatus,
    pub graph_status: ModalityStatus,
    pub vector_elapsed: Duration,
    pub graph_elapsed: Duration,
}

struct BranchResult {
    items: Vec<ScoredItem>,
    status: ModalityStatus,
    elapsed: Duration,
}

pub struct HybridRetrievalCoordinator {
    vector_store: Arc<dyn VectorStore>,
    graph_store: Arc<dyn GraphStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    recognizer: Arc<dyn EntityRecognizer>,
    vector_permits: Arc<Semaphore>,
    graph_permits: Arc<Semaphore>,
    settings: RetrievalSettings,
}

impl HybridRetrievalCoordinator {
    pub fn new(
        vector_store: Arc<dyn VectorStore>,
        graph_store: Arc<dyn GraphStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        recognizer: Arc<dyn EntityRecognizer>,
        settings: RetrievalSettings,
    ) -> Self {
        Self {
            vector_store,
            graph_store,
            embedder,
            recognizer,
            vector_permits: Arc::new(Semaphore::new(settings.max_concurrent_fetches)),
            graph_permits: Arc::new(Semaphore::new(settings.max_concurrent_fetches)),
            settings,
        }
    }

    /// Fetch both modalities for `query` and join them
    #[instrument(skip(self, query), fields(query_chars = query.chars().count()))]
    pub async fn retrieve(&self, query: &str) -> RetrievalOutcome {
        let ((embedding, vector), (seeds, graph)) =
            tokio::join!(self.vector_branch(query), self.graph_branch(query));

        debug!(
            vector_items = vector.items.len(),
            graph_items = graph.items.len(),
            "Retrieval joined"
        );

        RetrievalOutcome {
            query_embedding: embedding,
            seed_entities: seeds,
            vector_items: vector.items,
            graph_items: graph.items,
            vector_status: vector.status,
            graph_status: graph.status,
            vector_elapsed: vector.elapsed,
            graph_elapsed: graph.elapsed,
        }
    }

    async fn vector_branch(&self, query: &str) -> (Option<Vec<f32>>, BranchResult) {
        let started = Instant::now();
        let analysis = self.settings.query_analysis_timeout();

        let embedding = match bounded(analysis, "embed", self.embedder.embed(query)).await {
            Ok(e) if !e.is_empty() => e,
            Ok(_) => {
                return (
                    None,
                    branch_failed(started, "embedding provider returned an empty vector"),
                )
            }
            Err(e) => {
                warn!(provider = self.embedder.name(), error = %e, "Query embedding failed");
                return (None, branch_error(started, e));
            }
        };

        let k = self.settings.vector_top_k;
        let search = async {
            let _permit = self
                .vector_permits
                .acquire()
                .await
                .map_err(|_| AdapterError::StoreUnavailable("vector pool closed".into()))?;
            self.vector_store.search(&embedding, k).await
        };

        let result = match bounded(self.settings.vector_timeout(), "vector search", search).await {
            Ok(hits) => {
                let items: Vec<ScoredItem> = hits
                    .into_iter()
                    .take(k)
                    .map(|hit| ScoredItem::vector(hit.id, hit.text, hit.score))
                    .collect();
                BranchResult {
                    status: ModalityStatus::Ok { items: items.len() },
                    items,
                    elapsed: started.elapsed(),
                }
            }
            Err(e) => {
                warn!(store = self.vector_store.name(), error = %e, "Vector retrieval failed");
                branch_error(started, e)
            }
        };

        (Some(embedding), result)
    }

    async fn graph_branch(&self, query: &str) -> (Vec<String>, BranchResult) {
        let started = Instant::now();
        let analysis = self.settings.query_analysis_timeout();

        let seeds = match bounded(analysis, "entity recognition", self.recognizer.recognize(query))
            .await
        {
            Ok(seeds) => seeds,
            Err(e) => {
                warn!(error = %e, "Entity recognition failed");
                return (Vec::new(), branch_error(started, e));
            }
        };

        if seeds.is_empty() {
            return (seeds, branch_skipped(started, "no seed entities recognized"));
        }

        let hops = self.settings.graph_max_hops;
        let max_nodes = self.settings.graph_max_nodes;
        let fetch = async {
            let _permit = self
                .graph_permits
                .acquire()
                .await
                .map_err(|_| AdapterError::StoreUnavailable("graph pool closed".into()))?;
            let node_ids = self.graph_store.seed_lookup(&seeds).await?;
            if node_ids.is_empty() {
                return Ok(None);
            }
            let subgraph = self.graph_store.expand(&node_ids, hops, max_nodes).await?;
            Ok::<_, AdapterError>(Some((node_ids, subgraph)))
        };

        let result = match bounded(self.settings.graph_timeout(), "graph fetch", fetch).await {
            Ok(None) => branch_skipped(started, "no graph nodes match the seed entities"),
            Ok(Some((node_ids, subgraph))) => {
                let items = graph_items(query, &node_ids, &subgraph, hops, max_nodes);
                BranchResult {
                    status: ModalityStatus::Ok { items: items.len() },
                    items,
                    elapsed: started.elapsed(),
                }
            }
            Err(e) => {
                warn!(store = self.graph_store.name(), error = %e, "Graph retrieval failed");
                branch_error(started, e)
            }
        };

        (seeds, result)
    }
}

/// Run `fut` under `limit`, folding the timeout into `AdapterError`
async fn bounded<T, F>(limit: Duration, operation: &str, fut: F) -> Result<T, AdapterError>
where
    F: Future<Output = Result<T, AdapterError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(AdapterError::Timeout {
            operation: operation.to_string(),
            elapsed_ms: limit.as_millis() as u64,
        }),
    }
}

fn branch_error(started: Instant, error: AdapterError) -> BranchResult {
    let status = match error {
        AdapterError::Timeout { elapsed_ms, .. } => ModalityStatus::TimedOut {
            after_ms: elapsed_ms,
        },
        other => ModalityStatus::Failed {
            reason: other.to_string(),
        },
    };
    BranchResult {
        items: Vec::new(),
        status,
        elapsed: started.elapsed(),
    }
}

fn branch_failed(started: Instant, reason: &str) -> BranchResult {
    BranchResult {
        items: Vec::new(),
        status: ModalityStatus::Failed {
            reason: reason.to_string(),
        },
        elapsed: started.elapsed(),
    }
}

fn branch_skipped(started: Instant, reason: &str) -> BranchResult {
    BranchResult {
        items: Vec::new(),
        status: ModalityStatus::Skipped {
            reason: reason.to_string(),
        },
        elapsed: started.elapsed(),
    }
}

/// Best product of edge weights from any seed to each node, within `hops`.
///
/// Edges are traversed in both directions. Seeds start at 1.0; nodes not
/// reachable within the bound are absent.
pub fn path_weights(seeds: &[String], subgraph: &Subgraph, hops: u32) -> HashMap<String, f64> {
    let mut adjacency: HashMap<&str, Vec<(&str, f64)>> = HashMap::new();
    for edge in &subgraph.edges {
        let w = edge.weight.max(0.0);
        adjacency
            .entry(edge.source.as_str())
            .or_default()
            .push((edge.target.as_str(), w));
        adjacency
            .entry(edge.target.as_str())
            .or_default()
            .push((edge.source.as_str(), w));
    }

    let mut best: HashMap<String, f64> = HashMap::new();
    let mut frontier: BTreeSet<&str> = BTreeSet::new();
    for seed in seeds {
        if subgraph.node(seed).is_some() {
            best.insert(seed.clone(), 1.0);
            frontier.insert(seed.as_str());
        }
    }

    for _ in 0..hops {
        // Relax from the previous round's values only, so a path never
        // gains more than one hop per round
        let settled = best.clone();
        let mut next: BTreeSet<&str> = BTreeSet::new();
        for &node in &frontier {
            let here = settled.get(node).copied().unwrap_or(0.0);
            for &(neighbor, weight) in adjacency.get(node).into_iter().flatten() {
                if subgraph.node(neighbor).is_none() {
                    continue;
                }
                let candidate = here * weight;
                let improved = best
                    .get(neighbor)
                    .map_or(true, |current| candidate > *current);
                if improved {
                    best.insert(neighbor.to_string(), candidate);
                    next.insert(neighbor);
                }
            }
        }
        if next.is_empty() {
            break;
        }
        frontier = next;
    }

    best
}

/// Turn an expanded subgraph into graph-origin candidates
fn graph_items(
    query: &str,
    seeds: &[String],
    subgraph: &Subgraph,
    hops: u32,
    max_nodes: usize,
) -> Vec<ScoredItem> {
    let reach = path_weights(seeds, subgraph, hops);
    let query_terms = terms(query);

    let mut items: Vec<ScoredItem> = subgraph
        .nodes
        .iter()
        .filter_map(|node| {
            let path = reach.get(&node.id)?;
            let node_terms = terms(&format!("{} {}", node.label, node.description));
            Some(ScoredItem::graph(
                node.id.clone(),
                subgraph.fact_text(node),
                node.weight.max(0.0) * path,
                jaccard(&query_terms, &node_terms),
            ))
        })
        .collect();

    items.sort_by(|a, b| {
        b.origin_score()
            .total_cmp(&a.origin_score())
            .then_with(|| a.source_id().cmp(b.source_id()))
    });
    items.truncate(max_nodes);
    items
}
