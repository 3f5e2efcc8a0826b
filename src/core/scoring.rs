//! Hybrid scoring engine.
//!
//! Merges the two modalities' candidates, min-max normalizes each signal
//! within the batch, fuses them with the configured weights and produces a
//! total order:
//!
//! 1. fused score, descending
//! 2. graph before vector
//! 3. source id, ascending

use std::cmp::Ordering;
use std::collections::HashMap;

use tracing::debug;

use crate::config::{ConfigError, ScoringWeights};
use crate::domain::{ScoreComponents, ScoredItem};

#[derive(Debug, Clone, Copy)]
pub struct HybridScorer {
    weights: ScoringWeights,
}

impl HybridScorer {
    pub fn new(weights: ScoringWeights) -> Result<Self, ConfigError> {
        weights.validate()?;
        Ok(Self { weights })
    }

    pub fn weights(&self) -> &ScoringWeights {
        &self.weights
    }

    /// Fuse both modalities into one ranking
    pub fn score(&self, vector: Vec<ScoredItem>, graph: Vec<ScoredItem>) -> Vec<ScoredItem> {
        let merged = merge(vector, graph);
        if merged.is_empty() {
            return merged;
        }

        let column = |pick: fn(&ScoreComponents) -> Option<f64>| -> Vec<Option<f64>> {
            let raw: Vec<Option<f64>> = merged.iter().map(|item| pick(item.raw())).collect();
            normalize_present(&raw)
        };
        let vector_norm = column(|c| c.vector);
        let path_norm = column(|c| c.graph_path);
        let similarity_norm = column(|c| c.node_similarity);

        let mut ranked: Vec<ScoredItem> = merged
            .into_iter()
            .enumerate()
            .map(|(i, item)| {
                let normalized = ScoreComponents {
                    vector: vector_norm[i],
                    graph_path: path_norm[i],
                    node_similarity: similarity_norm[i],
                };
                let fused = self.fuse(&normalized);
                item.into_scored(normalized, fused)
            })
            .collect();

        ranked.sort_by(compare_ranked);

        debug!(
            items = ranked.len(),
            top = ranked.first().map(|i| i.fused_score()).unwrap_or(0.0),
            "Fused ranking"
        );
        ranked
    }

    /// Weighted sum of normalized components; missing ones count as 0
    pub fn fuse(&self, normalized: &ScoreComponents) -> f64 {
        self.weights.vector * normalized.vector.unwrap_or(0.0)
            + self.weights.graph * normalized.graph_path.unwrap_or(0.0)
            + self.weights.node_similarity * normalized.node_similarity.unwrap_or(0.0)
    }
}

/// Ranking order over scored items
pub fn compare_ranked(a: &ScoredItem, b: &ScoredItem) -> Ordering {
    b.fused_score()
        .total_cmp(&a.fused_score())
        .then_with(|| a.kind().priority().cmp(&b.kind().priority()))
        .then_with(|| a.source_id().cmp(b.source_id()))
}

/// Merge by source id. The vector item stays primary and absorbs the graph
/// item's signals; repeated ids within one modality keep the first hit.
fn merge(vector: Vec<ScoredItem>, graph: Vec<ScoredItem>) -> Vec<ScoredItem> {
    let mut merged: Vec<ScoredItem> = Vec::with_capacity(vector.len() + graph.len());
    let mut index: HashMap<String, usize> = HashMap::new();

    for item in vector {
        if !index.contains_key(item.source_id()) {
            index.insert(item.source_id().to_string(), merged.len());
            merged.push(item);
        }
    }

    for item in graph {
        match index.get(item.source_id()) {
            Some(&pos) => {
                if merged[pos].raw().graph_path.is_none() {
                    merged[pos].absorb(&item);
                }
            }
            None => {
                index.insert(item.source_id().to_string(), merged.len());
                merged.push(item);
            }
        }
    }

    merged
}

/// Min-max normalize into [0, 1].
///
/// Non-finite values count as 0. When every value is equal the result is
/// 1.0 for a positive value and 0.0 otherwise.
pub fn min_max_normalize(values: &[f64]) -> Vec<f64> {
    let clean: Vec<f64> = values
        .iter()
        .map(|v| if v.is_finite() { *v } else { 0.0 })
        .collect();

    let Some(min) = clean.iter().copied().reduce(f64::min) else {
        return Vec::new();
    };
    let max = clean.iter().copied().fold(min, f64::max);
    let span = max - min;

    clean
        .iter()
        .map(|v| {
            if span <= f64::EPSILON {
                if *v > 0.0 {
                    1.0
                } else {
                    0.0
                }
            } else {
                ((v - min) / span).clamp(0.0, 1.0)
            }
        })
        .collect()
}

/// Normalize only the reported values, keeping absent ones absent
fn normalize_present(raw: &[Option<f64>]) -> Vec<Option<f64>> {
    let present: Vec<f64> = raw.iter().flatten().copied().collect();
    let mut normalized = min_max_normalize(&present).into_iter();
    raw.iter()
        .map(|v| v.and_then(|_| normalized.next()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::SourceKind;

    fn scorer() -> HybridScorer {
        HybridScorer::new(ScoringWeights::default()).unwrap()
    }

    #[test]
    fn test_min_max_normalize() {
        assert_eq!(min_max_normalize(&[2.0, 4.0, 3.0]), vec![0.0, 1.0, 0.5]);
        assert_eq!(min_max_normalize(&[0.4, 0.4]), vec![1.0, 1.0]);
        assert_eq!(min_max_normalize(&[0.0]), vec![0.0]);
        assert_eq!(min_max_normalize(&[f64::NAN, 1.0]), vec![0.0, 1.0]);
        assert!(min_max_normalize(&[]).is_empty());
    }

    #[test]
    fn test_normalize_present_skips_missing() {
        let out = normalize_present(&[Some(1.0), None, Some(3.0)]);
        assert_eq!(out, vec![Some(0.0), None, Some(1.0)]);
    }

    #[test]
    fn test_merge_keeps_vector_primary() {
        let ranked = scorer().score(
            vec![
                ScoredItem::vector("shared", "passage", 0.9),
                ScoredItem::vector("v2", "other", 0.5),
            ],
            vec![
                ScoredItem::graph("shared", "fact", 0.8, 0.4),
                ScoredItem::graph("g2", "fact two", 0.2, 0.1),
            ],
        );

        assert_eq!(ranked.len(), 3);
        let shared = ranked.iter().find(|i| i.source_id() == "shared").unwrap();
        assert_eq!(shared.kind(), SourceKind::Vector);
        assert_eq!(shared.text(), "passage");
        assert!(shared.is_merged());
        // Best in every column: 0.6 + 0.3 + 0.1
        assert!((shared.fused_score() - 1.0).abs() < 1e-9);
        assert_eq!(ranked[0].source_id(), "shared");
    }

    #[test]
    fn test_ties_prefer_graph_then_source_id() {
        let ranked = scorer().score(
            vec![ScoredItem::vector("b", "x", 0.5)],
            vec![
                ScoredItem::graph("z", "y", 0.0, 0.0),
                ScoredItem::graph("a", "y", 0.0, 0.0),
            ],
        );
        // Single vector value normalizes to 1.0 -> 0.6; graph items score 0
        assert_eq!(ranked[0].source_id(), "b");
        assert_eq!(ranked[1].source_id(), "a");
        assert_eq!(ranked[2].source_id(), "z");

        let mut tied = vec![
            ScoredItem::vector("v", "x", 0.5).into_scored(ScoreComponents::default(), 0.3),
            ScoredItem::graph("g", "y", 0.5, 0.5).into_scored(ScoreComponents::default(), 0.3),
        ];
        tied.sort_by(compare_ranked);
        assert_eq!(tied[0].kind(), SourceKind::Graph);
    }

    #[test]
    fn test_empty_batches() {
        assert!(scorer().score(vec![], vec![]).is_empty());
        let only_graph = scorer().score(vec![], vec![ScoredItem::graph("g", "f", 0.7, 0.2)]);
        // Lone item: both graph signals normalize to 1.0
        assert!((only_graph[0].fused_score() - 0.4).abs() < 1e-9);
    }
}
