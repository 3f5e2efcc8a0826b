//! Retrieval candidates in the shape shared by both modalities.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Which retrieval modality produced an item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Vector,
    Graph,
}

impl SourceKind {
    /// Tie-break priority (lower wins): structured graph facts rank ahead of
    /// vector snippets when fused scores are equal.
    pub fn priority(self) -> u8 {
        match self {
            SourceKind::Graph => 0,
            SourceKind::Vector => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SourceKind::Vector => "vector",
            SourceKind::Graph => "graph",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pointer back to the stored record an item came from
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceRef {
    pub kind: SourceKind,
    pub source_id: String,
}

/// Raw or normalized ranking signals of one candidate.
///
/// `None` means the modality did not report that signal for this item;
/// it contributes nothing to the fused score.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreComponents {
    pub vector: Option<f64>,
    pub graph_path: Option<f64>,
    pub node_similarity: Option<f64>,
}

/// A retrieval candidate.
///
/// Built by the retrieval coordinator with its raw components, then given a
/// fused score exactly once by the scoring engine. Fields are read-only from
/// outside the crate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredItem {
    kind: SourceKind,
    source_id: String,
    text: String,
    origin_score: f64,
    raw: ScoreComponents,
    normalized: ScoreComponents,
    fused_score: Option<f64>,
    modalities: Vec<SourceKind>,
}

impl ScoredItem {
    /// A vector hit: origin score is the similarity reported by the store
    pub fn vector(source_id: impl Into<String>, text: impl Into<String>, similarity: f64) -> Self {
        Self {
            kind: SourceKind::Vector,
            source_id: source_id.into(),
            text: text.into(),
            origin_score: similarity,
            raw: ScoreComponents {
                vector: Some(similarity),
                ..Default::default()
            },
            normalized: ScoreComponents::default(),
            fused_score: None,
            modalities: vec![SourceKind::Vector],
        }
    }

    /// A graph node: origin score is its path weight from the seeds
    pub fn graph(
        source_id: impl Into<String>,
        fact: impl Into<String>,
        path_weight: f64,
        node_similarity: f64,
    ) -> Self {
        Self {
            kind: SourceKind::Graph,
            source_id: source_id.into(),
            text: fact.into(),
            origin_score: path_weight,
            raw: ScoreComponents {
                graph_path: Some(path_weight),
                node_similarity: Some(node_similarity),
                ..Default::default()
            },
            normalized: ScoreComponents::default(),
            fused_score: None,
            modalities: vec![SourceKind::Graph],
        }
    }

    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn origin_score(&self) -> f64 {
        self.origin_score
    }

    pub fn raw(&self) -> &ScoreComponents {
        &self.raw
    }

    pub fn normalized(&self) -> &ScoreComponents {
        &self.normalized
    }

    /// Fused score, 0.0 until the scoring engine has run
    pub fn fused_score(&self) -> f64 {
        self.fused_score.unwrap_or(0.0)
    }

    pub fn is_scored(&self) -> bool {
        self.fused_score.is_some()
    }

    /// Modalities that reported this source (two entries for merged items)
    pub fn modalities(&self) -> &[SourceKind] {
        &self.modalities
    }

    pub fn is_merged(&self) -> bool {
        self.modalities.len() > 1
    }

    pub fn provenance(&self) -> SourceRef {
        SourceRef {
            kind: self.kind,
            source_id: self.source_id.clone(),
        }
    }

    /// Fold another modality's raw signals into this item (same source id)
    pub(crate) fn absorb(&mut self, other: &ScoredItem) {
        self.raw.vector = self.raw.vector.or(other.raw.vector);
        self.raw.graph_path = self.raw.graph_path.or(other.raw.graph_path);
        self.raw.node_similarity = self.raw.node_similarity.or(other.raw.node_similarity);
        for kind in &other.modalities {
            if !self.modalities.contains(kind) {
                self.modalities.push(*kind);
            }
        }
        self.modalities.sort();
    }

    pub(crate) fn into_scored(mut self, normalized: ScoreComponents, fused: f64) -> Self {
        self.normalized = normalized;
        self.fused_score = Some(fused);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_graph_outranks_vector_on_priority() {
        assert!(SourceKind::Graph.priority() < SourceKind::Vector.priority());
    }

    #[test]
    fn test_absorb_merges_components_and_modalities() {
        let mut chunk = ScoredItem::vector("c1", "chunk text", 0.8);
        let node = ScoredItem::graph("c1", "fact", 0.6, 0.3);
        chunk.absorb(&node);

        assert_eq!(chunk.kind(), SourceKind::Vector);
        assert_eq!(chunk.raw().vector, Some(0.8));
        assert_eq!(chunk.raw().graph_path, Some(0.6));
        assert_eq!(chunk.raw().node_similarity, Some(0.3));
        assert_eq!(chunk.modalities(), &[SourceKind::Vector, SourceKind::Graph]);
        assert!(chunk.is_merged());
        assert!(!chunk.is_scored());
    }
}
