//! Knowledge-graph types returned by the graph store.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A node in the knowledge graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    /// Stable node identifier
    pub id: String,

    /// Display label (entity name)
    pub label: String,

    /// Free-text description of the entity, used as the fact text when present
    #[serde(default)]
    pub description: String,

    /// Relevance weight assigned by the store, expected in [0, 1]
    #[serde(default = "default_node_weight")]
    pub weight: f64,
}

fn default_node_weight() -> f64 {
    0.5
}

impl GraphNode {
    pub fn new(id: impl Into<String>, label: impl Into<String>, weight: f64) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            description: String::new(),
            weight,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// A directed, weighted relation between two nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphEdge {
    pub source: String,
    pub target: String,
    pub relation: RelationType,

    #[serde(default = "default_edge_weight")]
    pub weight: f64,

    /// Free-form attributes carried by the store (kept for extensibility)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

fn default_edge_weight() -> f64 {
    1.0
}

impl GraphEdge {
    pub fn new(
        source: impl Into<String>,
        target: impl Into<String>,
        relation: RelationType,
        weight: f64,
    ) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            relation,
            weight,
            metadata: BTreeMap::new(),
        }
    }

    /// The endpoint opposite `node_id`, if this edge touches it
    pub fn other_end(&self, node_id: &str) -> Option<&str> {
        if self.source == node_id {
            Some(&self.target)
        } else if self.target == node_id {
            Some(&self.source)
        } else {
            None
        }
    }
}

/// Relation types known at compile time, with a string fallback
///
/// Serialized as a plain snake_case string so stores can emit any label:
/// - `related_to`, `is_a`, `part_of`, `causes`, `mitigates`, `symptom_of`, `mentions`
/// - anything else becomes `Custom(label)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RelationType {
    RelatedTo,
    IsA,
    PartOf,
    Causes,
    Mitigates,
    SymptomOf,
    Mentions,
    Custom(String),
}

impl RelationType {
    pub fn as_str(&self) -> &str {
        match self {
            RelationType::RelatedTo => "related_to",
            RelationType::IsA => "is_a",
            RelationType::PartOf => "part_of",
            RelationType::Causes => "causes",
            RelationType::Mitigates => "mitigates",
            RelationType::SymptomOf => "symptom_of",
            RelationType::Mentions => "mentions",
            RelationType::Custom(label) => label,
        }
    }

    /// Human-readable phrase used when rendering a fact
    pub fn phrase(&self) -> String {
        self.as_str().replace('_', " ")
    }
}

impl From<String> for RelationType {
    fn from(value: String) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "related_to" => RelationType::RelatedTo,
            "is_a" => RelationType::IsA,
            "part_of" => RelationType::PartOf,
            "causes" => RelationType::Causes,
            "mitigates" => RelationType::Mitigates,
            "symptom_of" => RelationType::SymptomOf,
            "mentions" => RelationType::Mentions,
            _ => RelationType::Custom(value),
        }
    }
}

impl From<RelationType> for String {
    fn from(value: RelationType) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for RelationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Nodes and edges reachable from a set of seeds within a hop bound
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Subgraph {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

impl Subgraph {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: &str) -> Option<&GraphNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Render a node as a one-line fact.
    ///
    /// Uses the description when present, otherwise the strongest incident
    /// relation ("anxiety mitigates breathing exercises"), otherwise the label.
    pub fn fact_text(&self, node: &GraphNode) -> String {
        if !node.description.trim().is_empty() {
            return format!("{}: {}", node.label, node.description.trim());
        }

        let strongest = self
            .edges
            .iter()
            .filter(|e| e.source == node.id || e.target == node.id)
            .max_by(|a, b| {
                a.weight
                    .total_cmp(&b.weight)
                    .then_with(|| b.target.cmp(&a.target))
            });

        match strongest {
            Some(edge) => {
                let source = self.label_of(&edge.source);
                let target = self.label_of(&edge.target);
                format!("{} {} {}", source, edge.relation.phrase(), target)
            }
            None => node.label.clone(),
        }
    }

    fn label_of<'a>(&'a self, id: &'a str) -> &'a str {
        self.node(id).map(|n| n.label.as_str()).unwrap_or(id)
    }
}
