//! Domain types for the hybrid retrieval pipeline.
//!
//! This module contains the core data structures:
//! - Graph: nodes, edges and subgraphs from the graph store
//! - Item: scored retrieval candidates
//! - Context: the budgeted prompt payload
//! - Safety: verdicts and escalation events
//! - State: per-request pipeline state and stage machine
//! - Response: streamed results and summaries

pub mod context;
pub mod graph;
pub mod item;
pub mod response;
pub mod safety;
pub mod state;

// Re-export commonly used types
pub use context::{AssembledContext, ContextItem, ContextRole, Prompt};
pub use graph::{GraphEdge, GraphNode, RelationType, Subgraph};
pub use item::{ScoreComponents, ScoredItem, SourceKind, SourceRef};
pub use response::{
    BlockedResponse, ClaimProvenance, CollectedResponse, ProvenanceRef, ResponseResult,
    ResponseStream, ResponseSummary, StreamError, StreamEvent,
};
pub use safety::{DeliveryStatus, EscalationEvent, SafetyLevel, SafetyStage, SafetyVerdict, Severity};
pub use state::{InvalidTransition, ModalityReport, ModalityStatus, PipelineStage, PipelineState};
