//! Core pipeline logic.
//!
//! This module contains:
//! - Retrieval: parallel vector + graph fetch
//! - Scoring: normalization, fusion and ranking
//! - Context: budgeted prompt payload
//! - Safety: prefilter, postfilter and escalation
//! - Provenance: answer-to-source attribution
//! - Orchestrator: the per-request state machine

pub mod context;
pub mod escalation;
pub mod orchestrator;
pub mod provenance;
pub mod retrieval;
pub mod safety;
pub mod scoring;
pub mod text;

// Re-export commonly used types
pub use context::ContextAssembler;
pub use escalation::{EscalationDispatcher, EscalationLog};
pub use orchestrator::{
    CancelHandle, CancelToken, Collaborators, Orchestrator, PipelineError, SessionContext,
};
pub use provenance::ProvenanceExtractor;
pub use retrieval::{HybridRetrievalCoordinator, RetrievalOutcome};
pub use safety::{CompiledLexicon, LexiconMatch, SafetyGate};
pub use scoring::HybridScorer;
