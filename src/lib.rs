//! hybrid-rag - Hybrid retrieval and safety-gated generation
//!
//! Answers a user query by fusing two retrieval modalities, a vector store
//! of text chunks and a knowledge graph of entities, into one bounded
//! context for a generation provider. Every request passes a two-tier
//! safety gate.
//!
//! # Architecture
//!
//! One request moves through a fixed stage machine:
//! - Tier-1 prefilter: lexicon scan of the query; critical matches are
//!   answered with a fixed message and escalated without any retrieval
//! - Retrieval: vector search and graph expansion run concurrently, each
//!   under its own timeout; a failed modality degrades the context instead
//!   of failing the request
//! - Scoring: per-modality min-max normalization, weighted fusion and a
//!   deterministic ranking
//! - Context: deduplicated, capped and token-budgeted prompt payload
//! - Generation: streamed tokens under a deadline, with cancellation
//! - Tier-2 postfilter: classifier check of the answer, escalating and
//!   substituting a safe template when critical
//!
//! # Modules
//!
//! - `adapters`: Collaborator traits plus in-memory, offline and HTTP
//!   implementations
//! - `core`: Retrieval, scoring, context assembly, safety and the orchestrator
//! - `domain`: Data structures (ScoredItem, SafetyVerdict, PipelineState)
//! - `config`: YAML configuration with validation
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Answer a query over the demo corpus
//! hybrid-rag ask "I'm anxious about my exams" --corpus demos/corpus.yaml
//!
//! # Check the prefilter only
//! hybrid-rag prefilter "some text"
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;

// Re-export main types at crate root for convenience
pub use config::PipelineConfig;
pub use core::{Collaborators, Orchestrator, PipelineError, SessionContext};
pub use domain::{ResponseResult, ResponseStream, ResponseSummary, SafetyLevel, StreamEvent};
