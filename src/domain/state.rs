//! Per-request pipeline state and its stage machine.
//!
//! A `PipelineState` is created by one `Orchestrator::run_pipeline` call,
//! threaded by value/`&mut` through every stage, and dropped when the
//! response has been fully streamed or the request aborts.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::context::AssembledContext;
use super::item::ScoredItem;
use super::safety::{EscalationEvent, SafetyLevel, SafetyVerdict};

/// Stages of a single request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Received,
    Prefiltered,
    Retrieving,
    Scored,
    ContextAssembled,
    Generating,
    Postfiltered,
    Streaming,
    Done,
    Escalated,
    Aborted,
}

impl PipelineStage {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PipelineStage::Done | PipelineStage::Escalated | PipelineStage::Aborted
        )
    }

    /// Whether `self -> next` is a legal transition
    pub fn can_advance_to(self, next: PipelineStage) -> bool {
        use PipelineStage::*;

        if self.is_terminal() {
            return false;
        }
        if next == Aborted {
            return true;
        }

        matches!(
            (self, next),
            (Received, Prefiltered)
                | (Prefiltered, Retrieving)
                | (Prefiltered, Escalated)
                | (Retrieving, Scored)
                | (Scored, ContextAssembled)
                | (ContextAssembled, Generating)
                | (Generating, Postfiltered)
                | (Postfiltered, Streaming)
                | (Postfiltered, Escalated)
                | (Streaming, Done)
                | (Streaming, Escalated)
        )
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid pipeline transition: {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub from: PipelineStage,
    pub to: PipelineStage,
}

/// Outcome of one retrieval modality for a request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum ModalityStatus {
    /// Not run yet
    Pending,
    Ok { items: usize },
    Failed { reason: String },
    TimedOut { after_ms: u64 },
    /// Nothing to fetch (e.g. no seed entities recognized)
    Skipped { reason: String },
}

impl ModalityStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, ModalityStatus::Ok { .. })
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            ModalityStatus::Failed { .. } | ModalityStatus::TimedOut { .. }
        )
    }
}

/// Status of both modalities, reported in the response summary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModalityReport {
    pub vector: ModalityStatus,
    pub graph: ModalityStatus,
}

impl ModalityReport {
    /// No modality produced results
    pub fn is_degraded(&self) -> bool {
        !self.vector.is_ok() && !self.graph.is_ok()
    }
}

/// Mutable record of one request
#[derive(Debug, Clone)]
pub struct PipelineState {
    pub correlation_id: Uuid,
    pub session_id: String,
    stage: PipelineStage,

    pub original_query: String,
    pub rewritten_query: Option<String>,
    pub query_embedding: Option<Vec<f32>>,
    pub seed_entities: Vec<String>,

    pub vector_items: Vec<ScoredItem>,
    pub graph_items: Vec<ScoredItem>,
    pub ranking: Vec<ScoredItem>,
    pub context: Option<AssembledContext>,

    pub prefilter: Option<SafetyVerdict>,
    pub postfilter: Option<SafetyVerdict>,
    pub escalations: Vec<EscalationEvent>,

    pub modalities: ModalityReport,

    /// Stage name -> elapsed microseconds
    pub timings_us: BTreeMap<String, u64>,
    started_at: Instant,
}

impl PipelineState {
    pub fn new(original_query: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            correlation_id: Uuid::new_v4(),
            session_id: session_id.into(),
            stage: PipelineStage::Received,
            original_query: original_query.into(),
            rewritten_query: None,
            query_embedding: None,
            seed_entities: Vec::new(),
            vector_items: Vec::new(),
            graph_items: Vec::new(),
            ranking: Vec::new(),
            context: None,
            prefilter: None,
            postfilter: None,
            escalations: Vec::new(),
            modalities: ModalityReport {
                vector: ModalityStatus::Pending,
                graph: ModalityStatus::Pending,
            },
            timings_us: BTreeMap::new(),
            started_at: Instant::now(),
        }
    }

    pub fn stage(&self) -> PipelineStage {
        self.stage
    }

    /// Move to the next stage, rejecting illegal transitions.
    ///
    /// Entering `Generating` additionally requires a non-critical prefilter
    /// verdict.
    pub fn advance(&mut self, next: PipelineStage) -> Result<(), InvalidTransition> {
        let blocked_generation = next == PipelineStage::Generating
            && self.prefilter.as_ref().map_or(true, |v| v.is_critical());

        if !self.stage.can_advance_to(next) || blocked_generation {
            return Err(InvalidTransition {
                from: self.stage,
                to: next,
            });
        }
        self.stage = next;
        Ok(())
    }

    pub fn record_timing(&mut self, stage: &str, elapsed: Duration) {
        self.timings_us
            .insert(stage.to_string(), elapsed.as_micros() as u64);
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn escalated(&self) -> bool {
        !self.escalations.is_empty()
    }

    /// Query used for retrieval and generation
    pub fn effective_query(&self) -> &str {
        self.rewritten_query
            .as_deref()
            .unwrap_or(&self.original_query)
    }

    /// Highest level reported by either safety stage
    pub fn safety_level(&self) -> SafetyLevel {
        [self.prefilter.as_ref(), self.postfilter.as_ref()]
            .into_iter()
            .flatten()
            .map(|v| v.level)
            .max()
            .unwrap_or(SafetyLevel::Safe)
    }
}
