//! What the pipeline hands back to the API layer.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::item::SourceKind;
use super::safety::{EscalationEvent, SafetyLevel, SafetyVerdict};
use super::state::ModalityReport;

/// One attributed source for an answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvenanceRef {
    pub kind: SourceKind,
    pub source_id: String,
    /// Sentence of the source text that best matched
    pub excerpt: String,
    /// Fraction of the claim's terms found in the source, in [0, 1]
    pub overlap: f64,
}

/// Sources attributed to one sentence of the answer (possibly none)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimProvenance {
    pub claim: String,
    pub sources: Vec<ProvenanceRef>,
}

/// Final safety/provenance summary sent after the last token
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseSummary {
    pub correlation_id: Uuid,
    pub session_id: String,
    pub safety_level: SafetyLevel,
    pub prefilter: Option<SafetyVerdict>,
    pub postfilter: Option<SafetyVerdict>,
    pub escalated: bool,
    pub escalations: Vec<EscalationEvent>,
    /// Deduplicated sources, strongest first
    pub provenance: Vec<ProvenanceRef>,
    pub claims: Vec<ClaimProvenance>,
    pub modalities: ModalityReport,
    /// Neither retrieval modality produced context
    pub degraded: bool,
    /// The generated answer was replaced by the safe template
    pub substituted: bool,
    pub timings_us: BTreeMap<String, u64>,
}

/// Events of a streamed response, in order
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Token(String),
    /// Previously streamed text must be withdrawn and replaced
    Retracted { replacement: String },
    /// Generation failed after streaming began
    Error { message: String, retryable: bool },
    Done(Box<ResponseSummary>),
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum StreamError {
    #[error("stream interrupted: {message}")]
    Interrupted { message: String, retryable: bool },

    #[error("stream closed before the summary was sent")]
    Closed,
}

/// Receiving half of a response stream.
///
/// Dropping it cancels the remaining work and releases the generation
/// channel.
#[derive(Debug)]
pub struct ResponseStream {
    pub correlation_id: Uuid,
    events: mpsc::Receiver<StreamEvent>,
}

/// Fully drained response
#[derive(Debug, Clone, PartialEq)]
pub struct CollectedResponse {
    pub text: String,
    pub retracted: bool,
    pub summary: ResponseSummary,
}

impl ResponseStream {
    pub fn new(correlation_id: Uuid, events: mpsc::Receiver<StreamEvent>) -> Self {
        Self {
            correlation_id,
            events,
        }
    }

    pub async fn next(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }

    /// Drain the stream into the final visible text and summary
    pub async fn collect(mut self) -> Result<CollectedResponse, StreamError> {
        let mut text = String::new();
        let mut retracted = false;

        while let Some(event) = self.events.recv().await {
            match event {
                StreamEvent::Token(token) => text.push_str(&token),
                StreamEvent::Retracted { replacement } => {
                    text = replacement;
                    retracted = true;
                }
                StreamEvent::Error { message, retryable } => {
                    return Err(StreamError::Interrupted { message, retryable });
                }
                StreamEvent::Done(summary) => {
                    return Ok(CollectedResponse {
                        text,
                        retracted,
                        summary: *summary,
                    });
                }
            }
        }

        Err(StreamError::Closed)
    }
}

/// Immediate answer for a request stopped at Tier-1
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockedResponse {
    pub correlation_id: Uuid,
    pub message: String,
    pub verdict: SafetyVerdict,
    pub escalation: EscalationEvent,
    pub escalated: bool,
}

/// Result of `Orchestrator::run_pipeline`
#[derive(Debug)]
pub enum ResponseResult {
    Stream(ResponseStream),
    Blocked(BlockedResponse),
}

impl ResponseResult {
    pub fn is_blocked(&self) -> bool {
        matches!(self, ResponseResult::Blocked(_))
    }

    pub fn into_stream(self) -> Option<ResponseStream> {
        match self {
            ResponseResult::Stream(stream) => Some(stream),
            ResponseResult::Blocked(_) => None,
        }
    }

    pub fn into_blocked(self) -> Option<BlockedResponse> {
        match self {
            ResponseResult::Blocked(blocked) => Some(blocked),
            ResponseResult::Stream(_) => None,
        }
    }
}
