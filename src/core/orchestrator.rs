//! Pipeline orchestrator.
//!
//! Sequences one request through the stage machine:
//!
//! ```text
//! Received -> Prefiltered -> Retrieving -> Scored -> ContextAssembled
//!          -> Generating -> Postfiltered -> Streaming -> Done
//! ```
//!
//! with `Escalated` reachable after either safety stage and `Aborted` on
//! cancellation or generation failure. Each call owns its `PipelineState`;
//! nothing mutable is shared between requests.

use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, instrument, warn, Span};

use crate::adapters::{
    AdapterError, ContentClassifier, EmbeddingProvider, EntityRecognizer, EscalationNotifier,
    GenerationProvider, GraphStore, TokenReceiver, VectorStore,
};
use crate::config::{ConfigError, PipelineConfig, StreamPolicy};
use crate::domain::{
    BlockedResponse, EscalationEvent, InvalidTransition, PipelineStage, PipelineState, Prompt,
    ResponseResult, ResponseStream, ResponseSummary, SafetyLevel, SafetyVerdict, StreamEvent,
};

use super::context::ContextAssembler;
use super::escalation::{EscalationDispatcher, EscalationLog};
use super::provenance::ProvenanceExtractor;
use super::retrieval::HybridRetrievalCoordinator;
use super::safety::SafetyGate;
use super::scoring::HybridScorer;
use super::text::rewrite_query;

/// Buffered events between the pipeline and the response consumer
const EVENT_BUFFER: usize = 64;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("generation failed: {source}")]
    Generation {
        #[source]
        source: AdapterError,
        retryable: bool,
    },

    #[error("request cancelled")]
    Cancelled,

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl PipelineError {
    fn generation(source: AdapterError) -> Self {
        let retryable = !matches!(source, AdapterError::Provider(_));
        PipelineError::Generation { source, retryable }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, PipelineError::Generation { retryable: true, .. })
    }
}

/// Cancels the request its token was handed to
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

/// Observes cancellation of one request
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn pair() -> (CancelHandle, CancelToken) {
        let (tx, rx) = watch::channel(false);
        (CancelHandle { tx }, CancelToken { rx })
    }

    /// A token that is never cancelled
    pub fn none() -> CancelToken {
        let (_, token) = Self::pair();
        token
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancelled; pends forever if the handle is gone
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Caller-supplied context for one request
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub session_id: String,
    pub language: Option<String>,
    pub cancel: CancelToken,
}

impl SessionContext {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            language: None,
            cancel: CancelToken::none(),
        }
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// External capabilities the pipeline depends on
#[derive(Clone)]
pub struct Collaborators {
    pub vector_store: Arc<dyn VectorStore>,
    pub graph_store: Arc<dyn GraphStore>,
    pub embedder: Arc<dyn EmbeddingProvider>,
    pub recognizer: Arc<dyn EntityRecognizer>,
    pub generator: Arc<dyn GenerationProvider>,
    pub classifier: Arc<dyn ContentClassifier>,
    pub notifier: Arc<dyn EscalationNotifier>,
}

/// Main pipeline orchestrator
pub struct Orchestrator {
    config: Arc<PipelineConfig>,
    retrieval: HybridRetrievalCoordinator,
    scorer: HybridScorer,
    assembler: ContextAssembler,
    generator: Arc<dyn GenerationProvider>,
    finisher: Finisher,
}

/// What the tail of a request needs once it leaves `run_pipeline`
#[derive(Clone)]
struct Finisher {
    gate: SafetyGate,
    provenance: ProvenanceExtractor,
    config: Arc<PipelineConfig>,
}

/// Outcome of pulling one token from the generator
enum Pull {
    Token(String),
    End,
    Failed(PipelineError),
}

impl Orchestrator {
    /// Validate the configuration and wire the components
    pub fn new(config: Arc<PipelineConfig>, collaborators: Collaborators) -> Result<Self, ConfigError> {
        config.validate()?;

        let mut dispatcher = EscalationDispatcher::new(
            collaborators.notifier,
            config.escalation.retry.clone(),
        );
        if let Some(path) = &config.escalation.audit_log {
            dispatcher = dispatcher.with_audit_log(EscalationLog::new(path));
        }

        let gate = SafetyGate::new(config.clone(), collaborators.classifier, dispatcher)?;

        Ok(Self {
            retrieval: HybridRetrievalCoordinator::new(
                collaborators.vector_store,
                collaborators.graph_store,
                collaborators.embedder,
                collaborators.recognizer,
                config.retrieval.clone(),
            ),
            scorer: HybridScorer::new(config.scoring)?,
            assembler: ContextAssembler::new(config.context.clone()),
            generator: collaborators.generator,
            finisher: Finisher {
                gate,
                provenance: ProvenanceExtractor::default(),
                config: config.clone(),
            },
            config,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn safety_gate(&self) -> &SafetyGate {
        &self.finisher.gate
    }

    /// Wait for background escalation deliveries; call before shutdown
    pub async fn drain_escalations(&self) -> Vec<EscalationEvent> {
        self.finisher.gate.drain_escalations().await
    }

    /// Run one query end to end.
    ///
    /// Returns a blocked response when the prefilter escalates, otherwise a
    /// stream of tokens ending in a summary. Store failures degrade the
    /// context; only cancellation and generation failures are errors.
    #[instrument(
        skip(self, query, session),
        fields(session_id = %session.session_id, correlation_id = tracing::field::Empty)
    )]
    pub async fn run_pipeline(
        &self,
        query: &str,
        session: &SessionContext,
    ) -> Result<ResponseResult, PipelineError> {
        let mut state = PipelineState::new(query, session.session_id.clone());
        Span::current().record("correlation_id", tracing::field::display(state.correlation_id));
        info!(language = ?session.language, "Pipeline started");

        let cancel = &session.cancel;
        if cancel.is_cancelled() {
            return Err(abort(&mut state, PipelineError::Cancelled));
        }

        // Tier 1 on the raw query
        let started = Instant::now();
        let verdict = self.finisher.gate.prefilter(query);
        state.record_timing("prefilter", started.elapsed());
        state.prefilter = Some(verdict.clone());
        state.advance(PipelineStage::Prefiltered)?;

        if verdict.is_critical() {
            let escalation =
                self.finisher
                    .gate
                    .escalate(&state.session_id, state.correlation_id, &verdict);
            state.escalations.push(escalation.clone());
            state.advance(PipelineStage::Escalated)?;
            state.record_timing("total", state.elapsed());
            info!(escalation_id = %escalation.id, "Request blocked at prefilter");

            return Ok(ResponseResult::Blocked(BlockedResponse {
                correlation_id: state.correlation_id,
                message: self.finisher.gate.fallback_message().to_string(),
                verdict,
                escalation,
                escalated: true,
            }));
        }

        state.rewritten_query = Some(rewrite_query(
            query,
            self.config.generation.max_query_chars,
        ));

        // Retrieval, both modalities joined
        state.advance(PipelineStage::Retrieving)?;
        let started = Instant::now();
        let effective_query = state.effective_query().to_string();
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(abort(&mut state, PipelineError::Cancelled)),
            outcome = self.retrieval.retrieve(&effective_query) => outcome,
        };
        state.record_timing("retrieval", started.elapsed());
        state.record_timing("vector", outcome.vector_elapsed);
        state.record_timing("graph", outcome.graph_elapsed);
        state.query_embedding = outcome.query_embedding;
        state.seed_entities = outcome.seed_entities;
        state.vector_items = outcome.vector_items;
        state.graph_items = outcome.graph_items;
        state.modalities.vector = outcome.vector_status;
        state.modalities.graph = outcome.graph_status;

        if state.modalities.is_degraded() {
            warn!(
                vector = ?state.modalities.vector,
                graph = ?state.modalities.graph,
                "No retrieval modality succeeded, generating without context"
            );
        }

        let started = Instant::now();
        state.ranking = self
            .scorer
            .score(state.vector_items.clone(), state.graph_items.clone());
        state.record_timing("scoring", started.elapsed());
        state.advance(PipelineStage::Scored)?;

        let started = Instant::now();
        let context = self.assembler.assemble(&state.ranking);
        state.record_timing("context", started.elapsed());
        let prompt = Prompt::new(
            self.config.generation.system_prompt.clone(),
            &context,
            effective_query,
        )
        .with_language(session.language.clone());
        state.context = Some(context);
        state.advance(PipelineStage::ContextAssembled)?;

        // Generation
        state.advance(PipelineStage::Generating)?;
        let generation_started = Instant::now();
        let deadline = Deadline::after(self.config.generation.timeout_ms);
        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(PipelineError::Cancelled),
            res = tokio::time::timeout_at(deadline.at, self.generator.generate(&prompt)) => match res {
                Ok(Ok(rx)) => Ok(rx),
                Ok(Err(e)) => Err(PipelineError::generation(e)),
                Err(_) => Err(deadline.expired()),
            },
        };
        let mut tokens = match opened {
            Ok(rx) => rx,
            Err(e) => return Err(abort(&mut state, e)),
        };

        match self.config.safety.stream_policy {
            StreamPolicy::BufferAll => {
                let mut answer = Vec::new();
                loop {
                    match next_token(&mut tokens, deadline, cancel).await {
                        Pull::Token(t) => answer.push(t),
                        Pull::End => break,
                        Pull::Failed(e) => return Err(abort(&mut state, e)),
                    }
                }
                drop(tokens);
                state.record_timing("generation", generation_started.elapsed());

                let text = answer.concat();
                let prefilter_level = state.safety_level();
                let started = Instant::now();
                let verdict = self.finisher.gate.postfilter(&text, prefilter_level).await;
                state.record_timing("postfilter", started.elapsed());

                Ok(ResponseResult::Stream(
                    self.finisher.clone().emit_buffered(state, answer, verdict),
                ))
            }
            StreamPolicy::ClassifyPrefix { prefix_chars } => {
                let mut prefix = Vec::new();
                let mut prefix_len = 0usize;
                let mut finished = false;
                while prefix_len < prefix_chars {
                    match next_token(&mut tokens, deadline, cancel).await {
                        Pull::Token(t) => {
                            prefix_len += t.chars().count();
                            prefix.push(t);
                        }
                        Pull::End => {
                            finished = true;
                            break;
                        }
                        Pull::Failed(e) => return Err(abort(&mut state, e)),
                    }
                }

                if finished {
                    // Whole answer fit in the prefix; same as buffering it
                    drop(tokens);
                    state.record_timing("generation", generation_started.elapsed());
                    let text = prefix.concat();
                    let started = Instant::now();
                    let verdict = self
                        .finisher
                        .gate
                        .postfilter(&text, state.safety_level())
                        .await;
                    state.record_timing("postfilter", started.elapsed());
                    return Ok(ResponseResult::Stream(
                        self.finisher.clone().emit_buffered(state, prefix, verdict),
                    ));
                }

                let started = Instant::now();
                let verdict = self
                    .finisher
                    .gate
                    .postfilter(&prefix.concat(), state.safety_level())
                    .await;
                state.record_timing("postfilter_prefix", started.elapsed());

                if verdict.is_critical() {
                    // Stop generating before anything reaches the client
                    drop(tokens);
                    return Ok(ResponseResult::Stream(
                        self.finisher.clone().emit_buffered(state, prefix, verdict),
                    ));
                }

                Ok(ResponseResult::Stream(self.finisher.clone().emit_streaming(
                    state,
                    prefix,
                    verdict,
                    tokens,
                    deadline,
                    generation_started,
                    cancel.clone(),
                )))
            }
        }
    }
}

impl Finisher {
    /// Stream a fully classified answer (or its substitute)
    fn emit_buffered(
        self,
        mut state: PipelineState,
        answer: Vec<String>,
        verdict: SafetyVerdict,
    ) -> ResponseStream {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let stream = ResponseStream::new(state.correlation_id, rx);

        tokio::spawn(async move {
            let critical = verdict.is_critical();
            state.postfilter = Some(verdict.clone());
            if let Err(e) = state.advance(PipelineStage::Postfiltered) {
                error!(error = %e, "Unexpected pipeline transition");
                return;
            }

            if critical {
                self.raise(&mut state, &verdict);
                let _ = state.advance(PipelineStage::Escalated);
                let replacement = self.gate.substitution_message().to_string();
                let summary = self.summary(&mut state, None);
                if tx.send(StreamEvent::Token(replacement)).await.is_ok() {
                    let _ = tx.send(StreamEvent::Done(Box::new(summary))).await;
                }
                return;
            }

            let _ = state.advance(PipelineStage::Streaming);
            for token in &answer {
                if tx.send(StreamEvent::Token(token.clone())).await.is_err() {
                    debug!("Response stream dropped by consumer");
                    let _ = state.advance(PipelineStage::Aborted);
                    return;
                }
            }

            let text = answer.concat();
            let summary = self.summary(&mut state, Some(&text));
            let _ = state.advance(PipelineStage::Done);
            let _ = tx.send(StreamEvent::Done(Box::new(summary))).await;
        });

        stream
    }

    /// Forward tokens as they arrive after a safe prefix, re-checking the
    /// full answer at the end and retracting it on escalation
    #[allow(clippy::too_many_arguments)]
    fn emit_streaming(
        self,
        mut state: PipelineState,
        prefix: Vec<String>,
        prefix_verdict: SafetyVerdict,
        mut tokens: TokenReceiver,
        deadline: Deadline,
        generation_started: Instant,
        cancel: CancelToken,
    ) -> ResponseStream {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let stream = ResponseStream::new(state.correlation_id, rx);

        tokio::spawn(async move {
            state.postfilter = Some(prefix_verdict.clone());
            if state.advance(PipelineStage::Postfiltered).is_err()
                || state.advance(PipelineStage::Streaming).is_err()
            {
                error!("Unexpected pipeline transition");
                return;
            }

            let mut answer = String::new();
            for token in prefix {
                answer.push_str(&token);
                if tx.send(StreamEvent::Token(token)).await.is_err() {
                    let _ = state.advance(PipelineStage::Aborted);
                    return;
                }
            }

            loop {
                let pulled = tokio::select! {
                    biased;
                    _ = tx.closed() => {
                        debug!("Response stream dropped by consumer, cancelling generation");
                        let _ = state.advance(PipelineStage::Aborted);
                        return;
                    }
                    pulled = next_token(&mut tokens, deadline, &cancel) => pulled,
                };

                match pulled {
                    Pull::Token(t) => {
                        answer.push_str(&t);
                        if tx.send(StreamEvent::Token(t)).await.is_err() {
                            let _ = state.advance(PipelineStage::Aborted);
                            return;
                        }
                    }
                    Pull::End => break,
                    Pull::Failed(e) => {
                        warn!(error = %e, "Generation failed mid-stream");
                        let retryable = e.is_retryable();
                        let _ = state.advance(PipelineStage::Aborted);
                        let _ = tx
                            .send(StreamEvent::Error {
                                message: e.to_string(),
                                retryable,
                            })
                            .await;
                        return;
                    }
                }
            }
            drop(tokens);
            state.record_timing("generation", generation_started.elapsed());

            let started = Instant::now();
            let prefilter_level = state
                .prefilter
                .as_ref()
                .map_or(SafetyLevel::Safe, |v| v.level);
            let full = self.gate.postfilter(&answer, prefilter_level).await;
            state.record_timing("postfilter", started.elapsed());

            let verdict = if full.level >= prefix_verdict.level {
                full
            } else {
                prefix_verdict
            };
            state.postfilter = Some(verdict.clone());

            if verdict.is_critical() {
                self.raise(&mut state, &verdict);
                let _ = state.advance(PipelineStage::Escalated);
                warn!("Streamed answer retracted after full-answer check");
                let replacement = self.gate.substitution_message().to_string();
                let summary = self.summary(&mut state, None);
                if tx.send(StreamEvent::Retracted { replacement }).await.is_ok() {
                    let _ = tx.send(StreamEvent::Done(Box::new(summary))).await;
                }
                return;
            }

            let summary = self.summary(&mut state, Some(&answer));
            let _ = state.advance(PipelineStage::Done);
            let _ = tx.send(StreamEvent::Done(Box::new(summary))).await;
        });

        stream
    }

    fn raise(&self, state: &mut PipelineState, verdict: &SafetyVerdict) {
        let event = self
            .gate
            .escalate(&state.session_id, state.correlation_id, verdict);
        info!(escalation_id = %event.id, "Answer substituted after postfilter escalation");
        state.escalations.push(event);
    }

    /// Build the final summary; `answer` is `None` when it was substituted
    fn summary(&self, state: &mut PipelineState, answer: Option<&str>) -> ResponseSummary {
        let (claims, provenance) = match (answer, state.context.as_ref()) {
            (Some(text), Some(context)) => {
                let claims = self.provenance.extract(text, context);
                let provenance = ProvenanceExtractor::summarize(&claims);
                (claims, provenance)
            }
            _ => (Vec::new(), Vec::new()),
        };

        let total = state.elapsed();
        state.record_timing("total", total);
        let target = self.config.latency.end_to_end_target_ms;
        if total.as_millis() as u64 > target {
            warn!(
                elapsed_ms = total.as_millis() as u64,
                target_ms = target,
                "Request exceeded end-to-end latency target"
            );
        }

        info!(
            safety_level = state.safety_level().as_str(),
            escalated = state.escalated(),
            sources = provenance.len(),
            elapsed_ms = total.as_millis() as u64,
            "Pipeline completed"
        );

        ResponseSummary {
            correlation_id: state.correlation_id,
            session_id: state.session_id.clone(),
            safety_level: state.safety_level(),
            prefilter: state.prefilter.clone(),
            postfilter: state.postfilter.clone(),
            escalated: state.escalated(),
            escalations: state.escalations.clone(),
            provenance,
            claims,
            modalities: state.modalities.clone(),
            degraded: state.modalities.is_degraded(),
            substituted: answer.is_none(),
            timings_us: state.timings_us.clone(),
        }
    }
}

/// Whole-generation deadline
#[derive(Debug, Clone, Copy)]
struct Deadline {
    at: tokio::time::Instant,
    budget_ms: u64,
}

impl Deadline {
    fn after(budget_ms: u64) -> Self {
        Self {
            at: tokio::time::Instant::now() + std::time::Duration::from_millis(budget_ms),
            budget_ms,
        }
    }

    fn expired(&self) -> PipelineError {
        PipelineError::generation(AdapterError::Timeout {
            operation: "generation".to_string(),
            elapsed_ms: self.budget_ms,
        })
    }
}

/// Next token, honouring the generation deadline and cancellation
async fn next_token(tokens: &mut TokenReceiver, deadline: Deadline, cancel: &CancelToken) -> Pull {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Pull::Failed(PipelineError::Cancelled),
        res = tokio::time::timeout_at(deadline.at, tokens.recv()) => match res {
            Ok(Some(Ok(token))) => Pull::Token(token),
            Ok(Some(Err(e))) => Pull::Failed(PipelineError::generation(e)),
            Ok(None) => Pull::End,
            Err(_) => Pull::Failed(deadline.expired()),
        },
    }
}

fn abort(state: &mut PipelineState, error: PipelineError) -> PipelineError {
    if let Err(e) = state.advance(PipelineStage::Aborted) {
        debug!(error = %e, "Abort after terminal stage");
    }
    match &error {
        PipelineError::Cancelled => info!(stage = ?state.stage(), "Request cancelled"),
        other => error!(stage = ?state.stage(), error = %other, "Pipeline aborted"),
    }
    error
}
