//! Command-line interface for hybrid-rag.
//!
//! Provides commands for answering a query over a local corpus, checking
//! the safety prefilter, showing the resolved configuration and reading
//! the escalation audit log.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use uuid::Uuid;

use crate::adapters::{
    Corpus, EmbeddingProvider, EscalationNotifier, ExtractiveGenerator, GenerationProvider,
    HashingEmbedder, InMemoryGraphStore, InMemoryVectorStore, KeywordEntityRecognizer,
    LogNotifier, OpenAiClient, PatternClassifier, WebhookNotifier,
};
use crate::config::{self, PipelineConfig};
use crate::core::{
    CancelToken, Collaborators, EscalationDispatcher, EscalationLog, Orchestrator, SafetyGate,
    SessionContext,
};
use crate::domain::{DeliveryStatus, ResponseResult, ResponseSummary, SafetyLevel, StreamEvent};

/// hybrid-rag - vector + knowledge-graph retrieval with safety gating
#[derive(Parser, Debug)]
#[command(name = "hybrid-rag")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file (default: discovered .hybrid-rag/config.yaml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Answer a query over a corpus
    Ask {
        /// The question
        query: String,

        /// Corpus YAML with chunks, nodes and edges
        #[arg(long, default_value = "demos/corpus.yaml")]
        corpus: PathBuf,

        /// Use the OpenAI-compatible API for embeddings and generation
        #[arg(long)]
        openai: bool,

        /// Session id (random if not given)
        #[arg(short, long)]
        session: Option<String>,

        /// Language the answer should be written in
        #[arg(long)]
        language: Option<String>,

        /// Print the response summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run only the Tier-1 prefilter on some text
    Prefilter {
        /// Text to check
        text: String,
    },

    /// Show resolved configuration
    Config,

    /// List escalations from the audit log
    Escalations {
        /// Maximum number of entries to show (most recent last)
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        let loaded = config::load(self.config.as_deref())?;
        if let Some(source) = &loaded.source {
            tracing::debug!(config = %source.display(), "Loaded configuration");
        }
        let cfg = loaded.config;

        match self.command {
            Commands::Ask {
                query,
                corpus,
                openai,
                session,
                language,
                json,
            } => ask(cfg, &query, &corpus, openai, session, language, json).await,
            Commands::Prefilter { text } => prefilter(cfg, &text),
            Commands::Config => show_config(&cfg, loaded.source.as_deref()),
            Commands::Escalations { limit } => list_escalations(&cfg, limit).await,
        }
    }
}

/// Build the collaborators for a local corpus
async fn collaborators(
    cfg: &PipelineConfig,
    corpus: &Corpus,
    openai: bool,
) -> Result<Collaborators> {
    let embedder: Arc<dyn EmbeddingProvider>;
    let generator: Arc<dyn GenerationProvider>;
    if openai {
        let client = Arc::new(OpenAiClient::from_env(cfg.openai.clone())?);
        embedder = client.clone();
        generator = client;
    } else {
        embedder = Arc::new(HashingEmbedder::default());
        generator = Arc::new(ExtractiveGenerator::default());
    }

    let vector_store = InMemoryVectorStore::index(&corpus.chunks, embedder.as_ref())
        .await
        .context("Failed to index corpus chunks")?;

    let notifier: Arc<dyn EscalationNotifier> = match &cfg.escalation.webhook_url {
        Some(url) => Arc::new(WebhookNotifier::new(url.clone())?),
        None => Arc::new(LogNotifier),
    };

    Ok(Collaborators {
        vector_store: Arc::new(vector_store),
        graph_store: Arc::new(InMemoryGraphStore::from_corpus(corpus)),
        embedder,
        recognizer: Arc::new(KeywordEntityRecognizer::new(corpus.labels())),
        generator,
        classifier: Arc::new(PatternClassifier::new()?),
        notifier,
    })
}

/// Answer one query, streaming tokens to stdout
async fn ask(
    cfg: PipelineConfig,
    query: &str,
    corpus_path: &Path,
    openai: bool,
    session: Option<String>,
    language: Option<String>,
    json: bool,
) -> Result<()> {
    if query.trim().is_empty() {
        anyhow::bail!("Query is empty");
    }

    let corpus = Corpus::load(corpus_path).await?;
    let collaborators = collaborators(&cfg, &corpus, openai).await?;
    let orchestrator = Orchestrator::new(Arc::new(cfg), collaborators)?;

    let (cancel, token) = CancelToken::pair();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let session_id = session.unwrap_or_else(|| Uuid::new_v4().to_string());
    let mut session = SessionContext::new(session_id).with_cancel(token);
    if let Some(language) = language {
        session = session.with_language(language);
    }

    let outcome = orchestrator.run_pipeline(query, &session).await;

    let exit_code = match outcome {
        Ok(ResponseResult::Blocked(blocked)) => {
            println!("{}", blocked.message);
            eprintln!(
                "\n[Request {} blocked: {}; escalation {}]",
                blocked.correlation_id,
                blocked.verdict.signals.join(", "),
                blocked.escalation.id
            );
            0
        }
        Ok(ResponseResult::Stream(mut stream)) => {
            let mut stdout = std::io::stdout();
            let mut code = 1;
            while let Some(event) = stream.next().await {
                match event {
                    StreamEvent::Token(token) => {
                        print!("{}", token);
                        stdout.flush().context("Failed to write to stdout")?;
                    }
                    StreamEvent::Retracted { replacement } => {
                        eprintln!("\n[Previous answer withdrawn]");
                        print!("{}", replacement);
                    }
                    StreamEvent::Error { message, retryable } => {
                        eprintln!(
                            "\n[Generation failed{}: {}]",
                            if retryable { " (retryable)" } else { "" },
                            message
                        );
                    }
                    StreamEvent::Done(summary) => {
                        println!();
                        print_summary(&summary, json)?;
                        code = 0;
                    }
                }
            }
            code
        }
        Err(e) => {
            eprintln!(
                "[Request failed{}: {}]",
                if e.is_retryable() { " (retryable)" } else { "" },
                e
            );
            1
        }
    };

    for event in orchestrator.drain_escalations().await {
        match &event.delivery {
            DeliveryStatus::Sent { attempts } => {
                eprintln!("[Escalation {} delivered after {} attempt(s)]", event.id, attempts)
            }
            DeliveryStatus::Failed { attempts, error } => eprintln!(
                "[Escalation {} undelivered after {} attempt(s): {}]",
                event.id, attempts, error
            ),
            DeliveryStatus::Pending => {}
        }
    }

    if exit_code != 0 {
        std::process::exit(exit_code);
    }
    Ok(())
}

fn print_summary(summary: &ResponseSummary, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(summary)?);
        return Ok(());
    }

    eprintln!();
    eprintln!("Safety:     {}", summary.safety_level.as_str());
    if summary.escalated {
        eprintln!("Escalated:  {} event(s)", summary.escalations.len());
    }
    if summary.substituted {
        eprintln!("Answer replaced with the safe template");
    }
    eprintln!(
        "Retrieval:  vector {:?}, graph {:?}{}",
        summary.modalities.vector,
        summary.modalities.graph,
        if summary.degraded { " (degraded)" } else { "" }
    );
    if !summary.provenance.is_empty() {
        eprintln!("Sources:");
        for source in &summary.provenance {
            eprintln!(
                "  [{}] {} ({:.0}%): {}",
                source.kind,
                source.source_id,
                source.overlap * 100.0,
                source.excerpt
            );
        }
    }
    if let Some(total) = summary.timings_us.get("total") {
        eprintln!("Total:      {:.1}ms", *total as f64 / 1000.0);
    }
    Ok(())
}

/// Check text against the lexicon
fn prefilter(cfg: PipelineConfig, text: &str) -> Result<()> {
    let dispatcher = EscalationDispatcher::new(Arc::new(LogNotifier), cfg.escalation.retry.clone());
    let gate = SafetyGate::new(Arc::new(cfg), Arc::new(PatternClassifier::new()?), dispatcher)?;

    let verdict = gate.prefilter(text);
    println!("Level:   {}", verdict.level.as_str());
    println!("Risk:    {:.2}", verdict.risk);
    if verdict.signals.is_empty() {
        println!("Signals: (none)");
    } else {
        println!("Signals: {}", verdict.signals.join(", "));
    }
    if verdict.level == SafetyLevel::Critical {
        println!("\nThis request would be blocked with:\n{}", gate.fallback_message());
    }
    Ok(())
}

fn show_config(cfg: &PipelineConfig, source: Option<&Path>) -> Result<()> {
    println!(
        "# Config file: {}",
        source
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    print!("{}", serde_yaml::to_string(cfg).context("Failed to render configuration")?);
    Ok(())
}

/// Show the tail of the escalation audit log
async fn list_escalations(cfg: &PipelineConfig, limit: usize) -> Result<()> {
    let Some(path) = &cfg.escalation.audit_log else {
        anyhow::bail!("No audit log configured. Set escalation.audit_log in the config file");
    };

    let events = EscalationLog::new(path).replay().await?;
    if events.is_empty() {
        println!("No escalations recorded");
        return Ok(());
    }

    println!(
        "{:<22} {:<26} {:<11} {:<9} {:<10} REASON",
        "ID", "CREATED", "STAGE", "SEVERITY", "DELIVERY"
    );
    println!("{}", "-".repeat(100));

    let skip = events.len().saturating_sub(limit);
    for event in events.iter().skip(skip) {
        let delivery = match &event.delivery {
            DeliveryStatus::Pending => "pending".to_string(),
            DeliveryStatus::Sent { .. } => "sent".to_string(),
            DeliveryStatus::Failed { .. } => "failed".to_string(),
        };
        println!(
            "{:<22} {:<26} {:<11} {:<9} {:<10} {}",
            event.id,
            event.created_at.format("%Y-%m-%d %H:%M:%S UTC"),
            format!("{:?}", event.stage).to_lowercase(),
            format!("{:?}", event.severity).to_lowercase(),
            delivery,
            event.reason
        );
    }

    Ok(())
}
