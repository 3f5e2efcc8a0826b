//! Out-of-band escalation delivery.
//!
//! The safety gate hands each new event to an `EscalationDispatcher`, which
//! delivers it on a spawned task with retry/backoff and records the final
//! outcome in an append-only JSONL audit log. Nothing here is awaited on the
//! response path.

use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use fs2::FileExt;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::adapters::EscalationNotifier;
use crate::config::RetryPolicy;
use crate::domain::{DeliveryStatus, EscalationEvent};

/// Delivers escalation events without blocking the caller
#[derive(Clone)]
pub struct EscalationDispatcher {
    notifier: Arc<dyn EscalationNotifier>,
    retry: RetryPolicy,
    audit_log: Option<Arc<EscalationLog>>,
    in_flight: Arc<Mutex<Vec<JoinHandle<EscalationEvent>>>>,
}

impl EscalationDispatcher {
    pub fn new(notifier: Arc<dyn EscalationNotifier>, retry: RetryPolicy) -> Self {
        Self {
            notifier,
            retry,
            audit_log: None,
            in_flight: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_audit_log(mut self, log: EscalationLog) -> Self {
        self.audit_log = Some(Arc::new(log));
        self
    }

    /// Start delivery on a background task and return immediately
    pub fn dispatch(&self, event: EscalationEvent) {
        let dispatcher = self.clone();
        let handle = tokio::spawn(async move { dispatcher.deliver(event).await });

        match self.in_flight.lock() {
            Ok(mut pending) => {
                pending.retain(|h| !h.is_finished());
                pending.push(handle);
            }
            // Poisoned: the task still runs, it just can't be drained
            Err(_) => warn!("Escalation tracker poisoned; delivery will not be awaited"),
        }
    }

    /// Wait for deliveries still in flight.
    ///
    /// Returns their events with the final delivery status, in dispatch
    /// order. Deliveries that had already finished when a later one was
    /// dispatched are only in the audit log.
    pub async fn drain(&self) -> Vec<EscalationEvent> {
        let handles = match self.in_flight.lock() {
            Ok(mut pending) => std::mem::take(&mut *pending),
            Err(_) => Vec::new(),
        };

        let mut delivered = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(event) => delivered.push(event),
                Err(e) => error!(error = %e, "Escalation delivery task panicked"),
            }
        }
        delivered
    }

    /// Deliver with retries, then append the outcome to the audit log
    pub async fn deliver(&self, event: EscalationEvent) -> EscalationEvent {
        let mut attempt = 0u32;

        let status = loop {
            attempt += 1;

            match self.notifier.notify(&event).await {
                Ok(()) => {
                    info!(
                        escalation_id = %event.id,
                        notifier = self.notifier.name(),
                        attempt,
                        "Escalation delivered"
                    );
                    break DeliveryStatus::Sent { attempts: attempt };
                }
                Err(e) if self.retry.should_retry(attempt) => {
                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!(
                        escalation_id = %event.id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Escalation delivery failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    error!(
                        escalation_id = %event.id,
                        attempt,
                        error = %e,
                        "Escalation delivery failed permanently"
                    );
                    break DeliveryStatus::Failed {
                        attempts: attempt,
                        error: e.to_string(),
                    };
                }
            }
        };

        let event = event.with_delivery(status);

        if let Some(log) = &self.audit_log {
            if let Err(e) = log.append(&event).await {
                error!(escalation_id = %event.id, error = %e, "Failed to write escalation audit log");
            }
        }

        event
    }
}

/// Append-only JSONL log of escalation outcomes.
///
/// Writers take an exclusive advisory lock so concurrent processes sharing
/// the file never interleave lines.
#[derive(Debug, Clone)]
pub struct EscalationLog {
    path: PathBuf,
}

impl EscalationLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append an event as one JSON line
    pub async fn append(&self, event: &EscalationEvent) -> Result<()> {
        let path = self.path.clone();
        let line = serde_json::to_string(event).context("Failed to serialize escalation")?;

        tokio::task::spawn_blocking(move || -> Result<()> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create audit log directory: {}", parent.display())
                })?;
            }

            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("Failed to open audit log: {}", path.display()))?;

            file.lock_exclusive()
                .context("Failed to lock audit log")?;
            let written = writeln!(file, "{}", line).and_then(|_| file.flush());
            FileExt::unlock(&file).context("Failed to unlock audit log")?;
            written.context("Failed to write escalation")?;

            Ok(())
        })
        .await
        .context("Audit log writer panicked")?
    }

    /// Read all events in order
    pub async fn replay(&self) -> Result<Vec<EscalationEvent>> {
        let path = self.path.clone();

        tokio::task::spawn_blocking(move || -> Result<Vec<EscalationEvent>> {
            if !path.exists() {
                return Ok(Vec::new());
            }

            let file = std::fs::File::open(&path)
                .with_context(|| format!("Failed to open audit log: {}", path.display()))?;
            file.lock_shared().context("Failed to lock audit log")?;

            let mut events = Vec::new();
            for line in BufReader::new(&file).lines() {
                let line = line.context("Failed to read audit log")?;
                if line.trim().is_empty() {
                    continue;
                }
                let event: EscalationEvent = serde_json::from_str(&line)
                    .with_context(|| format!("Failed to parse escalation: {}", line))?;
                events.push(event);
            }

            FileExt::unlock(&file).context("Failed to unlock audit log")?;
            Ok(events)
        })
        .await
        .context("Audit log reader panicked")?
    }
}
