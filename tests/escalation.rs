//! Escalation Audit Tests
//!
//! Delivery outcomes of escalations raised by the orchestrator, as recorded
//! in the JSONL audit log.

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use common::*;
use hybrid_rag::adapters::{AdapterError, EscalationNotifier};
use hybrid_rag::core::EscalationLog;
use hybrid_rag::domain::{DeliveryStatus, EscalationEvent, SafetyStage};
use hybrid_rag::{Collaborators, Orchestrator, SessionContext};
use tempfile::TempDir;

/// Fails every delivery
#[derive(Default)]
struct DownNotifier {
    attempts: AtomicU32,
}

#[async_trait]
impl EscalationNotifier for DownNotifier {
    fn name(&self) -> &str {
        "down"
    }

    async fn notify(&self, _event: &EscalationEvent) -> Result<(), AdapterError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(AdapterError::StoreUnavailable("reviewer queue offline".into()))
    }
}

fn answer() -> Arc<ScriptedGenerator> {
    Arc::new(ScriptedGenerator::new(&["Take a slow breath."]))
}

#[tokio::test]
async fn test_blocked_query_is_audited() {
    let temp = TempDir::new().unwrap();
    let log_path = temp.path().join("audit").join("escalations.jsonl");

    let harness = Harness::new(answer());
    let mut config = test_config();
    config.escalation.audit_log = Some(log_path.clone());
    let orchestrator = harness.orchestrator(config);

    let result = orchestrator
        .run_pipeline("I keep thinking about suicide", &SessionContext::new("s-audit"))
        .await
        .unwrap();
    let blocked = result.into_blocked().unwrap();

    orchestrator.drain_escalations().await;

    let events = EscalationLog::new(&log_path).replay().await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].id, blocked.escalation.id);
    assert_eq!(events[0].session_id, "s-audit");
    assert_eq!(events[0].stage, SafetyStage::Prefilter);
    assert_eq!(events[0].reason, "critical:suicide");
    assert_eq!(events[0].delivery, DeliveryStatus::Sent { attempts: 1 });
}

#[tokio::test]
async fn test_failed_delivery_is_retried_then_audited() {
    let temp = TempDir::new().unwrap();
    let log_path = temp.path().join("escalations.jsonl");

    let harness = Harness::new(answer());
    let notifier = Arc::new(DownNotifier::default());
    let collaborators = Collaborators {
        notifier: notifier.clone(),
        ..harness.collaborators()
    };
    let mut config = test_config();
    config.escalation.audit_log = Some(log_path.clone());
    let orchestrator = Orchestrator::new(Arc::new(config), collaborators).unwrap();

    // The request itself succeeds even though nobody can be notified
    let result = orchestrator
        .run_pipeline("I want to end my life", &SessionContext::new("s-down"))
        .await
        .unwrap();
    assert!(result.is_blocked());

    let delivered = orchestrator.drain_escalations().await;
    assert_eq!(delivered.len(), 1);
    assert!(matches!(
        delivered[0].delivery,
        DeliveryStatus::Failed { attempts: 3, ref error } if error.contains("reviewer queue offline")
    ));
    assert_eq!(notifier.attempts.load(Ordering::SeqCst), 3);

    let events = EscalationLog::new(&log_path).replay().await.unwrap();
    assert_eq!(events, delivered);
}

#[tokio::test]
async fn test_audit_log_accumulates_across_requests() {
    let temp = TempDir::new().unwrap();
    let log_path = temp.path().join("escalations.jsonl");

    let harness = Harness::new(answer());
    let mut config = test_config();
    config.escalation.audit_log = Some(log_path.clone());
    let orchestrator = harness.orchestrator(config);

    for (session, query) in [
        ("s-1", "I feel suicidal"),
        ("s-2", "how do I plan revision?"),
        ("s-3", "I was abused"),
    ] {
        orchestrator
            .run_pipeline(query, &SessionContext::new(session))
            .await
            .unwrap();
    }
    orchestrator.drain_escalations().await;

    let events = EscalationLog::new(&log_path).replay().await.unwrap();
    let mut sessions: Vec<_> = events.iter().map(|e| e.session_id.as_str()).collect();
    sessions.sort();
    assert_eq!(sessions, vec!["s-1", "s-3"]);
    assert!(events
        .iter()
        .all(|e| e.delivery == DeliveryStatus::Sent { attempts: 1 }));
}
