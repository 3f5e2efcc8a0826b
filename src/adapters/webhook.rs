//! Webhook adapter for delivering escalations to a reviewer service.
//!
//! Each escalation is POSTed as JSON. Any non-2xx answer counts as a failed
//! attempt; the dispatcher decides whether to retry.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use super::{AdapterError, EscalationNotifier};
use crate::domain::{EscalationEvent, SafetyStage, Severity};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Escalation webhook client
pub struct WebhookNotifier {
    url: String,
    client: reqwest::Client,
}

/// Body sent to the webhook
#[derive(Debug, Serialize)]
struct EscalationPayload<'a> {
    id: &'a str,
    session_id: &'a str,
    correlation_id: String,
    stage: SafetyStage,
    severity: Severity,
    reason: &'a str,
    created_at: String,
}

impl<'a> From<&'a EscalationEvent> for EscalationPayload<'a> {
    fn from(event: &'a EscalationEvent) -> Self {
        Self {
            id: &event.id,
            session_id: &event.session_id,
            correlation_id: event.correlation_id.to_string(),
            stage: event.stage,
            severity: event.severity,
            reason: &event.reason,
            created_at: event.created_at.to_rfc3339(),
        }
    }
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Result<Self, AdapterError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| AdapterError::Provider(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            url: url.into(),
            client,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl EscalationNotifier for WebhookNotifier {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn notify(&self, event: &EscalationEvent) -> Result<(), AdapterError> {
        let response = self
            .client
            .post(&self.url)
            .json(&EscalationPayload::from(event))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AdapterError::Timeout {
                        operation: "escalation webhook".to_string(),
                        elapsed_ms: REQUEST_TIMEOUT.as_millis() as u64,
                    }
                } else {
                    AdapterError::StoreUnavailable(format!("escalation webhook unreachable: {}", e))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AdapterError::Provider(format!(
                "escalation webhook returned {}: {}",
                status,
                body.trim()
            )));
        }

        Ok(())
    }
}
