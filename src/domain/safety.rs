//! Safety verdicts and escalation events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which tier of the safety gate produced a verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyStage {
    Prefilter,
    Postfilter,
}

/// Outcome level, ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyLevel {
    Safe,
    Review,
    Critical,
}

impl SafetyLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            SafetyLevel::Safe => "safe",
            SafetyLevel::Review => "review",
            SafetyLevel::Critical => "critical",
        }
    }
}

/// Immutable result of one safety check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyVerdict {
    pub stage: SafetyStage,
    pub level: SafetyLevel,
    /// Trigger reasons in the order they were detected
    pub signals: Vec<String>,
    /// Risk score in [0, 1]
    pub risk: f64,
}

impl SafetyVerdict {
    pub fn new(stage: SafetyStage, level: SafetyLevel, signals: Vec<String>, risk: f64) -> Self {
        Self {
            stage,
            level,
            signals,
            // NaN carries no information; treat it as maximal risk
            risk: if risk.is_nan() { 1.0 } else { risk.clamp(0.0, 1.0) },
        }
    }

    pub fn is_critical(&self) -> bool {
        self.level == SafetyLevel::Critical
    }
}

/// Severity attached to an escalation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    High,
    Critical,
}

/// Delivery state of an escalation notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum DeliveryStatus {
    Pending,
    Sent { attempts: u32 },
    Failed { attempts: u32, error: String },
}

/// A request for human review raised by the safety gate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationEvent {
    /// Identifier in the form `ESC_<16 hex chars>`
    pub id: String,
    pub session_id: String,
    /// Correlation id of the request that raised the event
    pub correlation_id: Uuid,
    pub stage: SafetyStage,
    pub severity: Severity,
    pub reason: String,
    pub created_at: DateTime<Utc>,
    pub delivery: DeliveryStatus,
}

impl EscalationEvent {
    pub(crate) fn new(
        session_id: impl Into<String>,
        correlation_id: Uuid,
        stage: SafetyStage,
        severity: Severity,
        reason: impl Into<String>,
    ) -> Self {
        let hex = Uuid::new_v4().simple().to_string();
        Self {
            id: format!("ESC_{}", &hex[..16]),
            session_id: session_id.into(),
            correlation_id,
            stage,
            severity,
            reason: reason.into(),
            created_at: Utc::now(),
            delivery: DeliveryStatus::Pending,
        }
    }

    pub fn with_delivery(mut self, delivery: DeliveryStatus) -> Self {
        self.delivery = delivery;
        self
    }
}
