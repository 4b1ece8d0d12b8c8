//! Audit log data models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of event recorded in the audit chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    PlaybookCreated,
    PolicyDenied,
    PlaybookApproved,
    PlaybookRejected,
    PlaybookPromoted,
    PlaybookExpired,
    ExecutionStarted,
    ExecutionCompleted,
    ExecutionFailed,
    DryRunExecuted,
    DuplicateSkipped,
    CircuitRejected,
    CircuitOpened,
    CircuitHalfOpened,
    CircuitClosed,
    /// An audited transition could not be persisted afterwards
    StateWriteFailed,
}

impl AuditEventType {
    /// Stable snake_case name, identical to the serialized form
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventType::PlaybookCreated => "playbook_created",
            AuditEventType::PolicyDenied => "policy_denied",
            AuditEventType::PlaybookApproved => "playbook_approved",
            AuditEventType::PlaybookRejected => "playbook_rejected",
            AuditEventType::PlaybookPromoted => "playbook_promoted",
            AuditEventType::PlaybookExpired => "playbook_expired",
            AuditEventType::ExecutionStarted => "execution_started",
            AuditEventType::ExecutionCompleted => "execution_completed",
            AuditEventType::ExecutionFailed => "execution_failed",
            AuditEventType::DryRunExecuted => "dry_run_executed",
            AuditEventType::DuplicateSkipped => "duplicate_skipped",
            AuditEventType::CircuitRejected => "circuit_rejected",
            AuditEventType::CircuitOpened => "circuit_opened",
            AuditEventType::CircuitHalfOpened => "circuit_half_opened",
            AuditEventType::CircuitClosed => "circuit_closed",
            AuditEventType::StateWriteFailed => "state_write_failed",
        }
    }
}

impl fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AuditEventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.trim().to_lowercase()))
            .map_err(|_| format!("unknown audit event type '{}'", s))
    }
}

/// One append-only entry of the audit chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    /// Position in the chain, starting at 0
    pub sequence_no: u64,
    /// What happened
    pub event_type: AuditEventType,
    /// Who caused it
    pub actor: String,
    /// Event details
    pub payload: serde_json::Value,
    /// Hex SHA-256 of the canonical payload
    pub payload_hash: String,
    /// Hash of the previous entry; None only for the first entry
    pub prev_hash: Option<String>,
    /// Hex Ed25519 signature over every other field
    pub signature: String,
    /// When the entry was appended
    pub timestamp: DateTime<Utc>,
}

/// Filter applied when exporting the audit log
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<AuditEventType>,
}

impl AuditFilter {
    /// Whether an entry passes every configured criterion
    pub fn matches(&self, entry: &AuditLogEntry) -> bool {
        self.since.map_or(true, |since| entry.timestamp >= since)
            && self.until.map_or(true, |until| entry.timestamp < until)
            && self.actor.as_deref().map_or(true, |actor| entry.actor == actor)
            && self.event_type.map_or(true, |kind| entry.event_type == kind)
    }
}
