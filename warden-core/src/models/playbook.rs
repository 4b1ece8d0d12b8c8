//! Playbook and approval data models

use crate::models::action::{Action, Environment, Severity};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Lifecycle status of a playbook
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybookStatus {
    /// Simulation only; terminal unless promoted
    DryRun,
    /// Waiting for an approver
    PendingApproval,
    /// Cleared to execute until `expires_at`
    Approved,
    /// Turned down by an approver
    Rejected,
    /// Executor call in flight
    Executing,
    /// Executor reported success
    Completed,
    /// Executor reported failure, or retries were exhausted
    Failed,
    /// Approval lapsed before execution
    Expired,
}

impl PlaybookStatus {
    /// Whether no further transition can leave this status
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PlaybookStatus::Rejected
                | PlaybookStatus::Completed
                | PlaybookStatus::Failed
                | PlaybookStatus::Expired
        )
    }
}

impl fmt::Display for PlaybookStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PlaybookStatus::DryRun => "DRY_RUN",
            PlaybookStatus::PendingApproval => "PENDING_APPROVAL",
            PlaybookStatus::Approved => "APPROVED",
            PlaybookStatus::Rejected => "REJECTED",
            PlaybookStatus::Executing => "EXECUTING",
            PlaybookStatus::Completed => "COMPLETED",
            PlaybookStatus::Failed => "FAILED",
            PlaybookStatus::Expired => "EXPIRED",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for PlaybookStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "dry_run" => Ok(PlaybookStatus::DryRun),
            "pending_approval" | "pending" => Ok(PlaybookStatus::PendingApproval),
            "approved" => Ok(PlaybookStatus::Approved),
            "rejected" => Ok(PlaybookStatus::Rejected),
            "executing" => Ok(PlaybookStatus::Executing),
            "completed" => Ok(PlaybookStatus::Completed),
            "failed" => Ok(PlaybookStatus::Failed),
            "expired" => Ok(PlaybookStatus::Expired),
            other => Err(format!("unknown playbook status '{}'", other)),
        }
    }
}

/// A proposed remediation plus its governance metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Playbook {
    /// Unique playbook identifier
    pub id: Uuid,
    /// Alert that produced the proposal
    pub alert_id: String,
    /// The governed action
    pub action: Action,
    /// Normalized target, duplicated for querying
    pub target: String,
    /// Why the action is needed
    pub justification: String,
    /// Severity of the originating alert
    pub severity: Severity,
    /// Environment of the originating alert
    pub environment: Environment,
    /// Current lifecycle status
    pub status: PlaybookStatus,
    /// Reasons reported by the policy engine at creation
    #[serde(default)]
    pub policy_reasons: Vec<String>,
    /// Identity that created the playbook
    pub created_by: String,
    /// Person or detector that asked for the action
    #[serde(default)]
    pub requested_by: String,
    /// Deployment signature over the governed fields
    pub signature: String,
    /// When the playbook was created
    pub created_at: DateTime<Utc>,
    /// When the playbook last changed status
    pub updated_at: DateTime<Utc>,
    /// Identity that approved the playbook
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_by: Option<String>,
    /// Deadline for execution once approved
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Failure or rejection reason
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    /// Bumped by the store on every write; stale writers are refused
    #[serde(default)]
    pub revision: u64,
}

impl Playbook {
    /// Whether the approval window has lapsed at `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|deadline| now >= deadline)
    }

    /// Whether `identity` proposed this playbook, either as creator or requester.
    /// Such an identity may not approve, reject or execute it.
    pub fn is_originator(&self, identity: &str) -> bool {
        identity == self.created_by
            || (!self.requested_by.is_empty() && identity == self.requested_by)
    }

    /// Upstream requester, falling back to the creator for older records
    pub fn requester(&self) -> &str {
        if self.requested_by.is_empty() {
            &self.created_by
        } else {
            &self.requested_by
        }
    }

    /// Bytes covered by the playbook signature
    pub fn signing_payload(&self) -> Vec<u8> {
        serde_json::json!({
            "id": self.id,
            "alert_id": self.alert_id,
            "action": self.action,
            "justification": self.justification,
            "created_by": self.created_by,
            "requested_by": self.requested_by,
            "created_at": self.created_at,
        })
        .to_string()
        .into_bytes()
    }
}

/// Decision recorded on an approval
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approved,
    Rejected,
}

/// Approval record, kept alongside the playbook it governs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Approval {
    /// Unique approval identifier
    pub id: Uuid,
    /// Playbook the decision applies to
    pub playbook_id: Uuid,
    /// Approve or reject
    pub decision: ApprovalDecision,
    /// Approver identity
    pub decided_by: String,
    /// Deployment signature over the decision
    pub signature: String,
    /// When the decision was made
    pub decided_at: DateTime<Utc>,
    /// How long an approval stays valid
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Optional approver comment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl Approval {
    /// Bytes covered by the approval signature
    pub fn signing_payload(&self) -> Vec<u8> {
        serde_json::json!({
            "id": self.id,
            "playbook_id": self.playbook_id,
            "decision": self.decision,
            "decided_by": self.decided_by,
            "decided_at": self.decided_at,
            "expires_at": self.expires_at,
        })
        .to_string()
        .into_bytes()
    }
}
