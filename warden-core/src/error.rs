//! Remediation error taxonomy

use crate::models::{PlaybookStatus, Role, WorkflowTransition};
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by the governance layer
#[derive(Error, Debug)]
pub enum RemediationError {
    #[error("policy denied the action: {}", .reasons.join("; "))]
    PolicyViolation {
        reasons: Vec<String>,
        matched_rule_ids: Vec<String>,
    },

    #[error("playbook {playbook_id} requires approval: {}", .reasons.join("; "))]
    ApprovalRequired {
        playbook_id: Uuid,
        reasons: Vec<String>,
    },

    #[error("approval for playbook {playbook_id} expired at {expired_at}")]
    ApprovalExpired {
        playbook_id: Uuid,
        expired_at: DateTime<Utc>,
    },

    #[error("action already handled (fingerprint {fingerprint}, execution {execution_id})")]
    DuplicateAction {
        fingerprint: String,
        execution_id: Uuid,
    },

    #[error("circuit open for target {target}; retry after {retry_after_ms} ms")]
    CircuitOpenFailFast { target: String, retry_after_ms: u64 },

    #[error("transient failure on {target} after {attempts} attempt(s): {message}")]
    TransientExecutionFailure {
        target: String,
        attempts: u32,
        message: String,
    },

    #[error("permanent failure on {target}: {message}")]
    PermanentExecutionFailure { target: String, message: String },

    #[error("audit append failed: {0}")]
    AuditAppendFailure(String),

    #[error("action queue saturated ({strategy}, capacity {capacity})")]
    QueueSaturated { strategy: String, capacity: usize },

    #[error("{actor} with role {role} may not {transition}")]
    PermissionDenied {
        actor: String,
        role: Role,
        transition: WorkflowTransition,
    },

    #[error("{actor} created playbook {playbook_id} and cannot also decide on it")]
    SeparationOfDuties { actor: String, playbook_id: Uuid },

    #[error("cannot {transition} playbook {playbook_id} in status {from}")]
    InvalidTransition {
        playbook_id: Uuid,
        from: PlaybookStatus,
        transition: WorkflowTransition,
    },

    #[error("playbook {0} not found")]
    PlaybookNotFound(Uuid),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl RemediationError {
    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            RemediationError::PolicyViolation { .. } => "POLICY_VIOLATION",
            RemediationError::ApprovalRequired { .. } => "APPROVAL_REQUIRED",
            RemediationError::ApprovalExpired { .. } => "APPROVAL_EXPIRED",
            RemediationError::DuplicateAction { .. } => "DUPLICATE_ACTION",
            RemediationError::CircuitOpenFailFast { .. } => "CIRCUIT_OPEN",
            RemediationError::TransientExecutionFailure { .. } => "TRANSIENT_FAILURE",
            RemediationError::PermanentExecutionFailure { .. } => "PERMANENT_FAILURE",
            RemediationError::AuditAppendFailure(_) => "AUDIT_APPEND_FAILURE",
            RemediationError::QueueSaturated { .. } => "QUEUE_SATURATED",
            RemediationError::PermissionDenied { .. } => "PERMISSION_DENIED",
            RemediationError::SeparationOfDuties { .. } => "SEPARATION_OF_DUTIES",
            RemediationError::InvalidTransition { .. } => "INVALID_TRANSITION",
            RemediationError::PlaybookNotFound(_) => "PLAYBOOK_NOT_FOUND",
            RemediationError::Storage(_) => "STORAGE",
        }
    }

    /// Whether the caller may retry the same request later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RemediationError::TransientExecutionFailure { .. }
                | RemediationError::CircuitOpenFailFast { .. }
                | RemediationError::QueueSaturated { .. }
        )
    }
}

pub type RemediationResult<T> = std::result::Result<T, RemediationError>;
