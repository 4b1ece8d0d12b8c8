//! Events and outcomes returned by workflow transitions

use crate::execution::CircuitTransition;
use crate::models::{ExecutionRecord, Playbook, PlaybookStatus};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Something the caller may want to dispatch (notify, page, record metrics).
/// Transitions return these instead of invoking callbacks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkflowEvent {
    PlaybookCreated {
        playbook_id: Uuid,
        status: PlaybookStatus,
    },
    PlaybookApproved {
        playbook_id: Uuid,
        approved_by: String,
    },
    PlaybookRejected {
        playbook_id: Uuid,
        rejected_by: String,
    },
    PlaybookPromoted {
        playbook_id: Uuid,
        promoted_by: String,
    },
    PlaybookExpired {
        playbook_id: Uuid,
    },
    DryRunCompleted {
        playbook_id: Uuid,
        execution_id: Uuid,
        would_execute: bool,
    },
    ExecutionStarted {
        playbook_id: Uuid,
        execution_id: Uuid,
        fingerprint: String,
    },
    ExecutionCompleted {
        playbook_id: Uuid,
        execution_id: Uuid,
        attempts: u32,
    },
    ExecutionFailed {
        playbook_id: Uuid,
        execution_id: Uuid,
        code: String,
        reason: String,
        attempts: u32,
    },
    CircuitChanged(CircuitTransition),
}

/// One dry-run validation step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationCheck {
    pub name: String,
    pub passed: bool,
    pub detail: String,
}

/// What a real execution would have done
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DryRunReport {
    pub playbook_id: Uuid,
    pub checks: Vec<ValidationCheck>,
    pub estimated_impact: String,
    /// Every check passed
    pub would_execute: bool,
}

/// Result of a committed transition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionOutcome {
    pub playbook: Playbook,
    pub events: Vec<WorkflowEvent>,
    /// Set by execute and dry runs
    pub execution: Option<ExecutionRecord>,
    /// Set by dry runs
    pub dry_run: Option<DryRunReport>,
}

impl TransitionOutcome {
    pub fn new(playbook: Playbook, events: Vec<WorkflowEvent>) -> Self {
        Self {
            playbook,
            events,
            execution: None,
            dry_run: None,
        }
    }

    pub fn status(&self) -> PlaybookStatus {
        self.playbook.status
    }
}
