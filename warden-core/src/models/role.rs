//! Actors, roles and the role × transition permission matrix

use serde::{Deserialize, Serialize};
use std::fmt;

/// Role an actor holds when driving the workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Proposes remediations
    Analyst,
    /// Approves or rejects pending playbooks
    Approver,
    /// Runs approved playbooks
    Executor,
    /// Promotes dry runs and may do anything an approver or executor may
    Admin,
    /// The automated pipeline and background sweepers
    System,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Analyst => "analyst",
            Role::Approver => "approver",
            Role::Executor => "executor",
            Role::Admin => "admin",
            Role::System => "system",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "analyst" => Ok(Role::Analyst),
            "approver" => Ok(Role::Approver),
            "executor" => Ok(Role::Executor),
            "admin" => Ok(Role::Admin),
            "system" => Ok(Role::System),
            other => Err(format!("unknown role '{}'", other)),
        }
    }
}

/// Workflow transitions that require a permission check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowTransition {
    Create,
    Approve,
    Reject,
    Promote,
    Execute,
    DryRun,
    Expire,
}

impl fmt::Display for WorkflowTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkflowTransition::Create => "create",
            WorkflowTransition::Approve => "approve",
            WorkflowTransition::Reject => "reject",
            WorkflowTransition::Promote => "promote",
            WorkflowTransition::Execute => "execute",
            WorkflowTransition::DryRun => "dry_run",
            WorkflowTransition::Expire => "expire",
        };
        f.write_str(name)
    }
}

impl Role {
    /// The permission matrix. Separation of duties is enforced separately.
    pub fn permits(&self, transition: WorkflowTransition) -> bool {
        use WorkflowTransition::*;

        match self {
            Role::Analyst => matches!(transition, Create | DryRun),
            Role::Approver => matches!(transition, Approve | Reject),
            Role::Executor => matches!(transition, Execute | DryRun),
            Role::Admin => matches!(
                transition,
                Create | Approve | Reject | Promote | Execute | DryRun | Expire
            ),
            Role::System => matches!(transition, Create | Execute | DryRun | Expire),
        }
    }
}

/// Authenticated identity plus the role it acts under
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
    pub role: Role,
}

impl Actor {
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            role,
        }
    }

    /// The built-in identity used by workers and sweepers
    pub fn system() -> Self {
        Self::new("system", Role::System)
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.id, self.role)
    }
}
