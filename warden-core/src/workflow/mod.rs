//! Playbook workflow: state machine, worker service and persistence

pub mod engine;
pub mod events;
pub mod persistence;
pub mod service;

pub use engine::{RemediationWorkflow, WorkflowConfig, CIRCUIT_BREAKER_ACTOR, POLICY_ENGINE_ACTOR};
pub use events::{DryRunReport, TransitionOutcome, ValidationCheck, WorkflowEvent};
pub use persistence::{GovernanceDocument, GovernanceStore};
pub use service::{RemediationService, ServiceConfig, ServiceStatus, WorkerStats};
