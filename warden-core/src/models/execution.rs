//! Execution ledger data models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Status of a tracked execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Claimed by a worker, executor call not finished
    InProgress,
    /// Executor reported success
    Succeeded,
    /// Executor reported failure
    Failed,
    /// Dry run; no executor call was made
    Simulated,
}

/// One entry of the idempotency ledger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    /// Unique execution identifier
    pub id: Uuid,
    /// Deterministic action fingerprint
    pub fingerprint: String,
    /// Playbook the execution belongs to
    pub playbook_id: Uuid,
    /// Current status
    pub status: ExecutionStatus,
    /// Executor output or failure description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// True when produced by a dry run
    #[serde(default)]
    pub simulated: bool,
    /// Executor attempts made, including retries
    #[serde(default)]
    pub attempts: u32,
    /// When the record was created
    pub recorded_at: DateTime<Utc>,
    /// After this instant an identical request is treated as fresh
    pub ttl_expiry: DateTime<Utc>,
}

impl ExecutionRecord {
    /// Whether the record still blocks identical requests at `now`
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        now < self.ttl_expiry
    }
}
