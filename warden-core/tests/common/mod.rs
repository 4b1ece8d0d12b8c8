//! Shared fixtures for warden-core integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use warden_core::audit::{AuditChain, AuditSigner};
use warden_core::execution::{
    CircuitBreakerConfig, CircuitBreakerRegistry, ExecutionTracker, Executor, ExecutorOutcome,
    ResilientExecutor, RetryPolicy,
};
use warden_core::models::{Action, Environment, PolicySettings, RemediationRequest, Severity};
use warden_core::policy::PolicyEngine;
use warden_core::workflow::{GovernanceStore, RemediationWorkflow, WorkflowConfig};

/// Plays back scripted outcomes, then succeeds
pub struct ScriptedExecutor {
    script: Mutex<Vec<ExecutorOutcome>>,
    delay: Duration,
    pub calls: AtomicU32,
}

impl ScriptedExecutor {
    pub fn new(mut script: Vec<ExecutorOutcome>) -> Self {
        script.reverse();
        Self {
            script: Mutex::new(script),
            delay: Duration::ZERO,
            calls: AtomicU32::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Executor for ScriptedExecutor {
    async fn execute(&self, _action: &Action) -> ExecutorOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.script
            .lock()
            .unwrap()
            .pop()
            .unwrap_or_else(|| ExecutorOutcome::Success(serde_json::json!({"ok": true})))
    }
}

pub fn transient() -> ExecutorOutcome {
    ExecutorOutcome::TransientFailure("connection reset by firewall".to_string())
}

pub struct Fixture {
    pub signer: AuditSigner,
    pub breaker: CircuitBreakerConfig,
    pub retry: RetryPolicy,
    pub approval_ttl: chrono::Duration,
}

impl Default for Fixture {
    fn default() -> Self {
        Self {
            signer: AuditSigner::from_seed([7u8; 32]),
            breaker: CircuitBreakerConfig {
                failure_threshold: 5,
                failure_window: Duration::from_secs(60),
                recovery_timeout: Duration::from_secs(60),
                success_threshold: 1,
            },
            retry: RetryPolicy::immediate(1),
            approval_ttl: chrono::Duration::hours(1),
        }
    }
}

impl Fixture {
    /// Workflow persisting to `dir/governance.json`
    pub fn build(&self, dir: &Path, executor: Arc<dyn Executor>) -> RemediationWorkflow {
        let store = Arc::new(GovernanceStore::new(dir.join("governance.json")).unwrap());
        let audit = Arc::new(AuditChain::open(store.clone(), self.signer.clone()).unwrap());
        let breakers = Arc::new(CircuitBreakerRegistry::new(self.breaker.clone()));

        RemediationWorkflow::new(
            Arc::new(PolicyEngine::with_builtin_rules(&PolicySettings::default())),
            Arc::new(ExecutionTracker::new(chrono::Duration::hours(24))),
            ResilientExecutor::new(executor, breakers, self.retry.clone()),
            audit,
            store,
            WorkflowConfig {
                approval_ttl: self.approval_ttl,
            },
        )
    }
}

pub fn request(alert_id: &str, action_type: &str, target: &str) -> RemediationRequest {
    RemediationRequest {
        alert_id: alert_id.to_string(),
        action_type: action_type.to_string(),
        target: target.to_string(),
        severity: Severity::High,
        environment: Environment::Production,
        requested_by: "detector".to_string(),
        justification: None,
        parameters: Default::default(),
    }
}
