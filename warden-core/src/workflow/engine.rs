//! Playbook lifecycle state machine
//!
//! Every transition checks the actor's role, appends an audit entry and only
//! then persists the new state. If the audit append fails the transition is
//! abandoned.

use crate::audit::{AuditChain, AuditSigner};
use crate::error::{RemediationError, RemediationResult};
use crate::execution::{
    fingerprint, CircuitBreakerRegistry, CircuitSnapshot, CircuitState, CircuitTransition,
    ClaimOutcome, ExecutionReport, ExecutionTracker, Executor, ResilientExecutor, TrackerStats,
};
use crate::models::{
    Action, Actor, Approval, ApprovalDecision, AuditEventType, Configuration, ExecutionRecord,
    ExecutionStatus, Playbook, PlaybookStatus, RemediationRequest, Role, WorkflowTransition,
    BLOCK_IP, SUSPEND_SESSION, SUSPEND_USER, UNBLOCK_IP,
};
use crate::policy::{Decision, PolicyContext, PolicyEngine};
use crate::services::logging::{log_security_event, log_transition};
use crate::workflow::events::{
    DryRunReport, TransitionOutcome, ValidationCheck, WorkflowEvent,
};
use crate::workflow::persistence::GovernanceStore;
use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::json;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::error;
use uuid::Uuid;

/// Identity recorded as approver when policy allows an action outright
pub const POLICY_ENGINE_ACTOR: &str = "policy-engine";

/// Identity recorded on circuit breaker audit entries
pub const CIRCUIT_BREAKER_ACTOR: &str = "circuit-breaker";

#[derive(Debug, Clone)]
pub struct WorkflowConfig {
    /// How long an approval stays executable
    pub approval_ttl: Duration,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            approval_ttl: Duration::hours(1),
        }
    }
}

/// A claimed execution between the EXECUTING commit and the executor outcome
struct ExecutionClaim {
    playbook: Playbook,
    record: ExecutionRecord,
    events: Vec<WorkflowEvent>,
}

fn to_payload<T: Serialize>(value: &T) -> RemediationResult<serde_json::Value> {
    serde_json::to_value(value)
        .context("Failed to serialize audit payload")
        .map_err(RemediationError::from)
}

fn authorize(actor: &Actor, transition: WorkflowTransition) -> RemediationResult<()> {
    if actor.role.permits(transition) {
        return Ok(());
    }

    log_security_event(
        "permission_denied",
        &transition.to_string(),
        Some(&actor.id),
        &format!("role {} may not {}", actor.role, transition),
    );
    Err(RemediationError::PermissionDenied {
        actor: actor.id.clone(),
        role: actor.role,
        transition,
    })
}

fn estimated_impact(action: &Action) -> String {
    match action.name.as_str() {
        BLOCK_IP => format!("all traffic to and from {} would be dropped", action.target),
        UNBLOCK_IP => format!("traffic to and from {} would be allowed again", action.target),
        SUSPEND_SESSION => format!("session {} would be terminated", action.target),
        SUSPEND_USER => format!(
            "account {} would be suspended and its sessions terminated",
            action.target
        ),
        other => format!("'{}' would run against {}", other, action.target),
    }
}

/// Drives playbooks through their lifecycle
pub struct RemediationWorkflow {
    policy: Arc<PolicyEngine>,
    tracker: Arc<ExecutionTracker>,
    executor: ResilientExecutor,
    audit: Arc<AuditChain>,
    store: Arc<GovernanceStore>,
    config: WorkflowConfig,
    /// Serializes transitions of a single playbook
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl RemediationWorkflow {
    /// Assemble a workflow; the tracker is hydrated from the store's execution records
    pub fn new(
        policy: Arc<PolicyEngine>,
        tracker: Arc<ExecutionTracker>,
        executor: ResilientExecutor,
        audit: Arc<AuditChain>,
        store: Arc<GovernanceStore>,
        config: WorkflowConfig,
    ) -> Self {
        tracker.hydrate(store.executions());

        Self {
            policy,
            tracker,
            executor,
            audit,
            store,
            config,
            locks: DashMap::new(),
        }
    }

    /// Build every component from configuration, persisting under `data_dir`
    pub fn from_configuration(
        config: &Configuration,
        executor: Arc<dyn Executor>,
        signer: AuditSigner,
    ) -> anyhow::Result<Self> {
        let store = Arc::new(GovernanceStore::new(config.store_path())?);
        let audit = Arc::new(AuditChain::open(store.clone(), signer)?);
        let policy = Arc::new(PolicyEngine::with_builtin_rules(&config.policy));
        let tracker = Arc::new(ExecutionTracker::new(config.tracker.execution_ttl()));
        let breakers = Arc::new(CircuitBreakerRegistry::new(
            config.circuit_breaker.to_config(),
        ));
        let resilient = ResilientExecutor::new(executor, breakers, config.retry.to_policy());

        Ok(Self::new(
            policy,
            tracker,
            resilient,
            audit,
            store,
            WorkflowConfig {
                approval_ttl: config.workflow.approval_ttl(),
            },
        ))
    }

    pub fn audit(&self) -> &Arc<AuditChain> {
        &self.audit
    }

    pub fn store(&self) -> &Arc<GovernanceStore> {
        &self.store
    }

    pub fn tracker(&self) -> &Arc<ExecutionTracker> {
        &self.tracker
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        self.executor.breakers()
    }

    fn lock_for(&self, playbook_id: Uuid) -> Arc<Mutex<()>> {
        self.locks
            .entry(playbook_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn load(&self, playbook_id: Uuid) -> RemediationResult<Playbook> {
        self.store
            .get_playbook(playbook_id)
            .ok_or(RemediationError::PlaybookNotFound(playbook_id))
    }

    fn invalid(playbook: &Playbook, transition: WorkflowTransition) -> RemediationError {
        RemediationError::InvalidTransition {
            playbook_id: playbook.id,
            from: playbook.status,
            transition,
        }
    }

    /// Create a playbook from an upstream request. The policy verdict picks the initial state.
    pub fn create_playbook(
        &self,
        request: &RemediationRequest,
        actor: &Actor,
    ) -> RemediationResult<TransitionOutcome> {
        authorize(actor, WorkflowTransition::Create)?;

        let context = PolicyContext::from_request(request);
        let verdict = self.policy.evaluate(&context);
        let action = context.action;
        let now = Utc::now();

        let (status, approved_by, expires_at) = match verdict.decision {
            Decision::Deny => {
                self.audit.append(
                    AuditEventType::PolicyDenied,
                    &actor.id,
                    json!({
                        "alert_id": request.alert_id,
                        "action": action,
                        "requested_by": request.requested_by,
                        "reasons": verdict.reasons,
                        "matched_rule_ids": verdict.matched_rule_ids,
                    }),
                )?;
                log_security_event(
                    "policy_denied",
                    &action.target,
                    Some(&actor.id),
                    &verdict.reasons.join("; "),
                );
                return Err(RemediationError::PolicyViolation {
                    reasons: verdict.reasons,
                    matched_rule_ids: verdict.matched_rule_ids,
                });
            }
            Decision::DryRunOnly => (PlaybookStatus::DryRun, None, None),
            Decision::RequireApproval => (PlaybookStatus::PendingApproval, None, None),
            Decision::Allow => (
                PlaybookStatus::Approved,
                Some(POLICY_ENGINE_ACTOR.to_string()),
                Some(now + self.config.approval_ttl),
            ),
        };

        let justification = request.justification.clone().unwrap_or_else(|| {
            format!(
                "alert {} ({} severity) from {}",
                request.alert_id, request.severity, request.requested_by
            )
        });

        let mut playbook = Playbook {
            id: Uuid::new_v4(),
            alert_id: request.alert_id.clone(),
            target: action.normalized_target(),
            action,
            justification,
            severity: request.severity,
            environment: request.environment,
            status,
            policy_reasons: verdict.reasons.clone(),
            created_by: actor.id.clone(),
            requested_by: request.requested_by.clone(),
            signature: String::new(),
            created_at: now,
            updated_at: now,
            approved_by,
            expires_at,
            failure_reason: None,
            revision: 0,
        };
        playbook.signature = self.audit.signer().sign(&playbook.signing_payload());

        self.audit.append(
            AuditEventType::PlaybookCreated,
            &actor.id,
            json!({
                "playbook_id": playbook.id,
                "alert_id": playbook.alert_id,
                "action": playbook.action,
                "requested_by": request.requested_by,
                "status": playbook.status,
                "decision": verdict.decision,
                "reasons": verdict.reasons,
                "matched_rule_ids": verdict.matched_rule_ids,
                "signature": playbook.signature,
            }),
        )?;
        let written = self.store.upsert_playbook(&mut playbook);
        self.settle_write(written, AuditEventType::PlaybookCreated, &playbook, None, &actor.id)?;

        log_transition(
            AuditEventType::PlaybookCreated.as_str(),
            &playbook.id.to_string(),
            &actor.id,
            Some(&format!("status={}", playbook.status)),
        );

        let events = vec![WorkflowEvent::PlaybookCreated {
            playbook_id: playbook.id,
            status: playbook.status,
        }];
        Ok(TransitionOutcome::new(playbook, events))
    }

    /// PENDING_APPROVAL -> APPROVED
    pub fn approve(
        &self,
        playbook_id: Uuid,
        actor: &Actor,
        comment: Option<String>,
    ) -> RemediationResult<TransitionOutcome> {
        self.decide(playbook_id, actor, ApprovalDecision::Approved, comment)
    }

    /// PENDING_APPROVAL -> REJECTED
    pub fn reject(
        &self,
        playbook_id: Uuid,
        actor: &Actor,
        comment: Option<String>,
    ) -> RemediationResult<TransitionOutcome> {
        self.decide(playbook_id, actor, ApprovalDecision::Rejected, comment)
    }

    fn decide(
        &self,
        playbook_id: Uuid,
        actor: &Actor,
        decision: ApprovalDecision,
        comment: Option<String>,
    ) -> RemediationResult<TransitionOutcome> {
        let transition = match decision {
            ApprovalDecision::Approved => WorkflowTransition::Approve,
            ApprovalDecision::Rejected => WorkflowTransition::Reject,
        };
        authorize(actor, transition)?;

        let lock = self.lock_for(playbook_id);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let mut playbook = self.load(playbook_id)?;
        if playbook.status != PlaybookStatus::PendingApproval {
            return Err(Self::invalid(&playbook, transition));
        }

        if playbook.is_originator(&actor.id) {
            log_security_event(
                "separation_of_duties",
                &playbook.target,
                Some(&actor.id),
                &format!("originator attempted to {} playbook {}", transition, playbook.id),
            );
            return Err(RemediationError::SeparationOfDuties {
                actor: actor.id.clone(),
                playbook_id,
            });
        }

        let now = Utc::now();
        let expires_at = match decision {
            ApprovalDecision::Approved => Some(now + self.config.approval_ttl),
            ApprovalDecision::Rejected => None,
        };

        let mut approval = Approval {
            id: Uuid::new_v4(),
            playbook_id,
            decision,
            decided_by: actor.id.clone(),
            signature: String::new(),
            decided_at: now,
            expires_at,
            comment: comment.clone(),
        };
        approval.signature = self.audit.signer().sign(&approval.signing_payload());

        let (event_type, event) = match decision {
            ApprovalDecision::Approved => {
                playbook.status = PlaybookStatus::Approved;
                playbook.approved_by = Some(actor.id.clone());
                playbook.expires_at = expires_at;
                (
                    AuditEventType::PlaybookApproved,
                    WorkflowEvent::PlaybookApproved {
                        playbook_id,
                        approved_by: actor.id.clone(),
                    },
                )
            }
            ApprovalDecision::Rejected => {
                playbook.status = PlaybookStatus::Rejected;
                playbook.failure_reason =
                    Some(comment.unwrap_or_else(|| format!("rejected by {}", actor.id)));
                (
                    AuditEventType::PlaybookRejected,
                    WorkflowEvent::PlaybookRejected {
                        playbook_id,
                        rejected_by: actor.id.clone(),
                    },
                )
            }
        };
        playbook.updated_at = now;

        self.audit.append(
            event_type,
            &actor.id,
            json!({
                "playbook_id": playbook_id,
                "approval_id": approval.id,
                "decision": approval.decision,
                "comment": approval.comment,
                "expires_at": approval.expires_at,
                "signature": approval.signature,
            }),
        )?;
        let written = self.store.record_decision(&mut playbook, &approval);
        self.settle_write(written, event_type, &playbook, None, &actor.id)?;

        log_transition(event_type.as_str(), &playbook_id.to_string(), &actor.id, None);
        Ok(TransitionOutcome::new(playbook, vec![event]))
    }

    /// DRY_RUN -> PENDING_APPROVAL, after re-checking policy
    pub fn promote(&self, playbook_id: Uuid, actor: &Actor) -> RemediationResult<TransitionOutcome> {
        authorize(actor, WorkflowTransition::Promote)?;

        let lock = self.lock_for(playbook_id);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let mut playbook = self.load(playbook_id)?;
        if playbook.status != PlaybookStatus::DryRun {
            return Err(Self::invalid(&playbook, WorkflowTransition::Promote));
        }

        let verdict = self.policy.evaluate(&PolicyContext {
            action: playbook.action.clone(),
            environment: playbook.environment,
            severity: playbook.severity,
            requested_by: playbook.requester().to_string(),
        });
        if verdict.decision == Decision::Deny {
            self.audit.append(
                AuditEventType::PolicyDenied,
                &actor.id,
                json!({
                    "playbook_id": playbook_id,
                    "action": playbook.action,
                    "reasons": verdict.reasons,
                    "matched_rule_ids": verdict.matched_rule_ids,
                }),
            )?;
            return Err(RemediationError::PolicyViolation {
                reasons: verdict.reasons,
                matched_rule_ids: verdict.matched_rule_ids,
            });
        }

        playbook.status = PlaybookStatus::PendingApproval;
        playbook.updated_at = Utc::now();

        self.audit.append(
            AuditEventType::PlaybookPromoted,
            &actor.id,
            json!({
                "playbook_id": playbook_id,
                "from": PlaybookStatus::DryRun,
                "to": PlaybookStatus::PendingApproval,
                "reasons": verdict.reasons,
            }),
        )?;
        let written = self.store.upsert_playbook(&mut playbook);
        self.settle_write(written, AuditEventType::PlaybookPromoted, &playbook, None, &actor.id)?;

        log_transition(
            AuditEventType::PlaybookPromoted.as_str(),
            &playbook_id.to_string(),
            &actor.id,
            None,
        );
        Ok(TransitionOutcome::new(
            playbook,
            vec![WorkflowEvent::PlaybookPromoted {
                playbook_id,
                promoted_by: actor.id.clone(),
            }],
        ))
    }

    /// Move every APPROVED playbook whose approval lapsed at `now` to EXPIRED
    pub fn expire_stale(&self, now: DateTime<Utc>) -> RemediationResult<Vec<TransitionOutcome>> {
        let actor = Actor::system();
        authorize(&actor, WorkflowTransition::Expire)?;

        let mut expired = Vec::new();
        for candidate in self.store.list_playbooks(Some(PlaybookStatus::Approved)) {
            if !candidate.is_expired_at(now) {
                continue;
            }

            let lock = self.lock_for(candidate.id);
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

            let playbook = self.load(candidate.id)?;
            if playbook.status == PlaybookStatus::Approved && playbook.is_expired_at(now) {
                expired.push(self.expire_locked(playbook, &actor.id)?);
            }
        }

        Ok(expired)
    }

    /// Caller holds the playbook lock
    fn expire_locked(
        &self,
        mut playbook: Playbook,
        actor_id: &str,
    ) -> RemediationResult<TransitionOutcome> {
        playbook.status = PlaybookStatus::Expired;
        playbook.updated_at = Utc::now();

        self.audit.append(
            AuditEventType::PlaybookExpired,
            actor_id,
            json!({
                "playbook_id": playbook.id,
                "expires_at": playbook.expires_at,
            }),
        )?;
        let written = self.store.upsert_playbook(&mut playbook);
        self.settle_write(written, AuditEventType::PlaybookExpired, &playbook, None, actor_id)?;

        log_transition(
            AuditEventType::PlaybookExpired.as_str(),
            &playbook.id.to_string(),
            actor_id,
            None,
        );
        let playbook_id = playbook.id;
        Ok(TransitionOutcome::new(
            playbook,
            vec![WorkflowEvent::PlaybookExpired { playbook_id }],
        ))
    }

    /// Run a playbook. DRY_RUN playbooks are simulated; APPROVED ones go
    /// through the duplicate check, the circuit breaker and the executor.
    pub async fn execute(
        &self,
        playbook_id: Uuid,
        actor: &Actor,
    ) -> RemediationResult<TransitionOutcome> {
        let playbook = self.load(playbook_id)?;
        if playbook.status == PlaybookStatus::DryRun {
            return self.dry_run(playbook_id, actor);
        }

        authorize(actor, WorkflowTransition::Execute)?;

        let claim = self.begin_execution(playbook_id, actor)?;
        let report = self.executor.run(&claim.playbook.action).await;
        self.finish_execution(claim, report, actor)
    }

    fn duplicate(
        &self,
        playbook: &Playbook,
        fingerprint: &str,
        execution_id: Uuid,
        actor: &Actor,
    ) -> RemediationError {
        if let Err(e) = self.audit.append(
            AuditEventType::DuplicateSkipped,
            &actor.id,
            json!({
                "playbook_id": playbook.id,
                "fingerprint": fingerprint,
                "execution_id": execution_id,
            }),
        ) {
            return e;
        }

        RemediationError::DuplicateAction {
            fingerprint: fingerprint.to_string(),
            execution_id,
        }
    }

    fn audit_circuit(&self, transition: &CircuitTransition) -> RemediationResult<()> {
        let event_type = match transition.to {
            CircuitState::Open => AuditEventType::CircuitOpened,
            CircuitState::HalfOpen => AuditEventType::CircuitHalfOpened,
            CircuitState::Closed => AuditEventType::CircuitClosed,
        };
        self.audit
            .append(event_type, CIRCUIT_BREAKER_ACTOR, to_payload(transition)?)?;
        Ok(())
    }

    /// Gate checks and the APPROVED -> EXECUTING commit, under the playbook lock
    fn begin_execution(&self, playbook_id: Uuid, actor: &Actor) -> RemediationResult<ExecutionClaim> {
        let lock = self.lock_for(playbook_id);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let mut playbook = self.load(playbook_id)?;
        let fingerprint = fingerprint(&playbook.action, playbook.id);

        match playbook.status {
            PlaybookStatus::Approved => {}
            PlaybookStatus::PendingApproval => {
                return Err(RemediationError::ApprovalRequired {
                    playbook_id,
                    reasons: playbook.policy_reasons.clone(),
                })
            }
            PlaybookStatus::Executing | PlaybookStatus::Completed | PlaybookStatus::Failed => {
                if let Some(existing) = self.tracker.get(&fingerprint) {
                    if existing.is_live_at(Utc::now()) {
                        return Err(self.duplicate(&playbook, &fingerprint, existing.id, actor));
                    }
                }
                return Err(Self::invalid(&playbook, WorkflowTransition::Execute));
            }
            _ => return Err(Self::invalid(&playbook, WorkflowTransition::Execute)),
        }

        let now = Utc::now();
        if playbook.is_expired_at(now) {
            let expired_at = playbook.expires_at.unwrap_or(now);
            self.expire_locked(playbook, &actor.id)?;
            return Err(RemediationError::ApprovalExpired {
                playbook_id,
                expired_at,
            });
        }

        // The built-in worker runs what it created on a policy allow; anyone else
        // who proposed the playbook may not execute it
        let creating_worker = actor.role == Role::System && actor.id == playbook.created_by;
        if !creating_worker && playbook.is_originator(&actor.id) {
            log_security_event(
                "separation_of_duties",
                &playbook.target,
                Some(&actor.id),
                &format!("originator attempted to execute playbook {}", playbook_id),
            );
            return Err(RemediationError::SeparationOfDuties {
                actor: actor.id.clone(),
                playbook_id,
            });
        }
        if let Some(approver) = playbook.approved_by.as_deref() {
            if playbook.is_originator(approver) {
                return Err(RemediationError::SeparationOfDuties {
                    actor: approver.to_string(),
                    playbook_id,
                });
            }
        }

        let mut events = Vec::new();
        match self.breakers().acquire(&playbook.target) {
            Ok(Some(transition)) => {
                self.audit_circuit(&transition)?;
                events.push(WorkflowEvent::CircuitChanged(transition));
            }
            Ok(None) => {}
            Err(open) => {
                self.audit.append(
                    AuditEventType::CircuitRejected,
                    &actor.id,
                    json!({
                        "playbook_id": playbook_id,
                        "target": playbook.target,
                        "retry_after_ms": open.retry_after_ms,
                    }),
                )?;
                return Err(RemediationError::CircuitOpenFailFast {
                    target: playbook.target.clone(),
                    retry_after_ms: open.retry_after_ms,
                });
            }
        }

        let record = match self.tracker.record_execution(
            &fingerprint,
            playbook_id,
            ExecutionStatus::InProgress,
            None,
            None,
        ) {
            ClaimOutcome::Recorded(record) => record,
            ClaimOutcome::Duplicate(existing) => {
                return Err(self.duplicate(&playbook, &fingerprint, existing.id, actor));
            }
        };

        if let Err(e) = self.audit.append(
            AuditEventType::ExecutionStarted,
            &actor.id,
            json!({
                "playbook_id": playbook_id,
                "execution_id": record.id,
                "fingerprint": fingerprint,
                "target": playbook.target,
            }),
        ) {
            self.tracker.release(&fingerprint);
            return Err(e);
        }

        playbook.status = PlaybookStatus::Executing;
        playbook.updated_at = now;
        let written = self.store.record_execution(&mut playbook, &record);
        if let Err(e) = self.settle_write(
            written,
            AuditEventType::ExecutionStarted,
            &playbook,
            Some(record.id),
            &actor.id,
        ) {
            self.tracker.release(&fingerprint);
            return Err(e);
        }

        log_transition(
            AuditEventType::ExecutionStarted.as_str(),
            &playbook_id.to_string(),
            &actor.id,
            Some(&format!("execution_id={}", record.id)),
        );
        events.push(WorkflowEvent::ExecutionStarted {
            playbook_id,
            execution_id: record.id,
            fingerprint,
        });

        Ok(ExecutionClaim {
            playbook,
            record,
            events,
        })
    }

    /// EXECUTING -> COMPLETED | FAILED. The outcome is audited, then persisted,
    /// and only then is the tracker claim settled. If either write fails the
    /// playbook stays EXECUTING and the tracker keeps its claim.
    fn finish_execution(
        &self,
        claim: ExecutionClaim,
        report: ExecutionReport,
        actor: &Actor,
    ) -> RemediationResult<TransitionOutcome> {
        let ExecutionClaim {
            mut playbook,
            mut record,
            mut events,
        } = claim;

        let lock = self.lock_for(playbook.id);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        for transition in &report.transitions {
            self.audit_circuit(transition)?;
            events.push(WorkflowEvent::CircuitChanged(transition.clone()));
        }

        let attempts = report.attempts;
        let retries = report.retries;
        let failed_fast = report.failed_fast();
        let fingerprint = record.fingerprint.clone();
        record.attempts = attempts;

        let (event_type, event) = match report.into_result(&playbook.target) {
            Ok(value) => {
                self.audit.append(
                    AuditEventType::ExecutionCompleted,
                    &actor.id,
                    json!({
                        "playbook_id": playbook.id,
                        "execution_id": record.id,
                        "attempts": attempts,
                        "retries": retries,
                    }),
                )?;

                record.status = ExecutionStatus::Succeeded;
                record.result = Some(value);
                playbook.status = PlaybookStatus::Completed;
                (
                    AuditEventType::ExecutionCompleted,
                    WorkflowEvent::ExecutionCompleted {
                        playbook_id: playbook.id,
                        execution_id: record.id,
                        attempts,
                    },
                )
            }
            Err(error) => {
                let reason = error.to_string();
                self.audit.append(
                    AuditEventType::ExecutionFailed,
                    &actor.id,
                    json!({
                        "playbook_id": playbook.id,
                        "execution_id": record.id,
                        "code": error.code(),
                        "reason": reason,
                        "attempts": attempts,
                    }),
                )?;

                record.status = ExecutionStatus::Failed;
                record.result = Some(json!({ "code": error.code(), "error": reason }));
                playbook.status = PlaybookStatus::Failed;
                playbook.failure_reason = Some(reason.clone());
                (
                    AuditEventType::ExecutionFailed,
                    WorkflowEvent::ExecutionFailed {
                        playbook_id: playbook.id,
                        execution_id: record.id,
                        code: error.code().to_string(),
                        reason,
                        attempts,
                    },
                )
            }
        };

        playbook.updated_at = Utc::now();
        let written = self.store.record_execution(&mut playbook, &record);
        self.settle_write(written, event_type, &playbook, Some(record.id), &actor.id)?;

        // The executor never ran, so the claim must not block a recreated playbook
        if failed_fast {
            self.tracker.release(&fingerprint);
        } else {
            self.tracker
                .complete(&fingerprint, record.status, record.result.clone(), attempts);
        }
        events.push(event);

        log_transition(
            event_type.as_str(),
            &playbook.id.to_string(),
            &actor.id,
            Some(&format!("attempts={}", attempts)),
        );

        Ok(TransitionOutcome {
            playbook,
            events,
            execution: Some(record),
            dry_run: None,
        })
    }

    /// Pass a store write through. A failed write of an already audited
    /// transition gets a compensating `state_write_failed` entry.
    fn settle_write(
        &self,
        written: anyhow::Result<()>,
        audited: AuditEventType,
        playbook: &Playbook,
        execution_id: Option<Uuid>,
        actor_id: &str,
    ) -> RemediationResult<()> {
        let error = match written {
            Ok(()) => return Ok(()),
            Err(error) => error,
        };

        log_security_event(
            "state_write_failed",
            &playbook.target,
            Some(actor_id),
            &format!("{} for playbook {} was not persisted: {:#}", audited, playbook.id, error),
        );

        if let Err(e) = self.audit.append(
            AuditEventType::StateWriteFailed,
            actor_id,
            json!({
                "playbook_id": playbook.id,
                "execution_id": execution_id,
                "audited_event": audited,
                "error": format!("{:#}", error),
            }),
        ) {
            error!(
                playbook_id = %playbook.id,
                error = %e,
                "Could not audit failed state write"
            );
        }

        Err(error.into())
    }

    /// Validate a playbook the way a real execution would, without calling the executor
    pub fn dry_run(&self, playbook_id: Uuid, actor: &Actor) -> RemediationResult<TransitionOutcome> {
        authorize(actor, WorkflowTransition::DryRun)?;

        let lock = self.lock_for(playbook_id);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let playbook = self.load(playbook_id)?;
        if playbook.status.is_terminal() || playbook.status == PlaybookStatus::Executing {
            return Err(Self::invalid(&playbook, WorkflowTransition::DryRun));
        }

        let report = self.simulate(&playbook);
        let now = Utc::now();
        let record = ExecutionRecord {
            id: Uuid::new_v4(),
            fingerprint: fingerprint(&playbook.action, playbook.id),
            playbook_id,
            status: ExecutionStatus::Simulated,
            result: Some(to_payload(&report)?),
            simulated: true,
            attempts: 0,
            recorded_at: now,
            ttl_expiry: now + self.tracker.default_ttl(),
        };

        self.audit.append(
            AuditEventType::DryRunExecuted,
            &actor.id,
            json!({
                "playbook_id": playbook_id,
                "execution_id": record.id,
                "would_execute": report.would_execute,
                "estimated_impact": report.estimated_impact,
            }),
        )?;
        let written = self.store.upsert_execution(&record);
        self.settle_write(
            written,
            AuditEventType::DryRunExecuted,
            &playbook,
            Some(record.id),
            &actor.id,
        )?;

        log_transition(
            AuditEventType::DryRunExecuted.as_str(),
            &playbook_id.to_string(),
            &actor.id,
            Some(&format!("would_execute={}", report.would_execute)),
        );

        let events = vec![WorkflowEvent::DryRunCompleted {
            playbook_id,
            execution_id: record.id,
            would_execute: report.would_execute,
        }];
        Ok(TransitionOutcome {
            playbook,
            events,
            execution: Some(record),
            dry_run: Some(report),
        })
    }

    /// The same target and policy checks a real execution goes through
    fn simulate(&self, playbook: &Playbook) -> DryRunReport {
        let action = &playbook.action;
        let mut checks = Vec::new();

        let verdict = self.policy.evaluate(&PolicyContext {
            action: action.clone(),
            environment: playbook.environment,
            severity: playbook.severity,
            requested_by: playbook.requester().to_string(),
        });
        checks.push(ValidationCheck {
            name: "policy".to_string(),
            passed: verdict.decision != Decision::Deny,
            detail: format!("{}: {}", verdict.decision, verdict.reasons.join("; ")),
        });

        let target_ok = if action.targets_network() {
            action.target_ip().is_some()
        } else {
            !action.target.trim().is_empty()
        };
        checks.push(ValidationCheck {
            name: "target".to_string(),
            passed: target_ok,
            detail: if target_ok {
                format!("target '{}' is well formed", playbook.target)
            } else {
                format!("target '{}' is not valid for {}", action.target, action.name)
            },
        });

        let circuit = self.breakers().state(&playbook.target);
        checks.push(ValidationCheck {
            name: "circuit".to_string(),
            passed: circuit != CircuitState::Open,
            detail: format!("circuit for {} is {}", playbook.target, circuit),
        });

        let duplicate = self
            .tracker
            .is_duplicate(&fingerprint(action, playbook.id));
        checks.push(ValidationCheck {
            name: "duplicate".to_string(),
            passed: !duplicate,
            detail: if duplicate {
                "an identical execution is already recorded".to_string()
            } else {
                "no identical execution recorded".to_string()
            },
        });

        let would_execute = checks.iter().all(|check| check.passed);
        DryRunReport {
            playbook_id: playbook.id,
            checks,
            estimated_impact: estimated_impact(action),
            would_execute,
        }
    }

    pub fn get_playbook(&self, playbook_id: Uuid) -> RemediationResult<Playbook> {
        self.load(playbook_id)
    }

    pub fn list_playbooks(&self, status: Option<PlaybookStatus>) -> Vec<Playbook> {
        self.store.list_playbooks(status)
    }

    pub fn pending_approvals(&self) -> Vec<Playbook> {
        self.store.pending_approvals()
    }

    pub fn approvals_for(&self, playbook_id: Uuid) -> Vec<Approval> {
        self.store.approvals_for(playbook_id)
    }

    pub fn executions_for(&self, playbook_id: Uuid) -> Vec<ExecutionRecord> {
        self.store.executions_for(playbook_id)
    }

    pub fn circuit_snapshots(&self) -> Vec<CircuitSnapshot> {
        self.breakers().snapshots()
    }

    pub fn circuit_snapshot(&self, target: &str) -> Option<CircuitSnapshot> {
        self.breakers()
            .snapshot(&crate::models::normalize_target(target))
    }

    pub fn tracker_stats(&self) -> TrackerStats {
        self.tracker.stats()
    }
}
