//! Queue-fed worker pool and background sweepers

use crate::error::{RemediationError, RemediationResult};
use crate::execution::{CircuitSnapshot, TrackerStats};
use crate::models::{Actor, Configuration, PlaybookStatus, RemediationRequest};
use crate::queue::{BoundedActionQueue, PutOutcome, QueueMetrics};
use crate::services::logging::log_error;
use crate::workflow::engine::RemediationWorkflow;
use crate::workflow::events::TransitionOutcome;
use chrono::Utc;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub workers: usize,
    /// How long an idle worker waits on the queue before re-checking shutdown
    pub poll_interval: Duration,
    /// Default BLOCK timeout for submissions
    pub put_timeout: Duration,
    pub tracker_sweep_interval: Duration,
    pub expiry_sweep_interval: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            poll_interval: Duration::from_millis(250),
            put_timeout: Duration::from_secs(1),
            tracker_sweep_interval: Duration::from_secs(60),
            expiry_sweep_interval: Duration::from_secs(60),
        }
    }
}

impl ServiceConfig {
    pub fn from_configuration(config: &Configuration) -> Self {
        Self {
            workers: config.workflow.workers.max(1),
            put_timeout: config.queue.put_timeout(),
            tracker_sweep_interval: Duration::from_secs(
                config.tracker.sweep_interval_seconds.max(1),
            ),
            expiry_sweep_interval: Duration::from_secs(
                config.workflow.expiry_sweep_interval_seconds.max(1),
            ),
            ..Self::default()
        }
    }
}

#[derive(Default)]
struct WorkerCounters {
    processed: AtomicU64,
    created: AtomicU64,
    denied: AtomicU64,
    executed: AtomicU64,
    failed: AtomicU64,
    duplicates: AtomicU64,
    dry_runs: AtomicU64,
    awaiting_approval: AtomicU64,
    errors: AtomicU64,
}

impl WorkerCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn record_error(&self, error: &RemediationError) {
        match error {
            RemediationError::PolicyViolation { .. } => Self::bump(&self.denied),
            RemediationError::DuplicateAction { .. } => Self::bump(&self.duplicates),
            other => {
                Self::bump(&self.errors);
                log_error(&other.to_string(), Some(other.code()));
            }
        }
    }

    fn snapshot(&self) -> WorkerStats {
        WorkerStats {
            processed: self.processed.load(Ordering::Relaxed),
            created: self.created.load(Ordering::Relaxed),
            denied: self.denied.load(Ordering::Relaxed),
            executed: self.executed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            dry_runs: self.dry_runs.load(Ordering::Relaxed),
            awaiting_approval: self.awaiting_approval.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Counters across all workers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WorkerStats {
    pub processed: u64,
    pub created: u64,
    pub denied: u64,
    pub executed: u64,
    pub failed: u64,
    pub duplicates: u64,
    pub dry_runs: u64,
    pub awaiting_approval: u64,
    pub errors: u64,
}

/// Point-in-time view of the running service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub queue: QueueMetrics,
    pub circuits: Vec<CircuitSnapshot>,
    pub tracker: TrackerStats,
    pub workers: WorkerStats,
    pub running_tasks: usize,
}

/// Drains remediation requests from the queue into the workflow
pub struct RemediationService {
    workflow: Arc<RemediationWorkflow>,
    queue: Arc<BoundedActionQueue<RemediationRequest>>,
    config: ServiceConfig,
    counters: Arc<WorkerCounters>,
    shutdown: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl RemediationService {
    pub fn new(
        workflow: Arc<RemediationWorkflow>,
        queue: Arc<BoundedActionQueue<RemediationRequest>>,
        config: ServiceConfig,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);

        Self {
            workflow,
            queue,
            config,
            counters: Arc::new(WorkerCounters::default()),
            shutdown,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Build the queue and worker settings from configuration
    pub fn from_configuration(config: &Configuration, workflow: Arc<RemediationWorkflow>) -> Self {
        let queue = Arc::new(BoundedActionQueue::new(config.queue.to_config()));
        Self::new(workflow, queue, ServiceConfig::from_configuration(config))
    }

    pub fn workflow(&self) -> &Arc<RemediationWorkflow> {
        &self.workflow
    }

    pub fn queue(&self) -> &Arc<BoundedActionQueue<RemediationRequest>> {
        &self.queue
    }

    /// Spawn the workers and the tracker and expiry sweepers
    pub fn start(&self) {
        let mut handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
        if !handles.is_empty() {
            warn!("Remediation service already started");
            return;
        }

        for index in 0..self.config.workers {
            handles.push(tokio::spawn(worker_loop(
                index,
                self.workflow.clone(),
                self.queue.clone(),
                self.counters.clone(),
                self.config.poll_interval,
                self.shutdown.subscribe(),
            )));
        }

        handles.push(self.workflow.tracker().clone().spawn_sweeper(
            self.config.tracker_sweep_interval,
            self.shutdown.subscribe(),
        ));
        handles.push(spawn_expiry_sweeper(
            self.workflow.clone(),
            self.config.expiry_sweep_interval,
            self.shutdown.subscribe(),
        ));

        info!(workers = self.config.workers, "Remediation service started");
    }

    /// Enqueue a request under the configured overflow strategy
    pub async fn submit(
        &self,
        request: RemediationRequest,
        timeout: Option<Duration>,
    ) -> RemediationResult<()> {
        let alert_id = request.alert_id.clone();
        let outcome = self
            .queue
            .put(request, timeout.unwrap_or(self.config.put_timeout))
            .await;

        match outcome {
            PutOutcome::Accepted => {
                debug!(alert_id = %alert_id, "Request queued");
                Ok(())
            }
            PutOutcome::DroppedOldest(evicted) => {
                warn!(
                    alert_id = %alert_id,
                    dropped_alert_id = %evicted.item.alert_id,
                    "Queue full; dropped oldest request"
                );
                Ok(())
            }
            PutOutcome::DroppedNewest(_) | PutOutcome::Rejected(_) => {
                warn!(
                    alert_id = %alert_id,
                    strategy = %self.queue.strategy(),
                    outcome = outcome.label(),
                    "Queue saturated; request not accepted"
                );
                Err(RemediationError::QueueSaturated {
                    strategy: self.queue.strategy().to_string(),
                    capacity: self.queue.capacity(),
                })
            }
        }
    }

    /// Run one request through the workflow as the system actor
    pub async fn process_request(
        &self,
        request: RemediationRequest,
    ) -> RemediationResult<TransitionOutcome> {
        handle_request(&self.workflow, request, &self.counters).await
    }

    pub fn stats(&self) -> WorkerStats {
        self.counters.snapshot()
    }

    pub fn status(&self) -> ServiceStatus {
        let running_tasks = self
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|handle| !handle.is_finished())
            .count();

        ServiceStatus {
            queue: self.queue.metrics(),
            circuits: self.workflow.circuit_snapshots(),
            tracker: self.workflow.tracker_stats(),
            workers: self.counters.snapshot(),
            running_tasks,
        }
    }

    /// Signal shutdown and wait for workers to drain the queue
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);

        let handles: Vec<JoinHandle<()>> = self
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();

        for result in join_all(handles).await {
            if let Err(e) = result {
                log_error(&e.to_string(), Some("service task panicked"));
            }
        }

        info!(remaining = self.queue.len(), "Remediation service stopped");
    }
}

async fn handle_request(
    workflow: &RemediationWorkflow,
    request: RemediationRequest,
    counters: &WorkerCounters,
) -> RemediationResult<TransitionOutcome> {
    WorkerCounters::bump(&counters.processed);
    let system = Actor::system();

    let created = workflow
        .create_playbook(&request, &system)
        .inspect_err(|e| counters.record_error(e))?;
    WorkerCounters::bump(&counters.created);

    match created.status() {
        PlaybookStatus::Approved | PlaybookStatus::DryRun => {
            let outcome = workflow
                .execute(created.playbook.id, &system)
                .await
                .inspect_err(|e| counters.record_error(e))?;

            match outcome.status() {
                PlaybookStatus::Completed => WorkerCounters::bump(&counters.executed),
                PlaybookStatus::Failed => WorkerCounters::bump(&counters.failed),
                PlaybookStatus::DryRun => WorkerCounters::bump(&counters.dry_runs),
                _ => {}
            }
            Ok(outcome)
        }
        PlaybookStatus::PendingApproval => {
            WorkerCounters::bump(&counters.awaiting_approval);
            Ok(created)
        }
        _ => Ok(created),
    }
}

async fn worker_loop(
    index: usize,
    workflow: Arc<RemediationWorkflow>,
    queue: Arc<BoundedActionQueue<RemediationRequest>>,
    counters: Arc<WorkerCounters>,
    poll_interval: Duration,
    shutdown: watch::Receiver<bool>,
) {
    debug!(worker = index, "Worker started");

    loop {
        match queue.get(poll_interval).await {
            Some(queued) => {
                let alert_id = queued.item.alert_id.clone();
                match handle_request(&workflow, queued.item, &counters).await {
                    Ok(outcome) => debug!(
                        worker = index,
                        alert_id = %alert_id,
                        playbook_id = %outcome.playbook.id,
                        status = %outcome.status(),
                        "Request processed"
                    ),
                    Err(e) => debug!(
                        worker = index,
                        alert_id = %alert_id,
                        code = e.code(),
                        "Request not executed"
                    ),
                }
            }
            // Drain what is left before honouring shutdown
            None if *shutdown.borrow() && queue.is_empty() => break,
            None => {}
        }
    }

    debug!(worker = index, "Worker stopped");
}

fn spawn_expiry_sweeper(
    workflow: Arc<RemediationWorkflow>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match workflow.expire_stale(Utc::now()) {
                        Ok(expired) if !expired.is_empty() => {
                            info!(count = expired.len(), "Expired stale approvals");
                        }
                        Ok(_) => {}
                        Err(e) => log_error(&e.to_string(), Some("approval expiry sweep")),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditSigner;
    use crate::execution::{Executor, ExecutorOutcome};
    use crate::models::{Action, Environment, Role, Severity};
    use crate::queue::{OverflowStrategy, QueueConfig};
    use async_trait::async_trait;
    use tempfile::TempDir;

    struct AlwaysSucceeds;

    #[async_trait]
    impl Executor for AlwaysSucceeds {
        async fn execute(&self, _action: &Action) -> ExecutorOutcome {
            ExecutorOutcome::Success(serde_json::json!({"ok": true}))
        }
    }

    fn workflow(dir: &TempDir) -> Arc<RemediationWorkflow> {
        let config = Configuration {
            data_dir: Some(dir.path().to_path_buf()),
            ..Configuration::default()
        };
        Arc::new(
            RemediationWorkflow::from_configuration(
                &config,
                Arc::new(AlwaysSucceeds),
                AuditSigner::generate(),
            )
            .unwrap(),
        )
    }

    fn service(dir: &TempDir, capacity: usize, strategy: OverflowStrategy) -> RemediationService {
        let queue = Arc::new(BoundedActionQueue::new(QueueConfig {
            capacity,
            strategy,
            alert_threshold: 0.8,
        }));
        RemediationService::new(
            workflow(dir),
            queue,
            ServiceConfig {
                poll_interval: Duration::from_millis(20),
                put_timeout: Duration::from_millis(50),
                ..ServiceConfig::default()
            },
        )
    }

    fn request(alert_id: &str, action_type: &str, target: &str) -> RemediationRequest {
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

    #[tokio::test]
    async fn test_shutdown_drains_queued_requests() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(&dir, 8, OverflowStrategy::Block);

        service.submit(request("a-1", "block_ip", "93.184.216.34"), None).await.unwrap();
        service.submit(request("a-2", "block_ip", "8.8.8.8"), None).await.unwrap();
        service.submit(request("a-3", "suspend_user", "mallory"), None).await.unwrap();
        service.submit(request("a-4", "block_ip", "127.0.0.1"), None).await.unwrap();

        service.start();
        service.shutdown().await;

        let stats = service.stats();
        assert_eq!(stats.processed, 4);
        assert_eq!(stats.executed, 2);
        assert_eq!(stats.awaiting_approval, 1);
        assert_eq!(stats.denied, 1);
        assert!(service.queue().is_empty());
        assert_eq!(service.workflow().pending_approvals().len(), 1);
    }

    #[tokio::test]
    async fn test_reject_strategy_reports_saturation() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(&dir, 1, OverflowStrategy::Reject);

        service.submit(request("a-1", "block_ip", "93.184.216.34"), None).await.unwrap();
        let err = service
            .submit(request("a-2", "block_ip", "8.8.8.8"), None)
            .await
            .unwrap_err();

        match err {
            RemediationError::QueueSaturated { strategy, capacity } => {
                assert_eq!(strategy, "REJECT");
                assert_eq!(capacity, 1);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(service.status().queue.rejected, 1);
    }

    #[tokio::test]
    async fn test_process_request_runs_dry_run_outside_production() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(&dir, 4, OverflowStrategy::Block);

        let mut staging = request("a-1", "block_ip", "93.184.216.34");
        staging.environment = Environment::Staging;

        let outcome = service.process_request(staging).await.unwrap();

        assert_eq!(outcome.status(), PlaybookStatus::DryRun);
        assert!(outcome.dry_run.is_some());
        assert_eq!(service.stats().dry_runs, 1);
    }

    #[tokio::test]
    async fn test_requester_of_queued_request_cannot_approve_or_execute_it() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(&dir, 8, OverflowStrategy::Reject);

        let mut req = request("A-9", "suspend_user", "mallory");
        req.requested_by = "alice".to_string();
        let pending = service.process_request(req).await.unwrap();
        assert_eq!(pending.status(), PlaybookStatus::PendingApproval);
        let id = pending.playbook.id;

        let workflow = service.workflow();
        let err = workflow
            .approve(id, &Actor::new("alice", Role::Approver), None)
            .unwrap_err();
        assert_eq!(err.code(), "SEPARATION_OF_DUTIES");

        workflow
            .approve(id, &Actor::new("bob", Role::Approver), None)
            .unwrap();
        let err = workflow
            .execute(id, &Actor::new("alice", Role::Executor))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "SEPARATION_OF_DUTIES");

        let executed = workflow
            .execute(id, &Actor::new("eve", Role::Executor))
            .await
            .unwrap();
        assert_eq!(executed.status(), PlaybookStatus::Completed);
    }
}
