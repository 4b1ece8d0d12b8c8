//! Retry with exponential backoff, gated by the target's circuit breaker

use super::circuit_breaker::{CircuitBreakerRegistry, CircuitTransition};
use super::executor::{Executor, ExecutorOutcome};
use crate::error::RemediationError;
use crate::models::Action;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Backoff parameters for transient failures
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    /// Upper bound of the random jitter added to each delay
    pub max_jitter: Duration,
    /// Cap applied to the exponential part
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            multiplier: 2.0,
            max_jitter: Duration::from_millis(250),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Policy that never waits between attempts
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            multiplier: 1.0,
            max_jitter: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// `base_delay * multiplier^attempt`, capped at `max_delay`. `attempt` is zero-based.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let delay = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = delay.min(self.max_delay.as_secs_f64());
        if capped.is_finite() && capped > 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            Duration::ZERO
        }
    }

    /// Backoff plus uniform jitter in `[0, max_jitter]`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let jitter_ms = self.max_jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        self.backoff(attempt) + Duration::from_millis(jitter)
    }
}

/// How a resilient execution ended
#[derive(Debug, Clone, PartialEq)]
pub enum ResilientOutcome {
    Succeeded(serde_json::Value),
    /// Every allowed attempt failed transiently
    TransientExhausted(String),
    Permanent(String),
    /// The circuit refused the call before an attempt could be made
    CircuitOpen { retry_after_ms: u64 },
}

/// Result of driving an action through retries and the circuit breaker
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub outcome: ResilientOutcome,
    /// Executor invocations made
    pub attempts: u32,
    /// Attempts beyond the first
    pub retries: u32,
    /// Circuit transitions observed along the way
    pub transitions: Vec<CircuitTransition>,
}

impl ExecutionReport {
    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, ResilientOutcome::Succeeded(_))
    }

    /// Circuit refused the very first attempt, so the executor never ran
    pub fn failed_fast(&self) -> bool {
        self.attempts == 0 && matches!(self.outcome, ResilientOutcome::CircuitOpen { .. })
    }

    /// Map to the caller-facing result
    pub fn into_result(self, target: &str) -> Result<serde_json::Value, RemediationError> {
        match self.outcome {
            ResilientOutcome::Succeeded(value) => Ok(value),
            ResilientOutcome::Permanent(message) => Err(RemediationError::PermanentExecutionFailure {
                target: target.to_string(),
                message,
            }),
            ResilientOutcome::TransientExhausted(message) => {
                Err(RemediationError::TransientExecutionFailure {
                    target: target.to_string(),
                    attempts: self.attempts,
                    message,
                })
            }
            ResilientOutcome::CircuitOpen { retry_after_ms } if self.attempts == 0 => {
                Err(RemediationError::CircuitOpenFailFast {
                    target: target.to_string(),
                    retry_after_ms,
                })
            }
            ResilientOutcome::CircuitOpen { .. } => Err(RemediationError::TransientExecutionFailure {
                target: target.to_string(),
                attempts: self.attempts,
                message: "circuit opened while retrying".to_string(),
            }),
        }
    }
}

/// Wraps an executor with per-target circuit breaking and backoff retries
pub struct ResilientExecutor {
    executor: Arc<dyn Executor>,
    breakers: Arc<CircuitBreakerRegistry>,
    policy: RetryPolicy,
}

impl ResilientExecutor {
    pub fn new(
        executor: Arc<dyn Executor>,
        breakers: Arc<CircuitBreakerRegistry>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            executor,
            breakers,
            policy,
        }
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `action`, retrying transient failures while the circuit allows it.
    ///
    /// Backoff sleeps suspend only the calling task.
    pub async fn run(&self, action: &Action) -> ExecutionReport {
        let target = action.normalized_target();
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempts = 0u32;
        let mut transitions = Vec::new();

        loop {
            match self.breakers.acquire(&target) {
                Ok(transition) => transitions.extend(transition),
                Err(open) => {
                    warn!(action_target = %target, attempts, "Circuit open; failing fast");
                    return ExecutionReport {
                        outcome: ResilientOutcome::CircuitOpen {
                            retry_after_ms: open.retry_after_ms,
                        },
                        attempts,
                        retries: attempts.saturating_sub(1),
                        transitions,
                    };
                }
            }

            attempts += 1;
            let outcome = self.executor.execute(action).await;

            let finished = match outcome {
                ExecutorOutcome::Success(value) => {
                    transitions.extend(self.breakers.record_success(&target));
                    if attempts > 1 {
                        info!(action_target = %target, attempts, "Action succeeded after retries");
                    }
                    Some(ResilientOutcome::Succeeded(value))
                }
                // Bad input says nothing about the target's health
                ExecutorOutcome::PermanentFailure(message) => {
                    warn!(action_target = %target, error = %message, "Permanent failure; not retrying");
                    Some(ResilientOutcome::Permanent(message))
                }
                ExecutorOutcome::TransientFailure(message) => {
                    transitions.extend(self.breakers.record_failure(&target));
                    if attempts >= max_attempts {
                        warn!(
                            action_target = %target,
                            attempts,
                            error = %message,
                            "Retries exhausted"
                        );
                        Some(ResilientOutcome::TransientExhausted(message))
                    } else {
                        let delay = self.policy.delay_for(attempts - 1);
                        warn!(
                            action_target = %target,
                            attempt = attempts,
                            max_attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = %message,
                            "Transient failure; retrying"
                        );
                        tokio::time::sleep(delay).await;
                        None
                    }
                }
            };

            if let Some(outcome) = finished {
                return ExecutionReport {
                    outcome,
                    attempts,
                    retries: attempts - 1,
                    transitions,
                };
            }
        }
    }
}
