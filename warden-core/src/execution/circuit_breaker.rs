//! Per-target circuit breakers

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{info, warn};

/// Health state of a single target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Failures further apart than this start a new streak
    pub failure_window: Duration,
    /// Time spent OPEN before a trial call is let through
    pub recovery_timeout: Duration,
    /// Consecutive HALF_OPEN successes that close the circuit
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window: Duration::from_secs(60),
            recovery_timeout: Duration::from_secs(30),
            success_threshold: 2,
        }
    }
}

/// Point-in-time view of a target's circuit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    pub target: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub opened_at: Option<DateTime<Utc>>,
}

/// A state change, returned so the caller can audit it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitTransition {
    pub target: String,
    pub from: CircuitState,
    pub to: CircuitState,
    pub consecutive_failures: u32,
    pub at: DateTime<Utc>,
}

/// The circuit refused the call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitOpen {
    pub retry_after_ms: u64,
}

#[derive(Debug)]
struct TargetCircuit {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    streak_started_at: Option<DateTime<Utc>>,
    last_failure_at: Option<DateTime<Utc>>,
    opened_at: Option<DateTime<Utc>>,
}

impl TargetCircuit {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            streak_started_at: None,
            last_failure_at: None,
            opened_at: None,
        }
    }

    fn transition(&mut self, target: &str, to: CircuitState, at: DateTime<Utc>) -> CircuitTransition {
        let from = self.state;
        self.state = to;
        CircuitTransition {
            target: target.to_string(),
            from,
            to,
            consecutive_failures: self.consecutive_failures,
            at,
        }
    }

    fn snapshot(&self, target: &str) -> CircuitSnapshot {
        CircuitSnapshot {
            target: target.to_string(),
            state: self.state,
            consecutive_failures: self.consecutive_failures,
            consecutive_successes: self.consecutive_successes,
            last_failure_at: self.last_failure_at,
            opened_at: self.opened_at,
        }
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

/// Circuit breakers keyed by normalized target.
///
/// Each target sits behind its own mutex, so a slow or failing target never
/// blocks bookkeeping for unrelated ones.
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    circuits: DashMap<String, Arc<Mutex<TargetCircuit>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            circuits: DashMap::new(),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn circuit(&self, target: &str) -> Arc<Mutex<TargetCircuit>> {
        self.circuits
            .entry(target.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(TargetCircuit::new())))
            .clone()
    }

    /// Ask permission to call `target`
    pub fn acquire(&self, target: &str) -> Result<Option<CircuitTransition>, CircuitOpen> {
        self.acquire_at(target, Utc::now())
    }

    pub fn acquire_at(
        &self,
        target: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<CircuitTransition>, CircuitOpen> {
        let circuit = self.circuit(target);
        let mut circuit = circuit.lock().unwrap_or_else(PoisonError::into_inner);

        if circuit.state != CircuitState::Open {
            return Ok(None);
        }

        let opened_at = circuit.opened_at.unwrap_or(now);
        let reopen_at = opened_at + to_chrono(self.config.recovery_timeout);
        if now < reopen_at {
            let retry_after_ms = (reopen_at - now).num_milliseconds().max(0) as u64;
            return Err(CircuitOpen { retry_after_ms });
        }

        circuit.consecutive_successes = 0;
        let transition = circuit.transition(target, CircuitState::HalfOpen, now);
        info!(action_target = %target, "Circuit half-open; probing target");
        Ok(Some(transition))
    }

    pub fn record_success(&self, target: &str) -> Option<CircuitTransition> {
        self.record_success_at(target, Utc::now())
    }

    pub fn record_success_at(&self, target: &str, now: DateTime<Utc>) -> Option<CircuitTransition> {
        let circuit = self.circuit(target);
        let mut circuit = circuit.lock().unwrap_or_else(PoisonError::into_inner);

        circuit.consecutive_failures = 0;
        circuit.streak_started_at = None;

        match circuit.state {
            CircuitState::HalfOpen => {
                circuit.consecutive_successes += 1;
                if circuit.consecutive_successes >= self.config.success_threshold {
                    circuit.opened_at = None;
                    circuit.consecutive_successes = 0;
                    info!(action_target = %target, "Circuit closed");
                    return Some(circuit.transition(target, CircuitState::Closed, now));
                }
                None
            }
            _ => None,
        }
    }

    pub fn record_failure(&self, target: &str) -> Option<CircuitTransition> {
        self.record_failure_at(target, Utc::now())
    }

    pub fn record_failure_at(&self, target: &str, now: DateTime<Utc>) -> Option<CircuitTransition> {
        let circuit = self.circuit(target);
        let mut circuit = circuit.lock().unwrap_or_else(PoisonError::into_inner);

        circuit.last_failure_at = Some(now);
        circuit.consecutive_successes = 0;

        match circuit.state {
            CircuitState::HalfOpen => {
                circuit.opened_at = Some(now);
                warn!(action_target = %target, "Trial call failed; circuit re-opened");
                Some(circuit.transition(target, CircuitState::Open, now))
            }
            CircuitState::Open => None,
            CircuitState::Closed => {
                let window = to_chrono(self.config.failure_window);
                let streak_expired = circuit
                    .streak_started_at
                    .map_or(true, |started| now - started > window);
                if streak_expired {
                    circuit.streak_started_at = Some(now);
                    circuit.consecutive_failures = 0;
                }

                circuit.consecutive_failures += 1;
                if circuit.consecutive_failures >= self.config.failure_threshold {
                    circuit.opened_at = Some(now);
                    warn!(
                        action_target = %target,
                        failures = circuit.consecutive_failures,
                        "Circuit opened"
                    );
                    return Some(circuit.transition(target, CircuitState::Open, now));
                }
                None
            }
        }
    }

    /// Current state; unknown targets are CLOSED
    pub fn state(&self, target: &str) -> CircuitState {
        self.circuits
            .get(target)
            .map(|circuit| circuit.lock().unwrap_or_else(PoisonError::into_inner).state)
            .unwrap_or(CircuitState::Closed)
    }

    pub fn snapshot(&self, target: &str) -> Option<CircuitSnapshot> {
        self.circuits.get(target).map(|circuit| {
            circuit
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .snapshot(target)
        })
    }

    /// Snapshots of every known target, sorted by target
    pub fn snapshots(&self) -> Vec<CircuitSnapshot> {
        let mut snapshots: Vec<CircuitSnapshot> = self
            .circuits
            .iter()
            .map(|entry| {
                entry
                    .value()
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .snapshot(entry.key())
            })
            .collect();
        snapshots.sort_by(|a, b| a.target.cmp(&b.target));
        snapshots
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
