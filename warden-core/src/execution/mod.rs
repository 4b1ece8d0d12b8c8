//! Execution tracking, circuit breaking, retries and the executor seam

pub mod circuit_breaker;
pub mod executor;
pub mod retry;
pub mod tracker;

pub use circuit_breaker::{
    CircuitBreakerConfig, CircuitBreakerRegistry, CircuitOpen, CircuitSnapshot, CircuitState,
    CircuitTransition,
};
pub use executor::{CommandExecutor, Executor, ExecutorOutcome};
pub use retry::{ExecutionReport, ResilientExecutor, ResilientOutcome, RetryPolicy};
pub use tracker::{fingerprint, ClaimOutcome, ExecutionTracker, TrackerStats};
