//! Configuration data structures

use crate::audit::AuditSigner;
use crate::execution::{CircuitBreakerConfig, RetryPolicy};
use crate::queue::{OverflowStrategy, QueueConfig};
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable that overrides the configured signing key
pub const SIGNING_KEY_ENV: &str = "WARDEN_SIGNING_KEY";

/// Longest accepted approval or execution TTL (ten years)
pub const MAX_TTL_SECONDS: u64 = 10 * 365 * 86_400;

/// TTL as a chrono duration, clamped so timestamp arithmetic cannot overflow
fn ttl(seconds: u64) -> chrono::Duration {
    chrono::Duration::seconds(seconds.min(MAX_TTL_SECONDS) as i64)
}

/// Logging level configuration
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub enum LogLevel {
    #[serde(rename = "error")]
    Error,
    #[serde(rename = "warn")]
    Warn,
    #[serde(rename = "info")]
    #[default]
    Info,
    #[serde(rename = "debug")]
    Debug,
    #[serde(rename = "trace")]
    Trace,
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Configuration {
    /// Logging verbosity level
    pub log_level: LogLevel,
    /// Directory holding the governance store
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    pub policy: PolicySettings,
    pub tracker: TrackerSettings,
    pub circuit_breaker: CircuitBreakerSettings,
    pub retry: RetrySettings,
    pub queue: QueueSettings,
    pub workflow: WorkflowSettings,
    pub audit: AuditSettings,
    pub executor: ExecutorSettings,
    pub server: ServerSettings,
}

/// Policy engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicySettings {
    /// Action types with an established track record
    pub known_action_types: Vec<String>,
    /// Action types that always need a human decision
    pub approval_required_actions: Vec<String>,
}

impl Default for PolicySettings {
    fn default() -> Self {
        Self {
            known_action_types: vec![
                "block_ip".to_string(),
                "unblock_ip".to_string(),
                "suspend_session".to_string(),
                "suspend_user".to_string(),
            ],
            approval_required_actions: vec!["suspend_user".to_string()],
        }
    }
}

/// Execution tracker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerSettings {
    /// How long an execution blocks identical requests
    pub execution_ttl_seconds: u64,
    /// Interval of the background expiry sweep
    pub sweep_interval_seconds: u64,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            execution_ttl_seconds: 86_400,
            sweep_interval_seconds: 60,
        }
    }
}

impl TrackerSettings {
    pub fn execution_ttl(&self) -> chrono::Duration {
        ttl(self.execution_ttl_seconds)
    }
}

/// Circuit breaker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    pub failure_threshold: u32,
    pub failure_window_seconds: u64,
    pub recovery_timeout_seconds: u64,
    pub success_threshold: u32,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window_seconds: 60,
            recovery_timeout_seconds: 30,
            success_threshold: 2,
        }
    }
}

impl CircuitBreakerSettings {
    pub fn to_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            failure_window: Duration::from_secs(self.failure_window_seconds),
            recovery_timeout: Duration::from_secs(self.recovery_timeout_seconds),
            success_threshold: self.success_threshold,
        }
    }
}

/// Retry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Total attempts including the first (1-10)
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    /// Backoff multiplier (1.0-10.0)
    pub multiplier: f64,
    /// Upper bound of the random jitter added to each delay
    pub max_jitter_ms: u64,
    /// Cap applied before jitter
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            multiplier: 2.0,
            max_jitter_ms: 250,
            max_delay_ms: 30_000,
        }
    }
}

impl RetrySettings {
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            multiplier: self.multiplier,
            max_jitter: Duration::from_millis(self.max_jitter_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }
}

/// Bounded queue settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    pub capacity: usize,
    pub strategy: OverflowStrategy,
    /// How long producers may wait under the block strategy
    pub put_timeout_ms: u64,
    /// Utilization ratio (0, 1] that raises an alert
    pub alert_threshold: f64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            capacity: 256,
            strategy: OverflowStrategy::Block,
            put_timeout_ms: 1_000,
            alert_threshold: 0.8,
        }
    }
}

impl QueueSettings {
    pub fn to_config(&self) -> QueueConfig {
        QueueConfig {
            capacity: self.capacity,
            strategy: self.strategy,
            alert_threshold: self.alert_threshold,
        }
    }

    pub fn put_timeout(&self) -> Duration {
        Duration::from_millis(self.put_timeout_ms)
    }
}

/// Approval workflow settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowSettings {
    /// How long an approval stays executable
    pub approval_ttl_seconds: u64,
    /// Consumer workers draining the queue
    pub workers: usize,
    /// Interval of the approval expiry sweep
    pub expiry_sweep_interval_seconds: u64,
}

impl WorkflowSettings {
    pub fn approval_ttl(&self) -> chrono::Duration {
        ttl(self.approval_ttl_seconds)
    }
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            approval_ttl_seconds: 3_600,
            workers: 2,
            expiry_sweep_interval_seconds: 60,
        }
    }
}

/// Audit signing key location
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AuditSettings {
    /// Hex-encoded 32-byte Ed25519 seed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signing_key_hex: Option<String>,
    /// File containing the hex seed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signing_key_path: Option<PathBuf>,
}

impl AuditSettings {
    /// Resolve the deployment signing key: environment, inline hex, then key file
    pub fn load_signer(&self) -> Result<AuditSigner> {
        if let Ok(seed) = std::env::var(SIGNING_KEY_ENV) {
            return AuditSigner::from_seed_hex(&seed)
                .with_context(|| format!("Invalid signing key in ${}", SIGNING_KEY_ENV));
        }

        if let Some(seed) = &self.signing_key_hex {
            return AuditSigner::from_seed_hex(seed).context("Invalid audit.signing_key_hex");
        }

        if let Some(path) = &self.signing_key_path {
            let seed = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read signing key {}", path.display()))?;
            return AuditSigner::from_seed_hex(&seed)
                .with_context(|| format!("Invalid signing key in {}", path.display()));
        }

        Err(anyhow!(
            "No audit signing key configured (set ${}, audit.signing_key_hex or audit.signing_key_path)",
            SIGNING_KEY_ENV
        ))
    }
}

/// Settings for the shipped command executor
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorSettings {
    pub command_timeout_seconds: u64,
    /// Shell command per action type
    pub commands: BTreeMap<String, String>,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            command_timeout_seconds: 30,
            commands: BTreeMap::new(),
        }
    }
}

/// Admin API bind settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// IP literal or resolvable host name
    pub host: String,
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8790,
        }
    }
}

impl Configuration {
    /// Load configuration from file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config {}", path.display()))?;
            let config: Configuration = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config {}", path.display()))?;
            Ok(config)
        } else {
            // Return default configuration if file doesn't exist
            Ok(Configuration::default())
        }
    }

    /// Save configuration to file
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config {}", path.display()))?;
        Ok(())
    }

    /// Get the XDG config directory path
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir =
            dirs::config_dir().ok_or_else(|| anyhow!("Could not determine config directory"))?;
        Ok(config_dir.join("warden").join("config.toml"))
    }

    /// Directory holding the governance store
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .map(|dir| dir.join("warden"))
                .unwrap_or_else(|| PathBuf::from(".warden"))
        })
    }

    /// Path of the JSON governance store
    pub fn store_path(&self) -> PathBuf {
        self.data_dir().join("governance_store.json")
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.circuit_breaker.failure_threshold == 0 {
            errors.push("circuit_breaker.failure_threshold must be at least 1".to_string());
        }
        if self.circuit_breaker.success_threshold == 0 {
            errors.push("circuit_breaker.success_threshold must be at least 1".to_string());
        }
        if self.circuit_breaker.failure_window_seconds == 0 {
            errors.push("circuit_breaker.failure_window_seconds must be positive".to_string());
        }

        if !(1..=10).contains(&self.retry.max_attempts) {
            errors.push("retry.max_attempts must be between 1 and 10".to_string());
        }
        if !(1.0..=10.0).contains(&self.retry.multiplier) {
            errors.push("retry.multiplier must be between 1.0 and 10.0".to_string());
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            errors.push("retry.base_delay_ms cannot exceed retry.max_delay_ms".to_string());
        }

        if self.queue.capacity == 0 || self.queue.capacity > 1_000_000 {
            errors.push("queue.capacity must be between 1 and 1000000".to_string());
        }
        if !(self.queue.alert_threshold > 0.0 && self.queue.alert_threshold <= 1.0) {
            errors.push("queue.alert_threshold must be in (0, 1]".to_string());
        }

        if !(1..=MAX_TTL_SECONDS).contains(&self.tracker.execution_ttl_seconds) {
            errors.push(format!(
                "tracker.execution_ttl_seconds must be between 1 and {}",
                MAX_TTL_SECONDS
            ));
        }
        if !(1..=MAX_TTL_SECONDS).contains(&self.workflow.approval_ttl_seconds) {
            errors.push(format!(
                "workflow.approval_ttl_seconds must be between 1 and {}",
                MAX_TTL_SECONDS
            ));
        }
        if !(1..=64).contains(&self.workflow.workers) {
            errors.push("workflow.workers must be between 1 and 64".to_string());
        }

        // Validate port (u16 is already 0-65535, so only check minimum)
        if self.server.port < 1024 {
            errors.push(
                "server.port must be at least 1024 (privileged ports not allowed)".to_string(),
            );
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
