//! Executor seam and the shipped shell command executor

use crate::models::{Action, ExecutorSettings};
use async_trait::async_trait;
use serde_json::json;
use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::time::timeout;

/// What the downstream system reported for one attempt
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutorOutcome {
    /// The side effect happened; carries executor output
    Success(serde_json::Value),
    /// Worth retrying (timeouts, throttling, flaky targets)
    TransientFailure(String),
    /// Retrying cannot help (invalid target or parameters)
    PermanentFailure(String),
}

impl ExecutorOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ExecutorOutcome::Success(_))
    }
}

/// Performs the real side effect of an action.
///
/// Only invoked once policy, approval, duplicate check and circuit breaker
/// have all cleared the action.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, action: &Action) -> ExecutorOutcome;
}

/// Runs a configured shell command per action type.
///
/// The action reaches the command through `WARDEN_ACTION`, `WARDEN_TARGET`
/// and one `WARDEN_PARAM_<KEY>` variable per parameter.
pub struct CommandExecutor {
    commands: BTreeMap<String, String>,
    timeout: Duration,
}

impl CommandExecutor {
    pub fn new(commands: BTreeMap<String, String>, timeout: Duration) -> Self {
        Self { commands, timeout }
    }

    pub fn from_settings(settings: &ExecutorSettings) -> Self {
        Self::new(
            settings.commands.clone(),
            Duration::from_secs(settings.command_timeout_seconds),
        )
    }

    /// Exit codes 1-10 and SIGTERM are transient; anything else is permanent
    fn is_transient_exit(exit_code: Option<i32>) -> bool {
        match exit_code {
            Some(code) if (1..=10).contains(&code) => true,
            Some(143) => true,
            _ => false,
        }
    }

    fn parameter_env_name(key: &str) -> String {
        let sanitized: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("WARDEN_PARAM_{}", sanitized)
    }

    fn build_command(command: &str, action: &Action) -> Command {
        let mut cmd = Command::new("bash");
        cmd.arg("-c")
            .arg(command)
            .env("WARDEN_ACTION", &action.name)
            .env("WARDEN_TARGET", &action.target)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        for (key, value) in &action.parameters {
            let value = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            cmd.env(Self::parameter_env_name(key), value);
        }

        cmd
    }
}

#[async_trait]
impl Executor for CommandExecutor {
    async fn execute(&self, action: &Action) -> ExecutorOutcome {
        let Some(command) = self.commands.get(&action.name) else {
            return ExecutorOutcome::PermanentFailure(format!(
                "no command configured for action type '{}'",
                action.name
            ));
        };

        let start_time = Instant::now();

        let mut child = match Self::build_command(command, action).spawn() {
            Ok(child) => child,
            Err(e) => {
                return ExecutorOutcome::PermanentFailure(format!(
                    "failed to spawn bash process: {}",
                    e
                ))
            }
        };

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let stdout_task = tokio::spawn(async move {
            let mut collected = Vec::new();
            if let Some(stdout) = stdout {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    collected.push(line);
                }
            }
            collected
        });

        let stderr_task = tokio::spawn(async move {
            if let Some(stderr) = stderr {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!("stderr: {}", line);
                }
            }
        });

        let wait_result = timeout(self.timeout, child.wait()).await;

        if wait_result.is_err() {
            let _ = child.kill().await;
        }

        let output = stdout_task.await.unwrap_or_default();
        let _ = stderr_task.await;
        let duration_ms = start_time.elapsed().as_millis() as u64;

        match wait_result {
            Ok(Ok(status)) if status.success() => ExecutorOutcome::Success(json!({
                "exit_code": status.code(),
                "duration_ms": duration_ms,
                "output": output,
            })),
            Ok(Ok(status)) => {
                let exit_code = status.code();
                let message = format!("command exited with code {:?}", exit_code);
                if Self::is_transient_exit(exit_code) {
                    ExecutorOutcome::TransientFailure(message)
                } else {
                    ExecutorOutcome::PermanentFailure(message)
                }
            }
            Ok(Err(e)) => ExecutorOutcome::TransientFailure(format!("failed to wait for process: {}", e)),
            Err(_) => ExecutorOutcome::TransientFailure(format!(
                "command timed out after {} seconds",
                self.timeout.as_secs()
            )),
        }
    }
}
