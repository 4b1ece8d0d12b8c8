//! Logging service

use crate::models::LogLevel;

/// Initialize logging with the specified level.
///
/// `RUST_LOG` takes precedence over the configured level when set.
pub fn init_logging(level: LogLevel) -> anyhow::Result<()> {
    let filter = match level {
        LogLevel::Error => "warden=error",
        LogLevel::Warn => "warden=warn",
        LogLevel::Info => "warden=info",
        LogLevel::Debug => "warden=debug",
        LogLevel::Trace => "warden=trace",
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    Ok(())
}

/// Log a governance transition
pub fn log_transition(event_type: &str, playbook_id: &str, actor: &str, details: Option<&str>) {
    tracing::info!(
        event_type = event_type,
        playbook_id = playbook_id,
        actor = actor,
        details = details.unwrap_or(""),
        "Governance transition"
    );
}

/// Log a security event (always logged regardless of level)
pub fn log_security_event(event_type: &str, target: &str, actor: Option<&str>, details: &str) {
    tracing::warn!(
        event_type = event_type,
        action_target = target,
        actor = actor.unwrap_or("unknown"),
        details = details,
        "Security event"
    );
}

/// Log a system error
pub fn log_error(error: &str, context: Option<&str>) {
    tracing::error!(
        error = error,
        context = context.unwrap_or(""),
        "System error occurred"
    );
}
