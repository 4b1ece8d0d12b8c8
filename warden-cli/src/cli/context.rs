//! Configuration loading and component wiring shared by all commands

use anyhow::{anyhow, Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use warden_core::execution::CommandExecutor;
use warden_core::models::Configuration;
use warden_core::services::init_logging;
use warden_core::workflow::{RemediationService, RemediationWorkflow};

/// Resolve `--config` or fall back to the XDG default
pub fn resolve_config_path(config: Option<PathBuf>) -> Result<PathBuf> {
    match config {
        Some(path) => Ok(path),
        None => Configuration::default_config_path()
            .map_err(|e| anyhow!("Failed to get default config path: {}", e)),
    }
}

/// Load and validate configuration, then start logging
pub fn load_configuration(config: Option<PathBuf>) -> Result<Configuration> {
    let path = resolve_config_path(config)?;
    let configuration = Configuration::load_from_file(&path)?;

    if let Err(errors) = configuration.validate() {
        return Err(anyhow!(
            "Invalid configuration {}:\n  {}",
            path.display(),
            errors.join("\n  ")
        ));
    }

    // Logging may already be set up when commands are chained in tests
    let _ = init_logging(configuration.log_level);

    Ok(configuration)
}

pub fn build_workflow(config: &Configuration) -> Result<Arc<RemediationWorkflow>> {
    let signer = config
        .audit
        .load_signer()
        .context("Run 'warden config --init' to create a signing key")?;
    let executor = Arc::new(CommandExecutor::from_settings(&config.executor));

    let workflow = RemediationWorkflow::from_configuration(config, executor, signer)
        .with_context(|| format!("Failed to open governance store in {}", config.data_dir().display()))?;
    Ok(Arc::new(workflow))
}

pub fn build_service(config: &Configuration) -> Result<Arc<RemediationService>> {
    let workflow = build_workflow(config)?;
    Ok(Arc::new(RemediationService::from_configuration(
        config, workflow,
    )))
}
