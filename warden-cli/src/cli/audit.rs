//! Audit CLI commands

use crate::cli::context::{build_workflow, load_configuration};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use clap::Subcommand;
use std::path::PathBuf;
use warden_core::audit::write_jsonl;
use warden_core::models::{AuditEventType, AuditFilter};

#[derive(Subcommand)]
pub enum AuditCommands {
    /// Export audit entries as JSON Lines
    Export {
        /// Only entries at or after this RFC 3339 timestamp
        #[arg(long)]
        since: Option<DateTime<Utc>>,

        /// Only entries before this RFC 3339 timestamp
        #[arg(long)]
        until: Option<DateTime<Utc>>,

        /// Only entries caused by this actor
        #[arg(long)]
        actor: Option<String>,

        /// Only entries of this type (e.g. execution_started)
        #[arg(long)]
        event_type: Option<AuditEventType>,

        /// Output file (stdout when omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Verify hash links and signatures of the whole chain
    Verify,
}

/// Handle 'audit export'
pub async fn handle_audit_export(
    config: Option<PathBuf>,
    since: Option<DateTime<Utc>>,
    until: Option<DateTime<Utc>>,
    actor: Option<String>,
    event_type: Option<AuditEventType>,
    output: Option<PathBuf>,
) -> Result<()> {
    let configuration = load_configuration(config)?;
    let workflow = build_workflow(&configuration)?;

    let filter = AuditFilter {
        since,
        until,
        actor,
        event_type,
    };
    let entries = workflow.audit().export(&filter)?;

    match output {
        Some(path) => {
            let file = std::fs::File::create(&path)
                .with_context(|| format!("Failed to create {}", path.display()))?;
            write_jsonl(&entries, std::io::BufWriter::new(file))?;
            eprintln!("Exported {} entries to {}", entries.len(), path.display());
        }
        None => write_jsonl(&entries, std::io::stdout().lock())?,
    }

    Ok(())
}

/// Handle 'audit verify'; a broken chain is reported as an error exit
pub async fn handle_audit_verify(config: Option<PathBuf>, json: bool) -> Result<()> {
    let configuration = load_configuration(config)?;
    let workflow = build_workflow(&configuration)?;

    let result = workflow.audit().verify()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else if result.valid {
        println!(
            "✅ Audit chain intact: {} of {} entries verified",
            result.verified_entries, result.total_entries
        );
    } else {
        println!(
            "❌ Audit chain broken: {} of {} entries verified",
            result.verified_entries, result.total_entries
        );
    }

    if !result.valid {
        return Err(anyhow!(
            "Audit chain verification failed at sequence {}: {}",
            result
                .first_invalid_sequence
                .map(|s| s.to_string())
                .unwrap_or_else(|| "?".to_string()),
            result.error_message.unwrap_or_default()
        ));
    }

    Ok(())
}
