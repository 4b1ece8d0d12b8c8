mod cli;

use anyhow::Result;
use clap::{Parser, Subcommand};
use cli::handlers;
use std::path::PathBuf;
use uuid::Uuid;
use warden_core::models::{Environment, PlaybookStatus, Role, Severity};

#[derive(Parser)]
#[command(name = "warden")]
#[command(version)]
#[command(about = "Governance layer for automated security remediation")]
#[command(
    help_template = "{name} - {version}\n{about}\n\n{usage-heading}\n  {usage}\n\n{all-args}{options}\n"
)]
struct Cli {
    /// Path to configuration file (default: ~/.config/warden/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output in JSON format
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Propose a remediation and drive it as far as policy allows
    ///
    /// Allowed actions run immediately, dry-run-only actions are simulated,
    /// and anything else waits for approval.
    ///
    /// Examples:
    ///   warden submit --alert-id A-17 --action block_ip --target 93.184.216.34
    ///   warden submit --alert-id A-18 --action suspend_user --target mallory --severity critical
    Submit {
        /// Identifier of the triggering alert
        #[arg(long)]
        alert_id: String,

        /// Action type (block_ip, unblock_ip, suspend_session, suspend_user, ...)
        #[arg(short, long)]
        action: String,

        /// Action target (IP address, session id, user name)
        #[arg(short, long)]
        target: String,

        /// Alert severity
        #[arg(short, long, default_value = "medium")]
        severity: Severity,

        /// Environment the alert came from
        #[arg(short, long, default_value = "production")]
        environment: Environment,

        /// Detector or person asking for the action
        #[arg(long, default_value = "cli")]
        requested_by: String,

        /// Justification recorded on the playbook
        #[arg(long)]
        justification: Option<String>,

        /// Executor parameter as key=value (repeatable)
        #[arg(short, long = "param")]
        params: Vec<String>,
    },

    /// Show one playbook with its approvals and executions
    Status {
        /// Playbook ID (UUID)
        playbook_id: Uuid,
    },

    /// List playbooks
    List {
        /// Only playbooks in this state (e.g. pending_approval)
        #[arg(short, long)]
        status: Option<PlaybookStatus>,
    },

    /// List playbooks waiting for approval
    Approvals,

    /// Approve a pending playbook
    Approve {
        playbook_id: Uuid,

        /// Approver identity
        #[arg(long)]
        actor: String,

        #[arg(long, default_value = "approver")]
        role: Role,

        #[arg(short, long)]
        comment: Option<String>,
    },

    /// Reject a pending playbook
    Reject {
        playbook_id: Uuid,

        /// Approver identity
        #[arg(long)]
        actor: String,

        #[arg(long, default_value = "approver")]
        role: Role,

        /// Reason recorded on the playbook
        #[arg(short, long)]
        comment: Option<String>,
    },

    /// Promote a dry-run playbook into the approval queue
    Promote {
        playbook_id: Uuid,

        #[arg(long)]
        actor: String,

        #[arg(long, default_value = "admin")]
        role: Role,
    },

    /// Execute an approved playbook (dry-run playbooks are simulated)
    Execute {
        playbook_id: Uuid,

        #[arg(long)]
        actor: String,

        #[arg(long, default_value = "executor")]
        role: Role,
    },

    /// Expire approved playbooks whose approval window has passed
    Expire,

    /// Show circuit breaker state per target
    Circuits,

    /// Audit log commands
    Audit {
        #[command(subcommand)]
        command: cli::audit::AuditCommands,
    },

    /// Process a JSON Lines file of requests through the bounded queue
    Run {
        /// Input file ("-" for stdin)
        #[arg(short, long, default_value = "-")]
        input: String,

        /// Worker count (overrides workflow.workers)
        #[arg(short, long)]
        workers: Option<usize>,
    },

    /// Run queue workers, sweepers and the admin API until Ctrl+C
    Serve {
        /// Bind address (overrides server.host)
        #[arg(long)]
        host: Option<String>,

        /// Port (overrides server.port)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Write a configuration file and audit signing key
    Config {
        /// Create the configuration
        #[arg(long)]
        init: bool,

        /// Replace the signing key; refused once the audit chain holds entries
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let json = cli.json;
    let config_path = cli.config;

    match cli.command {
        Commands::Config { init, force } => {
            if init {
                handlers::handle_config_init(config_path, force, json).await?;
            } else {
                println!("Config command requires --init flag");
                println!("Usage: warden config --init [--config PATH] [--force]");
            }
        }
        Commands::Submit {
            alert_id,
            action,
            target,
            severity,
            environment,
            requested_by,
            justification,
            params,
        } => {
            let request = handlers::build_request(
                alert_id,
                action,
                target,
                severity,
                environment,
                requested_by,
                justification,
                &params,
            )?;
            handlers::handle_submit(config_path, request, json).await?;
        }
        Commands::Status { playbook_id } => {
            handlers::handle_status(config_path, playbook_id, json).await?;
        }
        Commands::List { status } => {
            handlers::handle_list(config_path, status, json).await?;
        }
        Commands::Approvals => {
            handlers::handle_list(config_path, Some(PlaybookStatus::PendingApproval), json)
                .await?;
        }
        Commands::Approve {
            playbook_id,
            actor,
            role,
            comment,
        } => {
            handlers::handle_approve(config_path, playbook_id, actor, role, comment, json).await?;
        }
        Commands::Reject {
            playbook_id,
            actor,
            role,
            comment,
        } => {
            handlers::handle_reject(config_path, playbook_id, actor, role, comment, json).await?;
        }
        Commands::Promote {
            playbook_id,
            actor,
            role,
        } => {
            handlers::handle_promote(config_path, playbook_id, actor, role, json).await?;
        }
        Commands::Execute {
            playbook_id,
            actor,
            role,
        } => {
            handlers::handle_execute(config_path, playbook_id, actor, role, json).await?;
        }
        Commands::Expire => {
            handlers::handle_expire(config_path, json).await?;
        }
        Commands::Circuits => {
            handlers::handle_circuits(config_path, json).await?;
        }
        Commands::Audit { command } => {
            use cli::audit::AuditCommands;

            match command {
                AuditCommands::Export {
                    since,
                    until,
                    actor,
                    event_type,
                    output,
                } => {
                    cli::audit::handle_audit_export(
                        config_path,
                        since,
                        until,
                        actor,
                        event_type,
                        output,
                    )
                    .await?;
                }
                AuditCommands::Verify => {
                    cli::audit::handle_audit_verify(config_path, json).await?;
                }
            }
        }
        Commands::Run { input, workers } => {
            handlers::handle_run(config_path, input, workers, json).await?;
        }
        Commands::Serve { host, port } => {
            handlers::handle_serve(config_path, host, port).await?;
        }
    }

    Ok(())
}
