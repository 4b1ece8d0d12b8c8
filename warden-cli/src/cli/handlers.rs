//! CLI command handlers

use crate::cli::context::{build_service, build_workflow, load_configuration, resolve_config_path};
use crate::cli::output::{
    print_approvals, print_executions, print_json, print_outcome, print_playbook,
    print_playbook_row,
};
use anyhow::{anyhow, Context, Result};
use std::collections::BTreeMap;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use uuid::Uuid;
use warden_core::audit::{AuditSigner, AuditSink};
use warden_core::models::{
    Actor, Configuration, Environment, PlaybookStatus, RemediationRequest, Role, Severity,
};
use warden_core::server::WardenServer;
use warden_core::workflow::GovernanceStore;

/// Parse `key=value`; values that are valid JSON keep their type
fn parse_param(raw: &str) -> Result<(String, serde_json::Value)> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| anyhow!("Invalid parameter '{}' (expected key=value)", raw))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(anyhow!("Invalid parameter '{}' (empty key)", raw));
    }
    let value = serde_json::from_str(value)
        .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

/// Identity of a human operator; the system role belongs to the built-in worker
fn operator(actor: String, role: Role) -> Result<Actor> {
    if role == Role::System {
        return Err(anyhow!(
            "Role 'system' is reserved for the built-in worker; use admin, approver or executor"
        ));
    }
    Ok(Actor::new(actor, role))
}

#[allow(clippy::too_many_arguments)]
pub fn build_request(
    alert_id: String,
    action: String,
    target: String,
    severity: Severity,
    environment: Environment,
    requested_by: String,
    justification: Option<String>,
    params: &[String],
) -> Result<RemediationRequest> {
    let parameters = params
        .iter()
        .map(|raw| parse_param(raw))
        .collect::<Result<BTreeMap<_, _>>>()?;

    Ok(RemediationRequest {
        alert_id,
        action_type: action,
        target,
        severity,
        environment,
        requested_by,
        justification,
        parameters,
    })
}

/// Handle the 'submit' command
pub async fn handle_submit(
    config: Option<PathBuf>,
    request: RemediationRequest,
    json: bool,
) -> Result<()> {
    let configuration = load_configuration(config)?;
    let service = build_service(&configuration)?;

    let outcome = service.process_request(request).await?;

    if json {
        print_json(&outcome)?;
    } else {
        print_outcome(&outcome);
        if outcome.playbook.status == PlaybookStatus::PendingApproval {
            println!();
            println!(
                "Use 'warden approve {} --actor <approver>' to approve",
                outcome.playbook.id
            );
        } else if outcome.playbook.status == PlaybookStatus::DryRun {
            println!();
            println!(
                "Use 'warden promote {} --actor <admin>' to request approval",
                outcome.playbook.id
            );
        }
    }

    Ok(())
}

/// Handle the 'status' command
pub async fn handle_status(config: Option<PathBuf>, playbook_id: Uuid, json: bool) -> Result<()> {
    let configuration = load_configuration(config)?;
    let workflow = build_workflow(&configuration)?;

    let playbook = workflow.get_playbook(playbook_id)?;
    let approvals = workflow.approvals_for(playbook_id);
    let executions = workflow.executions_for(playbook_id);

    if json {
        print_json(&serde_json::json!({
            "playbook": playbook,
            "approvals": approvals,
            "executions": executions,
        }))?;
    } else {
        print_playbook(&playbook);
        print_approvals(&approvals);
        print_executions(&executions);
    }

    Ok(())
}

/// Handle the 'list' and 'approvals' commands
pub async fn handle_list(
    config: Option<PathBuf>,
    status: Option<PlaybookStatus>,
    json: bool,
) -> Result<()> {
    let configuration = load_configuration(config)?;
    let workflow = build_workflow(&configuration)?;
    let playbooks = workflow.list_playbooks(status);

    if json {
        return print_json(&playbooks);
    }

    if playbooks.is_empty() {
        match status {
            Some(status) => println!("No playbooks in state {}", status),
            None => println!("No playbooks recorded"),
        }
        return Ok(());
    }

    println!("Playbooks ({}):", playbooks.len());
    for playbook in &playbooks {
        print_playbook_row(playbook);
    }

    Ok(())
}

/// Handle the 'approve' command
pub async fn handle_approve(
    config: Option<PathBuf>,
    playbook_id: Uuid,
    actor: String,
    role: Role,
    comment: Option<String>,
    json: bool,
) -> Result<()> {
    let configuration = load_configuration(config)?;
    let workflow = build_workflow(&configuration)?;

    let outcome = workflow.approve(playbook_id, &operator(actor, role)?, comment)?;

    if json {
        print_json(&outcome)
    } else {
        print_outcome(&outcome);
        Ok(())
    }
}

/// Handle the 'reject' command
pub async fn handle_reject(
    config: Option<PathBuf>,
    playbook_id: Uuid,
    actor: String,
    role: Role,
    comment: Option<String>,
    json: bool,
) -> Result<()> {
    let configuration = load_configuration(config)?;
    let workflow = build_workflow(&configuration)?;

    let outcome = workflow.reject(playbook_id, &operator(actor, role)?, comment)?;

    if json {
        print_json(&outcome)
    } else {
        print_outcome(&outcome);
        Ok(())
    }
}

/// Handle the 'promote' command
pub async fn handle_promote(
    config: Option<PathBuf>,
    playbook_id: Uuid,
    actor: String,
    role: Role,
    json: bool,
) -> Result<()> {
    let configuration = load_configuration(config)?;
    let workflow = build_workflow(&configuration)?;

    let outcome = workflow.promote(playbook_id, &operator(actor, role)?)?;

    if json {
        print_json(&outcome)
    } else {
        print_outcome(&outcome);
        Ok(())
    }
}

/// Handle the 'execute' command
pub async fn handle_execute(
    config: Option<PathBuf>,
    playbook_id: Uuid,
    actor: String,
    role: Role,
    json: bool,
) -> Result<()> {
    let configuration = load_configuration(config)?;
    let workflow = build_workflow(&configuration)?;

    let outcome = workflow
        .execute(playbook_id, &operator(actor, role)?)
        .await?;

    if json {
        print_json(&outcome)?;
    } else {
        print_outcome(&outcome);
    }

    if outcome.playbook.status == PlaybookStatus::Failed {
        return Err(anyhow!(
            "Execution failed: {}",
            outcome
                .playbook
                .failure_reason
                .as_deref()
                .unwrap_or("unknown reason")
        ));
    }

    Ok(())
}

/// Handle the 'expire' command
pub async fn handle_expire(config: Option<PathBuf>, json: bool) -> Result<()> {
    let configuration = load_configuration(config)?;
    let workflow = build_workflow(&configuration)?;

    let expired = workflow.expire_stale(chrono::Utc::now())?;

    if json {
        let ids: Vec<Uuid> = expired.iter().map(|o| o.playbook.id).collect();
        print_json(&serde_json::json!({ "expired": ids }))?;
    } else if expired.is_empty() {
        println!("No approvals have expired");
    } else {
        println!("Expired {} playbook(s):", expired.len());
        for outcome in &expired {
            println!("  {}", outcome.playbook.id);
        }
    }

    Ok(())
}

/// Handle the 'circuits' command
pub async fn handle_circuits(config: Option<PathBuf>, json: bool) -> Result<()> {
    let configuration = load_configuration(config)?;
    let workflow = build_workflow(&configuration)?;
    let snapshots = workflow.circuit_snapshots();

    if json {
        return print_json(&snapshots);
    }

    // Circuit state lives in memory; a one-shot CLI process only sees its own
    if snapshots.is_empty() {
        println!("No circuits tracked in this process (use 'warden serve' and GET /api/circuits)");
    }
    for snapshot in &snapshots {
        println!(
            "{:<40} {:<10} failures={}",
            snapshot.target,
            snapshot.state.to_string(),
            snapshot.consecutive_failures
        );
    }

    Ok(())
}

fn read_requests(input: &str) -> Result<Vec<RemediationRequest>> {
    let reader: Box<dyn BufRead> = if input == "-" {
        Box::new(BufReader::new(std::io::stdin()))
    } else {
        let file = std::fs::File::open(input)
            .with_context(|| format!("Failed to open request file {}", input))?;
        Box::new(BufReader::new(file))
    };

    let mut requests = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line.context("Failed to read request line")?;
        if line.trim().is_empty() {
            continue;
        }
        let request: RemediationRequest = serde_json::from_str(&line)
            .with_context(|| format!("Invalid request on line {}", index + 1))?;
        requests.push(request);
    }
    Ok(requests)
}

/// Handle the 'run' command
pub async fn handle_run(
    config: Option<PathBuf>,
    input: String,
    workers: Option<usize>,
    json: bool,
) -> Result<()> {
    let mut configuration = load_configuration(config)?;
    if let Some(workers) = workers {
        configuration.workflow.workers = workers.max(1);
    }

    let requests = read_requests(&input)?;
    let service = build_service(&configuration)?;
    service.start();

    let mut refused = 0usize;
    for request in requests {
        let alert_id = request.alert_id.clone();
        if let Err(e) = service.submit(request, None).await {
            refused += 1;
            if !json {
                eprintln!("⚠️  Request {} not queued: {}", alert_id, e);
            }
        }
    }

    service.shutdown().await;
    let status = service.status();

    if json {
        print_json(&serde_json::json!({
            "refused": refused,
            "workers": status.workers,
            "queue": status.queue,
        }))?;
    } else {
        let stats = status.workers;
        println!("Processed {} request(s)", stats.processed);
        println!("  executed:          {}", stats.executed);
        println!("  failed:            {}", stats.failed);
        println!("  dry runs:          {}", stats.dry_runs);
        println!("  awaiting approval: {}", stats.awaiting_approval);
        println!("  denied by policy:  {}", stats.denied);
        println!("  duplicates:        {}", stats.duplicates);
        println!("  errors:            {}", stats.errors);
        println!("  refused by queue:  {}", refused);
    }

    Ok(())
}

/// Handle the 'serve' command
pub async fn handle_serve(
    config: Option<PathBuf>,
    host: Option<String>,
    port: Option<u16>,
) -> Result<()> {
    let mut configuration = load_configuration(config)?;
    if let Some(host) = host {
        configuration.server.host = host;
    }
    if let Some(port) = port {
        configuration.server.port = port;
    }

    let service = build_service(&configuration)?;
    WardenServer::new(&configuration.server, service).start().await
}

fn write_signing_key(path: &Path, signer: &AuditSigner) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    std::fs::write(path, signer.seed_hex())
        .with_context(|| format!("Failed to write signing key {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .with_context(|| format!("Failed to restrict permissions on {}", path.display()))?;
    }

    Ok(())
}

/// Handle the 'config --init' command
/// A new key would leave every existing audit entry unverifiable
fn ensure_no_signed_history(configuration: &Configuration) -> Result<()> {
    let store_path = configuration.store_path();
    if !store_path.exists() {
        return Ok(());
    }

    let store = GovernanceStore::new(&store_path)?;
    let entries = store.load_entries()?;
    if !entries.is_empty() {
        return Err(anyhow!(
            "Refusing to replace the signing key: the audit chain in {} holds {} entries signed \
             with it and would no longer verify",
            store_path.display(),
            entries.len()
        ));
    }
    Ok(())
}

pub async fn handle_config_init(config: Option<PathBuf>, force: bool, json: bool) -> Result<()> {
    let config_path = resolve_config_path(config)?;

    let mut configuration = if config_path.exists() {
        Configuration::load_from_file(&config_path)
            .map_err(|e| anyhow!("Failed to load existing config: {}", e))?
    } else {
        Configuration::default()
    };

    let has_key =
        configuration.audit.signing_key_hex.is_some() || configuration.audit.signing_key_path.is_some();
    if has_key && force {
        ensure_no_signed_history(&configuration)?;
    }

    let mut key_path = None;
    if !has_key || force {
        let path = configuration.data_dir().join("audit_signing.key");
        let signer = AuditSigner::generate();
        write_signing_key(&path, &signer)?;
        configuration.audit.signing_key_hex = None;
        configuration.audit.signing_key_path = Some(path.clone());
        key_path = Some((path, signer.public_key_hex()));
    }

    configuration
        .save_to_file(&config_path)
        .map_err(|e| anyhow!("Failed to save configuration: {}", e))?;

    if json {
        print_json(&serde_json::json!({
            "config_path": config_path,
            "data_dir": configuration.data_dir(),
            "signing_key_path": key_path.as_ref().map(|(path, _)| path),
            "public_key": key_path.as_ref().map(|(_, public)| public),
        }))?;
    } else {
        println!("✅ Configuration saved to {}", config_path.display());
        println!("   Data directory: {}", configuration.data_dir().display());
        match &key_path {
            Some((path, public)) => {
                println!("   Signing key:    {}", path.display());
                println!("   Public key:     {}", public);
            }
            None => println!("   Existing signing key kept (use --force to replace)"),
        }
    }

    Ok(())
}
