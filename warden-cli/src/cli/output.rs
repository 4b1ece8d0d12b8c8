//! Human-readable rendering of workflow results

use warden_core::models::{Approval, ExecutionRecord, Playbook};
use warden_core::workflow::{TransitionOutcome, WorkflowEvent};

pub fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn print_playbook(playbook: &Playbook) {
    println!("Playbook {}", playbook.id);
    println!("========================================");
    println!("Status:        {}", playbook.status);
    println!("Action:        {} {}", playbook.action.name, playbook.target);
    println!("Alert:         {} ({} severity)", playbook.alert_id, playbook.severity);
    println!("Environment:   {}", playbook.environment);
    println!("Created by:    {}", playbook.created_by);
    println!(
        "Created at:    {}",
        playbook.created_at.format("%Y-%m-%d %H:%M:%S")
    );
    if let Some(approved_by) = &playbook.approved_by {
        println!("Approved by:   {}", approved_by);
    }
    if let Some(expires_at) = playbook.expires_at {
        println!("Expires at:    {}", expires_at.format("%Y-%m-%d %H:%M:%S"));
    }
    if let Some(reason) = &playbook.failure_reason {
        println!("Reason:        {}", reason);
    }
    println!("Justification: {}", playbook.justification);
    if !playbook.policy_reasons.is_empty() {
        println!("Policy:");
        for reason in &playbook.policy_reasons {
            println!("  - {}", reason);
        }
    }
}

pub fn print_approvals(approvals: &[Approval]) {
    if approvals.is_empty() {
        return;
    }
    println!();
    println!("Approvals:");
    for approval in approvals {
        println!(
            "  {:?} by {} at {}{}",
            approval.decision,
            approval.decided_by,
            approval.decided_at.format("%Y-%m-%d %H:%M:%S"),
            approval
                .comment
                .as_deref()
                .map(|c| format!(" ({})", c))
                .unwrap_or_default()
        );
    }
}

pub fn print_executions(executions: &[ExecutionRecord]) {
    if executions.is_empty() {
        return;
    }
    println!();
    println!("Executions:");
    for record in executions {
        println!(
            "  {} {:?}{} attempts={} at {}",
            record.id,
            record.status,
            if record.simulated { " (simulated)" } else { "" },
            record.attempts,
            record.recorded_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
}

pub fn print_playbook_row(playbook: &Playbook) {
    println!(
        "{}  {:<16}  {:<15}  {:<24}  {}",
        playbook.id,
        playbook.status.to_string(),
        playbook.action.name,
        playbook.target,
        playbook.created_at.format("%Y-%m-%d %H:%M:%S")
    );
}

fn describe(event: &WorkflowEvent) -> String {
    match event {
        WorkflowEvent::PlaybookCreated { status, .. } => format!("created as {}", status),
        WorkflowEvent::PlaybookApproved { approved_by, .. } => {
            format!("approved by {}", approved_by)
        }
        WorkflowEvent::PlaybookRejected { rejected_by, .. } => {
            format!("rejected by {}", rejected_by)
        }
        WorkflowEvent::PlaybookPromoted { promoted_by, .. } => {
            format!("promoted by {}", promoted_by)
        }
        WorkflowEvent::PlaybookExpired { .. } => "approval expired".to_string(),
        WorkflowEvent::DryRunCompleted { would_execute, .. } => {
            format!("dry run completed (would execute: {})", would_execute)
        }
        WorkflowEvent::ExecutionStarted { execution_id, .. } => {
            format!("execution {} started", execution_id)
        }
        WorkflowEvent::ExecutionCompleted { attempts, .. } => {
            format!("execution completed after {} attempt(s)", attempts)
        }
        WorkflowEvent::ExecutionFailed {
            code,
            reason,
            attempts,
            ..
        } => format!("execution failed [{}] after {} attempt(s): {}", code, attempts, reason),
        WorkflowEvent::CircuitChanged(transition) => format!(
            "circuit for {} moved {} -> {}",
            transition.target, transition.from, transition.to
        ),
    }
}

pub fn print_outcome(outcome: &TransitionOutcome) {
    println!(
        "✅ Playbook {} is {}",
        outcome.playbook.id,
        outcome.playbook.status
    );
    for event in &outcome.events {
        println!("   • {}", describe(event));
    }

    if let Some(report) = &outcome.dry_run {
        println!();
        println!("Dry run: {}", report.estimated_impact);
        for check in &report.checks {
            println!(
                "  [{}] {}: {}",
                if check.passed { "ok" } else { "FAIL" },
                check.name,
                check.detail
            );
        }
    }
}
