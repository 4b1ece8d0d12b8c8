//! Tamper detection on the persisted audit chain

mod common;

use common::{request, Fixture, ScriptedExecutor};
use std::path::Path;
use std::sync::Arc;
use warden_core::audit::{verify_chain, write_jsonl, AuditChain, AuditSigner, AuditSink};
use warden_core::models::{Actor, AuditEventType, AuditFilter, AuditLogEntry};
use warden_core::workflow::GovernanceStore;

/// Three playbooks worth of audit entries, persisted under `dir`
fn seed_chain(dir: &Path) -> AuditSigner {
    let fixture = Fixture::default();
    let workflow = fixture.build(dir, Arc::new(ScriptedExecutor::new(vec![])));
    for (alert, target) in [("a-1", "93.184.216.34"), ("a-2", "8.8.8.8"), ("a-3", "1.1.1.1")] {
        workflow
            .create_playbook(&request(alert, "block_ip", target), &Actor::system())
            .unwrap();
    }
    fixture.signer
}

fn rewrite_store(dir: &Path, edit: impl FnOnce(&mut Vec<serde_json::Value>)) {
    let path = dir.join("governance.json");
    let mut document: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    let log = document["audit_log"].as_array_mut().unwrap();
    edit(log);
    std::fs::write(&path, serde_json::to_string_pretty(&document).unwrap()).unwrap();
}

fn persisted_entries(dir: &Path) -> Vec<AuditLogEntry> {
    GovernanceStore::new(dir.join("governance.json"))
        .unwrap()
        .load_entries()
        .unwrap()
}

#[test]
fn test_untouched_chain_verifies() {
    let dir = tempfile::tempdir().unwrap();
    let signer = seed_chain(dir.path());

    let result = verify_chain(&persisted_entries(dir.path()), &signer.verifier());

    assert!(result.valid);
    assert_eq!(result.total_entries, 3);
    assert_eq!(result.verified_entries, 3);
}

#[test]
fn test_edited_payload_is_detected() {
    let dir = tempfile::tempdir().unwrap();
    let signer = seed_chain(dir.path());

    rewrite_store(dir.path(), |log| {
        log[1]["payload"]["alert_id"] = serde_json::json!("forged");
    });

    let result = verify_chain(&persisted_entries(dir.path()), &signer.verifier());
    assert!(!result.valid);
    assert_eq!(result.first_invalid_sequence, Some(1));
    assert_eq!(result.verified_entries, 1);
}

#[test]
fn test_recomputed_payload_hash_still_breaks_signature() {
    let dir = tempfile::tempdir().unwrap();
    let signer = seed_chain(dir.path());

    rewrite_store(dir.path(), |log| {
        log[2]["payload"]["alert_id"] = serde_json::json!("forged");
        let forged = warden_core::audit::hash_payload(&log[2]["payload"]);
        log[2]["payload_hash"] = serde_json::json!(forged);
    });

    let result = verify_chain(&persisted_entries(dir.path()), &signer.verifier());
    assert!(!result.valid);
    assert_eq!(result.first_invalid_sequence, Some(2));
    assert!(result.error_message.unwrap().contains("signature"));
}

#[test]
fn test_deleted_entry_is_detected() {
    let dir = tempfile::tempdir().unwrap();
    let signer = seed_chain(dir.path());

    rewrite_store(dir.path(), |log| {
        log.remove(1);
    });

    let result = verify_chain(&persisted_entries(dir.path()), &signer.verifier());
    assert!(!result.valid);
    assert_eq!(result.first_invalid_sequence, Some(2));
}

#[test]
fn test_foreign_key_fails_verification() {
    let dir = tempfile::tempdir().unwrap();
    seed_chain(dir.path());

    let other = AuditSigner::from_seed([9u8; 32]);
    let result = verify_chain(&persisted_entries(dir.path()), &other.verifier());

    assert!(!result.valid);
    assert_eq!(result.first_invalid_sequence, Some(0));
}

#[test]
fn test_export_filters_and_writes_jsonl() {
    let dir = tempfile::tempdir().unwrap();
    let signer = seed_chain(dir.path());
    let store = Arc::new(GovernanceStore::new(dir.path().join("governance.json")).unwrap());
    let chain = AuditChain::open(store, signer).unwrap();
    assert_eq!(chain.next_sequence(), 3);

    let filter = AuditFilter {
        event_type: Some(AuditEventType::PlaybookCreated),
        actor: Some("system".to_string()),
        ..AuditFilter::default()
    };
    let entries = chain.export(&filter).unwrap();
    assert_eq!(entries.len(), 3);

    let mut buffer = Vec::new();
    write_jsonl(&entries, &mut buffer).unwrap();
    let text = String::from_utf8(buffer).unwrap();
    assert_eq!(text.lines().count(), 3);
    let first: AuditLogEntry = serde_json::from_str(text.lines().next().unwrap()).unwrap();
    assert_eq!(first.sequence_no, 0);
}

#[test]
fn test_reattributed_entry_is_detected() {
    let dir = tempfile::tempdir().unwrap();
    let signer = seed_chain(dir.path());

    rewrite_store(dir.path(), |log| {
        log[2]["actor"] = serde_json::json!("mallory");
        log[1]["event_type"] = serde_json::json!("playbook_rejected");
    });

    let result = verify_chain(&persisted_entries(dir.path()), &signer.verifier());
    assert!(!result.valid);
    assert_eq!(result.first_invalid_sequence, Some(1));
}
