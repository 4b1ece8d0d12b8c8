//! Idempotency guarantees of the execution tracker

use chrono::{Duration, Utc};
use std::sync::Arc;
use uuid::Uuid;
use warden_core::execution::{fingerprint, ClaimOutcome, ExecutionTracker};
use warden_core::models::{Action, ExecutionStatus};

#[test]
fn test_racing_claims_record_exactly_once() {
    let tracker = Arc::new(ExecutionTracker::new(Duration::hours(1)));
    let playbook_id = Uuid::new_v4();
    let fp = fingerprint(&Action::new("block_ip", "93.184.216.34"), playbook_id);

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let tracker = tracker.clone();
            let fp = fp.clone();
            std::thread::spawn(move || {
                tracker.record_execution(&fp, playbook_id, ExecutionStatus::InProgress, None, None)
            })
        })
        .collect();

    let outcomes: Vec<ClaimOutcome> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let recorded = outcomes.iter().filter(|o| !o.is_duplicate()).count();

    assert_eq!(recorded, 1);
    let winner = outcomes
        .iter()
        .find(|o| !o.is_duplicate())
        .unwrap()
        .execution_id();
    assert!(outcomes.iter().all(|o| o.execution_id() == winner));

    let stats = tracker.stats();
    assert_eq!(stats.total_recorded, 1);
    assert_eq!(stats.duplicates_skipped, 15);
}

#[test]
fn test_fingerprint_normalizes_target() {
    let playbook_id = Uuid::new_v4();
    let a = fingerprint(&Action::new("BLOCK_IP", " 2001:4860:4860::8888 "), playbook_id);
    let b = fingerprint(&Action::new("block_ip", "2001:4860:4860:0:0:0:0:8888"), playbook_id);

    assert_eq!(a, b);
    assert_ne!(
        a,
        fingerprint(&Action::new("block_ip", "2001:4860:4860::8888"), Uuid::new_v4())
    );
}

#[test]
fn test_expired_record_allows_new_claim() {
    let tracker = ExecutionTracker::new(Duration::seconds(60));
    let playbook_id = Uuid::new_v4();
    let fp = fingerprint(&Action::new("block_ip", "8.8.8.8"), playbook_id);
    let start = Utc::now();

    assert!(!tracker
        .record_execution_at(&fp, playbook_id, ExecutionStatus::Succeeded, None, None, start)
        .is_duplicate());
    assert!(tracker
        .record_execution_at(
            &fp,
            playbook_id,
            ExecutionStatus::Succeeded,
            None,
            None,
            start + Duration::seconds(30)
        )
        .is_duplicate());
    assert!(!tracker
        .record_execution_at(
            &fp,
            playbook_id,
            ExecutionStatus::Succeeded,
            None,
            None,
            start + Duration::seconds(61)
        )
        .is_duplicate());
}
