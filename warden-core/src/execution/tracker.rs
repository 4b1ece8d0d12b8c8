//! Idempotency ledger keyed by action fingerprint

use crate::models::{Action, ExecutionRecord, ExecutionStatus};
use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

const FIELD_SEPARATOR: &[u8] = &[0x1f];

/// Deterministic fingerprint of (action name, normalized target, playbook id).
///
/// Timestamps are deliberately left out so every retry of the same logical
/// request hashes identically.
pub fn fingerprint(action: &Action, playbook_id: Uuid) -> String {
    let mut hasher = Sha256::new();
    hasher.update(action.name.trim().to_lowercase().as_bytes());
    hasher.update(FIELD_SEPARATOR);
    hasher.update(action.normalized_target().as_bytes());
    hasher.update(FIELD_SEPARATOR);
    hasher.update(playbook_id.as_bytes());
    hex::encode(hasher.finalize())
}

/// Result of a compare-and-set claim on a fingerprint
#[derive(Debug, Clone)]
pub enum ClaimOutcome {
    /// The fingerprint was free; a new record was stored
    Recorded(ExecutionRecord),
    /// A live record already exists for the fingerprint
    Duplicate(ExecutionRecord),
}

impl ClaimOutcome {
    pub fn execution_id(&self) -> Uuid {
        match self {
            ClaimOutcome::Recorded(record) | ClaimOutcome::Duplicate(record) => record.id,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, ClaimOutcome::Duplicate(_))
    }
}

/// Counter snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerStats {
    pub total_recorded: u64,
    pub duplicates_skipped: u64,
    pub live_entries: usize,
}

pub struct ExecutionTracker {
    entries: DashMap<String, ExecutionRecord>,
    default_ttl: Duration,
    total_recorded: AtomicU64,
    duplicates_skipped: AtomicU64,
}

impl ExecutionTracker {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            default_ttl,
            total_recorded: AtomicU64::new(0),
            duplicates_skipped: AtomicU64::new(0),
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Load persisted records after a restart. Simulated and expired records
    /// are skipped; for a repeated fingerprint the latest record wins.
    pub fn hydrate(&self, records: impl IntoIterator<Item = ExecutionRecord>) -> usize {
        let now = Utc::now();
        let mut loaded = 0;

        for record in records {
            if record.simulated || !record.is_live_at(now) {
                continue;
            }
            match self.entries.entry(record.fingerprint.clone()) {
                Entry::Occupied(mut existing) => {
                    if existing.get().recorded_at <= record.recorded_at {
                        existing.insert(record);
                    }
                }
                Entry::Vacant(slot) => {
                    slot.insert(record);
                    loaded += 1;
                }
            }
        }

        if loaded > 0 {
            info!(loaded, "Hydrated execution tracker");
        }
        loaded
    }

    /// Whether a live record exists. Expired records are evicted on the way.
    pub fn is_duplicate(&self, fingerprint: &str) -> bool {
        self.is_duplicate_at(fingerprint, Utc::now())
    }

    pub fn is_duplicate_at(&self, fingerprint: &str, now: DateTime<Utc>) -> bool {
        self.entries
            .remove_if(fingerprint, |_, record| !record.is_live_at(now));
        self.entries.contains_key(fingerprint)
    }

    /// Atomically check for a live record and store a new one if none exists
    pub fn record_execution(
        &self,
        fingerprint: &str,
        playbook_id: Uuid,
        status: ExecutionStatus,
        result: Option<serde_json::Value>,
        ttl: Option<Duration>,
    ) -> ClaimOutcome {
        self.record_execution_at(fingerprint, playbook_id, status, result, ttl, Utc::now())
    }

    pub fn record_execution_at(
        &self,
        fingerprint: &str,
        playbook_id: Uuid,
        status: ExecutionStatus,
        result: Option<serde_json::Value>,
        ttl: Option<Duration>,
        now: DateTime<Utc>,
    ) -> ClaimOutcome {
        let record = ExecutionRecord {
            id: Uuid::new_v4(),
            fingerprint: fingerprint.to_string(),
            playbook_id,
            status,
            result,
            simulated: status == ExecutionStatus::Simulated,
            attempts: 0,
            recorded_at: now,
            ttl_expiry: now + ttl.unwrap_or(self.default_ttl),
        };

        // The entry guard holds the shard lock, making check-and-insert atomic
        match self.entries.entry(fingerprint.to_string()) {
            Entry::Occupied(mut existing) => {
                if existing.get().is_live_at(now) {
                    self.duplicates_skipped.fetch_add(1, Ordering::Relaxed);
                    debug!(fingerprint, "Duplicate execution skipped");
                    return ClaimOutcome::Duplicate(existing.get().clone());
                }
                existing.insert(record.clone());
            }
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
            }
        }

        self.total_recorded.fetch_add(1, Ordering::Relaxed);
        ClaimOutcome::Recorded(record)
    }

    /// Finalize a claimed record with the executor outcome
    pub fn complete(
        &self,
        fingerprint: &str,
        status: ExecutionStatus,
        result: Option<serde_json::Value>,
        attempts: u32,
    ) -> Option<ExecutionRecord> {
        self.entries.get_mut(fingerprint).map(|mut record| {
            record.status = status;
            record.result = result;
            record.attempts = attempts;
            record.clone()
        })
    }

    /// Drop a claim whose action never ran
    pub fn release(&self, fingerprint: &str) -> Option<ExecutionRecord> {
        self.entries.remove(fingerprint).map(|(_, record)| record)
    }

    pub fn get(&self, fingerprint: &str) -> Option<ExecutionRecord> {
        self.entries.get(fingerprint).map(|record| record.clone())
    }

    /// Remove every record whose TTL has elapsed at `now`
    pub fn evict_expired(&self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, record| record.is_live_at(now));
        before.saturating_sub(self.entries.len())
    }

    pub fn stats(&self) -> TrackerStats {
        TrackerStats {
            total_recorded: self.total_recorded.load(Ordering::Relaxed),
            duplicates_skipped: self.duplicates_skipped.load(Ordering::Relaxed),
            live_entries: self.entries.len(),
        }
    }

    /// Periodically evict expired records until `shutdown` flips to true
    pub fn spawn_sweeper(
        self: Arc<Self>,
        interval: std::time::Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let evicted = self.evict_expired(Utc::now());
                        if evicted > 0 {
                            debug!(evicted, "Evicted expired execution records");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> ExecutionTracker {
        ExecutionTracker::new(Duration::seconds(60))
    }

    #[test]
    fn test_fingerprint_is_deterministic_and_normalized() {
        let playbook_id = Uuid::new_v4();
        let a = fingerprint(&Action::new("block_ip", " ::0001 "), playbook_id);
        let b = fingerprint(&Action::new("BLOCK_IP", "::1"), playbook_id);
        let other = fingerprint(&Action::new("block_ip", "::1"), Uuid::new_v4());

        assert_eq!(a, b);
        assert_ne!(a, other);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_second_record_within_ttl_is_duplicate() {
        let tracker = tracker();
        let playbook_id = Uuid::new_v4();

        let first = tracker.record_execution("fp", playbook_id, ExecutionStatus::InProgress, None, None);
        let second = tracker.record_execution("fp", playbook_id, ExecutionStatus::InProgress, None, None);

        assert!(!first.is_duplicate());
        assert!(second.is_duplicate());
        assert_eq!(first.execution_id(), second.execution_id());

        let stats = tracker.stats();
        assert_eq!(stats.total_recorded, 1);
        assert_eq!(stats.duplicates_skipped, 1);
        assert_eq!(stats.live_entries, 1);
    }

    #[test]
    fn test_expired_record_is_treated_as_fresh() {
        let tracker = tracker();
        let t0 = Utc::now();
        let playbook_id = Uuid::new_v4();

        tracker.record_execution_at("fp", playbook_id, ExecutionStatus::Succeeded, None, None, t0);
        let later = t0 + Duration::seconds(61);

        assert!(!tracker.is_duplicate_at("fp", later));
        let again = tracker.record_execution_at(
            "fp",
            playbook_id,
            ExecutionStatus::InProgress,
            None,
            None,
            later,
        );
        assert!(!again.is_duplicate());
        assert_eq!(tracker.stats().total_recorded, 2);
    }

    #[test]
    fn test_complete_and_release() {
        let tracker = tracker();
        let playbook_id = Uuid::new_v4();
        tracker.record_execution("fp", playbook_id, ExecutionStatus::InProgress, None, None);

        let done = tracker
            .complete("fp", ExecutionStatus::Succeeded, Some(serde_json::json!({"ok": true})), 2)
            .unwrap();
        assert_eq!(done.status, ExecutionStatus::Succeeded);
        assert_eq!(done.attempts, 2);

        assert!(tracker.release("fp").is_some());
        assert!(!tracker.is_duplicate("fp"));
    }

    #[test]
    fn test_evict_expired() {
        let tracker = tracker();
        let t0 = Utc::now();
        tracker.record_execution_at("old", Uuid::new_v4(), ExecutionStatus::Succeeded, None, Some(Duration::seconds(1)), t0);
        tracker.record_execution_at("new", Uuid::new_v4(), ExecutionStatus::Succeeded, None, None, t0);

        assert_eq!(tracker.evict_expired(t0 + Duration::seconds(5)), 1);
        assert!(tracker.get("old").is_none());
        assert!(tracker.get("new").is_some());
    }

    #[test]
    fn test_hydrate_skips_simulated_and_expired() {
        let tracker = tracker();
        let now = Utc::now();
        let record = |fingerprint: &str, simulated: bool, ttl_expiry| ExecutionRecord {
            id: Uuid::new_v4(),
            fingerprint: fingerprint.to_string(),
            playbook_id: Uuid::new_v4(),
            status: ExecutionStatus::Succeeded,
            result: None,
            simulated,
            attempts: 1,
            recorded_at: now,
            ttl_expiry,
        };

        let loaded = tracker.hydrate(vec![
            record("live", false, now + Duration::hours(1)),
            record("dry", true, now + Duration::hours(1)),
            record("stale", false, now - Duration::hours(1)),
        ]);

        assert_eq!(loaded, 1);
        assert!(tracker.is_duplicate("live"));
        assert!(!tracker.is_duplicate("dry"));
        assert!(!tracker.is_duplicate("stale"));
    }

    #[tokio::test]
    async fn test_concurrent_claims_converge_to_one() {
        let tracker = Arc::new(tracker());
        let playbook_id = Uuid::new_v4();

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let tracker = tracker.clone();
                tokio::spawn(async move {
                    tracker.record_execution("same", playbook_id, ExecutionStatus::InProgress, None, None)
                })
            })
            .collect();

        let mut recorded = 0;
        for handle in handles {
            if !handle.await.unwrap().is_duplicate() {
                recorded += 1;
            }
        }

        assert_eq!(recorded, 1);
        assert_eq!(tracker.stats().duplicates_skipped, 15);
    }
}
