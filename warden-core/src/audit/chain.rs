//! Append-only, hash-linked, signed audit chain

use super::signer::{AuditSigner, AuditVerifier};
use crate::error::{RemediationError, RemediationResult};
use crate::models::{AuditEventType, AuditFilter, AuditLogEntry};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, error, warn};

/// Durable home of the audit log. Appends must be durable before they return,
/// and must be refused with [`SequenceConflict`] unless the entry extends the
/// current head (see [`ensure_extends`]).
pub trait AuditSink: Send + Sync {
    fn append_entry(&self, entry: &AuditLogEntry) -> Result<()>;

    /// Every entry, in sequence order
    fn load_entries(&self) -> Result<Vec<AuditLogEntry>>;

    /// Last persisted entry
    fn head(&self) -> Result<Option<AuditLogEntry>> {
        Ok(self.load_entries()?.pop())
    }
}

/// Another writer extended the chain since this one last saw its head
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("audit chain head moved: expected sequence {expected}, got {attempted}")]
pub struct SequenceConflict {
    pub expected: u64,
    pub attempted: u64,
}

/// Check that `entry` directly follows the last entry of `log`
pub fn ensure_extends(
    log: &[AuditLogEntry],
    entry: &AuditLogEntry,
) -> std::result::Result<(), SequenceConflict> {
    let tail = ChainTail::after(log.last());
    if entry.sequence_no != tail.next_sequence || entry.prev_hash != tail.last_hash {
        return Err(SequenceConflict {
            expected: tail.next_sequence,
            attempted: entry.sequence_no,
        });
    }
    Ok(())
}

/// In-memory sink, mostly useful for tests and ephemeral tooling
#[derive(Default)]
pub struct MemoryAuditSink {
    entries: Mutex<Vec<AuditLogEntry>>,
    failing: AtomicBool,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent appends fail, simulating an unavailable store
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl AuditSink for MemoryAuditSink {
    fn append_entry(&self, entry: &AuditLogEntry) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(anyhow!("audit store unavailable"));
        }
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        ensure_extends(&entries, entry)?;
        entries.push(entry.clone());
        Ok(())
    }

    fn load_entries(&self) -> Result<Vec<AuditLogEntry>> {
        Ok(self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }
}

/// Hex SHA-256 of the canonical JSON form of a payload.
/// `serde_json::Value` objects are key-ordered, which makes the encoding canonical.
pub fn hash_payload(payload: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Hash of a whole entry, used as the next entry's `prev_hash`
pub fn hash_entry(entry: &AuditLogEntry) -> String {
    let mut hasher = Sha256::new();
    hasher.update(entry.sequence_no.to_be_bytes());
    hasher.update(entry.event_type.as_str().as_bytes());
    hasher.update(entry.actor.as_bytes());
    hasher.update(entry.payload_hash.as_bytes());
    hasher.update(entry.prev_hash.as_deref().unwrap_or("").as_bytes());
    hasher.update(entry.signature.as_bytes());
    hasher.update(format_timestamp(&entry.timestamp).as_bytes());
    hex::encode(hasher.finalize())
}

fn format_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Bytes covered by an entry signature: every field except the signature itself.
/// The actor is length-prefixed so no choice of name can shift the field boundaries.
pub fn signing_message(
    event_type: AuditEventType,
    actor: &str,
    payload_hash: &str,
    prev_hash: Option<&str>,
    sequence_no: u64,
    timestamp: &DateTime<Utc>,
) -> Vec<u8> {
    format!(
        "{}|{}:{}|{}|{}|{}|{}",
        event_type.as_str(),
        actor.len(),
        actor,
        payload_hash,
        prev_hash.unwrap_or("-"),
        sequence_no,
        format_timestamp(timestamp)
    )
    .into_bytes()
}

/// Outcome of walking a chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainVerification {
    pub valid: bool,
    pub total_entries: usize,
    /// Entries checked successfully before the walk stopped
    pub verified_entries: usize,
    /// Sequence number of the first offending entry
    pub first_invalid_sequence: Option<u64>,
    pub error_message: Option<String>,
}

/// Walk `entries` in order and stop at the first mismatch. Nothing is skipped or repaired.
pub fn verify_chain(entries: &[AuditLogEntry], verifier: &AuditVerifier) -> ChainVerification {
    let mut result = ChainVerification {
        valid: true,
        total_entries: entries.len(),
        verified_entries: 0,
        first_invalid_sequence: None,
        error_message: None,
    };

    let mut expected_prev: Option<String> = None;

    for (index, entry) in entries.iter().enumerate() {
        let problem = if entry.sequence_no != index as u64 {
            Some(format!(
                "expected sequence {}, found {}",
                index, entry.sequence_no
            ))
        } else if hash_payload(&entry.payload) != entry.payload_hash {
            Some("payload does not match payload_hash".to_string())
        } else if entry.prev_hash != expected_prev {
            Some(format!(
                "broken link (expected prev {:?}, got {:?})",
                expected_prev, entry.prev_hash
            ))
        } else if !verifier.verify(
            &signing_message(
                entry.event_type,
                &entry.actor,
                &entry.payload_hash,
                entry.prev_hash.as_deref(),
                entry.sequence_no,
                &entry.timestamp,
            ),
            &entry.signature,
        ) {
            Some("invalid signature".to_string())
        } else {
            None
        };

        if let Some(message) = problem {
            result.valid = false;
            result.first_invalid_sequence = Some(entry.sequence_no);
            result.error_message = Some(format!("entry {}: {}", entry.sequence_no, message));
            return result;
        }

        expected_prev = Some(hash_entry(entry));
        result.verified_entries = index + 1;
    }

    result
}

/// Write entries as JSON Lines
pub fn write_jsonl<W: Write>(entries: &[AuditLogEntry], mut writer: W) -> Result<()> {
    for entry in entries {
        serde_json::to_writer(&mut writer, entry).context("Failed to serialize audit entry")?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(())
}

/// Attempts per append when other processes keep moving the head
const MAX_APPEND_ATTEMPTS: usize = 5;

#[derive(Debug)]
struct ChainTail {
    next_sequence: u64,
    last_hash: Option<String>,
}

impl ChainTail {
    fn after(last: Option<&AuditLogEntry>) -> Self {
        match last {
            Some(last) => Self {
                next_sequence: last.sequence_no + 1,
                last_hash: Some(hash_entry(last)),
            },
            None => Self {
                next_sequence: 0,
                last_hash: None,
            },
        }
    }
}

/// The audit chain. Within a process every append runs under one mutex; across
/// processes sharing a sink, the sink refuses appends that do not extend its
/// head and the chain resyncs its tail and re-signs. Sequence numbers and links
/// never fork.
pub struct AuditChain {
    sink: Arc<dyn AuditSink>,
    signer: AuditSigner,
    tail: Mutex<ChainTail>,
}

impl AuditChain {
    /// Resume the chain from whatever the sink already holds
    pub fn open(sink: Arc<dyn AuditSink>, signer: AuditSigner) -> Result<Self> {
        let entries = sink.load_entries().context("Failed to load audit log")?;
        let tail = ChainTail::after(entries.last());

        debug!(entries = entries.len(), "Opened audit chain");

        Ok(Self {
            sink,
            signer,
            tail: Mutex::new(tail),
        })
    }

    pub fn signer(&self) -> &AuditSigner {
        &self.signer
    }

    pub fn verifier(&self) -> AuditVerifier {
        self.signer.verifier()
    }

    /// Sequence number the next entry will get
    pub fn next_sequence(&self) -> u64 {
        self.tail
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .next_sequence
    }

    /// Append one entry. The tail only advances once the sink accepted it;
    /// on failure the caller must abandon the transition being audited.
    pub fn append(
        &self,
        event_type: AuditEventType,
        actor: &str,
        payload: serde_json::Value,
    ) -> RemediationResult<AuditLogEntry> {
        let mut tail = self.tail.lock().unwrap_or_else(PoisonError::into_inner);
        let mut attempt = 1;

        loop {
            let entry = self.seal(&tail, event_type, actor, payload.clone());

            match self.sink.append_entry(&entry) {
                Ok(()) => {
                    tail.last_hash = Some(hash_entry(&entry));
                    tail.next_sequence += 1;
                    return Ok(entry);
                }
                Err(e)
                    if attempt < MAX_APPEND_ATTEMPTS
                        && e.downcast_ref::<SequenceConflict>().is_some() =>
                {
                    debug!(
                        event_type = %event_type,
                        sequence_no = entry.sequence_no,
                        attempt,
                        "Audit head moved, resyncing tail"
                    );
                    let head = self
                        .sink
                        .head()
                        .map_err(|e| RemediationError::AuditAppendFailure(format!("{:#}", e)))?;
                    *tail = ChainTail::after(head.as_ref());
                    attempt += 1;
                }
                Err(e) => {
                    error!(
                        event_type = %event_type,
                        sequence_no = entry.sequence_no,
                        error = %e,
                        "Audit append failed"
                    );
                    return Err(RemediationError::AuditAppendFailure(format!("{:#}", e)));
                }
            }
        }
    }

    fn seal(
        &self,
        tail: &ChainTail,
        event_type: AuditEventType,
        actor: &str,
        payload: serde_json::Value,
    ) -> AuditLogEntry {
        let timestamp = Utc::now();
        let payload_hash = hash_payload(&payload);
        let signature = self.signer.sign(&signing_message(
            event_type,
            actor,
            &payload_hash,
            tail.last_hash.as_deref(),
            tail.next_sequence,
            &timestamp,
        ));

        AuditLogEntry {
            sequence_no: tail.next_sequence,
            event_type,
            actor: actor.to_string(),
            payload,
            payload_hash,
            prev_hash: tail.last_hash.clone(),
            signature,
            timestamp,
        }
    }

    pub fn entries(&self) -> Result<Vec<AuditLogEntry>> {
        self.sink.load_entries()
    }

    pub fn export(&self, filter: &AuditFilter) -> Result<Vec<AuditLogEntry>> {
        Ok(self
            .sink
            .load_entries()?
            .into_iter()
            .filter(|entry| filter.matches(entry))
            .collect())
    }

    /// Verify the persisted chain against this deployment's key
    pub fn verify(&self) -> Result<ChainVerification> {
        let entries = self.sink.load_entries()?;
        let result = verify_chain(&entries, &self.verifier());
        if !result.valid {
            warn!(
                first_invalid_sequence = ?result.first_invalid_sequence,
                "Audit chain verification failed"
            );
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn chain() -> (Arc<MemoryAuditSink>, AuditChain) {
        let sink = Arc::new(MemoryAuditSink::new());
        let chain = AuditChain::open(sink.clone(), AuditSigner::generate()).unwrap();
        (sink, chain)
    }

    fn append_three(chain: &AuditChain) {
        chain
            .append(AuditEventType::PlaybookCreated, "alice", json!({"playbook": 1}))
            .unwrap();
        chain
            .append(AuditEventType::PlaybookApproved, "bob", json!({"playbook": 1}))
            .unwrap();
        chain
            .append(AuditEventType::ExecutionStarted, "system", json!({"playbook": 1}))
            .unwrap();
    }

    #[test]
    fn test_entries_are_linked() {
        let (sink, chain) = chain();
        append_three(&chain);

        let entries = sink.load_entries().unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].sequence_no, 0);
        assert!(entries[0].prev_hash.is_none());
        assert_eq!(entries[1].prev_hash, Some(hash_entry(&entries[0])));
        assert_eq!(entries[2].prev_hash, Some(hash_entry(&entries[1])));

        let result = chain.verify().unwrap();
        assert!(result.valid);
        assert_eq!(result.verified_entries, 3);
    }

    #[test]
    fn test_payload_tampering_is_detected_at_that_entry() {
        let (sink, chain) = chain();
        append_three(&chain);

        let mut entries = sink.load_entries().unwrap();
        entries[1].payload = json!({"playbook": 2});

        let result = verify_chain(&entries, &chain.verifier());
        assert!(!result.valid);
        assert_eq!(result.first_invalid_sequence, Some(1));
        assert_eq!(result.verified_entries, 1);
    }

    #[test]
    fn test_relinked_forgery_fails_signature_check() {
        let (sink, chain) = chain();
        append_three(&chain);

        let mut entries = sink.load_entries().unwrap();
        entries[2].payload = json!({"playbook": 9});
        entries[2].payload_hash = hash_payload(&entries[2].payload);

        let result = verify_chain(&entries, &chain.verifier());
        assert_eq!(result.first_invalid_sequence, Some(2));
        assert!(result.error_message.unwrap().contains("signature"));
    }

    #[test]
    fn test_forged_actor_on_last_entry_is_detected() {
        let (sink, chain) = chain();
        append_three(&chain);

        let mut entries = sink.load_entries().unwrap();
        entries[2].actor = "mallory".to_string();

        let result = verify_chain(&entries, &chain.verifier());
        assert!(!result.valid);
        assert_eq!(result.first_invalid_sequence, Some(2));
        assert_eq!(result.verified_entries, 2);
    }

    #[test]
    fn test_forged_event_type_is_detected_at_that_entry() {
        let (sink, chain) = chain();
        append_three(&chain);

        let mut entries = sink.load_entries().unwrap();
        entries[0].event_type = AuditEventType::PlaybookRejected;

        let result = verify_chain(&entries, &chain.verifier());
        assert_eq!(result.first_invalid_sequence, Some(0));
        assert!(result.error_message.unwrap().contains("signature"));
    }

    #[test]
    fn test_deleted_entry_breaks_chain() {
        let (sink, chain) = chain();
        append_three(&chain);

        let mut entries = sink.load_entries().unwrap();
        entries.remove(1);

        let result = verify_chain(&entries, &chain.verifier());
        assert_eq!(result.first_invalid_sequence, Some(2));
    }

    #[test]
    fn test_failed_append_does_not_advance_tail() {
        let (sink, chain) = chain();
        chain
            .append(AuditEventType::PlaybookCreated, "alice", json!({}))
            .unwrap();

        sink.set_failing(true);
        let err = chain
            .append(AuditEventType::PlaybookApproved, "bob", json!({}))
            .unwrap_err();
        assert_eq!(err.code(), "AUDIT_APPEND_FAILURE");
        assert_eq!(chain.next_sequence(), 1);

        sink.set_failing(false);
        let entry = chain
            .append(AuditEventType::PlaybookApproved, "bob", json!({}))
            .unwrap();
        assert_eq!(entry.sequence_no, 1);
        assert!(chain.verify().unwrap().valid);
    }

    #[test]
    fn test_two_chains_on_one_sink_resync() {
        let sink = Arc::new(MemoryAuditSink::new());
        let signer = AuditSigner::generate();
        let first = AuditChain::open(sink.clone(), signer.clone()).unwrap();
        let second = AuditChain::open(sink.clone(), signer).unwrap();

        first
            .append(AuditEventType::PlaybookCreated, "alice", json!({}))
            .unwrap();
        let entry = second
            .append(AuditEventType::PlaybookApproved, "bob", json!({}))
            .unwrap();

        assert_eq!(entry.sequence_no, 1);
        assert_eq!(sink.load_entries().unwrap().len(), 2);
        assert!(second.verify().unwrap().valid);
    }

    #[test]
    fn test_sink_refuses_entry_that_skips_head() {
        let (sink, chain) = chain();
        append_three(&chain);

        let mut stale = sink.load_entries().unwrap()[1].clone();
        stale.sequence_no = 3;
        let err = sink.append_entry(&stale).unwrap_err();
        assert!(err.downcast_ref::<SequenceConflict>().is_some());
        assert_eq!(sink.load_entries().unwrap().len(), 3);
    }

    #[test]
    fn test_reopen_continues_sequence() {
        let sink = Arc::new(MemoryAuditSink::new());
        let signer = AuditSigner::generate();
        {
            let chain = AuditChain::open(sink.clone(), signer.clone()).unwrap();
            append_three(&chain);
        }

        let reopened = AuditChain::open(sink.clone(), signer).unwrap();
        assert_eq!(reopened.next_sequence(), 3);
        reopened
            .append(AuditEventType::ExecutionCompleted, "system", json!({}))
            .unwrap();
        assert!(reopened.verify().unwrap().valid);
    }

    #[test]
    fn test_export_filters_and_jsonl() {
        let (_sink, chain) = chain();
        append_three(&chain);

        let filter = AuditFilter {
            actor: Some("bob".to_string()),
            ..AuditFilter::default()
        };
        let exported = chain.export(&filter).unwrap();
        assert_eq!(exported.len(), 1);
        assert_eq!(exported[0].event_type, AuditEventType::PlaybookApproved);

        let mut buffer = Vec::new();
        write_jsonl(&chain.entries().unwrap(), &mut buffer).unwrap();
        let text = String::from_utf8(buffer).unwrap();
        assert_eq!(text.lines().count(), 3);
        let first: AuditLogEntry = serde_json::from_str(text.lines().next().unwrap()).unwrap();
        assert_eq!(first.sequence_no, 0);
    }
}
