//! Governance state persistence using JSON file storage

use crate::audit::{ensure_extends, AuditSink};
use crate::models::{
    Approval, AuditFilter, AuditLogEntry, ExecutionRecord, Playbook, PlaybookStatus,
};
use anyhow::{anyhow, Context, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;
use tracing::{debug, warn};
use uuid::Uuid;

/// Root JSON document holding everything that must survive a restart
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GovernanceDocument {
    #[serde(default)]
    pub playbooks: Vec<Playbook>,
    #[serde(default)]
    pub approvals: Vec<Approval>,
    #[serde(default)]
    pub executions: Vec<ExecutionRecord>,
    #[serde(default)]
    pub audit_log: Vec<AuditLogEntry>,
}

/// Identity of the store file as last seen. Writers replace the file by
/// rename, so a write from any process changes the stamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    modified: Option<SystemTime>,
    len: u64,
    #[cfg(unix)]
    inode: u64,
}

impl FileStamp {
    fn of(path: &Path) -> Result<Option<Self>> {
        match std::fs::metadata(path) {
            Ok(metadata) => Ok(Some(Self {
                modified: metadata.modified().ok(),
                len: metadata.len(),
                #[cfg(unix)]
                inode: std::os::unix::fs::MetadataExt::ino(&metadata),
            })),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).context("Failed to stat governance store"),
        }
    }
}

struct CachedDocument {
    document: GovernanceDocument,
    stamp: Option<FileStamp>,
}

/// File-backed store for playbooks, approvals, execution records and the audit log.
///
/// Several processes may share one store (`warden serve` plus CLI commands).
/// Every mutation takes an exclusive fs2 lock on a sidecar lock file, re-reads
/// the document, applies the change and writes a temp file that is renamed
/// over the store. Reads reload whenever the file's stamp changed.
pub struct GovernanceStore {
    store_path: PathBuf,
    lock_path: PathBuf,
    cache: Mutex<CachedDocument>,
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

/// Insert a new playbook or replace the stored one if `playbook` was read
/// at the stored revision. Returns the revision now on disk.
fn put_playbook(document: &mut GovernanceDocument, playbook: &Playbook) -> Result<u64> {
    match document.playbooks.iter_mut().find(|p| p.id == playbook.id) {
        Some(existing) => {
            if existing.revision != playbook.revision {
                return Err(anyhow!(
                    "playbook {} was changed concurrently (stored revision {}, writer had {})",
                    playbook.id,
                    existing.revision,
                    playbook.revision
                ));
            }
            let mut updated = playbook.clone();
            updated.revision += 1;
            let revision = updated.revision;
            *existing = updated;
            Ok(revision)
        }
        None => {
            document.playbooks.push(playbook.clone());
            Ok(playbook.revision)
        }
    }
}

fn put_execution(document: &mut GovernanceDocument, record: &ExecutionRecord) {
    match document.executions.iter_mut().find(|e| e.id == record.id) {
        Some(existing) => *existing = record.clone(),
        None => document.executions.push(record.clone()),
    }
}

impl GovernanceStore {
    /// Open (or initialize) the store at `store_path`
    pub fn new<P: AsRef<Path>>(store_path: P) -> Result<Self> {
        let store_path = store_path.as_ref().to_path_buf();

        if let Some(parent) = store_path.parent() {
            std::fs::create_dir_all(parent)
                .context("Failed to create governance store directory")?;
        }

        let stamp = FileStamp::of(&store_path)?;
        let document = match stamp {
            Some(_) => Self::load_document(&store_path)?,
            None => GovernanceDocument::default(),
        };

        Ok(Self {
            lock_path: sibling(&store_path, ".lock"),
            store_path,
            cache: Mutex::new(CachedDocument { document, stamp }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.store_path
    }

    /// Load the JSON document. No lock is needed: writers only ever rename
    /// complete files into place.
    fn load_document(path: &Path) -> Result<GovernanceDocument> {
        let mut file = File::open(path).context("Failed to open governance store file")?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .context("Failed to read governance store")?;

        if contents.trim().is_empty() {
            return Ok(GovernanceDocument::default());
        }

        serde_json::from_str(&contents).context("Failed to parse governance store JSON")
    }

    /// Write to a temp file, sync it, then rename it over the store
    fn save_document(&self, document: &GovernanceDocument) -> Result<()> {
        let temp_path = sibling(&self.store_path, ".tmp");

        let json = serde_json::to_string_pretty(document)
            .context("Failed to serialize governance store")?;

        let file = File::create(&temp_path)
            .context("Failed to create temporary governance store file")?;
        let mut writer = std::io::BufWriter::new(file);
        writer
            .write_all(json.as_bytes())
            .context("Failed to write governance store")?;
        let file = writer
            .into_inner()
            .map_err(|e| anyhow!("Failed to flush governance store: {}", e.error()))?;
        file.sync_all()
            .context("Failed to sync governance store to disk")?;

        std::fs::rename(&temp_path, &self.store_path)
            .context("Failed to replace governance store file")?;

        Ok(())
    }

    /// Exclusive lock shared by every process using this store; released on drop
    fn write_lock(&self) -> Result<File> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.lock_path)
            .context("Failed to open governance store lock file")?;

        file.lock_exclusive()
            .context("Failed to acquire write lock on governance store")?;
        Ok(file)
    }

    fn lock(&self) -> MutexGuard<'_, CachedDocument> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pick up writes made by other processes
    fn refresh(&self, cached: &mut CachedDocument) -> Result<()> {
        let stamp = FileStamp::of(&self.store_path)?;
        if stamp == cached.stamp {
            return Ok(());
        }

        cached.document = match stamp {
            Some(_) => Self::load_document(&self.store_path)?,
            None => GovernanceDocument::default(),
        };
        cached.stamp = stamp;
        debug!(path = %self.store_path.display(), "Reloaded governance store");
        Ok(())
    }

    /// Current document; on a failed reload the last good copy is served
    fn read(&self) -> MutexGuard<'_, CachedDocument> {
        let mut cached = self.lock();
        if let Err(e) = self.refresh(&mut cached) {
            warn!(error = %e, "Serving cached governance state");
        }
        cached
    }

    /// Apply `change` durably. The change always sees the document on disk,
    /// read under the write lock; memory is only updated once the new file is
    /// in place.
    fn mutate<R>(&self, change: impl FnOnce(&mut GovernanceDocument) -> Result<R>) -> Result<R> {
        let mut cached = self.lock();
        let _write_lock = self.write_lock()?;

        let mut document = match FileStamp::of(&self.store_path)? {
            Some(_) => Self::load_document(&self.store_path)?,
            None => GovernanceDocument::default(),
        };

        let result = change(&mut document)?;
        self.save_document(&document)?;

        // An unknown stamp only forces a reload on the next read
        cached.stamp = FileStamp::of(&self.store_path).ok().flatten();
        cached.document = document;
        Ok(result)
    }

    /// Insert or replace a playbook; `playbook.revision` is updated on success
    pub fn upsert_playbook(&self, playbook: &mut Playbook) -> Result<()> {
        let current: &Playbook = playbook;
        let revision = self.mutate(|document| put_playbook(document, current))?;
        playbook.revision = revision;
        Ok(())
    }

    /// Persist a playbook change together with the approval that caused it
    pub fn record_decision(&self, playbook: &mut Playbook, approval: &Approval) -> Result<()> {
        let current: &Playbook = playbook;
        let revision = self.mutate(|document| {
            let revision = put_playbook(document, current)?;
            document.approvals.push(approval.clone());
            Ok(revision)
        })?;
        playbook.revision = revision;
        Ok(())
    }

    /// Persist a playbook change together with its execution record
    pub fn record_execution(
        &self,
        playbook: &mut Playbook,
        record: &ExecutionRecord,
    ) -> Result<()> {
        let current: &Playbook = playbook;
        let revision = self.mutate(|document| {
            let revision = put_playbook(document, current)?;
            put_execution(document, record);
            Ok(revision)
        })?;
        playbook.revision = revision;
        Ok(())
    }

    /// Insert or replace an execution record
    pub fn upsert_execution(&self, record: &ExecutionRecord) -> Result<()> {
        self.mutate(|document| {
            put_execution(document, record);
            Ok(())
        })
    }

    pub fn get_playbook(&self, playbook_id: Uuid) -> Option<Playbook> {
        self.read()
            .document
            .playbooks
            .iter()
            .find(|p| p.id == playbook_id)
            .cloned()
    }

    /// Playbooks, optionally restricted to one status, oldest first
    pub fn list_playbooks(&self, status: Option<PlaybookStatus>) -> Vec<Playbook> {
        let mut playbooks: Vec<Playbook> = self
            .read()
            .document
            .playbooks
            .iter()
            .filter(|p| status.map_or(true, |s| p.status == s))
            .cloned()
            .collect();
        playbooks.sort_by_key(|p| p.created_at);
        playbooks
    }

    /// Playbooks waiting for a human decision
    pub fn pending_approvals(&self) -> Vec<Playbook> {
        self.list_playbooks(Some(PlaybookStatus::PendingApproval))
    }

    pub fn approvals_for(&self, playbook_id: Uuid) -> Vec<Approval> {
        self.read()
            .document
            .approvals
            .iter()
            .filter(|a| a.playbook_id == playbook_id)
            .cloned()
            .collect()
    }

    pub fn executions(&self) -> Vec<ExecutionRecord> {
        self.read().document.executions.clone()
    }

    pub fn executions_for(&self, playbook_id: Uuid) -> Vec<ExecutionRecord> {
        self.read()
            .document
            .executions
            .iter()
            .filter(|e| e.playbook_id == playbook_id)
            .cloned()
            .collect()
    }

    /// Audit entries matching `filter`, in sequence order
    pub fn query_audit(&self, filter: &AuditFilter) -> Vec<AuditLogEntry> {
        self.read()
            .document
            .audit_log
            .iter()
            .filter(|entry| filter.matches(entry))
            .cloned()
            .collect()
    }
}

impl AuditSink for GovernanceStore {
    /// Refused with `SequenceConflict` when another writer extended the chain first
    fn append_entry(&self, entry: &AuditLogEntry) -> Result<()> {
        self.mutate(|document| {
            ensure_extends(&document.audit_log, entry)?;
            document.audit_log.push(entry.clone());
            Ok(())
        })
        .context("Failed to persist audit entry")
    }

    fn load_entries(&self) -> Result<Vec<AuditLogEntry>> {
        let mut cached = self.lock();
        self.refresh(&mut cached)?;
        Ok(cached.document.audit_log.clone())
    }

    fn head(&self) -> Result<Option<AuditLogEntry>> {
        let mut cached = self.lock();
        self.refresh(&mut cached)?;
        Ok(cached.document.audit_log.last().cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditChain, AuditSigner};
    use crate::models::{Action, AuditEventType, Environment, Severity};
    use chrono::Utc;
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn playbook(status: PlaybookStatus) -> Playbook {
        let now = Utc::now();
        Playbook {
            id: Uuid::new_v4(),
            alert_id: "alert-1".to_string(),
            action: Action::new("block_ip", "93.184.216.34"),
            target: "93.184.216.34".to_string(),
            justification: "scanner".to_string(),
            severity: Severity::High,
            environment: Environment::Production,
            status,
            policy_reasons: vec![],
            created_by: "alice".to_string(),
            requested_by: "detector".to_string(),
            signature: String::new(),
            created_at: now,
            updated_at: now,
            approved_by: None,
            expires_at: None,
            failure_reason: None,
            revision: 0,
        }
    }

    #[test]
    fn test_store_initialization() {
        let dir = tempdir().unwrap();
        let store_path = dir.path().join("nested").join("governance.json");

        let store = GovernanceStore::new(&store_path).unwrap();

        assert!(store_path.parent().unwrap().exists());
        assert!(store.list_playbooks(None).is_empty());
    }

    #[test]
    fn test_playbooks_survive_reopen() {
        let dir = tempdir().unwrap();
        let store_path = dir.path().join("governance.json");

        let mut pending = playbook(PlaybookStatus::PendingApproval);
        let mut approved = playbook(PlaybookStatus::Approved);
        {
            let store = GovernanceStore::new(&store_path).unwrap();
            store.upsert_playbook(&mut pending).unwrap();
            store.upsert_playbook(&mut approved).unwrap();
        }

        let store = GovernanceStore::new(&store_path).unwrap();
        assert_eq!(store.list_playbooks(None).len(), 2);
        assert_eq!(store.pending_approvals()[0].id, pending.id);
        assert_eq!(
            store.get_playbook(approved.id).unwrap().status,
            PlaybookStatus::Approved
        );
        assert!(!sibling(&store_path, ".tmp").exists());
    }

    #[test]
    fn test_upsert_replaces_existing_and_bumps_revision() {
        let dir = tempdir().unwrap();
        let store = GovernanceStore::new(dir.path().join("governance.json")).unwrap();

        let mut pb = playbook(PlaybookStatus::Approved);
        store.upsert_playbook(&mut pb).unwrap();
        assert_eq!(pb.revision, 0);

        pb.status = PlaybookStatus::Completed;
        store.upsert_playbook(&mut pb).unwrap();
        assert_eq!(pb.revision, 1);

        let all = store.list_playbooks(None);
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].status, PlaybookStatus::Completed);
        assert_eq!(all[0].revision, 1);
    }

    #[test]
    fn test_failed_write_leaves_memory_untouched() {
        let dir = tempdir().unwrap();
        let store_path = dir.path().join("governance.json");
        let store = GovernanceStore::new(&store_path).unwrap();

        // Replace the file with a directory so the next write fails
        std::fs::create_dir(&store_path).unwrap();

        assert!(store
            .upsert_playbook(&mut playbook(PlaybookStatus::Approved))
            .is_err());
        assert!(store.list_playbooks(None).is_empty());
    }

    #[test]
    fn test_second_process_sees_writes() {
        let dir = tempdir().unwrap();
        let store_path = dir.path().join("governance.json");
        let server = GovernanceStore::new(&store_path).unwrap();
        let cli = GovernanceStore::new(&store_path).unwrap();

        let mut pb = playbook(PlaybookStatus::PendingApproval);
        cli.upsert_playbook(&mut pb).unwrap();

        assert_eq!(server.pending_approvals().len(), 1);

        let mut other = playbook(PlaybookStatus::Approved);
        server.upsert_playbook(&mut other).unwrap();

        let reopened = GovernanceStore::new(&store_path).unwrap();
        assert_eq!(reopened.list_playbooks(None).len(), 2);
    }

    #[test]
    fn test_stale_playbook_write_is_refused() {
        let dir = tempdir().unwrap();
        let store_path = dir.path().join("governance.json");
        let server = GovernanceStore::new(&store_path).unwrap();
        let cli = GovernanceStore::new(&store_path).unwrap();

        let mut pb = playbook(PlaybookStatus::PendingApproval);
        server.upsert_playbook(&mut pb).unwrap();

        let mut seen_by_server = server.get_playbook(pb.id).unwrap();
        let mut seen_by_cli = cli.get_playbook(pb.id).unwrap();

        seen_by_cli.status = PlaybookStatus::Rejected;
        cli.upsert_playbook(&mut seen_by_cli).unwrap();

        seen_by_server.status = PlaybookStatus::Approved;
        let err = server.upsert_playbook(&mut seen_by_server).unwrap_err();
        assert!(err.to_string().contains("changed concurrently"));
        assert_eq!(
            server.get_playbook(pb.id).unwrap().status,
            PlaybookStatus::Rejected
        );
    }

    #[test]
    fn test_audit_appends_from_two_processes_interleave() {
        let dir = tempdir().unwrap();
        let store_path = dir.path().join("governance.json");
        let signer = AuditSigner::generate();

        let cli_store = Arc::new(GovernanceStore::new(&store_path).unwrap());
        let server_store = Arc::new(GovernanceStore::new(&store_path).unwrap());
        let cli_chain = AuditChain::open(cli_store, signer.clone()).unwrap();
        let server_chain = AuditChain::open(server_store, signer.clone()).unwrap();

        cli_chain
            .append(AuditEventType::PlaybookApproved, "bob", json!({"playbook": 1}))
            .unwrap();
        let entry = server_chain
            .append(AuditEventType::ExecutionStarted, "system", json!({"playbook": 1}))
            .unwrap();
        assert_eq!(entry.sequence_no, 1);

        let reopened = Arc::new(GovernanceStore::new(&store_path).unwrap());
        let entries = reopened.load_entries().unwrap();
        let actors: Vec<&str> = entries.iter().map(|e| e.actor.as_str()).collect();
        assert_eq!(actors, vec!["bob", "system"]);

        let chain = AuditChain::open(reopened, signer).unwrap();
        assert!(chain.verify().unwrap().valid);
    }
}
