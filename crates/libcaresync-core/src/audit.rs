//! Append-only, hash-chained audit log.
//!
//! Lives in its own sled database so that audit failures never touch the
//! record store. Every entry stores the hash of its predecessor; rewriting or
//! dropping an entry breaks the chain and shows up in [`AuditLog::verify_chain`].

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::Transactional;
use tracing::{debug, error, info};

use crate::error::{AuditError, StorageError};
use crate::hash::compute_entry_hash;
use crate::store::next_counter;
use crate::types::actor::{ActorContext, AuditInfo};
use crate::types::audit::{AuditFilter, AuditLogEntry, EntryHash};
use crate::types::ids::AuditId;

const NEXT_ID_KEY: &[u8] = b"next_id";
const HEAD_KEY: &[u8] = b"head";

/// Receives every committed audit entry (e.g. forwarding to a central collector)
pub trait AuditSink: Send + Sync {
    fn forward(&self, entry: &AuditLogEntry);
}

/// Emits committed entries as structured tracing events
pub struct TracingSink;

impl AuditSink for TracingSink {
    fn forward(&self, entry: &AuditLogEntry) {
        info!(
            target: "caresync::audit",
            id = entry.id,
            action = %entry.action,
            tenant = %entry.actor.tenant_id,
            user = %entry.actor.user_id,
            device = %entry.actor.device_id,
            ip = %entry.ip_address,
            "audit"
        );
    }
}

/// How the chain is broken at one entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainBreakKind {
    /// Stored hash does not match the entry contents
    HashMismatch,
    /// `prev_hash` does not match the previous entry
    PrevMismatch,
    /// The head pointer does not match the last entry
    HeadMismatch,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainBreak {
    pub id: AuditId,
    pub kind: ChainBreakKind,
}

/// Result of walking the chain
#[derive(Debug, Clone, Default)]
pub struct ChainReport {
    pub entries_checked: usize,
    pub breaks: Vec<ChainBreak>,
}

impl ChainReport {
    pub fn is_intact(&self) -> bool {
        self.breaks.is_empty()
    }
}

pub struct AuditLog {
    path: PathBuf,
    db: sled::Db,
    entries: sled::Tree,
    meta: sled::Tree,
    sinks: Vec<Arc<dyn AuditSink>>,
    failures: AtomicU64,
}

impl AuditLog {
    /// Open or create the audit database at `path`
    pub fn open(path: &Path) -> Result<Self, AuditError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(StorageError::from)?;
            }
        }
        let db = sled::open(path)?;
        let entries = db.open_tree("entries")?;
        let meta = db.open_tree("meta")?;
        debug!(path = %path.display(), entries = entries.len(), "Audit log opened");
        Ok(Self {
            path: path.to_path_buf(),
            db,
            entries,
            meta,
            sinks: Vec::new(),
            failures: AtomicU64::new(0),
        })
    }

    pub fn with_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append an entry, chaining it to the current head
    pub fn append(
        &self,
        actor: &ActorContext,
        action: &str,
        details: serde_json::Value,
        info: &AuditInfo,
    ) -> Result<AuditId, AuditError> {
        if action.trim().is_empty() {
            return Err(AuditError::InvalidEntry("action must not be empty".to_string()));
        }

        let timestamp = Utc::now();
        let entry = (&self.entries, &self.meta)
            .transaction(|(entries, meta)| {
                let id = next_counter::<AuditError>(meta, NEXT_ID_KEY.to_vec())?;
                let prev_hash = match meta.get(HEAD_KEY)? {
                    Some(bytes) => to_hash(&bytes).ok_or_else(|| {
                        ConflictableTransactionError::Abort(AuditError::Storage(
                            StorageError::Corrupted("malformed audit head".to_string()),
                        ))
                    })?,
                    None => [0u8; 32],
                };

                let mut entry = AuditLogEntry {
                    id,
                    action: action.to_string(),
                    timestamp,
                    actor: actor.clone(),
                    details: details.clone(),
                    ip_address: info.ip_address.clone(),
                    user_agent: info.user_agent.clone(),
                    prev_hash,
                    hash: [0u8; 32],
                };
                entry.hash = compute_entry_hash(&entry);

                let bytes = serde_json::to_vec(&entry)
                    .map_err(|e| ConflictableTransactionError::Abort(AuditError::from(e)))?;
                entries.insert(id.to_be_bytes().to_vec(), bytes)?;
                meta.insert(HEAD_KEY.to_vec(), entry.hash.to_vec())?;
                Ok(entry)
            })
            .map_err(|e| match e {
                TransactionError::Abort(e) => e,
                TransactionError::Storage(e) => e.into(),
            })?;

        for sink in &self.sinks {
            sink.forward(&entry);
        }
        Ok(entry.id)
    }

    /// Append without failing the caller.
    ///
    /// Failures are logged under the `caresync::audit` target and counted in
    /// [`failure_count`](Self::failure_count).
    pub fn record(
        &self,
        actor: &ActorContext,
        action: &str,
        details: serde_json::Value,
        info: &AuditInfo,
    ) -> Option<AuditId> {
        match self.append(actor, action, details, info) {
            Ok(id) => Some(id),
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                error!(
                    target: "caresync::audit",
                    action,
                    tenant = %actor.tenant_id,
                    user = %actor.user_id,
                    error = %e,
                    "Audit append failed"
                );
                None
            }
        }
    }

    /// Number of appends dropped by [`record`](Self::record) since open
    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Entries matching the filter, oldest first
    pub fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditLogEntry>, AuditError> {
        let mut matched = Vec::new();
        for result in self.entries.iter() {
            let (_, value) = result?;
            let entry: AuditLogEntry = serde_json::from_slice(&value)?;
            if filter.matches(&entry) {
                matched.push(entry);
                if filter.limit.is_some_and(|limit| matched.len() >= limit) {
                    break;
                }
            }
        }
        Ok(matched)
    }

    /// Walk the whole chain and report every break
    pub fn verify_chain(&self) -> Result<ChainReport, AuditError> {
        let mut report = ChainReport::default();
        let mut expected_prev: EntryHash = [0u8; 32];
        let mut last_id = 0;

        for result in self.entries.iter() {
            let (_, value) = result?;
            let entry: AuditLogEntry = serde_json::from_slice(&value)?;
            report.entries_checked += 1;

            if compute_entry_hash(&entry) != entry.hash {
                report.breaks.push(ChainBreak {
                    id: entry.id,
                    kind: ChainBreakKind::HashMismatch,
                });
            }
            if entry.prev_hash != expected_prev {
                report.breaks.push(ChainBreak {
                    id: entry.id,
                    kind: ChainBreakKind::PrevMismatch,
                });
            }
            expected_prev = entry.hash;
            last_id = entry.id;
        }

        let head = match self.meta.get(HEAD_KEY)? {
            Some(bytes) => to_hash(&bytes),
            None => Some([0u8; 32]),
        };
        if head != Some(expected_prev) {
            report.breaks.push(ChainBreak {
                id: last_id,
                kind: ChainBreakKind::HeadMismatch,
            });
        }

        Ok(report)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn flush(&self) -> Result<(), AuditError> {
        self.db.flush()?;
        Ok(())
    }
}

fn to_hash(bytes: &[u8]) -> Option<EntryHash> {
    bytes.try_into().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::audit::actions;
    use serde_json::json;
    use std::sync::Mutex;
    use tempfile::tempdir;

    fn actor(tenant: &str, user: &str) -> ActorContext {
        ActorContext::new(user, tenant, "device-1").unwrap()
    }

    fn info() -> AuditInfo {
        AuditInfo::new("192.168.1.20", "caresync-test")
    }

    #[derive(Default)]
    struct CollectingSink(Mutex<Vec<AuditId>>);

    impl AuditSink for CollectingSink {
        fn forward(&self, entry: &AuditLogEntry) {
            self.0.lock().unwrap().push(entry.id);
        }
    }

    #[test]
    fn test_append_chains_entries() {
        let dir = tempdir().unwrap();
        let log = AuditLog::open(&dir.path().join("audit")).unwrap();
        let a = actor("t1", "nurse-1");

        let first = log.append(&a, actions::RECORD_WRITE, json!({"id": "r1"}), &info()).unwrap();
        let second = log.append(&a, actions::RECORD_READ, json!({"id": "r1"}), &info()).unwrap();
        assert_eq!((first, second), (1, 2));

        let entries = log.query(&AuditFilter::tenant("t1")).unwrap();
        assert_eq!(entries[0].prev_hash, [0u8; 32]);
        assert_eq!(entries[1].prev_hash, entries[0].hash);
        assert!(log.verify_chain().unwrap().is_intact());
    }

    #[test]
    fn test_query_filters() {
        let dir = tempdir().unwrap();
        let log = AuditLog::open(&dir.path().join("audit")).unwrap();

        log.append(&actor("t1", "alice"), actions::RECORD_WRITE, json!({}), &info()).unwrap();
        log.append(&actor("t1", "bob"), actions::RECORD_READ, json!({}), &info()).unwrap();
        log.append(&actor("t2", "alice"), actions::RECORD_WRITE, json!({}), &info()).unwrap();

        assert_eq!(log.query(&AuditFilter::tenant("t1")).unwrap().len(), 2);
        assert_eq!(log.query(&AuditFilter::tenant("t1").user("alice")).unwrap().len(), 1);
        assert_eq!(
            log.query(&AuditFilter::tenant("t1").action(actions::RECORD_READ))
                .unwrap()
                .len(),
            1
        );
        assert_eq!(log.query(&AuditFilter::tenant("t2")).unwrap().len(), 1);
        assert_eq!(log.query(&AuditFilter::tenant("t1").limit(1)).unwrap().len(), 1);
    }

    #[test]
    fn test_tampering_breaks_chain() {
        let dir = tempdir().unwrap();
        let log = AuditLog::open(&dir.path().join("audit")).unwrap();
        let a = actor("t1", "nurse-1");
        for i in 0..3 {
            log.append(&a, actions::RECORD_WRITE, json!({ "n": i }), &info()).unwrap();
        }

        let key = 2u64.to_be_bytes();
        let mut entry: AuditLogEntry =
            serde_json::from_slice(&log.entries.get(key).unwrap().unwrap()).unwrap();
        entry.details = json!({"n": 99});
        log.entries
            .insert(key, serde_json::to_vec(&entry).unwrap())
            .unwrap();

        let report = log.verify_chain().unwrap();
        assert_eq!(report.entries_checked, 3);
        assert_eq!(
            report.breaks,
            vec![ChainBreak {
                id: 2,
                kind: ChainBreakKind::HashMismatch
            }]
        );
    }

    #[test]
    fn test_deleting_entry_breaks_chain() {
        let dir = tempdir().unwrap();
        let log = AuditLog::open(&dir.path().join("audit")).unwrap();
        let a = actor("t1", "nurse-1");
        for _ in 0..3 {
            log.append(&a, actions::RECORD_WRITE, json!({}), &info()).unwrap();
        }
        log.entries.remove(2u64.to_be_bytes()).unwrap();

        let report = log.verify_chain().unwrap();
        assert!(report
            .breaks
            .iter()
            .any(|b| b.id == 3 && b.kind == ChainBreakKind::PrevMismatch));
    }

    #[test]
    fn test_record_swallows_failures() {
        let dir = tempdir().unwrap();
        let log = AuditLog::open(&dir.path().join("audit")).unwrap();

        assert!(log.record(&actor("t1", "u"), "", json!({}), &info()).is_none());
        assert_eq!(log.failure_count(), 1);
        assert!(log.is_empty());

        assert!(log
            .record(&actor("t1", "u"), actions::RECORD_WRITE, json!({}), &info())
            .is_some());
        assert_eq!(log.failure_count(), 1);
    }

    #[test]
    fn test_sinks_receive_committed_entries() {
        let dir = tempdir().unwrap();
        let sink = Arc::new(CollectingSink::default());
        let log = AuditLog::open(&dir.path().join("audit"))
            .unwrap()
            .with_sink(sink.clone());

        log.append(&actor("t1", "u"), actions::SYNC_STARTED, json!({}), &info()).unwrap();
        let _ = log.append(&actor("t1", "u"), " ", json!({}), &info());

        assert_eq!(*sink.0.lock().unwrap(), vec![1]);
    }

    #[test]
    fn test_chain_continues_after_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit");
        {
            let log = AuditLog::open(&path).unwrap();
            log.append(&actor("t1", "u"), actions::RECORD_WRITE, json!({}), &info()).unwrap();
            log.flush().unwrap();
        }
        let log = AuditLog::open(&path).unwrap();
        let id = log.append(&actor("t1", "u"), actions::RECORD_WRITE, json!({}), &info()).unwrap();
        assert_eq!(id, 2);
        assert!(log.verify_chain().unwrap().is_intact());
    }
}
