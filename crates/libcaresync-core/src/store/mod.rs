use std::fs::File;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::transaction::{ConflictableTransactionError, TransactionError, TransactionalTree};
use sled::Transactional;
use tracing::{debug, info};

use crate::error::StorageError;
use crate::types::actor::{ActorContext, AuditInfo};
use crate::types::change::{ChangeDraft, ChangeStatus, PendingChange};
use crate::types::ids::{validate_key_part, ChangeId, TenantId, UserId, KEY_SEPARATOR};
use crate::types::record::{Mutation, Record};

mod migrations;

pub use migrations::CURRENT_SCHEMA_VERSION;

/// Result type for operations running inside a store transaction
pub type TxResult<T> = Result<T, ConflictableTransactionError<StorageError>>;

const EMPTY: &[u8] = &[];
const QUEUE_SEQ_PREFIX: &[u8] = b"queue_seq\0";

/// Tenant-scoped index query. Filters combine as a conjunction.
#[derive(Debug, Clone)]
pub struct IndexQuery {
    pub tenant_id: TenantId,
    pub user_id: Option<UserId>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl IndexQuery {
    /// Every query starts from a tenant
    pub fn tenant(tenant_id: impl Into<TenantId>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            user_id: None,
            since: None,
            until: None,
            limit: None,
        }
    }

    pub fn user(mut self, user_id: impl Into<UserId>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Only records with `timestamp >= since`
    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    /// Only records with `timestamp <= until`
    pub fn until(mut self, until: DateTime<Utc>) -> Self {
        self.until = Some(until);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Statistics about the local store
#[derive(Debug)]
pub struct StoreStats {
    pub path: String,
    pub size_bytes: u64,
    pub record_count: usize,
    pub pending_count: usize,
    pub schema_version: u32,
    pub quota_bytes: Option<u64>,
}

/// Versioned, transactional local storage backed by sled.
///
/// Holds an exclusive filesystem lock (`<path>.lock`) for its lifetime so
/// that two processes never open the same store.
pub struct LocalStore {
    /// Lock file handle - flock released on drop
    _lock_file: File,
    path: PathBuf,
    db: sled::Db,
    pub(crate) records: sled::Tree,
    pub(crate) idx_tenant_date: sled::Tree,
    pub(crate) idx_tenant_user: sled::Tree,
    pub(crate) queue: sled::Tree,
    pub(crate) change_status: sled::Tree,
    pub(crate) meta: sled::Tree,
    quota_bytes: Option<u64>,
    schema_version: u32,
}

impl std::fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStore")
            .field("path", &self.path)
            .field("schema_version", &self.schema_version)
            .finish()
    }
}

impl LocalStore {
    /// Open or create a store at the given path, migrating it to `schema_version`.
    ///
    /// Returns `StorageError::Busy` if another process holds the store and
    /// `StorageError::Corrupted` if sled reports damage. A damaged store is
    /// never rewritten here.
    pub fn open(path: &Path, schema_version: u32) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let lock_path = path.with_extension("lock");
        let lock_file = File::create(&lock_path)?;
        lock_file.try_lock_exclusive().map_err(|e| {
            StorageError::Busy(format!("Store locked by another process: {}", e))
        })?;

        let db = sled::open(path)?;
        let records = db.open_tree("records")?;
        let idx_tenant_date = db.open_tree("idx_tenant_date")?;
        let idx_tenant_user = db.open_tree("idx_tenant_user")?;
        let queue = db.open_tree("queue")?;
        let change_status = db.open_tree("change_status")?;
        let meta = db.open_tree("meta")?;

        let mut store = Self {
            _lock_file: lock_file,
            path: path.to_path_buf(),
            db,
            records,
            idx_tenant_date,
            idx_tenant_user,
            queue,
            change_status,
            meta,
            quota_bytes: None,
            schema_version: 0,
        };
        store.schema_version = migrations::migrate(&store, schema_version)?;

        info!(
            path = %path.display(),
            schema_version = store.schema_version,
            "Local store opened"
        );
        Ok(store)
    }

    /// Refuse writes once the store grows beyond `quota_bytes`
    pub fn with_quota(mut self, quota_bytes: Option<u64>) -> Self {
        self.quota_bytes = quota_bytes;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    /// Run `f` as one atomic transaction over records, indices, the queue and
    /// delivery statuses.
    ///
    /// The closure may be re-run by sled on conflict, so it must not have
    /// side effects outside the transaction.
    pub fn transaction<F, T>(&self, f: F) -> Result<T, StorageError>
    where
        F: Fn(&StoreTx<'_>) -> TxResult<T>,
    {
        self.check_quota()?;

        let result = (
            &self.records,
            &self.idx_tenant_date,
            &self.idx_tenant_user,
            &self.queue,
            &self.change_status,
            &self.meta,
        )
            .transaction(|(records, by_date, by_user, queue, change_status, meta)| {
                let tx = StoreTx {
                    records,
                    by_date,
                    by_user,
                    queue,
                    change_status,
                    meta,
                };
                f(&tx)
            });

        match result {
            Ok(value) => Ok(value),
            Err(TransactionError::Abort(e)) => Err(e),
            Err(TransactionError::Storage(e)) => Err(e.into()),
        }
    }

    /// Upsert a record without queueing a change (e.g. data pulled from the server)
    pub fn put(
        &self,
        actor: &ActorContext,
        collection: &str,
        record: &Record,
    ) -> Result<(), StorageError> {
        self.transaction(|tx| tx.put(actor, collection, record).map(|_| ()))
    }

    /// Apply an offline mutation and queue it for sync in one transaction
    pub fn record_change(
        &self,
        actor: &ActorContext,
        audit_info: &AuditInfo,
        mutation: &Mutation,
    ) -> Result<ChangeId, StorageError> {
        let change_id = self.transaction(|tx| {
            match mutation {
                Mutation::Create { collection, record } | Mutation::Update { collection, record } => {
                    tx.put(actor, collection, record)?;
                }
                Mutation::Delete {
                    collection,
                    record_id,
                } => {
                    tx.delete(actor, collection, record_id)?;
                }
            }
            let (action, payload) = mutation
                .change_payload()
                .map_err(|e| ConflictableTransactionError::Abort(StorageError::from(e)))?;
            tx.enqueue(&ChangeDraft {
                action,
                collection: mutation.collection().to_string(),
                record_id: mutation.record_id().to_string(),
                payload,
                actor: actor.clone(),
                audit_info: audit_info.clone(),
            })
        })?;

        debug!(
            tenant = %actor.tenant_id,
            collection = mutation.collection(),
            record = mutation.record_id(),
            change_id,
            "Recorded offline change"
        );
        Ok(change_id)
    }

    /// Get a record by ID within a tenant
    pub fn get(
        &self,
        tenant_id: &str,
        collection: &str,
        id: &str,
    ) -> Result<Option<Record>, StorageError> {
        validate_key_part("collection", collection)?;
        validate_key_part("tenant_id", tenant_id)?;
        let key = record_key(collection, tenant_id, id);
        match self.records.get(&key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Get a record by ID, failing with `StorageError::NotFound` if absent
    pub fn require(
        &self,
        tenant_id: &str,
        collection: &str,
        id: &str,
    ) -> Result<Record, StorageError> {
        self.get(tenant_id, collection, id)?.ok_or_else(|| {
            StorageError::NotFound(format!("{} record '{}'", collection, id))
        })
    }

    /// List records of one tenant, ordered by timestamp
    pub fn list(&self, collection: &str, query: &IndexQuery) -> Result<Vec<Record>, StorageError> {
        validate_key_part("collection", collection)?;
        validate_key_part("tenant_id", &query.tenant_id)?;
        if let (Some(since), Some(until)) = (query.since, query.until) {
            if since > until {
                return Ok(Vec::new());
            }
        }

        let (tree, prefix) = match &query.user_id {
            Some(user) => {
                validate_key_part("user_id", user)?;
                (
                    &self.idx_tenant_user,
                    user_prefix(collection, &query.tenant_id, user),
                )
            }
            None => (
                &self.idx_tenant_date,
                tenant_prefix(collection, &query.tenant_id),
            ),
        };

        let mut lower = prefix.clone();
        if let Some(since) = query.since {
            lower.extend_from_slice(&encode_ts_millis(since.timestamp_millis()));
        }
        let upper = match query.until {
            Some(until) => {
                let mut key = prefix.clone();
                key.extend_from_slice(&encode_ts_millis(
                    until.timestamp_millis().saturating_add(1),
                ));
                key
            }
            None => prefix_upper_bound(&prefix),
        };

        let mut records = Vec::new();
        for result in tree.range(lower..upper) {
            let (key, _) = result?;
            let id = id_from_index_key(&key, prefix.len())?;
            let record = self.get(&query.tenant_id, collection, &id)?.ok_or_else(|| {
                StorageError::Corrupted(format!(
                    "index entry for {} '{}' has no record",
                    collection, id
                ))
            })?;
            if record.tenant_id != query.tenant_id {
                return Err(StorageError::Corrupted(format!(
                    "index entry for tenant '{}' points at a record of another tenant",
                    query.tenant_id
                )));
            }
            records.push(record);
            if query.limit.is_some_and(|limit| records.len() >= limit) {
                break;
            }
        }

        Ok(records)
    }

    /// Get database statistics
    pub fn stats(&self) -> Result<StoreStats, StorageError> {
        Ok(StoreStats {
            path: self.path.to_string_lossy().to_string(),
            size_bytes: self.db.size_on_disk()?,
            record_count: self.records.len(),
            pending_count: self.queue.len(),
            schema_version: self.schema_version,
            quota_bytes: self.quota_bytes,
        })
    }

    /// Flush pending writes to disk
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }

    fn check_quota(&self) -> Result<(), StorageError> {
        if let Some(limit) = self.quota_bytes {
            let used = self.db.size_on_disk()?;
            if used >= limit {
                return Err(StorageError::QuotaExceeded { used, limit });
            }
        }
        Ok(())
    }
}

/// Handle to an open store transaction
pub struct StoreTx<'a> {
    records: &'a TransactionalTree,
    by_date: &'a TransactionalTree,
    by_user: &'a TransactionalTree,
    queue: &'a TransactionalTree,
    change_status: &'a TransactionalTree,
    meta: &'a TransactionalTree,
}

impl StoreTx<'_> {
    /// Upsert a record by key, keeping both indices current.
    /// Returns the previous version, if any.
    pub fn put(
        &self,
        actor: &ActorContext,
        collection: &str,
        record: &Record,
    ) -> TxResult<Option<Record>> {
        check_key(validate_key_part("collection", collection))?;
        check_key(record.validate())?;
        ensure_tenant(actor, &record.tenant_id)?;

        let key = record_key(collection, &record.tenant_id, &record.id);
        let previous: Option<Record> = match self.records.get(&key)? {
            Some(bytes) => Some(from_json(&bytes)?),
            None => None,
        };
        if let Some(ref old) = previous {
            self.unindex(collection, old)?;
        }

        self.records.insert(key, to_json(record)?)?;
        self.by_date.insert(
            date_index_key(collection, &record.tenant_id, &record.timestamp, &record.id),
            EMPTY,
        )?;
        self.by_user.insert(
            user_index_key(
                collection,
                &record.tenant_id,
                &record.user_id,
                &record.timestamp,
                &record.id,
            ),
            EMPTY,
        )?;

        Ok(previous)
    }

    /// Delete a record of the actor's tenant. Returns the removed record, if any.
    pub fn delete(
        &self,
        actor: &ActorContext,
        collection: &str,
        record_id: &str,
    ) -> TxResult<Option<Record>> {
        check_key(validate_key_part("collection", collection))?;
        check_key(validate_key_part("record id", record_id))?;

        let key = record_key(collection, &actor.tenant_id, record_id);
        let previous: Option<Record> = match self.records.get(&key)? {
            Some(bytes) => Some(from_json(&bytes)?),
            None => None,
        };
        if let Some(ref old) = previous {
            self.unindex(collection, old)?;
            self.records.remove(key)?;
        }
        Ok(previous)
    }

    /// Append a change to the actor's tenant queue
    pub fn enqueue(&self, draft: &ChangeDraft) -> TxResult<ChangeId> {
        check_key(validate_key_part("collection", &draft.collection))?;
        check_key(validate_key_part("record id", &draft.record_id))?;

        let tenant = &draft.actor.tenant_id;
        let mut seq_key = QUEUE_SEQ_PREFIX.to_vec();
        seq_key.extend_from_slice(tenant.as_bytes());
        let id = next_counter(self.meta, seq_key)?;

        let change = PendingChange {
            id,
            action: draft.action,
            collection: draft.collection.clone(),
            record_id: draft.record_id.clone(),
            payload: draft.payload.clone(),
            created_at: Utc::now(),
            actor: draft.actor.clone(),
            audit_info: draft.audit_info.clone(),
        };
        self.queue.insert(queue_key(tenant, id), to_json(&change)?)?;
        Ok(id)
    }

    /// Read a queued change of a tenant
    pub(crate) fn pending(&self, tenant_id: &str, id: ChangeId) -> TxResult<Option<PendingChange>> {
        match self.queue.get(queue_key(tenant_id, id))? {
            Some(bytes) => Ok(Some(from_json(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Read the delivery status of a queued change
    pub(crate) fn status(&self, tenant_id: &str, id: ChangeId) -> TxResult<Option<ChangeStatus>> {
        match self.change_status.get(queue_key(tenant_id, id))? {
            Some(bytes) => Ok(Some(from_json(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Drop a queued change together with its delivery status
    pub(crate) fn dequeue(&self, tenant_id: &str, id: ChangeId) -> TxResult<()> {
        let key = queue_key(tenant_id, id);
        self.queue.remove(key.clone())?;
        self.change_status.remove(key)?;
        Ok(())
    }

    fn unindex(&self, collection: &str, record: &Record) -> TxResult<()> {
        self.by_date.remove(date_index_key(
            collection,
            &record.tenant_id,
            &record.timestamp,
            &record.id,
        ))?;
        self.by_user.remove(user_index_key(
            collection,
            &record.tenant_id,
            &record.user_id,
            &record.timestamp,
            &record.id,
        ))?;
        Ok(())
    }
}

/// Read, bump and store a big-endian u64 counter. The first value is 1.
pub(crate) fn next_counter<E: From<StorageError>>(
    tree: &TransactionalTree,
    key: Vec<u8>,
) -> Result<u64, ConflictableTransactionError<E>> {
    let current = match tree.get(&key)? {
        Some(bytes) => {
            let arr: [u8; 8] = bytes.as_ref().try_into().map_err(|_| {
                ConflictableTransactionError::Abort(
                    StorageError::Corrupted("malformed counter".to_string()).into(),
                )
            })?;
            u64::from_be_bytes(arr)
        }
        None => 0,
    };
    let next = current + 1;
    tree.insert(key, next.to_be_bytes().to_vec())?;
    Ok(next)
}

fn ensure_tenant(actor: &ActorContext, tenant_id: &str) -> TxResult<()> {
    if actor.tenant_id != tenant_id {
        return Err(ConflictableTransactionError::Abort(
            StorageError::TenantMismatch {
                actor: actor.tenant_id.clone(),
                record: tenant_id.to_string(),
            },
        ));
    }
    Ok(())
}

fn check_key(result: Result<(), crate::types::ids::IdError>) -> TxResult<()> {
    result.map_err(|e| ConflictableTransactionError::Abort(e.into()))
}

fn to_json<T: Serialize>(value: &T) -> TxResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| ConflictableTransactionError::Abort(e.into()))
}

fn from_json<T: DeserializeOwned>(bytes: &[u8]) -> TxResult<T> {
    serde_json::from_slice(bytes).map_err(|e| ConflictableTransactionError::Abort(e.into()))
}

// Key construction helpers

fn push_part(key: &mut Vec<u8>, part: &str) {
    key.extend_from_slice(part.as_bytes());
    key.push(KEY_SEPARATOR);
}

fn record_key(collection: &str, tenant_id: &str, id: &str) -> Vec<u8> {
    let mut key = tenant_prefix(collection, tenant_id);
    key.extend_from_slice(id.as_bytes());
    key
}

fn tenant_prefix(collection: &str, tenant_id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(collection.len() + tenant_id.len() + 2);
    push_part(&mut key, collection);
    push_part(&mut key, tenant_id);
    key
}

fn user_prefix(collection: &str, tenant_id: &str, user_id: &str) -> Vec<u8> {
    let mut key = tenant_prefix(collection, tenant_id);
    push_part(&mut key, user_id);
    key
}

fn date_index_key(collection: &str, tenant_id: &str, ts: &DateTime<Utc>, id: &str) -> Vec<u8> {
    let mut key = tenant_prefix(collection, tenant_id);
    key.extend_from_slice(&encode_ts_millis(ts.timestamp_millis()));
    key.extend_from_slice(id.as_bytes());
    key
}

fn user_index_key(
    collection: &str,
    tenant_id: &str,
    user_id: &str,
    ts: &DateTime<Utc>,
    id: &str,
) -> Vec<u8> {
    let mut key = user_prefix(collection, tenant_id, user_id);
    key.extend_from_slice(&encode_ts_millis(ts.timestamp_millis()));
    key.extend_from_slice(id.as_bytes());
    key
}

pub(crate) fn queue_key(tenant_id: &str, id: ChangeId) -> Vec<u8> {
    let mut key = queue_prefix(tenant_id);
    key.extend_from_slice(&id.to_be_bytes());
    key
}

pub(crate) fn queue_prefix(tenant_id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(tenant_id.len() + 1 + 8);
    push_part(&mut key, tenant_id);
    key
}

/// Order-preserving encoding of signed millisecond timestamps
fn encode_ts_millis(ms: i64) -> [u8; 8] {
    ((ms as u64) ^ (1 << 63)).to_be_bytes()
}

/// Smallest key greater than every key starting with `prefix`.
/// Prefixes always end with the separator byte.
fn prefix_upper_bound(prefix: &[u8]) -> Vec<u8> {
    let mut upper = prefix.to_vec();
    if let Some(last) = upper.last_mut() {
        *last += 1;
    }
    upper
}

/// Index key suffix format: <ts 8 bytes> <record id>
fn id_from_index_key(key: &[u8], prefix_len: usize) -> Result<String, StorageError> {
    let start = prefix_len + 8;
    if key.len() <= start {
        return Err(StorageError::Corrupted("invalid index key".to_string()));
    }
    String::from_utf8(key[start..].to_vec())
        .map_err(|_| StorageError::Corrupted("index key is not UTF-8".to_string()))
}

/// Collection name is the first component of a record key
fn collection_from_record_key(key: &[u8]) -> Result<String, StorageError> {
    let end = key
        .iter()
        .position(|b| *b == KEY_SEPARATOR)
        .ok_or_else(|| StorageError::Corrupted("invalid record key".to_string()))?;
    String::from_utf8(key[..end].to_vec())
        .map_err(|_| StorageError::Corrupted("record key is not UTF-8".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::change::ChangeAction;
    use crate::types::record::collections::{MEDICATIONS, SCHEDULES};
    use chrono::TimeZone;
    use serde_json::json;
    use tempfile::tempdir;

    fn actor(tenant: &str) -> ActorContext {
        ActorContext::new("nurse-1", tenant, "device-1").unwrap()
    }

    fn info() -> AuditInfo {
        AuditInfo::new("127.0.0.1", "caresync-test")
    }

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, hour, 0, 0).unwrap()
    }

    fn open(dir: &Path) -> LocalStore {
        LocalStore::open(&dir.join("store"), CURRENT_SCHEMA_VERSION).unwrap()
    }

    #[test]
    fn test_store_put_and_get() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        let a = actor("t1");

        let record = Record::new("r1", "t1", "nurse-1", json!({"drug": "paracetamol"}));
        store.put(&a, MEDICATIONS, &record).unwrap();

        let fetched = store.get("t1", MEDICATIONS, "r1").unwrap().unwrap();
        assert_eq!(fetched, record);
        assert!(store.get("t1", SCHEDULES, "r1").unwrap().is_none());
        assert!(matches!(
            store.require("t1", MEDICATIONS, "missing"),
            Err(StorageError::NotFound(_))
        ));
    }

    #[test]
    fn test_store_put_rejects_foreign_tenant() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());

        let record = Record::new("r1", "t2", "nurse-1", json!({}));
        let result = store.put(&actor("t1"), MEDICATIONS, &record);
        assert!(matches!(result, Err(StorageError::TenantMismatch { .. })));
        assert!(store.get("t2", MEDICATIONS, "r1").unwrap().is_none());
    }

    #[test]
    fn test_list_is_tenant_scoped() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());

        for (tenant, id) in [("a", "r1"), ("a", "r2"), ("b", "r3")] {
            let record = Record::new(id, tenant, "nurse-1", json!({}));
            store.put(&actor(tenant), MEDICATIONS, &record).unwrap();
        }

        let listed = store.list(MEDICATIONS, &IndexQuery::tenant("a")).unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().all(|r| r.tenant_id == "a"));

        let listed = store.list(MEDICATIONS, &IndexQuery::tenant("b")).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "r3");
    }

    #[test]
    fn test_tenant_prefix_does_not_leak_into_longer_tenant() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());

        store
            .put(&actor("care"), MEDICATIONS, &Record::new("r1", "care", "u", json!({})))
            .unwrap();
        store
            .put(&actor("care2"), MEDICATIONS, &Record::new("r2", "care2", "u", json!({})))
            .unwrap();

        let listed = store.list(MEDICATIONS, &IndexQuery::tenant("care")).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "r1");
    }

    #[test]
    fn test_list_filters_by_user_and_date() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        let a = actor("t1");

        let rows = [
            ("r1", "alice", 8),
            ("r2", "bob", 9),
            ("r3", "alice", 10),
            ("r4", "alice", 12),
        ];
        for (id, user, hour) in rows {
            let record = Record::new(id, "t1", user, json!({})).with_timestamp(at(hour));
            store.put(&a, MEDICATIONS, &record).unwrap();
        }

        let by_user = store
            .list(MEDICATIONS, &IndexQuery::tenant("t1").user("alice"))
            .unwrap();
        let ids: Vec<_> = by_user.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["r1", "r3", "r4"]);

        let by_date = store
            .list(MEDICATIONS, &IndexQuery::tenant("t1").since(at(9)).until(at(10)))
            .unwrap();
        let ids: Vec<_> = by_date.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["r2", "r3"]);

        let both = store
            .list(
                MEDICATIONS,
                &IndexQuery::tenant("t1").user("alice").since(at(9)).until(at(12)),
            )
            .unwrap();
        let ids: Vec<_> = both.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["r3", "r4"]);

        let limited = store
            .list(MEDICATIONS, &IndexQuery::tenant("t1").limit(2))
            .unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[test]
    fn test_update_moves_index_entries() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        let a = actor("t1");

        let record = Record::new("r1", "t1", "alice", json!({"v": 1})).with_timestamp(at(8));
        store.put(&a, MEDICATIONS, &record).unwrap();
        let record = Record::new("r1", "t1", "bob", json!({"v": 2})).with_timestamp(at(15));
        store.put(&a, MEDICATIONS, &record).unwrap();

        let alice = store
            .list(MEDICATIONS, &IndexQuery::tenant("t1").user("alice"))
            .unwrap();
        assert!(alice.is_empty());

        let all = store.list(MEDICATIONS, &IndexQuery::tenant("t1")).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].payload, json!({"v": 2}));
    }

    #[test]
    fn test_record_change_writes_record_and_queue_entry() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        let a = actor("t1");

        let record = Record::new("r1", "t1", "nurse-1", json!({"dose": "5mg"}));
        let id = store
            .record_change(
                &a,
                &info(),
                &Mutation::Create {
                    collection: MEDICATIONS.to_string(),
                    record: record.clone(),
                },
            )
            .unwrap();

        assert_eq!(id, 1);
        assert!(store.get("t1", MEDICATIONS, "r1").unwrap().is_some());
        let pending = store.queue().drain_order("t1").unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].record_id, "r1");
        assert_eq!(pending[0].action, ChangeAction::Create);
    }

    #[test]
    fn test_record_change_rolls_back_on_failure() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());

        let record = Record::new("r1", "other-tenant", "nurse-1", json!({}));
        let result = store.record_change(
            &actor("t1"),
            &info(),
            &Mutation::Create {
                collection: MEDICATIONS.to_string(),
                record,
            },
        );

        assert!(result.is_err());
        assert!(store.queue().drain_order("t1").unwrap().is_empty());
        assert!(store.queue().drain_order("other-tenant").unwrap().is_empty());
        assert!(store.get("other-tenant", MEDICATIONS, "r1").unwrap().is_none());
    }

    #[test]
    fn test_transaction_abort_discards_record_write() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        let a = actor("t1");

        let result: Result<(), StorageError> = store.transaction(|tx| {
            tx.put(&a, MEDICATIONS, &Record::new("r1", "t1", "nurse-1", json!({})))?;
            Err(ConflictableTransactionError::Abort(StorageError::Corrupted(
                "simulated queue failure".to_string(),
            )))
        });

        assert!(result.is_err());
        assert!(store.get("t1", MEDICATIONS, "r1").unwrap().is_none());
    }

    #[test]
    fn test_delete_removes_record_and_indices() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        let a = actor("t1");

        store
            .put(&a, MEDICATIONS, &Record::new("r1", "t1", "nurse-1", json!({})))
            .unwrap();
        store
            .record_change(
                &a,
                &info(),
                &Mutation::Delete {
                    collection: MEDICATIONS.to_string(),
                    record_id: "r1".to_string(),
                },
            )
            .unwrap();

        assert!(store.get("t1", MEDICATIONS, "r1").unwrap().is_none());
        assert!(store.list(MEDICATIONS, &IndexQuery::tenant("t1")).unwrap().is_empty());
        let pending = store.queue().drain_order("t1").unwrap();
        assert_eq!(pending[0].action, ChangeAction::Delete);
    }

    #[test]
    fn test_quota_exceeded_refuses_writes() {
        let dir = tempdir().unwrap();
        let store = open(dir.path()).with_quota(Some(1));

        let result = store.put(
            &actor("t1"),
            MEDICATIONS,
            &Record::new("r1", "t1", "nurse-1", json!({})),
        );
        assert!(matches!(result, Err(StorageError::QuotaExceeded { .. })));
    }

    #[test]
    fn test_second_open_is_busy() {
        let dir = tempdir().unwrap();
        let _store = open(dir.path());

        let result = LocalStore::open(&dir.path().join("store"), CURRENT_SCHEMA_VERSION);
        assert!(matches!(result, Err(StorageError::Busy(_))));
    }

    #[test]
    fn test_reopen_preserves_data() {
        let dir = tempdir().unwrap();
        {
            let store = open(dir.path());
            store
                .put(&actor("t1"), MEDICATIONS, &Record::new("r1", "t1", "u", json!({})))
                .unwrap();
            store.flush().unwrap();
        }

        let store = open(dir.path());
        assert!(store.get("t1", MEDICATIONS, "r1").unwrap().is_some());
        let stats = store.stats().unwrap();
        assert_eq!(stats.record_count, 1);
        assert_eq!(stats.schema_version, CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_invalid_collection_rejected() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());

        let result = store.put(
            &actor("t1"),
            "bad\0name",
            &Record::new("r1", "t1", "u", json!({})),
        );
        assert!(matches!(result, Err(StorageError::InvalidKey(_))));
    }

    #[test]
    fn test_encode_ts_preserves_order() {
        assert!(encode_ts_millis(-5) < encode_ts_millis(0));
        assert!(encode_ts_millis(0) < encode_ts_millis(1));
        assert!(encode_ts_millis(1_700_000_000_000) < encode_ts_millis(1_700_000_000_001));
    }
}
