//! Ordered, idempotent schema migrations for the local store.
//!
//! The applied version is stored under `schema_version` in the `meta` tree.
//! Each step runs at most once and bumps the stored version when it succeeds.

use tracing::info;

use super::{collection_from_record_key, user_index_key, LocalStore, EMPTY};
use crate::error::StorageError;
use crate::types::record::Record;

/// Schema version written by this build
pub const CURRENT_SCHEMA_VERSION: u32 = 3;

const SCHEMA_VERSION_KEY: &[u8] = b"schema_version";

struct Migration {
    version: u32,
    description: &'static str,
    apply: fn(&LocalStore) -> Result<(), StorageError>,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "initial layout: records, tenant/date index, change queue",
        apply: initial_layout,
    },
    Migration {
        version: 2,
        description: "backfill tenant/user index",
        apply: backfill_user_index,
    },
    Migration {
        version: 3,
        description: "per-change delivery status",
        apply: change_status_tree,
    },
];

/// Read the stored schema version (0 for a fresh store)
pub(super) fn stored_version(meta: &sled::Tree) -> Result<u32, StorageError> {
    match meta.get(SCHEMA_VERSION_KEY)? {
        Some(bytes) => {
            let arr: [u8; 4] = bytes.as_ref().try_into().map_err(|_| {
                StorageError::Corrupted("malformed schema version".to_string())
            })?;
            Ok(u32::from_be_bytes(arr))
        }
        None => Ok(0),
    }
}

/// Bring the store to `requested`, returning the resulting version.
///
/// Downgrades and versions unknown to this build fail with
/// `StorageError::SchemaMismatch` and leave the store untouched.
pub(super) fn migrate(store: &LocalStore, requested: u32) -> Result<u32, StorageError> {
    let found = stored_version(&store.meta)?;
    if requested == 0 || requested < found || requested > CURRENT_SCHEMA_VERSION {
        return Err(StorageError::SchemaMismatch { found, requested });
    }

    for migration in MIGRATIONS
        .iter()
        .filter(|m| m.version > found && m.version <= requested)
    {
        info!(
            version = migration.version,
            description = migration.description,
            "Applying store migration"
        );
        (migration.apply)(store)?;
        store
            .meta
            .insert(SCHEMA_VERSION_KEY, migration.version.to_be_bytes().to_vec())?;
    }

    store.meta.flush()?;
    Ok(requested)
}

fn initial_layout(_store: &LocalStore) -> Result<(), StorageError> {
    // Trees are created on open; nothing to rewrite
    Ok(())
}

fn backfill_user_index(store: &LocalStore) -> Result<(), StorageError> {
    let mut count = 0usize;
    for result in store.records.iter() {
        let (key, value) = result?;
        let collection = collection_from_record_key(&key)?;
        let record: Record = serde_json::from_slice(&value)?;
        store.idx_tenant_user.insert(
            user_index_key(
                &collection,
                &record.tenant_id,
                &record.user_id,
                &record.timestamp,
                &record.id,
            ),
            EMPTY,
        )?;
        count += 1;
    }
    info!(count, "Backfilled tenant/user index");
    Ok(())
}

fn change_status_tree(_store: &LocalStore) -> Result<(), StorageError> {
    // The tree is opened with the store; older stores simply have no entries yet
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::IndexQuery;
    use crate::types::actor::{ActorContext, AuditInfo};
    use crate::types::record::collections::MEDICATIONS;
    use crate::types::record::Mutation;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn test_fresh_store_reaches_current_version() {
        let dir = tempdir().unwrap();
        let store = LocalStore::open(&dir.path().join("store"), CURRENT_SCHEMA_VERSION).unwrap();
        assert_eq!(stored_version(&store.meta).unwrap(), CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_reopen_at_same_version_is_noop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store");
        drop(LocalStore::open(&path, CURRENT_SCHEMA_VERSION).unwrap());
        let store = LocalStore::open(&path, CURRENT_SCHEMA_VERSION).unwrap();
        assert_eq!(store.schema_version(), CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_downgrade_is_schema_mismatch() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store");
        drop(LocalStore::open(&path, 3).unwrap());

        let result = LocalStore::open(&path, 2);
        assert!(matches!(
            result,
            Err(StorageError::SchemaMismatch {
                found: 3,
                requested: 2
            })
        ));
    }

    #[test]
    fn test_unknown_future_version_is_schema_mismatch() {
        let dir = tempdir().unwrap();
        let result = LocalStore::open(&dir.path().join("store"), CURRENT_SCHEMA_VERSION + 1);
        assert!(matches!(result, Err(StorageError::SchemaMismatch { .. })));
    }

    #[test]
    fn test_upgrade_from_v1_backfills_user_index() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store");
        {
            let store = LocalStore::open(&path, 1).unwrap();
            let actor = ActorContext::new("alice", "t1", "d1").unwrap();
            store
                .put(&actor, MEDICATIONS, &Record::new("r1", "t1", "alice", json!({})))
                .unwrap();
            // Simulate a v1 store that never had the user index
            store.idx_tenant_user.clear().unwrap();
            store.flush().unwrap();
        }

        let store = LocalStore::open(&path, CURRENT_SCHEMA_VERSION).unwrap();
        let listed = store
            .list(MEDICATIONS, &IndexQuery::tenant("t1").user("alice"))
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(store.schema_version(), CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_upgrade_to_v3_keeps_delivery_statuses() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store");
        let actor = ActorContext::new("alice", "t1", "d1").unwrap();
        let id = {
            let store = LocalStore::open(&path, 2).unwrap();
            let id = store
                .record_change(
                    &actor,
                    &AuditInfo::new("127.0.0.1", "test"),
                    &Mutation::Create {
                        collection: MEDICATIONS.to_string(),
                        record: Record::new("r1", "t1", "alice", json!({})),
                    },
                )
                .unwrap();
            store.queue().mark_failed("t1", id, "timeout").unwrap();
            store.flush().unwrap();
            id
        };

        let store = LocalStore::open(&path, 3).unwrap();
        let status = store.queue().status("t1", id).unwrap().unwrap();
        assert_eq!(status.attempts, 1);
        assert_eq!(status.last_error.as_deref(), Some("timeout"));
    }
}
