//! Durable per-tenant FIFO of pending changes.
//!
//! Changes are appended by [`StoreTx::enqueue`](crate::store::StoreTx::enqueue)
//! in the same transaction as the record write, and removed only after the
//! remote acknowledges them. Delivery failures are tracked in a separate
//! `change_status` tree keyed like the queue itself.

use std::collections::HashMap;

use chrono::Utc;
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::Transactional;
use tracing::debug;

use crate::error::{QueueError, StorageError};
use crate::store::{queue_key, queue_prefix, LocalStore};
use crate::types::actor::{ActorContext, AuditInfo};
use crate::types::change::{ChangeDraft, ChangeState, ChangeStatus, PendingChange, Resolution};
use crate::types::ids::{validate_key_part, ChangeId};
use crate::types::record::Mutation;

/// View of the change queue inside a [`LocalStore`]
pub struct ChangeQueue<'a> {
    store: &'a LocalStore,
}

impl LocalStore {
    pub fn queue(&self) -> ChangeQueue<'_> {
        ChangeQueue { store: self }
    }
}

impl ChangeQueue<'_> {
    /// All pending changes of a tenant, in creation order
    pub fn drain_order(&self, tenant_id: &str) -> Result<Vec<PendingChange>, QueueError> {
        validate_key_part("tenant_id", tenant_id).map_err(crate::error::StorageError::from)?;
        let mut changes = Vec::new();
        for result in self.store.queue.scan_prefix(queue_prefix(tenant_id)) {
            let (_, value) = result?;
            changes.push(serde_json::from_slice(&value)?);
        }
        Ok(changes)
    }

    /// Get a single pending change
    pub fn get(&self, tenant_id: &str, id: ChangeId) -> Result<Option<PendingChange>, QueueError> {
        match self.store.queue.get(queue_key(tenant_id, id))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn pending_count(&self, tenant_id: &str) -> Result<usize, QueueError> {
        let mut count = 0;
        for result in self.store.queue.scan_prefix(queue_prefix(tenant_id)) {
            result?;
            count += 1;
        }
        Ok(count)
    }

    /// Remove an acknowledged change and its delivery status.
    /// Removing an absent change is a no-op.
    pub fn remove(&self, tenant_id: &str, id: ChangeId) -> Result<(), QueueError> {
        let key = queue_key(tenant_id, id);
        let removed = (&self.store.queue, &self.store.change_status)
            .transaction(|(queue, status)| {
                let removed = queue.remove(key.clone())?;
                status.remove(key.clone())?;
                Ok::<_, ConflictableTransactionError<QueueError>>(removed.is_some())
            })
            .map_err(unwrap_tx_error)?;

        if removed {
            debug!(tenant = tenant_id, change_id = id, "Removed acknowledged change");
        } else {
            debug!(tenant = tenant_id, change_id = id, "Change already removed");
        }
        Ok(())
    }

    /// Delivery status of a change, if an attempt has failed
    pub fn status(&self, tenant_id: &str, id: ChangeId) -> Result<Option<ChangeStatus>, QueueError> {
        match self.store.change_status.get(queue_key(tenant_id, id))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Delivery statuses of all changes of a tenant that have failed at least once
    pub fn statuses(&self, tenant_id: &str) -> Result<HashMap<ChangeId, ChangeStatus>, QueueError> {
        let prefix = queue_prefix(tenant_id);
        let mut statuses = HashMap::new();
        for result in self.store.change_status.scan_prefix(&prefix) {
            let (key, value) = result?;
            let id = change_id_from_key(&key, prefix.len())?;
            statuses.insert(id, serde_json::from_slice(&value)?);
        }
        Ok(statuses)
    }

    /// Record a transient delivery failure (timeout, network, server error)
    pub fn mark_failed(&self, tenant_id: &str, id: ChangeId, error: &str) -> Result<ChangeStatus, QueueError> {
        self.record_attempt(tenant_id, id, ChangeState::Failed, Some(error.to_string()))
    }

    /// Record that the remote refused the change. It stays queued.
    pub fn mark_rejected(&self, tenant_id: &str, id: ChangeId, reason: &str) -> Result<ChangeStatus, QueueError> {
        self.record_attempt(
            tenant_id,
            id,
            ChangeState::Rejected {
                reason: reason.to_string(),
            },
            Some(reason.to_string()),
        )
    }

    /// Hold the change until [`resolve_conflict`](Self::resolve_conflict) is called
    pub fn mark_conflict(
        &self,
        tenant_id: &str,
        id: ChangeId,
        server_version: &str,
    ) -> Result<ChangeStatus, QueueError> {
        self.record_attempt(
            tenant_id,
            id,
            ChangeState::Conflict {
                server_version: server_version.to_string(),
            },
            None,
        )
    }

    /// Pending changes of a tenant currently held in conflict
    pub fn conflicts(&self, tenant_id: &str) -> Result<Vec<(PendingChange, ChangeStatus)>, QueueError> {
        let statuses = self.statuses(tenant_id)?;
        let mut held = Vec::new();
        for change in self.drain_order(tenant_id)? {
            if let Some(status) = statuses.get(&change.id) {
                if status.is_conflict() {
                    held.push((change, status.clone()));
                }
            }
        }
        Ok(held)
    }

    /// Release a conflicted change.
    ///
    /// `Retry` resends the change as it is. `Replace` stores the merged record
    /// and swaps the conflicted change for a new one in the same transaction,
    /// so the remote sees a fresh idempotency key. Returns the change that the
    /// next cycle will send.
    pub fn resolve_conflict(
        &self,
        actor: &ActorContext,
        audit_info: &AuditInfo,
        id: ChangeId,
        resolution: &Resolution,
    ) -> Result<PendingChange, QueueError> {
        let tenant_id = actor.tenant_id.as_str();
        let record = match resolution {
            Resolution::Retry => {
                let change = self.retry_conflict(tenant_id, id)?;
                debug!(tenant = tenant_id, change_id = id, "Conflict resolved, resending");
                return Ok(change);
            }
            Resolution::Replace(record) => record,
        };

        let outcome = self.store.transaction(|tx| {
            let change = match tx.pending(tenant_id, id)? {
                Some(change) => change,
                None => return Ok(Err(QueueError::NotQueued(id))),
            };
            if !tx.status(tenant_id, id)?.is_some_and(|s| s.is_conflict()) {
                return Ok(Err(QueueError::NotInConflict(id)));
            }
            if record.id != change.record_id {
                return Ok(Err(QueueError::ResolutionMismatch {
                    change: id,
                    expected: change.record_id.clone(),
                    found: record.id.clone(),
                }));
            }

            let mutation = Mutation::Update {
                collection: change.collection.clone(),
                record: record.clone(),
            };
            let (action, payload) = mutation
                .change_payload()
                .map_err(|e| ConflictableTransactionError::Abort(StorageError::from(e)))?;
            tx.put(actor, &change.collection, record)?;
            tx.dequeue(tenant_id, id)?;
            let new_id = tx.enqueue(&ChangeDraft {
                action,
                collection: change.collection,
                record_id: change.record_id,
                payload,
                actor: actor.clone(),
                audit_info: audit_info.clone(),
            })?;
            Ok(Ok(new_id))
        })?;
        let new_id = outcome?;

        debug!(
            tenant = tenant_id,
            change_id = id,
            replacement = new_id,
            "Conflict resolved with merged record"
        );
        self.get(tenant_id, new_id)?
            .ok_or(QueueError::NotQueued(new_id))
    }

    fn retry_conflict(&self, tenant_id: &str, id: ChangeId) -> Result<PendingChange, QueueError> {
        let key = queue_key(tenant_id, id);
        (&self.store.queue, &self.store.change_status)
            .transaction(|(queue, status)| {
                let change: PendingChange = match queue.get(&key)? {
                    Some(bytes) => serde_json::from_slice(&bytes)
                        .map_err(|e| ConflictableTransactionError::Abort(QueueError::from(e)))?,
                    None => return Err(ConflictableTransactionError::Abort(QueueError::NotQueued(id))),
                };
                let current: Option<ChangeStatus> = match status.get(&key)? {
                    Some(bytes) => Some(
                        serde_json::from_slice(&bytes)
                            .map_err(|e| ConflictableTransactionError::Abort(QueueError::from(e)))?,
                    ),
                    None => None,
                };
                if !current.is_some_and(|s| s.is_conflict()) {
                    return Err(ConflictableTransactionError::Abort(QueueError::NotInConflict(id)));
                }
                status.remove(key.clone())?;
                Ok(change)
            })
            .map_err(unwrap_tx_error)
    }

    fn record_attempt(
        &self,
        tenant_id: &str,
        id: ChangeId,
        state: ChangeState,
        last_error: Option<String>,
    ) -> Result<ChangeStatus, QueueError> {
        let key = queue_key(tenant_id, id);
        let now = Utc::now();
        (&self.store.queue, &self.store.change_status)
            .transaction(|(queue, status)| {
                if queue.get(&key)?.is_none() {
                    return Err(ConflictableTransactionError::Abort(QueueError::NotQueued(id)));
                }
                let attempts = match status.get(&key)? {
                    Some(bytes) => serde_json::from_slice::<ChangeStatus>(&bytes)
                        .map(|s| s.attempts)
                        .map_err(|e| ConflictableTransactionError::Abort(QueueError::from(e)))?,
                    None => 0,
                };
                let next = ChangeStatus {
                    state: state.clone(),
                    attempts: attempts.saturating_add(1),
                    last_error: last_error.clone(),
                    last_attempt_at: now,
                };
                let bytes = serde_json::to_vec(&next)
                    .map_err(|e| ConflictableTransactionError::Abort(QueueError::from(e)))?;
                status.insert(key.clone(), bytes)?;
                Ok(next)
            })
            .map_err(unwrap_tx_error)
    }
}

fn unwrap_tx_error(e: TransactionError<QueueError>) -> QueueError {
    match e {
        TransactionError::Abort(e) => e,
        TransactionError::Storage(e) => e.into(),
    }
}

fn change_id_from_key(key: &[u8], prefix_len: usize) -> Result<ChangeId, QueueError> {
    let arr: [u8; 8] = key
        .get(prefix_len..)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| crate::error::StorageError::Corrupted("invalid queue key".to_string()))?;
    Ok(u64::from_be_bytes(arr))
}
