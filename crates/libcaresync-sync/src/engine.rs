//! Engine - the application-facing entry point
//!
//! Owns the local store and audit log. If the store cannot be opened the
//! engine keeps running in online-only mode: writes go straight to the remote
//! when one is attached and are refused otherwise, never accepted into a store
//! that cannot keep them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use libcaresync_core::audit::{AuditLog, TracingSink};
use libcaresync_core::config::EngineConfig;
use libcaresync_core::error::StorageError;
use libcaresync_core::store::{IndexQuery, LocalStore};
use libcaresync_core::types::actor::{ActorContext, AuditInfo};
use libcaresync_core::types::audit::actions;
use libcaresync_core::types::change::{PendingChange, Resolution};
use libcaresync_core::types::ids::{generate_request_id, validate_key_part, ChangeId, TenantId};
use libcaresync_core::types::record::{Mutation, Record};
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use crate::coordinator::SyncCoordinator;
use crate::error::{EngineError, RemoteError};
use crate::remote::{RemoteEndpoint, RemoteResponse, SyncRequest};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Mode {
    /// Local store available; writes are queued for sync
    OfflineCapable,
    /// Local store unavailable; writes go directly to the remote or are refused
    OnlineOnly { reason: String },
}

/// What happened to a write passed to [`Engine::submit`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WriteOutcome {
    /// Stored locally and queued for sync
    Queued { change_id: ChangeId },
    /// Sent straight to the remote, which accepted it
    Delivered { idempotency_key: String },
}

/// Snapshot reported by `Engine::status`
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    #[serde(flatten)]
    pub mode: Mode,
    pub pending: usize,
    pub conflicts: usize,
    pub audit_available: bool,
    pub audit_failures: u64,
}

pub struct Engine {
    config: EngineConfig,
    mode: Mode,
    store: Option<Arc<LocalStore>>,
    audit: Option<Arc<AuditLog>>,
    remote: Option<Arc<dyn RemoteEndpoint>>,
    coordinators: Mutex<HashMap<TenantId, Arc<SyncCoordinator>>>,
}

impl Engine {
    /// Open the store and audit log described by `config`.
    ///
    /// Never fails: storage problems switch the engine to online-only mode.
    pub fn open(config: &EngineConfig) -> Self {
        let (mode, store) = match LocalStore::open(&config.store_path(), config.schema_version) {
            Ok(store) => (
                Mode::OfflineCapable,
                Some(Arc::new(store.with_quota(config.quota_bytes))),
            ),
            Err(e) => {
                warn!(
                    path = %config.store_path().display(),
                    error = %e,
                    "Local store unavailable, running online-only"
                );
                (
                    Mode::OnlineOnly {
                        reason: e.to_string(),
                    },
                    None,
                )
            }
        };

        let audit = match AuditLog::open(&config.audit_path()) {
            Ok(log) => Some(Arc::new(log.with_sink(Arc::new(TracingSink)))),
            Err(e) => {
                warn!(error = %e, "Audit log unavailable, audit entries will be dropped");
                None
            }
        };

        info!(mode = ?mode, data_dir = %config.data_dir.display(), "Engine opened");
        Self {
            config: config.clone(),
            mode,
            store,
            audit,
            remote: None,
            coordinators: Mutex::new(HashMap::new()),
        }
    }

    /// Attach the sync server used by coordinators and online-only writes
    pub fn with_remote(mut self, remote: Arc<dyn RemoteEndpoint>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn has_remote(&self) -> bool {
        self.remote.is_some()
    }

    pub fn mode(&self) -> &Mode {
        &self.mode
    }

    pub fn is_offline_capable(&self) -> bool {
        matches!(self.mode, Mode::OfflineCapable)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The local store, or `OfflineUnavailable` in online-only mode
    pub fn store(&self) -> Result<&Arc<LocalStore>, EngineError> {
        match (&self.store, &self.mode) {
            (Some(store), _) => Ok(store),
            (None, Mode::OnlineOnly { reason }) => Err(EngineError::OfflineUnavailable(reason.clone())),
            (None, Mode::OfflineCapable) => Err(EngineError::OfflineUnavailable(
                "local store not open".to_string(),
            )),
        }
    }

    pub fn audit(&self) -> Option<&Arc<AuditLog>> {
        self.audit.as_ref()
    }

    /// Record an offline mutation and queue it for sync
    pub fn write(
        &self,
        actor: &ActorContext,
        info: &AuditInfo,
        mutation: &Mutation,
    ) -> Result<ChangeId, EngineError> {
        let store = self.store()?;
        let change_id = store.record_change(actor, info, mutation)?;
        self.audit_event(
            actor,
            actions::RECORD_WRITE,
            json!({
                "collection": mutation.collection(),
                "record_id": mutation.record_id(),
                "change_id": change_id,
            }),
            info,
        );
        Ok(change_id)
    }

    /// Apply a mutation in whichever way the current mode allows.
    ///
    /// Offline-capable engines queue it like [`write`](Self::write). In
    /// online-only mode it is pushed to the remote at once, under the sync
    /// request timeout; without a remote, or if the push fails, the write is
    /// refused.
    pub async fn submit(
        &self,
        actor: &ActorContext,
        info: &AuditInfo,
        mutation: &Mutation,
    ) -> Result<WriteOutcome, EngineError> {
        if self.store.is_some() {
            let change_id = self.write(actor, info, mutation)?;
            return Ok(WriteOutcome::Queued { change_id });
        }
        let Some(remote) = &self.remote else {
            return Err(self.offline_unavailable());
        };

        let request = direct_request(actor, mutation)?;
        let response = match tokio::time::timeout(
            self.config.sync.request_timeout(),
            remote.push(&request),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => return Err(RemoteError::Timeout.into()),
        };

        match response {
            RemoteResponse::Accepted => {
                info!(
                    tenant = %actor.tenant_id,
                    collection = mutation.collection(),
                    record = mutation.record_id(),
                    "Delivered write directly to remote"
                );
                self.audit_event(
                    actor,
                    actions::RECORD_WRITE,
                    json!({
                        "collection": mutation.collection(),
                        "record_id": mutation.record_id(),
                        "idempotency_key": request.idempotency_key,
                        "direct": true,
                    }),
                    info,
                );
                Ok(WriteOutcome::Delivered {
                    idempotency_key: request.idempotency_key,
                })
            }
            RemoteResponse::Rejected(reason) => Err(EngineError::Rejected(reason)),
            RemoteResponse::Conflict(server_version) => Err(EngineError::Conflict(server_version)),
        }
    }

    /// Read a record of the actor's tenant
    pub fn read(
        &self,
        actor: &ActorContext,
        info: &AuditInfo,
        collection: &str,
        id: &str,
    ) -> Result<Option<Record>, EngineError> {
        let store = self.store()?;
        let record = store.get(&actor.tenant_id, collection, id)?;
        self.audit_event(
            actor,
            actions::RECORD_READ,
            json!({
                "collection": collection,
                "record_id": id,
                "found": record.is_some(),
            }),
            info,
        );
        Ok(record)
    }

    /// List records; the query must target the actor's tenant
    pub fn list(
        &self,
        actor: &ActorContext,
        collection: &str,
        query: &IndexQuery,
    ) -> Result<Vec<Record>, EngineError> {
        if query.tenant_id != actor.tenant_id {
            return Err(StorageError::TenantMismatch {
                actor: actor.tenant_id.clone(),
                record: query.tenant_id.clone(),
            }
            .into());
        }
        Ok(self.store()?.list(collection, query)?)
    }

    pub fn status(&self, tenant_id: &str) -> Result<EngineStatus, EngineError> {
        let (pending, conflicts) = match &self.store {
            Some(store) => (
                store.queue().pending_count(tenant_id)?,
                store.queue().conflicts(tenant_id)?.len(),
            ),
            None => (0, 0),
        };
        Ok(EngineStatus {
            mode: self.mode.clone(),
            pending,
            conflicts,
            audit_available: self.audit.is_some(),
            audit_failures: self.audit.as_ref().map_or(0, |a| a.failure_count()),
        })
    }

    /// The coordinator of the actor's tenant.
    ///
    /// Built on first use and shared afterwards, so every caller sees the same
    /// cycle guard and progress channel.
    pub fn coordinator(&self, actor: &ActorContext) -> Result<Arc<SyncCoordinator>, EngineError> {
        let store = self.store()?;
        let remote = self.remote.as_ref().ok_or(EngineError::NoRemote)?;

        let mut coordinators = lock(&self.coordinators);
        if let Some(coordinator) = coordinators.get(&actor.tenant_id) {
            return Ok(Arc::clone(coordinator));
        }
        let mut coordinator = SyncCoordinator::new(
            Arc::clone(store),
            Arc::clone(remote),
            actor.clone(),
            self.config.sync.clone(),
        );
        if let Some(audit) = &self.audit {
            coordinator = coordinator.with_audit(Arc::clone(audit));
        }
        let coordinator = Arc::new(coordinator);
        coordinators.insert(actor.tenant_id.clone(), Arc::clone(&coordinator));
        Ok(coordinator)
    }

    /// Release a conflicted change so it is sent again, either unchanged or
    /// as a new change carrying the merged record
    pub fn resolve_conflict(
        &self,
        actor: &ActorContext,
        info: &AuditInfo,
        change_id: ChangeId,
        resolution: &Resolution,
    ) -> Result<PendingChange, EngineError> {
        let change = self
            .store()?
            .queue()
            .resolve_conflict(actor, info, change_id, resolution)?;
        self.audit_event(
            actor,
            actions::CONFLICT_RESOLVED,
            json!({
                "change_id": change_id,
                "resent_as": change.id,
                "record_id": change.record_id,
                "resolution": match resolution {
                    Resolution::Retry => "retry",
                    Resolution::Replace(_) => "replace",
                },
            }),
            info,
        );
        Ok(change)
    }

    /// Flush the store and audit log to disk
    pub fn flush(&self) -> Result<(), EngineError> {
        if let Some(store) = &self.store {
            store.flush()?;
        }
        if let Some(audit) = &self.audit {
            audit.flush()?;
        }
        Ok(())
    }

    fn offline_unavailable(&self) -> EngineError {
        match &self.mode {
            Mode::OnlineOnly { reason } => EngineError::OfflineUnavailable(reason.clone()),
            Mode::OfflineCapable => EngineError::OfflineUnavailable("local store not open".to_string()),
        }
    }

    fn audit_event(&self, actor: &ActorContext, action: &str, details: serde_json::Value, info: &AuditInfo) {
        if let Some(audit) = &self.audit {
            audit.record(actor, action, details, info);
        }
    }
}

/// Wire request for a write that bypasses the queue. The key is random since
/// there is no change id to derive it from.
fn direct_request(actor: &ActorContext, mutation: &Mutation) -> Result<SyncRequest, EngineError> {
    validate_key_part("collection", mutation.collection()).map_err(StorageError::from)?;
    match mutation {
        Mutation::Create { record, .. } | Mutation::Update { record, .. } => {
            record.validate().map_err(StorageError::from)?;
            if record.tenant_id != actor.tenant_id {
                return Err(StorageError::TenantMismatch {
                    actor: actor.tenant_id.clone(),
                    record: record.tenant_id.clone(),
                }
                .into());
            }
        }
        Mutation::Delete { record_id, .. } => {
            validate_key_part("record id", record_id).map_err(StorageError::from)?;
        }
    }
    let (action, payload) = mutation.change_payload().map_err(StorageError::from)?;

    Ok(SyncRequest {
        idempotency_key: format!(
            "{}:{}:direct:{}",
            actor.device_id,
            actor.tenant_id,
            generate_request_id()
        ),
        change_id: 0,
        tenant_id: actor.tenant_id.clone(),
        user_id: actor.user_id.clone(),
        device_id: actor.device_id.clone(),
        collection: mutation.collection().to_string(),
        record_id: mutation.record_id().to_string(),
        action,
        payload,
        timestamp: chrono::Utc::now(),
    })
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
