//! Sync coordinator - drains one tenant queue into the remote endpoint
//!
//! The coordinator:
//! - Sends pending changes in queue order, one at a time, with a timeout
//! - Removes a change only after the remote accepts it
//! - Keeps later changes to a record behind an earlier failure
//! - Holds conflicted changes until they are resolved
//! - Runs on connectivity, a periodic interval and manual triggers

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use libcaresync_core::audit::AuditLog;
use libcaresync_core::config::SyncConfig;
use libcaresync_core::error::QueueError;
use libcaresync_core::store::LocalStore;
use libcaresync_core::types::actor::{ActorContext, AuditInfo};
use libcaresync_core::types::audit::actions;
use libcaresync_core::types::change::PendingChange;
use serde::Serialize;
use serde_json::json;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::connectivity::{ConnectivityEvent, ConnectivityMonitor};
use crate::error::RemoteError;
use crate::remote::{RemoteEndpoint, RemoteResponse, SyncRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Idle,
    Syncing,
    Error,
    Complete,
}

/// Progress of the current or last sync cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncProgress {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub conflicts: usize,
    pub status: SyncStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SyncProgress {
    pub fn idle() -> Self {
        Self {
            total: 0,
            completed: 0,
            failed: 0,
            conflicts: 0,
            status: SyncStatus::Idle,
            error: None,
        }
    }

    fn starting(total: usize) -> Self {
        Self {
            total,
            status: SyncStatus::Syncing,
            ..Self::idle()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinatorState {
    Idle,
    Syncing,
}

pub struct SyncCoordinator {
    store: Arc<LocalStore>,
    audit: Option<Arc<AuditLog>>,
    remote: Arc<dyn RemoteEndpoint>,
    actor: ActorContext,
    audit_info: AuditInfo,
    config: SyncConfig,
    busy: tokio::sync::Mutex<()>,
    progress_tx: watch::Sender<SyncProgress>,
    failed_cycles: AtomicU32,
    trigger_tx: mpsc::Sender<()>,
    trigger_rx: Mutex<Option<mpsc::Receiver<()>>>,
    shutdown_tx: broadcast::Sender<()>,
    task: Mutex<Option<JoinHandle<mpsc::Receiver<()>>>>,
}

impl SyncCoordinator {
    /// Create a coordinator for the actor's tenant
    pub fn new(
        store: Arc<LocalStore>,
        remote: Arc<dyn RemoteEndpoint>,
        actor: ActorContext,
        config: SyncConfig,
    ) -> Self {
        let (progress_tx, _) = watch::channel(SyncProgress::idle());
        let (trigger_tx, trigger_rx) = mpsc::channel(1);
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            store,
            audit: None,
            remote,
            actor,
            audit_info: AuditInfo::new("local", concat!("caresync-sync/", env!("CARGO_PKG_VERSION"))),
            config,
            busy: tokio::sync::Mutex::new(()),
            progress_tx,
            failed_cycles: AtomicU32::new(0),
            trigger_tx,
            trigger_rx: Mutex::new(Some(trigger_rx)),
            shutdown_tx,
            task: Mutex::new(None),
        }
    }

    /// Append sync outcomes to the audit log
    pub fn with_audit(mut self, audit: Arc<AuditLog>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn actor(&self) -> &ActorContext {
        &self.actor
    }

    /// Snapshot of the current or last cycle
    pub fn progress(&self) -> SyncProgress {
        self.progress_tx.borrow().clone()
    }

    pub fn subscribe_progress(&self) -> watch::Receiver<SyncProgress> {
        self.progress_tx.subscribe()
    }

    pub fn state(&self) -> CoordinatorState {
        match self.busy.try_lock() {
            Ok(_) => CoordinatorState::Idle,
            Err(_) => CoordinatorState::Syncing,
        }
    }

    /// Number of changes still waiting for acknowledgment
    pub fn pending_indicator(&self) -> Result<usize, QueueError> {
        self.store.queue().pending_count(&self.actor.tenant_id)
    }

    /// Run one drain cycle.
    ///
    /// If a cycle is already running, returns its progress without starting
    /// another one.
    pub async fn sync_now(&self) -> SyncProgress {
        let _guard = match self.busy.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                debug!(tenant = %self.actor.tenant_id, "Sync already in progress");
                return self.progress();
            }
        };
        let progress = self.drain().await;
        self.track_cycle(&progress);
        progress
    }

    /// Ask the running loop for a cycle. Returns false if one is already queued.
    pub fn trigger(&self) -> bool {
        self.trigger_tx.try_send(()).is_ok()
    }

    async fn drain(&self) -> SyncProgress {
        let tenant = &self.actor.tenant_id;
        let queue = self.store.queue();

        let (changes, statuses) = match queue
            .drain_order(tenant)
            .and_then(|changes| Ok((changes, queue.statuses(tenant)?)))
        {
            Ok(loaded) => loaded,
            Err(e) => {
                error!(tenant = %tenant, error = %e, "Failed to read change queue");
                let progress = SyncProgress {
                    status: SyncStatus::Error,
                    error: Some(e.to_string()),
                    ..SyncProgress::idle()
                };
                self.publish(progress.clone());
                return progress;
            }
        };

        let mut progress = SyncProgress::starting(changes.len());
        self.publish(progress.clone());
        if changes.is_empty() {
            progress.status = SyncStatus::Complete;
            self.publish(progress.clone());
            return progress;
        }

        info!(tenant = %tenant, pending = changes.len(), "Sync started");
        self.audit(
            &self.actor,
            actions::SYNC_STARTED,
            json!({ "pending": changes.len() }),
            &self.audit_info,
        );

        // Records with an earlier change that did not go through this cycle
        let mut blocked: HashSet<(String, String)> = HashSet::new();
        let mut last_error: Option<String> = None;

        for change in &changes {
            let record = (change.collection.clone(), change.record_id.clone());

            if statuses.get(&change.id).is_some_and(|s| s.is_conflict()) {
                debug!(change_id = change.id, "Holding conflicted change");
                progress.conflicts += 1;
                blocked.insert(record);
                continue;
            }
            if blocked.contains(&record) {
                debug!(
                    change_id = change.id,
                    record = %change.record_id,
                    "Skipping change behind an earlier undelivered change"
                );
                continue;
            }

            match self.send(change).await {
                Ok(RemoteResponse::Accepted) => {
                    if let Err(e) = queue.remove(tenant, change.id) {
                        // Resent next cycle; the idempotency key makes that harmless
                        error!(change_id = change.id, error = %e, "Failed to remove acknowledged change");
                    }
                    progress.completed += 1;
                    self.audit(
                        &change.actor,
                        actions::SYNC_ACCEPTED,
                        json!({
                            "change_id": change.id,
                            "collection": change.collection,
                            "record_id": change.record_id,
                            "action": change.action,
                        }),
                        &change.audit_info,
                    );
                }
                Ok(RemoteResponse::Conflict(server_version)) => {
                    warn!(
                        change_id = change.id,
                        record = %change.record_id,
                        server_version = %server_version,
                        "Sync conflict, holding change"
                    );
                    if let Err(e) = queue.mark_conflict(tenant, change.id, &server_version) {
                        error!(change_id = change.id, error = %e, "Failed to record conflict");
                    }
                    progress.conflicts += 1;
                    blocked.insert(record);
                    self.audit(
                        &change.actor,
                        actions::SYNC_CONFLICT,
                        json!({
                            "change_id": change.id,
                            "collection": change.collection,
                            "record_id": change.record_id,
                            "server_version": server_version,
                        }),
                        &change.audit_info,
                    );
                }
                Ok(RemoteResponse::Rejected(reason)) => {
                    warn!(change_id = change.id, reason = %reason, "Change rejected by remote");
                    if let Err(e) = queue.mark_rejected(tenant, change.id, &reason) {
                        error!(change_id = change.id, error = %e, "Failed to record rejection");
                    }
                    progress.failed += 1;
                    blocked.insert(record);
                    self.audit_failure(change, &reason);
                    last_error = Some(reason);
                }
                Err(e) => {
                    warn!(change_id = change.id, error = %e, "Change delivery failed");
                    let message = e.to_string();
                    if let Err(e) = queue.mark_failed(tenant, change.id, &message) {
                        error!(change_id = change.id, error = %e, "Failed to record delivery failure");
                    }
                    progress.failed += 1;
                    blocked.insert(record);
                    self.audit_failure(change, &message);
                    last_error = Some(message);
                }
            }
            self.publish(progress.clone());
        }

        if progress.failed > 0 {
            progress.status = SyncStatus::Error;
            progress.error = Some(format!(
                "{} of {} changes failed: {}",
                progress.failed,
                progress.total,
                last_error.unwrap_or_default()
            ));
        } else {
            progress.status = SyncStatus::Complete;
        }
        self.publish(progress.clone());

        info!(
            tenant = %tenant,
            total = progress.total,
            completed = progress.completed,
            failed = progress.failed,
            conflicts = progress.conflicts,
            "Sync finished"
        );
        progress
    }

    async fn send(&self, change: &PendingChange) -> Result<RemoteResponse, RemoteError> {
        let request = SyncRequest::from_change(change);
        match tokio::time::timeout(self.config.request_timeout(), self.remote.push(&request)).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::Timeout),
        }
    }

    fn publish(&self, progress: SyncProgress) {
        self.progress_tx.send_replace(progress);
    }

    fn track_cycle(&self, progress: &SyncProgress) {
        if progress.status != SyncStatus::Error {
            self.failed_cycles.store(0, Ordering::Relaxed);
            return;
        }
        let failed = self.failed_cycles.fetch_add(1, Ordering::Relaxed) + 1;
        if failed >= self.config.warn_after_failed_cycles {
            match self.pending_indicator() {
                Ok(pending) => warn!(
                    tenant = %self.actor.tenant_id,
                    failed_cycles = failed,
                    "{} items pending sync",
                    pending
                ),
                Err(e) => warn!(
                    tenant = %self.actor.tenant_id,
                    failed_cycles = failed,
                    error = %e,
                    "Sync keeps failing and the queue is unreadable"
                ),
            }
        }
    }

    /// Consecutive cycles that ended in `Error`
    pub fn failed_cycles(&self) -> u32 {
        self.failed_cycles.load(Ordering::Relaxed)
    }

    fn audit(&self, actor: &ActorContext, action: &str, details: serde_json::Value, info: &AuditInfo) {
        if let Some(audit) = &self.audit {
            audit.record(actor, action, details, info);
        }
    }

    fn audit_failure(&self, change: &PendingChange, error: &str) {
        self.audit(
            &change.actor,
            actions::SYNC_FAILED,
            json!({
                "change_id": change.id,
                "collection": change.collection,
                "record_id": change.record_id,
                "error": error,
            }),
            &change.audit_info,
        );
    }

    /// Spawn the sync loop.
    ///
    /// Cycles run when connectivity comes back, on the configured interval
    /// while online, and on [`trigger`](Self::trigger).
    pub fn start(self: &Arc<Self>, monitor: &ConnectivityMonitor) {
        let mut task = lock(&self.task);
        if task.is_some() {
            warn!("Sync coordinator already started");
            return;
        }
        let Some(trigger_rx) = lock(&self.trigger_rx).take() else {
            warn!("Sync trigger receiver unavailable");
            return;
        };

        let events = monitor.subscribe();
        let state = monitor.watch();
        let shutdown = self.shutdown_tx.subscribe();
        let this = Arc::clone(self);
        *task = Some(tokio::spawn(async move {
            this.run(trigger_rx, events, state, shutdown).await
        }));
        info!(tenant = %self.actor.tenant_id, "Sync coordinator started");
    }

    async fn run(
        &self,
        mut trigger_rx: mpsc::Receiver<()>,
        mut events: broadcast::Receiver<ConnectivityEvent>,
        state: watch::Receiver<bool>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> mpsc::Receiver<()> {
        let mut online = *state.borrow();
        let mut events_open = true;
        let mut interval = tokio::time::interval(self.config.interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately
        interval.tick().await;

        if online {
            self.sync_now().await;
        }

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                event = events.recv(), if events_open => match event {
                    Ok(ConnectivityEvent::Online) => {
                        online = true;
                        info!("Back online, syncing");
                        self.sync_now().await;
                        interval.reset();
                    }
                    Ok(ConnectivityEvent::Offline) => {
                        online = false;
                        debug!("Offline, periodic sync paused");
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Missed connectivity events");
                        online = *state.borrow();
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        events_open = false;
                    }
                },
                _ = interval.tick(), if online => {
                    debug!("Periodic sync");
                    self.sync_now().await;
                }
                Some(()) = trigger_rx.recv() => {
                    debug!("Manual sync trigger");
                    self.sync_now().await;
                }
            }
        }

        trigger_rx
    }

    /// Stop the sync loop, waiting for any running cycle to finish
    pub async fn stop(&self) {
        let handle = lock(&self.task).take();
        let Some(handle) = handle else {
            return;
        };
        let _ = self.shutdown_tx.send(());
        match handle.await {
            Ok(trigger_rx) => {
                *lock(&self.trigger_rx) = Some(trigger_rx);
            }
            Err(e) => warn!(error = %e, "Sync coordinator task failed"),
        }
        info!(tenant = %self.actor.tenant_id, "Sync coordinator stopped");
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use libcaresync_core::store::CURRENT_SCHEMA_VERSION;
    use libcaresync_core::types::record::{collections::MEDICATIONS, Mutation, Record};
    use tempfile::tempdir;

    struct AcceptAll;

    #[async_trait]
    impl RemoteEndpoint for AcceptAll {
        async fn push(&self, _request: &SyncRequest) -> Result<RemoteResponse, RemoteError> {
            Ok(RemoteResponse::Accepted)
        }
    }

    fn setup() -> (tempfile::TempDir, Arc<LocalStore>, ActorContext) {
        let dir = tempdir().unwrap();
        let store = LocalStore::open(&dir.path().join("store"), CURRENT_SCHEMA_VERSION).unwrap();
        let actor = ActorContext::new("nurse-1", "t1", "device-1").unwrap();
        (dir, Arc::new(store), actor)
    }

    fn write(store: &LocalStore, actor: &ActorContext, id: &str) {
        store
            .record_change(
                actor,
                &AuditInfo::new("127.0.0.1", "test"),
                &Mutation::Create {
                    collection: MEDICATIONS.to_string(),
                    record: Record::new(id, &actor.tenant_id, &actor.user_id, json!({})),
                },
            )
            .unwrap();
    }

    #[tokio::test]
    async fn test_empty_queue_completes() {
        let (_dir, store, actor) = setup();
        let coordinator = SyncCoordinator::new(store, Arc::new(AcceptAll), actor, SyncConfig::default());

        let progress = coordinator.sync_now().await;
        assert_eq!(progress.status, SyncStatus::Complete);
        assert_eq!(progress.total, 0);
        assert_eq!(coordinator.state(), CoordinatorState::Idle);
    }

    #[tokio::test]
    async fn test_drain_removes_accepted() {
        let (_dir, store, actor) = setup();
        write(&store, &actor, "r1");
        write(&store, &actor, "r2");
        let coordinator =
            SyncCoordinator::new(store.clone(), Arc::new(AcceptAll), actor, SyncConfig::default());

        let progress = coordinator.sync_now().await;
        assert_eq!(progress.total, 2);
        assert_eq!(progress.completed, 2);
        assert_eq!(progress.status, SyncStatus::Complete);
        assert_eq!(coordinator.pending_indicator().unwrap(), 0);
        assert_eq!(coordinator.progress(), progress);
    }

    #[tokio::test]
    async fn test_only_own_tenant_is_drained() {
        let (_dir, store, actor) = setup();
        let other = ActorContext::new("nurse-2", "t2", "device-1").unwrap();
        write(&store, &actor, "r1");
        write(&store, &other, "r2");

        let coordinator =
            SyncCoordinator::new(store.clone(), Arc::new(AcceptAll), actor, SyncConfig::default());
        let progress = coordinator.sync_now().await;

        assert_eq!(progress.total, 1);
        assert_eq!(store.queue().pending_count("t2").unwrap(), 1);
    }

    #[tokio::test]
    async fn test_manual_trigger_runs_cycle() {
        let (_dir, store, actor) = setup();
        write(&store, &actor, "r1");
        let coordinator = Arc::new(SyncCoordinator::new(
            store.clone(),
            Arc::new(AcceptAll),
            actor,
            SyncConfig::default(),
        ));
        let monitor = ConnectivityMonitor::new(false, std::time::Duration::from_secs(2));
        let mut progress_rx = coordinator.subscribe_progress();

        coordinator.start(&monitor);
        assert!(coordinator.trigger());
        loop {
            progress_rx.changed().await.unwrap();
            if progress_rx.borrow().status == SyncStatus::Complete {
                break;
            }
        }
        coordinator.stop().await;

        assert_eq!(store.queue().pending_count("t1").unwrap(), 0);
    }
}
