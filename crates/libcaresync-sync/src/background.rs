//! OS-level background sync registration.
//!
//! Platforms that can wake the process periodically implement
//! [`BackgroundScheduler`]. Everywhere else [`NoopScheduler`] reports
//! `Unsupported` and sync only runs while the process is alive.

use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, info, warn};

use crate::coordinator::{SyncCoordinator, SyncProgress};
use crate::error::PlatformError;

/// Platform hook for scheduling background wake-ups
pub trait BackgroundScheduler: Send + Sync {
    fn register_background_sync(&self, tag: &str) -> Result<(), PlatformError>;
}

/// Scheduler for platforms without background execution
pub struct NoopScheduler;

impl BackgroundScheduler for NoopScheduler {
    fn register_background_sync(&self, _tag: &str) -> Result<(), PlatformError> {
        Err(PlatformError::Unsupported)
    }
}

pub struct BackgroundTrigger {
    coordinator: Arc<SyncCoordinator>,
    scheduler: Arc<dyn BackgroundScheduler>,
    registered: Mutex<Option<String>>,
}

impl BackgroundTrigger {
    pub fn new(coordinator: Arc<SyncCoordinator>, scheduler: Arc<dyn BackgroundScheduler>) -> Self {
        Self {
            coordinator,
            scheduler,
            registered: Mutex::new(None),
        }
    }

    /// Register a background wake-up under `tag`.
    ///
    /// Returns false if the platform refused; the failure is logged and
    /// never propagated.
    pub fn register(&self, tag: &str) -> bool {
        match self.scheduler.register_background_sync(tag) {
            Ok(()) => {
                info!(tag, "Background sync registered");
                *self.registered.lock().unwrap_or_else(PoisonError::into_inner) = Some(tag.to_string());
                true
            }
            Err(e) => {
                warn!(tag, error = %e, "Background sync unavailable, syncing only while running");
                false
            }
        }
    }

    pub fn registered_tag(&self) -> Option<String> {
        self.registered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Called by the platform when a background task fires.
    /// Runs one cycle if `tag` is the registered one.
    pub async fn on_wake(&self, tag: &str) -> Option<SyncProgress> {
        if self.registered_tag().as_deref() != Some(tag) {
            debug!(tag, "Ignoring wake for unregistered tag");
            return None;
        }
        debug!(tag, "Background wake, syncing");
        Some(self.coordinator.sync_now().await)
    }
}
