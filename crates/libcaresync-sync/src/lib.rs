//! Sync runtime for caresync.
//!
//! Watches connectivity, drains the per-tenant change queue into a
//! [`RemoteEndpoint`] and wraps everything in an [`Engine`] that degrades to
//! online-only mode when local storage is unavailable.

pub mod background;
pub mod connectivity;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod remote;

pub use background::{BackgroundScheduler, BackgroundTrigger, NoopScheduler};
pub use connectivity::{ConnectivityEvent, ConnectivityMonitor};
pub use coordinator::{CoordinatorState, SyncCoordinator, SyncProgress, SyncStatus};
pub use engine::{Engine, EngineStatus, Mode, WriteOutcome};
pub use error::{EngineError, PlatformError, RemoteError};
pub use remote::{HttpRemote, RemoteEndpoint, RemoteResponse, SyncRequest};
