use libcaresync_core::error::{AuditError, CareSyncError, QueueError, StorageError};
use thiserror::Error;

/// Failure delivering one change to the remote
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("request timed out")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("server error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("unexpected response {status}")]
    UnexpectedStatus { status: u16 },
}

impl RemoteError {
    /// Transient errors are worth retrying on the next cycle without operator action
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RemoteError::Timeout | RemoteError::Transport(_) | RemoteError::Server { .. }
        )
    }
}

/// Background scheduling capability errors
#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("background scheduling is not supported on this platform")]
    Unsupported,

    #[error("background registration failed: {0}")]
    Registration(String),
}

/// Errors surfaced by [`Engine`](crate::engine::Engine)
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("offline storage unavailable: {0}")]
    OfflineUnavailable(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Audit(#[from] AuditError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("no sync endpoint attached")]
    NoRemote,

    #[error("rejected by remote: {0}")]
    Rejected(String),

    #[error("remote holds a different version: {0}")]
    Conflict(String),
}

impl From<EngineError> for CareSyncError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::OfflineUnavailable(reason) => CareSyncError::OfflineUnavailable(reason),
            EngineError::Storage(e) => CareSyncError::Storage(e),
            EngineError::Queue(e) => CareSyncError::Queue(e),
            EngineError::Audit(e) => CareSyncError::Audit(e),
            EngineError::Remote(e) => CareSyncError::Sync(e.to_string()),
            EngineError::NoRemote => CareSyncError::InvalidArgs(
                "no sync endpoint configured; run 'caresync init --endpoint <url>'".to_string(),
            ),
            e @ (EngineError::Rejected(_) | EngineError::Conflict(_)) => CareSyncError::Sync(e.to_string()),
        }
    }
}
