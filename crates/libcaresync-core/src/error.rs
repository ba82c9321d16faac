use thiserror::Error;

use crate::types::ids::{ChangeId, IdError};

/// Failures of the local store. Fatal to offline capability.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage quota exceeded: {used} bytes used, limit {limit}")]
    QuotaExceeded { used: u64, limit: u64 },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("schema mismatch: store is at version {found}, requested {requested}")]
    SchemaMismatch { found: u32, requested: u32 },

    #[error("store corrupted: {0}")]
    Corrupted(String),

    #[error("store busy: {0}")]
    Busy(String),

    #[error("tenant mismatch: actor tenant {actor}, record tenant {record}")]
    TenantMismatch { actor: String, record: String },

    #[error("invalid key: {0}")]
    InvalidKey(#[from] IdError),

    #[error("sled error: {0}")]
    Sled(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<sled::Error> for StorageError {
    fn from(e: sled::Error) -> Self {
        match e {
            sled::Error::Corruption { .. } => StorageError::Corrupted(e.to_string()),
            sled::Error::ReportableBug(msg) => StorageError::Corrupted(msg),
            sled::Error::Io(io) => StorageError::Io(io),
            other => StorageError::Sled(other.to_string()),
        }
    }
}

/// Misuse of the change queue
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("change {0} is not queued")]
    NotQueued(ChangeId),

    #[error("change {0} is not in conflict")]
    NotInConflict(ChangeId),

    #[error("change {change} is for record {expected}, resolution supplies {found}")]
    ResolutionMismatch {
        change: ChangeId,
        expected: String,
        found: String,
    },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl From<sled::Error> for QueueError {
    fn from(e: sled::Error) -> Self {
        QueueError::Storage(e.into())
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(e: serde_json::Error) -> Self {
        QueueError::Storage(e.into())
    }
}

/// Failures of the audit log. Advisory: never roll back the primary operation.
#[derive(Debug, Error)]
pub enum AuditError {
    #[error("invalid audit entry: {0}")]
    InvalidEntry(String),

    #[error("audit store error: {0}")]
    Storage(#[from] StorageError),
}

impl From<sled::Error> for AuditError {
    fn from(e: sled::Error) -> Self {
        AuditError::Storage(e.into())
    }
}

impl From<serde_json::Error> for AuditError {
    fn from(e: serde_json::Error) -> Self {
        AuditError::Storage(e.into())
    }
}

/// Main error type for caresync operations surfaced to the CLI
#[derive(Debug, Error)]
pub enum CareSyncError {
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("offline storage unavailable: {0}")]
    OfflineUnavailable(String),

    #[error("sync error: {0}")]
    Sync(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("audit error: {0}")]
    Audit(#[from] AuditError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("ID error: {0}")]
    Id(#[from] IdError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl CareSyncError {
    /// Error code for JSON output
    pub fn error_code(&self) -> &'static str {
        match self {
            CareSyncError::InvalidArgs(_) => "invalid_args",
            CareSyncError::NotFound(_) => "not_found",
            CareSyncError::OfflineUnavailable(_) => "offline_unavailable",
            CareSyncError::Sync(_) => "sync_error",
            CareSyncError::Storage(StorageError::NotFound(_)) => "not_found",
            CareSyncError::Storage(StorageError::Busy(_)) => "db_busy",
            CareSyncError::Storage(StorageError::QuotaExceeded { .. }) => "quota_exceeded",
            CareSyncError::Storage(StorageError::TenantMismatch { .. }) => "tenant_mismatch",
            CareSyncError::Storage(_) => "db_error",
            CareSyncError::Queue(_) => "queue_error",
            CareSyncError::Audit(_) => "audit_error",
            CareSyncError::Io(_) => "io_error",
            CareSyncError::Json(_) => "internal_error",
            CareSyncError::TomlParse(_) => "invalid_args",
            CareSyncError::TomlSerialize(_) => "internal_error",
            CareSyncError::Id(_) => "invalid_args",
            CareSyncError::Internal(_) => "internal_error",
        }
    }

    /// Exit code for the CLI
    pub fn exit_code(&self) -> i32 {
        match self {
            CareSyncError::InvalidArgs(_) | CareSyncError::Id(_) | CareSyncError::TomlParse(_) => 2,
            CareSyncError::NotFound(_) | CareSyncError::Storage(StorageError::NotFound(_)) => 3,
            CareSyncError::Queue(_) => 4,
            CareSyncError::Storage(_) | CareSyncError::Io(_) => 5,
            CareSyncError::OfflineUnavailable(_) => 6,
            CareSyncError::Sync(_) => 7,
            _ => 1,
        }
    }

    /// Actionable suggestions for fixing the error
    pub fn suggestions(&self) -> Vec<&'static str> {
        match self {
            CareSyncError::Storage(StorageError::Corrupted(_)) => vec![
                "The local store is damaged and has NOT been modified",
                "Back up the data directory before deciding how to recover",
            ],
            CareSyncError::Storage(StorageError::Busy(_)) => vec![
                "Another caresync process holds the store; stop 'caresync run' and retry",
            ],
            CareSyncError::Storage(StorageError::SchemaMismatch { .. }) => vec![
                "This store was written by a newer caresync; upgrade before opening it",
            ],
            CareSyncError::Storage(StorageError::QuotaExceeded { .. }) => vec![
                "Connect to the network and run 'caresync sync' to drain pending changes",
                "Or raise 'quota_bytes' in config.toml",
            ],
            CareSyncError::OfflineUnavailable(_) => vec![
                "Offline storage is disabled for this session; writes must go directly to the server",
            ],
            CareSyncError::NotFound(msg) if msg.contains("device") => {
                vec!["Run 'caresync init' to create the device identity"]
            }
            _ => vec![],
        }
    }
}
