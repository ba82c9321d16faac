//! Core library for caresync: offline-first local storage for care records.
//!
//! Provides the sled-backed [`LocalStore`] with its per-tenant change queue,
//! the hash-chained [`AuditLog`], configuration and shared types.

pub mod audit;
pub mod config;
pub mod error;
pub mod hash;
pub mod queue;
pub mod store;
pub mod types;

pub use audit::{AuditLog, AuditSink, ChainReport, TracingSink};
pub use config::{EngineConfig, SyncConfig};
pub use error::{AuditError, CareSyncError, QueueError, StorageError};
pub use queue::ChangeQueue;
pub use store::{IndexQuery, LocalStore, StoreStats, StoreTx, CURRENT_SCHEMA_VERSION};
pub use types::actor::{ActorContext, AuditInfo};
pub use types::record::{Mutation, Record};
