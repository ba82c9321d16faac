use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::actor::ActorContext;
use super::ids::{AuditId, TenantId, UserId};

/// BLAKE2b-256 digest chaining audit entries together
pub type EntryHash = [u8; 32];

/// An append-only record of a security-relevant action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub id: AuditId,
    pub action: String,
    pub timestamp: DateTime<Utc>,
    pub actor: ActorContext,
    pub details: serde_json::Value,
    pub ip_address: String,
    pub user_agent: String,
    /// Hash of the previous entry (zeroes for the first entry)
    pub prev_hash: EntryHash,
    pub hash: EntryHash,
}

/// Filter for querying the audit log. Always scoped to one tenant.
#[derive(Debug, Clone)]
pub struct AuditFilter {
    pub tenant_id: TenantId,
    pub user_id: Option<UserId>,
    pub action: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl AuditFilter {
    pub fn tenant(tenant_id: impl Into<TenantId>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            user_id: None,
            action: None,
            since: None,
            until: None,
            limit: None,
        }
    }

    pub fn user(mut self, user_id: impl Into<UserId>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: DateTime<Utc>) -> Self {
        self.until = Some(until);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, entry: &AuditLogEntry) -> bool {
        if entry.actor.tenant_id != self.tenant_id {
            return false;
        }
        if let Some(ref user) = self.user_id {
            if &entry.actor.user_id != user {
                return false;
            }
        }
        if let Some(ref action) = self.action {
            if &entry.action != action {
                return false;
            }
        }
        if let Some(since) = self.since {
            if entry.timestamp < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if entry.timestamp > until {
                return false;
            }
        }
        true
    }
}

/// Action names written by the engine
pub mod actions {
    pub const RECORD_READ: &str = "record.read";
    pub const RECORD_WRITE: &str = "record.write";
    pub const SYNC_STARTED: &str = "sync.started";
    pub const SYNC_ACCEPTED: &str = "sync.accepted";
    pub const SYNC_CONFLICT: &str = "sync.conflict";
    pub const SYNC_FAILED: &str = "sync.failed";
    pub const CONFLICT_RESOLVED: &str = "sync.conflict_resolved";
}
