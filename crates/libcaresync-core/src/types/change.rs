use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::actor::{ActorContext, AuditInfo};
use super::ids::ChangeId;
use super::record::Record;

/// Kind of mutation a pending change represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeAction {
    Create,
    Update,
    Delete,
}

impl ChangeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeAction::Create => "create",
            ChangeAction::Update => "update",
            ChangeAction::Delete => "delete",
        }
    }
}

impl std::fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A local mutation awaiting remote acknowledgment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingChange {
    pub id: ChangeId,
    pub action: ChangeAction,
    pub collection: String,
    /// The record this change targets
    pub record_id: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub actor: ActorContext,
    pub audit_info: AuditInfo,
}

impl PendingChange {
    /// Key the remote uses to discard duplicate deliveries.
    ///
    /// Change ids are device-local counters, so the key is qualified by
    /// device and tenant.
    pub fn idempotency_key(&self) -> String {
        format!(
            "{}:{}:{}",
            self.actor.device_id, self.actor.tenant_id, self.id
        )
    }
}

/// A change before the queue assigns its id and timestamp
#[derive(Debug, Clone)]
pub struct ChangeDraft {
    pub action: ChangeAction,
    pub collection: String,
    pub record_id: String,
    pub payload: serde_json::Value,
    pub actor: ActorContext,
    pub audit_info: AuditInfo,
}

/// Outcome of the last failed delivery attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChangeState {
    /// Transient failure (timeout, network, 5xx); retried next cycle
    Failed,
    /// Remote refused the change; retried next cycle, never discarded
    Rejected { reason: String },
    /// Remote holds a different version; held until resolved
    Conflict { server_version: String },
}

/// Delivery bookkeeping for a pending change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeStatus {
    pub state: ChangeState,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub last_attempt_at: DateTime<Utc>,
}

impl ChangeStatus {
    pub fn is_conflict(&self) -> bool {
        matches!(self.state, ChangeState::Conflict { .. })
    }
}

/// How an application resolves a conflicted change
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Clear the conflict mark and resend the change unchanged
    Retry,
    /// Store the merged record locally and queue it as a new change
    Replace(Record),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn change(id: ChangeId) -> PendingChange {
        PendingChange {
            id,
            action: ChangeAction::Create,
            collection: "medications".to_string(),
            record_id: "r1".to_string(),
            payload: json!({}),
            created_at: Utc::now(),
            actor: ActorContext::new("u1", "t1", "d1").unwrap(),
            audit_info: AuditInfo::new("127.0.0.1", "test"),
        }
    }

    #[test]
    fn test_idempotency_key_is_stable_and_qualified() {
        let c = change(7);
        assert_eq!(c.idempotency_key(), "d1:t1:7");
        assert_eq!(c.idempotency_key(), c.clone().idempotency_key());
        assert_ne!(c.idempotency_key(), change(8).idempotency_key());
    }

    #[test]
    fn test_change_state_serialization() {
        let status = ChangeStatus {
            state: ChangeState::Conflict {
                server_version: "v12".to_string(),
            },
            attempts: 1,
            last_error: None,
            last_attempt_at: Utc::now(),
        };
        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("\"kind\":\"conflict\""));
        let parsed: ChangeStatus = serde_json::from_str(&json).unwrap();
        assert!(parsed.is_conflict());
    }
}
