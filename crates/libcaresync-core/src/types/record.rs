use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::change::ChangeAction;
use super::ids::{validate_key_part, IdError, TenantId, UserId};

/// Well-known collection names used by the care application
pub mod collections {
    pub const MEDICATIONS: &str = "medications";
    pub const SCHEDULES: &str = "schedules";
    pub const TEMPLATES: &str = "templates";
    pub const CARE_NOTES: &str = "care_notes";
}

/// A domain record stored in a collection of the local store.
///
/// The payload is opaque to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    pub tenant_id: TenantId,
    pub user_id: UserId,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl Record {
    pub fn new(
        id: impl Into<String>,
        tenant_id: impl Into<TenantId>,
        user_id: impl Into<UserId>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: id.into(),
            tenant_id: tenant_id.into(),
            user_id: user_id.into(),
            payload,
            timestamp: Utc::now(),
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Check the record's key fields
    pub fn validate(&self) -> Result<(), IdError> {
        validate_key_part("record id", &self.id)?;
        validate_key_part("tenant_id", &self.tenant_id)?;
        validate_key_part("user_id", &self.user_id)
    }
}

/// An offline-capable mutation of one record
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    Create { collection: String, record: Record },
    Update { collection: String, record: Record },
    Delete { collection: String, record_id: String },
}

impl Mutation {
    pub fn collection(&self) -> &str {
        match self {
            Mutation::Create { collection, .. }
            | Mutation::Update { collection, .. }
            | Mutation::Delete { collection, .. } => collection,
        }
    }

    pub fn record_id(&self) -> &str {
        match self {
            Mutation::Create { record, .. } | Mutation::Update { record, .. } => &record.id,
            Mutation::Delete { record_id, .. } => record_id,
        }
    }

    /// Action and wire payload of the change this mutation produces.
    /// Creates and updates carry the full record, deletes only its id.
    pub fn change_payload(&self) -> serde_json::Result<(ChangeAction, serde_json::Value)> {
        match self {
            Mutation::Create { record, .. } => Ok((ChangeAction::Create, serde_json::to_value(record)?)),
            Mutation::Update { record, .. } => Ok((ChangeAction::Update, serde_json::to_value(record)?)),
            Mutation::Delete { record_id, .. } => {
                Ok((ChangeAction::Delete, serde_json::json!({ "id": record_id })))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_validate() {
        let record = Record::new("r1", "t1", "u1", json!({"dose": "5mg"}));
        assert!(record.validate().is_ok());

        let record = Record::new("", "t1", "u1", json!({}));
        assert_eq!(record.validate(), Err(IdError::Empty { field: "record id" }));
    }

    #[test]
    fn test_mutation_accessors() {
        let record = Record::new("r1", "t1", "u1", json!({}));
        let m = Mutation::Update {
            collection: collections::MEDICATIONS.to_string(),
            record,
        };
        assert_eq!(m.collection(), "medications");
        assert_eq!(m.record_id(), "r1");

        let m = Mutation::Delete {
            collection: collections::SCHEDULES.to_string(),
            record_id: "r9".to_string(),
        };
        assert_eq!(m.collection(), "schedules");
        assert_eq!(m.record_id(), "r9");
    }

    #[test]
    fn test_change_payload() {
        let record = Record::new("r1", "t1", "u1", json!({"dose": "5mg"}));
        let m = Mutation::Create {
            collection: collections::MEDICATIONS.to_string(),
            record: record.clone(),
        };
        let (action, payload) = m.change_payload().unwrap();
        assert_eq!(action, ChangeAction::Create);
        assert_eq!(payload["payload"]["dose"], "5mg");
        assert_eq!(payload["tenant_id"], "t1");

        let m = Mutation::Delete {
            collection: collections::MEDICATIONS.to_string(),
            record_id: "r1".to_string(),
        };
        let (action, payload) = m.change_payload().unwrap();
        assert_eq!(action, ChangeAction::Delete);
        assert_eq!(payload, json!({"id": "r1"}));
    }
}
