use thiserror::Error;

/// Tenant identifier (care organisation)
pub type TenantId = String;

/// User identifier (carer, nurse, administrator)
pub type UserId = String;

/// Device identifier (one per installed client)
pub type DeviceId = String;

/// Auto-increment identifier of a pending change, local to one tenant queue
pub type ChangeId = u64;

/// Auto-increment identifier of an audit log entry
pub type AuditId = u64;

/// Separator used between key components in sled keys
pub const KEY_SEPARATOR: u8 = 0;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdError {
    #[error("{field} must not be empty")]
    Empty { field: &'static str },
    #[error("{field} must not contain NUL bytes")]
    ContainsNul { field: &'static str },
}

/// Check that a value can be used as one component of a composite key
pub fn validate_key_part(field: &'static str, value: &str) -> Result<(), IdError> {
    if value.is_empty() {
        return Err(IdError::Empty { field });
    }
    if value.as_bytes().contains(&KEY_SEPARATOR) {
        return Err(IdError::ContainsNul { field });
    }
    Ok(())
}

/// Generate a random device ID
pub fn generate_device_id() -> DeviceId {
    uuid::Uuid::new_v4().to_string()
}

/// Generate a random record ID
pub fn generate_record_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Generate a random ID for a request sent outside the change queue
pub fn generate_request_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_device_id_is_random() {
        assert_ne!(generate_device_id(), generate_device_id());
    }

    #[test]
    fn test_validate_key_part_rejects_empty() {
        assert_eq!(
            validate_key_part("tenant_id", ""),
            Err(IdError::Empty { field: "tenant_id" })
        );
    }

    #[test]
    fn test_validate_key_part_rejects_nul() {
        assert_eq!(
            validate_key_part("collection", "meds\0x"),
            Err(IdError::ContainsNul { field: "collection" })
        );
    }

    #[test]
    fn test_validate_key_part_accepts_normal_values() {
        assert!(validate_key_part("tenant_id", "care-home-42").is_ok());
    }
}
