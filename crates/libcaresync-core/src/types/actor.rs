use serde::{Deserialize, Serialize};

use super::ids::{validate_key_part, DeviceId, IdError, TenantId, UserId};

/// Who is performing an operation.
///
/// Required by every write, enqueue and audit call. Never defaulted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorContext {
    pub user_id: UserId,
    pub tenant_id: TenantId,
    pub device_id: DeviceId,
}

impl ActorContext {
    pub fn new(
        user_id: impl Into<UserId>,
        tenant_id: impl Into<TenantId>,
        device_id: impl Into<DeviceId>,
    ) -> Result<Self, IdError> {
        let ctx = Self {
            user_id: user_id.into(),
            tenant_id: tenant_id.into(),
            device_id: device_id.into(),
        };
        validate_key_part("user_id", &ctx.user_id)?;
        validate_key_part("tenant_id", &ctx.tenant_id)?;
        validate_key_part("device_id", &ctx.device_id)?;
        Ok(ctx)
    }
}

/// Request metadata captured alongside a change for later auditing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditInfo {
    pub ip_address: String,
    pub user_agent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

impl AuditInfo {
    pub fn new(ip_address: impl Into<String>, user_agent: impl Into<String>) -> Self {
        Self {
            ip_address: ip_address.into(),
            user_agent: user_agent.into(),
            location: None,
        }
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }
}

/// Device identity stored in `<data_dir>/device.toml`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub device_id: DeviceId,
    /// Optional human-friendly label
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Unix timestamp (ms) when the device was initialised
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_ts: Option<i64>,
}

impl DeviceConfig {
    pub fn new(device_id: DeviceId, label: Option<String>) -> Self {
        Self {
            device_id,
            label,
            created_ts: Some(chrono::Utc::now().timestamp_millis()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_actor_context_requires_all_fields() {
        assert!(ActorContext::new("u1", "t1", "d1").is_ok());
        assert_eq!(
            ActorContext::new("u1", "", "d1"),
            Err(IdError::Empty { field: "tenant_id" })
        );
        assert_eq!(
            ActorContext::new("", "t1", "d1"),
            Err(IdError::Empty { field: "user_id" })
        );
    }

    #[test]
    fn test_audit_info_location_is_optional() {
        let info = AuditInfo::new("10.0.0.1", "caresync-test");
        let json = serde_json::to_string(&info).unwrap();
        assert!(!json.contains("location"));

        let info = info.with_location("Room 4");
        let parsed: AuditInfo = serde_json::from_str(&serde_json::to_string(&info).unwrap()).unwrap();
        assert_eq!(parsed.location.as_deref(), Some("Room 4"));
    }

    #[test]
    fn test_device_config_serialization() {
        let config = DeviceConfig::new("dev-1".to_string(), Some("tablet".to_string()));
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: DeviceConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.device_id, "dev-1");
        assert_eq!(parsed.label.as_deref(), Some("tablet"));
        assert!(parsed.created_ts.is_some());
    }
}
