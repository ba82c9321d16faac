//! Delivery of pending changes to the sync server.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libcaresync_core::types::change::{ChangeAction, PendingChange};
use libcaresync_core::types::ids::{ChangeId, DeviceId, TenantId, UserId};
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::error::RemoteError;

/// Header carrying the idempotency key
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// Wire body for one pending change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRequest {
    pub idempotency_key: String,
    pub change_id: ChangeId,
    pub tenant_id: TenantId,
    pub user_id: UserId,
    pub device_id: DeviceId,
    pub collection: String,
    pub record_id: String,
    pub action: ChangeAction,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl SyncRequest {
    pub fn from_change(change: &PendingChange) -> Self {
        Self {
            idempotency_key: change.idempotency_key(),
            change_id: change.id,
            tenant_id: change.actor.tenant_id.clone(),
            user_id: change.actor.user_id.clone(),
            device_id: change.actor.device_id.clone(),
            collection: change.collection.clone(),
            record_id: change.record_id.clone(),
            action: change.action,
            payload: change.payload.clone(),
            timestamp: change.created_at,
        }
    }
}

/// How the remote answered a delivered change
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteResponse {
    Accepted,
    Rejected(String),
    /// The server holds a different version of the record
    Conflict(String),
}

/// The server side of synchronization
#[async_trait]
pub trait RemoteEndpoint: Send + Sync {
    /// Deliver one change. Must be safe to call again with the same idempotency key.
    async fn push(&self, request: &SyncRequest) -> Result<RemoteResponse, RemoteError>;
}

/// `RemoteEndpoint` over HTTP: `POST {base}/sync/{collection}`
pub struct HttpRemote {
    client: reqwest::Client,
    base: Url,
    token: Option<String>,
}

impl HttpRemote {
    pub fn new(base: &str, token: Option<String>, timeout: Duration) -> Result<Self, RemoteError> {
        let mut base =
            Url::parse(base).map_err(|e| RemoteError::InvalidEndpoint(format!("{}: {}", base, e)))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("caresync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| RemoteError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            base,
            token,
        })
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    /// Host and port used for reachability probes
    pub fn probe_addr(&self) -> Option<(String, u16)> {
        let host = self.base.host_str()?.to_string();
        let port = self.base.port_or_known_default()?;
        Some((host, port))
    }

    pub fn endpoint_for(&self, collection: &str) -> Result<Url, RemoteError> {
        self.base
            .join(&format!("sync/{}", collection))
            .map_err(|e| RemoteError::InvalidEndpoint(e.to_string()))
    }
}

#[async_trait]
impl RemoteEndpoint for HttpRemote {
    async fn push(&self, request: &SyncRequest) -> Result<RemoteResponse, RemoteError> {
        let url = self.endpoint_for(&request.collection)?;
        let mut builder = self
            .client
            .post(url)
            .header(IDEMPOTENCY_HEADER, request.idempotency_key.as_str())
            .json(request);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                RemoteError::Timeout
            } else {
                RemoteError::Transport(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        debug!(
            change_id = request.change_id,
            collection = %request.collection,
            status,
            "Remote responded"
        );
        classify_response(status, &body)
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    server_version: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Map an HTTP status and body onto a delivery outcome
pub fn classify_response(status: u16, body: &str) -> Result<RemoteResponse, RemoteError> {
    let parsed: Option<ErrorBody> = serde_json::from_str(body).ok();
    let message = || {
        parsed
            .as_ref()
            .and_then(|b| b.error.clone().or_else(|| b.message.clone()))
            .unwrap_or_else(|| body.trim().to_string())
    };

    match status {
        200..=299 => Ok(RemoteResponse::Accepted),
        409 => {
            let version = parsed
                .as_ref()
                .and_then(|b| b.server_version.as_ref())
                .map(|v| match v {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .unwrap_or_else(|| "unknown".to_string());
            Ok(RemoteResponse::Conflict(version))
        }
        400..=499 => {
            let reason = message();
            let reason = if reason.is_empty() {
                format!("rejected with status {}", status)
            } else {
                reason
            };
            Ok(RemoteResponse::Rejected(reason))
        }
        500..=599 => Err(RemoteError::Server {
            status,
            message: message(),
        }),
        _ => Err(RemoteError::UnexpectedStatus { status }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use libcaresync_core::types::actor::{ActorContext, AuditInfo};
    use serde_json::json;

    #[test]
    fn test_classify_success() {
        assert_eq!(classify_response(200, "").unwrap(), RemoteResponse::Accepted);
        assert_eq!(classify_response(201, "{}").unwrap(), RemoteResponse::Accepted);
    }

    #[test]
    fn test_classify_conflict_reads_server_version() {
        assert_eq!(
            classify_response(409, r#"{"server_version":"v7"}"#).unwrap(),
            RemoteResponse::Conflict("v7".to_string())
        );
        assert_eq!(
            classify_response(409, r#"{"server_version":12}"#).unwrap(),
            RemoteResponse::Conflict("12".to_string())
        );
        assert_eq!(
            classify_response(409, "").unwrap(),
            RemoteResponse::Conflict("unknown".to_string())
        );
    }

    #[test]
    fn test_classify_rejection_and_server_errors() {
        assert_eq!(
            classify_response(422, r#"{"error":"dose missing"}"#).unwrap(),
            RemoteResponse::Rejected("dose missing".to_string())
        );
        assert_eq!(
            classify_response(403, "").unwrap(),
            RemoteResponse::Rejected("rejected with status 403".to_string())
        );
        assert!(matches!(
            classify_response(503, "maintenance"),
            Err(RemoteError::Server { status: 503, .. })
        ));
        assert!(matches!(
            classify_response(302, ""),
            Err(RemoteError::UnexpectedStatus { status: 302 })
        ));
    }

    #[test]
    fn test_endpoint_join_keeps_base_path() {
        let remote = HttpRemote::new("https://sync.example.org/api", None, Duration::from_secs(5)).unwrap();
        assert_eq!(
            remote.endpoint_for("medications").unwrap().as_str(),
            "https://sync.example.org/api/sync/medications"
        );
        assert_eq!(
            remote.probe_addr(),
            Some(("sync.example.org".to_string(), 443))
        );
    }

    #[test]
    fn test_invalid_endpoint() {
        assert!(matches!(
            HttpRemote::new("not a url", None, Duration::from_secs(5)),
            Err(RemoteError::InvalidEndpoint(_))
        ));
    }

    #[test]
    fn test_request_from_change() {
        let change = PendingChange {
            id: 4,
            action: ChangeAction::Update,
            collection: "medications".to_string(),
            record_id: "r1".to_string(),
            payload: json!({"dose": "5mg"}),
            created_at: Utc::now(),
            actor: ActorContext::new("u1", "t1", "d1").unwrap(),
            audit_info: AuditInfo::new("127.0.0.1", "test"),
        };
        let request = SyncRequest::from_change(&change);
        assert_eq!(request.idempotency_key, "d1:t1:4");
        assert_eq!(request.tenant_id, "t1");
        assert_eq!(request.record_id, "r1");
    }
}
