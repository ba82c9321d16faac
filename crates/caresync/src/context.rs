use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use libcaresync_core::config::{load_config_or_default, load_device_config};
use libcaresync_core::types::actor::{ActorContext, AuditInfo, DeviceConfig};
use libcaresync_core::{CareSyncError, EngineConfig};
use libcaresync_sync::{Engine, HttpRemote};

use crate::cli::Cli;

const DEFAULT_DATA_DIR: &str = ".caresync";

/// Resolved per-invocation state: data dir, config and device identity
pub struct CareSyncContext {
    pub data_dir: PathBuf,
    pub config: EngineConfig,
    pub device: DeviceConfig,
}

impl CareSyncContext {
    /// Data directory from `--data-dir`, then `$CARESYNC_HOME`, then `./.caresync`
    pub fn data_dir(cli: &Cli) -> PathBuf {
        cli.data_dir
            .clone()
            .or_else(|| env::var_os("CARESYNC_HOME").map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR))
    }

    /// Load config and device identity. Fails if `caresync init` never ran.
    pub fn resolve(cli: &Cli) -> Result<Self, CareSyncError> {
        let data_dir = Self::data_dir(cli);
        let device = load_device_config(&data_dir)?;
        let mut config = load_config_or_default(&data_dir)?;
        config.data_dir = data_dir.clone();
        Ok(Self {
            data_dir,
            config,
            device,
        })
    }

    pub fn tenant(&self, cli: &Cli) -> Result<String, CareSyncError> {
        flag_or_env(&cli.tenant, "CARESYNC_TENANT")
            .ok_or_else(|| CareSyncError::InvalidArgs("--tenant is required".to_string()))
    }

    /// Actor for this invocation: `--user` and `--tenant` on this device
    pub fn actor(&self, cli: &Cli) -> Result<ActorContext, CareSyncError> {
        let tenant = self.tenant(cli)?;
        let user = flag_or_env(&cli.user, "CARESYNC_USER")
            .ok_or_else(|| CareSyncError::InvalidArgs("--user is required".to_string()))?;
        Ok(ActorContext::new(user, tenant, self.device.device_id.clone())?)
    }

    pub fn audit_info(&self) -> AuditInfo {
        let info = AuditInfo::new("local", concat!("caresync-cli/", env!("CARGO_PKG_VERSION")));
        match &self.device.label {
            Some(label) => info.with_location(label.clone()),
            None => info,
        }
    }

    pub fn open_engine(&self) -> Engine {
        Engine::open(&self.config)
    }

    /// Engine with the configured sync endpoint attached
    pub fn open_syncing_engine(&self) -> Result<Engine, CareSyncError> {
        Ok(Engine::open(&self.config).with_remote(self.remote()?))
    }

    pub fn remote(&self) -> Result<Arc<HttpRemote>, CareSyncError> {
        let endpoint = self.config.sync.endpoint.as_deref().ok_or_else(|| {
            CareSyncError::InvalidArgs(
                "no sync endpoint configured; run 'caresync init --endpoint <url>'".to_string(),
            )
        })?;
        let remote = HttpRemote::new(
            endpoint,
            self.config.sync.token.clone(),
            self.config.sync.request_timeout(),
        )
        .map_err(|e| CareSyncError::InvalidArgs(e.to_string()))?;
        Ok(Arc::new(remote))
    }
}

fn flag_or_env(flag: &Option<String>, var: &str) -> Option<String> {
    flag.clone()
        .or_else(|| env::var(var).ok())
        .filter(|v| !v.is_empty())
}

/// Parse an RFC 3339 timestamp argument
pub fn parse_time(flag: &str, value: &str) -> Result<DateTime<Utc>, CareSyncError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| CareSyncError::InvalidArgs(format!("{} must be RFC 3339: {}", flag, e)))
}

/// Parse a JSON argument
pub fn parse_json(flag: &str, value: &str) -> Result<serde_json::Value, CareSyncError> {
    serde_json::from_str(value)
        .map_err(|e| CareSyncError::InvalidArgs(format!("{} is not valid JSON: {}", flag, e)))
}
