use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CareSyncError;
use crate::store::CURRENT_SCHEMA_VERSION;
use crate::types::actor::DeviceConfig;

/// Engine configuration stored in `<data_dir>/config.toml`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Directory holding the store, audit log and config files
    #[serde(skip)]
    pub data_dir: PathBuf,
    /// Schema version to open the store at
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    /// Refuse local writes once the store reaches this size
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quota_bytes: Option<u64>,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub background: BackgroundConfig,
}

impl EngineConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            schema_version: CURRENT_SCHEMA_VERSION,
            quota_bytes: None,
            sync: SyncConfig::default(),
            background: BackgroundConfig::default(),
        }
    }

    pub fn store_path(&self) -> PathBuf {
        store_path(&self.data_dir)
    }

    pub fn audit_path(&self) -> PathBuf {
        audit_path(&self.data_dir)
    }
}

/// Sync coordinator settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Base URL of the sync server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Bearer token sent with every request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Periodic sync while online
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Connectivity changes must be stable this long before they count
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// Warn after this many consecutive failed cycles
    #[serde(default = "default_warn_after_failed_cycles")]
    pub warn_after_failed_cycles: u32,
    /// How often `caresync run` probes the server
    #[serde(default = "default_probe_interval_secs")]
    pub probe_interval_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            token: None,
            request_timeout_secs: default_request_timeout_secs(),
            interval_secs: default_interval_secs(),
            debounce_ms: default_debounce_ms(),
            warn_after_failed_cycles: default_warn_after_failed_cycles(),
            probe_interval_secs: default_probe_interval_secs(),
        }
    }
}

impl SyncConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }
}

/// OS background task registration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackgroundConfig {
    #[serde(default = "default_background_enabled")]
    pub enabled: bool,
    #[serde(default = "default_background_tag")]
    pub tag: String,
}

impl Default for BackgroundConfig {
    fn default() -> Self {
        Self {
            enabled: default_background_enabled(),
            tag: default_background_tag(),
        }
    }
}

fn default_schema_version() -> u32 {
    CURRENT_SCHEMA_VERSION
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_interval_secs() -> u64 {
    300
}

fn default_debounce_ms() -> u64 {
    2000
}

fn default_warn_after_failed_cycles() -> u32 {
    3
}

fn default_probe_interval_secs() -> u64 {
    10
}

fn default_background_enabled() -> bool {
    true
}

fn default_background_tag() -> String {
    "caresync-background-sync".to_string()
}

/// Load engine config from `<data_dir>/config.toml`
pub fn load_config(data_dir: &Path) -> Result<Option<EngineConfig>, CareSyncError> {
    let config_path = data_dir.join("config.toml");
    if !config_path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(&config_path)?;
    let mut config: EngineConfig = toml::from_str(&content)?;
    config.data_dir = data_dir.to_path_buf();
    Ok(Some(config))
}

/// Load engine config, falling back to defaults when no file exists
pub fn load_config_or_default(data_dir: &Path) -> Result<EngineConfig, CareSyncError> {
    Ok(load_config(data_dir)?.unwrap_or_else(|| EngineConfig::new(data_dir)))
}

/// Save engine config to `<data_dir>/config.toml`
pub fn save_config(data_dir: &Path, config: &EngineConfig) -> Result<(), CareSyncError> {
    std::fs::create_dir_all(data_dir)?;
    let content = toml::to_string_pretty(config)?;
    std::fs::write(data_dir.join("config.toml"), content)?;
    Ok(())
}

/// Load device identity from `<data_dir>/device.toml`
pub fn load_device_config(data_dir: &Path) -> Result<DeviceConfig, CareSyncError> {
    let config_path = data_dir.join("device.toml");
    if !config_path.exists() {
        return Err(CareSyncError::NotFound(format!(
            "device identity not found: {}",
            config_path.display()
        )));
    }
    let content = std::fs::read_to_string(&config_path)?;
    let config: DeviceConfig = toml::from_str(&content)?;
    Ok(config)
}

/// Save device identity to `<data_dir>/device.toml`
pub fn save_device_config(data_dir: &Path, config: &DeviceConfig) -> Result<(), CareSyncError> {
    std::fs::create_dir_all(data_dir)?;
    let content = toml::to_string_pretty(config)?;
    std::fs::write(data_dir.join("device.toml"), content)?;
    Ok(())
}

/// Get the sled database path for the local store
pub fn store_path(data_dir: &Path) -> PathBuf {
    data_dir.join("store")
}

/// Get the sled database path for the audit log
pub fn audit_path(data_dir: &Path) -> PathBuf {
    data_dir.join("audit")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_engine_config_roundtrip() {
        let dir = tempdir().unwrap();
        let mut config = EngineConfig::new(dir.path());
        config.quota_bytes = Some(64 * 1024 * 1024);
        config.sync.endpoint = Some("https://sync.example.org".to_string());
        config.sync.interval_secs = 60;

        save_config(dir.path(), &config).unwrap();
        let loaded = load_config(dir.path()).unwrap().unwrap();

        assert_eq!(loaded.quota_bytes, config.quota_bytes);
        assert_eq!(loaded.sync, config.sync);
        assert_eq!(loaded.data_dir, dir.path());
    }

    #[test]
    fn test_missing_fields_use_defaults() {
        let config: EngineConfig = toml::from_str("[sync]\nendpoint = \"http://x\"\n").unwrap();
        assert_eq!(config.schema_version, CURRENT_SCHEMA_VERSION);
        assert_eq!(config.sync.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.sync.interval(), Duration::from_secs(300));
        assert_eq!(config.sync.debounce(), Duration::from_millis(2000));
        assert_eq!(config.sync.warn_after_failed_cycles, 3);
        assert!(config.background.enabled);
    }

    #[test]
    fn test_missing_config_is_none() {
        let dir = tempdir().unwrap();
        assert!(load_config(dir.path()).unwrap().is_none());
        let config = load_config_or_default(dir.path()).unwrap();
        assert_eq!(config.store_path(), dir.path().join("store"));
    }

    #[test]
    fn test_device_config_roundtrip() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            load_device_config(dir.path()),
            Err(CareSyncError::NotFound(_))
        ));

        let device = DeviceConfig::new("dev-1".to_string(), Some("ward tablet".to_string()));
        save_device_config(dir.path(), &device).unwrap();
        let loaded = load_device_config(dir.path()).unwrap();
        assert_eq!(loaded.device_id, "dev-1");
        assert_eq!(loaded.label.as_deref(), Some("ward tablet"));
    }
}
