use std::fs;

use libcaresync_core::config::{load_config, load_device_config, save_config, save_device_config};
use libcaresync_core::types::actor::DeviceConfig;
use libcaresync_core::types::ids::generate_device_id;
use libcaresync_core::{CareSyncError, EngineConfig, LocalStore};
use serde::Serialize;

use crate::cli::Cli;
use crate::context::CareSyncContext;
use crate::output::{output_success, print_human};

#[derive(Serialize)]
struct InitOutput {
    device_id: String,
    data_dir: String,
    store: String,
    schema_version: u32,
    endpoint: Option<String>,
    created: bool,
}

/// Initialise the data directory. Re-running keeps the existing device
/// identity and only updates the sync settings that were passed.
pub fn run(
    cli: &Cli,
    label: Option<String>,
    endpoint: Option<String>,
    token: Option<String>,
) -> Result<(), CareSyncError> {
    let data_dir = CareSyncContext::data_dir(cli);
    fs::create_dir_all(&data_dir)?;

    let (device, created) = match load_device_config(&data_dir) {
        Ok(device) => (device, false),
        Err(CareSyncError::NotFound(_)) => {
            let device = DeviceConfig::new(generate_device_id(), label);
            save_device_config(&data_dir, &device)?;
            (device, true)
        }
        Err(e) => return Err(e),
    };

    let mut config = load_config(&data_dir)?.unwrap_or_else(|| EngineConfig::new(&data_dir));
    config.data_dir = data_dir.clone();
    if endpoint.is_some() {
        config.sync.endpoint = endpoint;
    }
    if token.is_some() {
        config.sync.token = token;
    }
    save_config(&data_dir, &config)?;

    let store = LocalStore::open(&config.store_path(), config.schema_version)?;
    store.flush()?;

    output_success(cli, InitOutput {
        device_id: device.device_id.clone(),
        data_dir: data_dir.to_string_lossy().to_string(),
        store: config.store_path().to_string_lossy().to_string(),
        schema_version: store.schema_version(),
        endpoint: config.sync.endpoint.clone(),
        created,
    });
    if created {
        print_human(cli, &format!("Initialized caresync device {}", device.device_id));
    } else {
        print_human(cli, &format!("Device {} already initialized, config updated", device.device_id));
    }

    Ok(())
}
