use libcaresync_core::CareSyncError;
use libcaresync_sync::{EngineStatus, Mode};
use serde::Serialize;

use crate::cli::Cli;
use crate::context::CareSyncContext;
use crate::output::{output_success, print_human};

#[derive(Serialize)]
struct StatusOutput {
    device_id: String,
    tenant_id: String,
    data_dir: String,
    endpoint: Option<String>,
    #[serde(flatten)]
    engine: EngineStatus,
}

pub fn run(cli: &Cli) -> Result<(), CareSyncError> {
    let ctx = CareSyncContext::resolve(cli)?;
    let tenant = ctx.tenant(cli)?;
    let engine = ctx.open_engine();
    let status = engine.status(&tenant)?;

    let mode = match &status.mode {
        Mode::OfflineCapable => "offline-capable".to_string(),
        Mode::OnlineOnly { reason } => format!("online-only ({})", reason),
    };
    print_human(cli, &format!("Device:    {}", ctx.device.device_id));
    print_human(cli, &format!("Tenant:    {}", tenant));
    print_human(cli, &format!("Mode:      {}", mode));
    print_human(cli, &format!("Pending:   {}", status.pending));
    print_human(cli, &format!("Conflicts: {}", status.conflicts));
    print_human(
        cli,
        &format!(
            "Endpoint:  {}",
            ctx.config.sync.endpoint.as_deref().unwrap_or("(not configured)")
        ),
    );
    if !status.audit_available {
        print_human(cli, "Audit:     unavailable");
    } else if status.audit_failures > 0 {
        print_human(cli, &format!("Audit:     {} entries dropped", status.audit_failures));
    }

    output_success(cli, StatusOutput {
        device_id: ctx.device.device_id.clone(),
        tenant_id: tenant,
        data_dir: ctx.data_dir.to_string_lossy().to_string(),
        endpoint: ctx.config.sync.endpoint.clone(),
        engine: status,
    });

    Ok(())
}
