use libcaresync_core::CareSyncError;
use libcaresync_sync::SyncStatus;
use tracing::info;

use crate::cli::Cli;
use crate::context::CareSyncContext;
use crate::output::{output_success, print_human};

/// Run a single drain cycle and report the result
pub fn run(cli: &Cli) -> Result<(), CareSyncError> {
    let ctx = CareSyncContext::resolve(cli)?;
    let actor = ctx.actor(cli)?;
    let runtime = tokio::runtime::Runtime::new()?;
    let _guard = runtime.enter();

    let engine = ctx.open_syncing_engine()?;
    let coordinator = engine.coordinator(&actor)?;
    let progress = runtime.block_on(coordinator.sync_now());
    engine.flush()?;
    info!(?progress, "Sync finished");

    match progress.status {
        SyncStatus::Complete => print_human(
            cli,
            &format!("Synced {} of {} changes", progress.completed, progress.total),
        ),
        SyncStatus::Error => print_human(
            cli,
            &format!(
                "Synced {} of {} changes, {} failed: {}",
                progress.completed,
                progress.total,
                progress.failed,
                progress.error.as_deref().unwrap_or("unknown error")
            ),
        ),
        SyncStatus::Idle | SyncStatus::Syncing => {}
    }
    if progress.conflicts > 0 {
        print_human(
            cli,
            &format!(
                "{} change(s) held by conflicts; see 'caresync conflict list'",
                progress.conflicts
            ),
        );
    }
    output_success(cli, &progress);

    Ok(())
}
