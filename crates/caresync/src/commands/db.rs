use libcaresync_core::CareSyncError;
use serde::Serialize;

use crate::cli::{Cli, DbCommand};
use crate::context::CareSyncContext;
use crate::output::{output_success, print_human};

#[derive(Serialize)]
struct DbStatsOutput {
    path: String,
    size_bytes: u64,
    record_count: usize,
    pending_count: usize,
    schema_version: u32,
    quota_bytes: Option<u64>,
}

pub fn run(cli: &Cli, cmd: DbCommand) -> Result<(), CareSyncError> {
    match cmd {
        DbCommand::Stats => run_stats(cli),
    }
}

fn run_stats(cli: &Cli) -> Result<(), CareSyncError> {
    let ctx = CareSyncContext::resolve(cli)?;
    let engine = ctx.open_engine();
    let stats = engine.store()?.stats()?;

    print_human(cli, &format!("Path:           {}", stats.path));
    print_human(cli, &format!("Size:           {} bytes", stats.size_bytes));
    print_human(cli, &format!("Records:        {}", stats.record_count));
    print_human(cli, &format!("Pending:        {}", stats.pending_count));
    print_human(cli, &format!("Schema version: {}", stats.schema_version));
    if let Some(quota) = stats.quota_bytes {
        print_human(cli, &format!("Quota:          {} bytes", quota));
    }

    output_success(cli, DbStatsOutput {
        path: stats.path,
        size_bytes: stats.size_bytes,
        record_count: stats.record_count,
        pending_count: stats.pending_count,
        schema_version: stats.schema_version,
        quota_bytes: stats.quota_bytes,
    });

    Ok(())
}
