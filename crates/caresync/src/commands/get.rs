use libcaresync_core::CareSyncError;

use crate::cli::Cli;
use crate::context::CareSyncContext;
use crate::output::{output_success, print_human};

pub fn run(cli: &Cli, collection: &str, id: &str) -> Result<(), CareSyncError> {
    let ctx = CareSyncContext::resolve(cli)?;
    let actor = ctx.actor(cli)?;
    let engine = ctx.open_engine();

    let record = engine
        .read(&actor, &ctx.audit_info(), collection, id)?
        .ok_or_else(|| CareSyncError::NotFound(format!("{}/{}", collection, id)))?;
    engine.flush()?;

    print_human(
        cli,
        &format!(
            "{}/{} by {} at {}\n{}",
            collection,
            record.id,
            record.user_id,
            record.timestamp.to_rfc3339(),
            serde_json::to_string_pretty(&record.payload)?
        ),
    );
    output_success(cli, record);

    Ok(())
}
