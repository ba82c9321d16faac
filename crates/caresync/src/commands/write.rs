use libcaresync_core::types::ids::generate_record_id;
use libcaresync_core::{CareSyncError, Mutation, Record};
use libcaresync_sync::WriteOutcome;
use serde::Serialize;

use crate::cli::{Cli, WriteAction};
use crate::context::{parse_json, parse_time, CareSyncContext};
use crate::output::{output_success, print_human};

#[derive(Serialize)]
struct WriteOutput {
    #[serde(skip_serializing_if = "Option::is_none")]
    change_id: Option<u64>,
    delivered: bool,
    action: &'static str,
    collection: String,
    record_id: String,
}

pub fn run(
    cli: &Cli,
    collection: &str,
    id: Option<String>,
    payload: Option<&str>,
    action: WriteAction,
    at: Option<&str>,
) -> Result<(), CareSyncError> {
    let ctx = CareSyncContext::resolve(cli)?;
    let actor = ctx.actor(cli)?;

    let mutation = match action {
        WriteAction::Create | WriteAction::Update => {
            let payload = payload.ok_or_else(|| {
                CareSyncError::InvalidArgs("--payload is required for create and update".to_string())
            })?;
            let id = match (action, id) {
                (_, Some(id)) => id,
                (WriteAction::Create, None) => generate_record_id(),
                _ => return Err(CareSyncError::InvalidArgs("--id is required for update".to_string())),
            };
            let mut record = Record::new(
                id,
                actor.tenant_id.clone(),
                actor.user_id.clone(),
                parse_json("--payload", payload)?,
            );
            if let Some(at) = at {
                record = record.with_timestamp(parse_time("--at", at)?);
            }
            let collection = collection.to_string();
            if matches!(action, WriteAction::Create) {
                Mutation::Create { collection, record }
            } else {
                Mutation::Update { collection, record }
            }
        }
        WriteAction::Delete => Mutation::Delete {
            collection: collection.to_string(),
            record_id: id.ok_or_else(|| {
                CareSyncError::InvalidArgs("--id is required for delete".to_string())
            })?,
        },
    };

    // Online-only engines send the write directly when an endpoint is configured
    let runtime = tokio::runtime::Runtime::new()?;
    let _guard = runtime.enter();
    let mut engine = ctx.open_engine();
    if !engine.is_offline_capable() && ctx.config.sync.endpoint.is_some() {
        engine = engine.with_remote(ctx.remote()?);
    }
    let outcome = runtime.block_on(engine.submit(&actor, &ctx.audit_info(), &mutation))?;
    engine.flush()?;

    let action = match action {
        WriteAction::Create => "create",
        WriteAction::Update => "update",
        WriteAction::Delete => "delete",
    };
    let change_id = match &outcome {
        WriteOutcome::Queued { change_id } => {
            print_human(
                cli,
                &format!(
                    "Queued {} of {}/{} as change {}",
                    action,
                    mutation.collection(),
                    mutation.record_id(),
                    change_id
                ),
            );
            Some(*change_id)
        }
        WriteOutcome::Delivered { .. } => {
            print_human(
                cli,
                &format!(
                    "Offline storage unavailable; sent {} of {}/{} directly to the server",
                    action,
                    mutation.collection(),
                    mutation.record_id()
                ),
            );
            None
        }
    };
    output_success(cli, WriteOutput {
        change_id,
        delivered: matches!(outcome, WriteOutcome::Delivered { .. }),
        action,
        collection: mutation.collection().to_string(),
        record_id: mutation.record_id().to_string(),
    });

    Ok(())
}
