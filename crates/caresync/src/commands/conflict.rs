use libcaresync_core::error::QueueError;
use libcaresync_core::types::change::{ChangeState, Resolution};
use libcaresync_core::{CareSyncError, Record};
use serde::Serialize;

use crate::cli::{Cli, ConflictCommand};
use crate::commands::pending::state_label;
use crate::context::{parse_json, CareSyncContext};
use crate::output::{output_success, print_human, print_table};

#[derive(Serialize)]
struct ConflictItem {
    change_id: u64,
    collection: String,
    record_id: String,
    server_version: Option<String>,
    attempts: u32,
    payload: serde_json::Value,
}

#[derive(Serialize)]
struct ResolveOutput {
    change_id: u64,
    resent_as: u64,
    record_id: String,
    resolution: &'static str,
}

pub fn run(cli: &Cli, cmd: ConflictCommand) -> Result<(), CareSyncError> {
    match cmd {
        ConflictCommand::List => run_list(cli),
        ConflictCommand::Resolve { change_id, payload } => {
            run_resolve(cli, change_id, payload.as_deref())
        }
    }
}

fn run_list(cli: &Cli) -> Result<(), CareSyncError> {
    let ctx = CareSyncContext::resolve(cli)?;
    let tenant = ctx.tenant(cli)?;
    let engine = ctx.open_engine();
    let conflicts = engine.store()?.queue().conflicts(&tenant)?;

    let rows = conflicts
        .iter()
        .map(|(change, status)| {
            vec![
                change.id.to_string(),
                format!("{}/{}", change.collection, change.record_id),
                state_label(Some(&status.state)),
                status.attempts.to_string(),
            ]
        })
        .collect();
    print_table(cli, &["Change", "Record", "State", "Attempts"], rows, "No conflicts");

    let items: Vec<ConflictItem> = conflicts
        .into_iter()
        .map(|(change, status)| ConflictItem {
            change_id: change.id,
            collection: change.collection,
            record_id: change.record_id,
            server_version: match status.state {
                ChangeState::Conflict { server_version } => Some(server_version),
                _ => None,
            },
            attempts: status.attempts,
            payload: change.payload,
        })
        .collect();
    output_success(cli, items);
    Ok(())
}

fn run_resolve(cli: &Cli, change_id: u64, payload: Option<&str>) -> Result<(), CareSyncError> {
    let ctx = CareSyncContext::resolve(cli)?;
    let actor = ctx.actor(cli)?;
    let engine = ctx.open_engine();
    let resolution = match payload {
        Some(payload) => {
            let payload = parse_json("--payload", payload)?;
            let held = engine
                .store()?
                .queue()
                .get(&actor.tenant_id, change_id)?
                .ok_or(QueueError::NotQueued(change_id))?;
            Resolution::Replace(Record::new(
                held.record_id,
                actor.tenant_id.clone(),
                actor.user_id.clone(),
                payload,
            ))
        }
        None => Resolution::Retry,
    };

    let change = engine.resolve_conflict(&actor, &ctx.audit_info(), change_id, &resolution)?;
    engine.flush()?;

    let resolution = match resolution {
        Resolution::Retry => "retry",
        Resolution::Replace(_) => "replace",
    };
    if change.id == change_id {
        print_human(
            cli,
            &format!(
                "Released change {} ({}/{}), it will be sent on the next sync",
                change_id, change.collection, change.record_id
            ),
        );
    } else {
        print_human(
            cli,
            &format!(
                "Replaced change {} with merged change {} ({}/{})",
                change_id, change.id, change.collection, change.record_id
            ),
        );
    }
    output_success(cli, ResolveOutput {
        change_id,
        resent_as: change.id,
        record_id: change.record_id,
        resolution,
    });
    Ok(())
}
