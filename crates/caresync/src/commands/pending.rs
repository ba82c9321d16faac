use libcaresync_core::types::change::ChangeState;
use libcaresync_core::CareSyncError;
use serde::Serialize;

use crate::cli::Cli;
use crate::context::CareSyncContext;
use crate::output::{output_success, print_table};

#[derive(Serialize)]
struct PendingItem {
    change_id: u64,
    action: &'static str,
    collection: String,
    record_id: String,
    user_id: String,
    created_at: String,
    attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    state: Option<ChangeState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_error: Option<String>,
}

pub fn run(cli: &Cli) -> Result<(), CareSyncError> {
    let ctx = CareSyncContext::resolve(cli)?;
    let tenant = ctx.tenant(cli)?;
    let engine = ctx.open_engine();
    let queue = engine.store()?.queue();

    let mut statuses = queue.statuses(&tenant)?;
    let items: Vec<PendingItem> = queue
        .drain_order(&tenant)?
        .into_iter()
        .map(|change| {
            let status = statuses.remove(&change.id);
            PendingItem {
                change_id: change.id,
                action: change.action.as_str(),
                collection: change.collection,
                record_id: change.record_id,
                user_id: change.actor.user_id,
                created_at: change.created_at.to_rfc3339(),
                attempts: status.as_ref().map_or(0, |s| s.attempts),
                last_error: status.as_ref().and_then(|s| s.last_error.clone()),
                state: status.map(|s| s.state),
            }
        })
        .collect();

    let rows = items
        .iter()
        .map(|item| {
            vec![
                item.change_id.to_string(),
                item.action.to_string(),
                format!("{}/{}", item.collection, item.record_id),
                item.user_id.clone(),
                item.created_at.clone(),
                item.attempts.to_string(),
                state_label(item.state.as_ref()),
            ]
        })
        .collect();
    print_table(
        cli,
        &["Change", "Action", "Record", "User", "Created", "Attempts", "State"],
        rows,
        "Nothing pending",
    );
    output_success(cli, items);

    Ok(())
}

pub(crate) fn state_label(state: Option<&ChangeState>) -> String {
    match state {
        None => "queued".to_string(),
        Some(ChangeState::Failed) => "failed".to_string(),
        Some(ChangeState::Rejected { reason }) => format!("rejected: {}", reason),
        Some(ChangeState::Conflict { server_version }) => format!("conflict ({})", server_version),
    }
}
