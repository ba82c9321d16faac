use libcaresync_core::{CareSyncError, IndexQuery};

use crate::cli::Cli;
use crate::context::{parse_time, CareSyncContext};
use crate::output::{output_success, print_table, truncate};

pub fn run(
    cli: &Cli,
    collection: &str,
    by_user: Option<String>,
    since: Option<&str>,
    until: Option<&str>,
    limit: Option<usize>,
) -> Result<(), CareSyncError> {
    let ctx = CareSyncContext::resolve(cli)?;
    let actor = ctx.actor(cli)?;

    let mut query = IndexQuery::tenant(actor.tenant_id.clone());
    if let Some(user) = by_user {
        query = query.user(user);
    }
    if let Some(since) = since {
        query = query.since(parse_time("--since", since)?);
    }
    if let Some(until) = until {
        query = query.until(parse_time("--until", until)?);
    }
    if let Some(limit) = limit {
        query = query.limit(limit);
    }

    let records = ctx.open_engine().list(&actor, collection, &query)?;

    let rows = records
        .iter()
        .map(|r| {
            vec![
                r.id.clone(),
                r.user_id.clone(),
                r.timestamp.to_rfc3339(),
                truncate(&r.payload.to_string(), 60),
            ]
        })
        .collect();
    print_table(cli, &["ID", "User", "Timestamp", "Payload"], rows, "No records");
    output_success(cli, records);

    Ok(())
}
