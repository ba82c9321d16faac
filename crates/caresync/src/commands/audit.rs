use libcaresync_core::audit::{AuditLog, ChainBreakKind};
use libcaresync_core::types::audit::{AuditFilter, AuditLogEntry};
use libcaresync_core::CareSyncError;
use serde::Serialize;

use crate::cli::{AuditCommand, Cli};
use crate::context::{parse_time, CareSyncContext};
use crate::output::{output_success, print_human, print_table, truncate};

#[derive(Serialize)]
struct AuditEntryOutput {
    id: u64,
    action: String,
    timestamp: String,
    user_id: String,
    device_id: String,
    details: serde_json::Value,
    ip_address: String,
    user_agent: String,
    prev_hash: String,
    hash: String,
}

impl From<AuditLogEntry> for AuditEntryOutput {
    fn from(entry: AuditLogEntry) -> Self {
        Self {
            id: entry.id,
            action: entry.action,
            timestamp: entry.timestamp.to_rfc3339(),
            user_id: entry.actor.user_id,
            device_id: entry.actor.device_id,
            details: entry.details,
            ip_address: entry.ip_address,
            user_agent: entry.user_agent,
            prev_hash: hex::encode(entry.prev_hash),
            hash: hex::encode(entry.hash),
        }
    }
}

#[derive(Serialize)]
struct BreakOutput {
    id: u64,
    kind: &'static str,
}

#[derive(Serialize)]
struct VerifyOutput {
    entries_checked: usize,
    intact: bool,
    breaks: Vec<BreakOutput>,
}

pub fn run(cli: &Cli, cmd: AuditCommand) -> Result<(), CareSyncError> {
    let ctx = CareSyncContext::resolve(cli)?;
    let log = AuditLog::open(&ctx.config.audit_path())?;

    match cmd {
        AuditCommand::Query { by_user, action, since, until, limit } => {
            let mut filter = AuditFilter::tenant(ctx.tenant(cli)?);
            if let Some(user) = by_user {
                filter = filter.user(user);
            }
            if let Some(action) = action {
                filter = filter.action(action);
            }
            if let Some(since) = since {
                filter = filter.since(parse_time("--since", &since)?);
            }
            if let Some(until) = until {
                filter = filter.until(parse_time("--until", &until)?);
            }
            if let Some(limit) = limit {
                filter = filter.limit(limit);
            }
            run_query(cli, &log, &filter)
        }
        AuditCommand::Verify => run_verify(cli, &log),
    }
}

fn run_query(cli: &Cli, log: &AuditLog, filter: &AuditFilter) -> Result<(), CareSyncError> {
    let entries: Vec<AuditEntryOutput> = log
        .query(filter)?
        .into_iter()
        .map(AuditEntryOutput::from)
        .collect();

    let rows = entries
        .iter()
        .map(|e| {
            vec![
                e.id.to_string(),
                e.timestamp.clone(),
                e.action.clone(),
                e.user_id.clone(),
                truncate(&e.details.to_string(), 50),
            ]
        })
        .collect();
    print_table(cli, &["ID", "Timestamp", "Action", "User", "Details"], rows, "No audit entries");
    output_success(cli, entries);
    Ok(())
}

fn run_verify(cli: &Cli, log: &AuditLog) -> Result<(), CareSyncError> {
    let report = log.verify_chain()?;

    let breaks: Vec<BreakOutput> = report
        .breaks
        .iter()
        .map(|b| BreakOutput {
            id: b.id,
            kind: match b.kind {
                ChainBreakKind::HashMismatch => "hash_mismatch",
                ChainBreakKind::PrevMismatch => "prev_mismatch",
                ChainBreakKind::HeadMismatch => "head_mismatch",
            },
        })
        .collect();

    if report.is_intact() {
        print_human(cli, &format!("Audit chain intact ({} entries)", report.entries_checked));
    } else {
        print_human(
            cli,
            &format!(
                "Audit chain BROKEN: {} problem(s) in {} entries",
                breaks.len(),
                report.entries_checked
            ),
        );
        for b in &breaks {
            print_human(cli, &format!("  entry {}: {}", b.id, b.kind));
        }
    }

    output_success(cli, VerifyOutput {
        entries_checked: report.entries_checked,
        intact: report.is_intact(),
        breaks,
    });
    Ok(())
}
