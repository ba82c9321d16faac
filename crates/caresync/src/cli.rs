use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "caresync", about = "Offline-first care record store and sync client", version)]
pub struct Cli {
    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress human-readable output
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Override the data directory (default: $CARESYNC_HOME or ./.caresync)
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Tenant the command acts for (default: $CARESYNC_TENANT)
    #[arg(long, global = true)]
    pub tenant: Option<String>,

    /// User the command acts as (default: $CARESYNC_USER)
    #[arg(long, global = true)]
    pub user: Option<String>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, global = true, default_value = "warn")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Create the device identity, config and local store
    Init {
        /// Human-friendly device label
        #[arg(long)]
        label: Option<String>,

        /// Base URL of the sync server
        #[arg(long)]
        endpoint: Option<String>,

        /// Bearer token sent to the sync server
        #[arg(long)]
        token: Option<String>,
    },

    /// Create, update or delete a record and queue the change
    Write {
        /// Collection name (e.g. medications, care_notes)
        collection: String,

        /// Record ID (generated for create when omitted)
        #[arg(long)]
        id: Option<String>,

        /// Record payload as JSON
        #[arg(long)]
        payload: Option<String>,

        /// Mutation kind
        #[arg(long, value_enum, default_value = "create")]
        action: WriteAction,

        /// Record timestamp (RFC 3339, default: now)
        #[arg(long)]
        at: Option<String>,
    },

    /// Read one record
    Get {
        collection: String,
        id: String,
    },

    /// List records of a collection for the tenant
    List {
        collection: String,

        /// Only records written by this user
        #[arg(long)]
        by_user: Option<String>,

        /// Only records at or after this time (RFC 3339)
        #[arg(long)]
        since: Option<String>,

        /// Only records at or before this time (RFC 3339)
        #[arg(long)]
        until: Option<String>,

        #[arg(long)]
        limit: Option<usize>,
    },

    /// Show changes waiting to be synced
    Pending,

    /// Show engine mode, queue depth and audit health
    Status,

    /// Run one sync cycle against the configured server
    Sync,

    /// Keep syncing in the foreground until interrupted
    Run,

    /// Audit log commands
    Audit {
        #[command(subcommand)]
        cmd: AuditCommand,
    },

    /// Conflict handling commands
    Conflict {
        #[command(subcommand)]
        cmd: ConflictCommand,
    },

    /// Database management commands
    Db {
        #[command(subcommand)]
        cmd: DbCommand,
    },
}

#[derive(Clone, Copy, ValueEnum)]
pub enum WriteAction {
    Create,
    Update,
    Delete,
}

#[derive(Clone, Subcommand)]
pub enum AuditCommand {
    /// Query audit entries for the tenant
    Query {
        /// Only entries by this user
        #[arg(long)]
        by_user: Option<String>,

        /// Only entries with this action (e.g. record.write)
        #[arg(long)]
        action: Option<String>,

        #[arg(long)]
        since: Option<String>,

        #[arg(long)]
        until: Option<String>,

        #[arg(long)]
        limit: Option<usize>,
    },

    /// Walk the hash chain and report tampering
    Verify,
}

#[derive(Clone, Subcommand)]
pub enum ConflictCommand {
    /// List changes held because the server reported a conflict
    List,

    /// Release a held change
    Resolve {
        /// Change ID
        change_id: u64,

        /// Replace the change payload with this JSON before retrying
        #[arg(long)]
        payload: Option<String>,
    },
}

#[derive(Clone, Subcommand)]
pub enum DbCommand {
    /// Show store statistics
    Stats,
}
