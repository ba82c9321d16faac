mod cli;
mod commands;
mod context;
mod output;

use clap::Parser;
use cli::{Cli, Command};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn main() {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    let result = match &cli.command {
        Command::Init { label, endpoint, token } => {
            commands::init::run(&cli, label.clone(), endpoint.clone(), token.clone())
        }
        Command::Write { collection, id, payload, action, at } => commands::write::run(
            &cli,
            collection,
            id.clone(),
            payload.as_deref(),
            *action,
            at.as_deref(),
        ),
        Command::Get { collection, id } => commands::get::run(&cli, collection, id),
        Command::List { collection, by_user, since, until, limit } => commands::list::run(
            &cli,
            collection,
            by_user.clone(),
            since.as_deref(),
            until.as_deref(),
            *limit,
        ),
        Command::Pending => commands::pending::run(&cli),
        Command::Status => commands::status::run(&cli),
        Command::Sync => commands::sync::run(&cli),
        Command::Run => commands::run::run(&cli),
        Command::Audit { cmd } => commands::audit::run(&cli, cmd.clone()),
        Command::Conflict { cmd } => commands::conflict::run(&cli, cmd.clone()),
        Command::Db { cmd } => commands::db::run(&cli, cmd.clone()),
    };

    if let Err(e) = result {
        output::output_error(&cli, &e);
        std::process::exit(e.exit_code());
    }
}

/// Logs go to stderr so `--json` output on stdout stays parseable
fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
}
