//! Foreground sync loop: probes the server, feeds the connectivity
//! monitor and lets the coordinator drain the queue until interrupted.

use std::sync::Arc;
use std::time::Duration;

use libcaresync_core::CareSyncError;
use libcaresync_sync::{BackgroundTrigger, ConnectivityMonitor, NoopScheduler, SyncStatus};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::cli::Cli;
use crate::context::CareSyncContext;
use crate::output::print_human;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

pub fn run(cli: &Cli) -> Result<(), CareSyncError> {
    let ctx = CareSyncContext::resolve(cli)?;
    let actor = ctx.actor(cli)?;
    let runtime = tokio::runtime::Runtime::new()?;

    runtime.block_on(async {
        let remote = ctx.remote()?;
        let probe_addr = remote.probe_addr().ok_or_else(|| {
            CareSyncError::InvalidArgs(format!("endpoint {} has no host to probe", remote.base()))
        })?;
        let engine = ctx.open_engine().with_remote(remote);
        let sync = &ctx.config.sync;
        let coordinator = engine.coordinator(&actor)?;

        let monitor = ConnectivityMonitor::new(false, sync.debounce());
        monitor.start();
        coordinator.start(&monitor);

        let trigger = BackgroundTrigger::new(Arc::clone(&coordinator), Arc::new(NoopScheduler));
        if ctx.config.background.enabled {
            trigger.register(&ctx.config.background.tag);
        }

        let (probe_stop_tx, probe_stop_rx) = broadcast::channel(1);
        let probe = tokio::spawn(probe_loop(
            probe_addr,
            sync.probe_interval(),
            monitor.raw_sender(),
            probe_stop_rx,
        ));

        print_human(
            cli,
            &format!(
                "Syncing tenant {} as {} (Ctrl+C to stop)",
                actor.tenant_id, actor.user_id
            ),
        );

        let mut progress = coordinator.subscribe_progress();
        let shutdown = setup_signal_handlers();
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Received shutdown signal");
                    break;
                }
                changed = progress.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let current = progress.borrow_and_update().clone();
                    match current.status {
                        SyncStatus::Complete => print_human(
                            cli,
                            &format!("Synced {}/{} changes", current.completed, current.total),
                        ),
                        SyncStatus::Error => match coordinator.pending_indicator() {
                            Ok(pending) => print_human(
                                cli,
                                &format!(
                                    "Sync incomplete: {} failed, {} pending",
                                    current.failed, pending
                                ),
                            ),
                            Err(e) => {
                                warn!(error = %e, "Failed to count pending changes");
                                print_human(
                                    cli,
                                    &format!("Sync incomplete: {} failed", current.failed),
                                )
                            }
                        },
                        SyncStatus::Idle | SyncStatus::Syncing => {}
                    }
                }
            }
        }

        let _ = probe_stop_tx.send(());
        if let Err(e) = probe.await {
            warn!(error = %e, "Probe task failed");
        }
        coordinator.stop().await;
        monitor.stop().await;
        engine.flush()?;
        Ok::<(), CareSyncError>(())
    })
}

/// Report server reachability to the monitor every `interval`
async fn probe_loop(
    (host, port): (String, u16),
    interval: Duration,
    raw: mpsc::Sender<bool>,
    mut stop: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = stop.recv() => break,
            _ = ticker.tick() => {
                let reachable = matches!(
                    tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect((host.as_str(), port))).await,
                    Ok(Ok(_))
                );
                debug!(%host, port, reachable, "Connectivity probe");
                if raw.send(reachable).await.is_err() {
                    break;
                }
            }
        }
    }
}

fn setup_signal_handlers() -> impl std::future::Future<Output = ()> {
    async {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    error!(error = %e, "Failed to install signal handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {}
            _ = terminate => {}
        }
    }
}
