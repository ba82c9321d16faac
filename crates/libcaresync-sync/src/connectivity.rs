//! Debounced online/offline tracking.
//!
//! The platform side reports raw reachability changes through
//! [`ConnectivityMonitor::raw_sender`]. A candidate state is published only
//! after it has held for the whole debounce window and differs from the
//! currently published state, so flapping networks produce no events.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Published connectivity transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEvent {
    Online,
    Offline,
}

impl ConnectivityEvent {
    pub fn from_online(online: bool) -> Self {
        if online {
            ConnectivityEvent::Online
        } else {
            ConnectivityEvent::Offline
        }
    }

    pub fn is_online(&self) -> bool {
        matches!(self, ConnectivityEvent::Online)
    }
}

pub struct ConnectivityMonitor {
    debounce: Duration,
    raw_tx: mpsc::Sender<bool>,
    raw_rx: Mutex<Option<mpsc::Receiver<bool>>>,
    state_tx: Arc<watch::Sender<bool>>,
    events_tx: broadcast::Sender<ConnectivityEvent>,
    shutdown_tx: broadcast::Sender<()>,
    task: Mutex<Option<JoinHandle<mpsc::Receiver<bool>>>>,
}

impl ConnectivityMonitor {
    pub fn new(initial_online: bool, debounce: Duration) -> Self {
        let (raw_tx, raw_rx) = mpsc::channel(64);
        let (state_tx, _) = watch::channel(initial_online);
        let (events_tx, _) = broadcast::channel(16);
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            debounce,
            raw_tx,
            raw_rx: Mutex::new(Some(raw_rx)),
            state_tx: Arc::new(state_tx),
            events_tx,
            shutdown_tx,
            task: Mutex::new(None),
        }
    }

    /// Sender for raw, undebounced reachability reports
    pub fn raw_sender(&self) -> mpsc::Sender<bool> {
        self.raw_tx.clone()
    }

    /// Last published state
    pub fn current(&self) -> bool {
        *self.state_tx.borrow()
    }

    /// Watch the published state
    pub fn watch(&self) -> watch::Receiver<bool> {
        self.state_tx.subscribe()
    }

    /// Receive published transitions
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectivityEvent> {
        self.events_tx.subscribe()
    }

    pub fn is_running(&self) -> bool {
        lock(&self.task).is_some()
    }

    /// Spawn the debounce task. Must be called within a tokio runtime.
    pub fn start(&self) {
        let mut task = lock(&self.task);
        if task.is_some() {
            warn!("Connectivity monitor already started");
            return;
        }
        let Some(raw_rx) = lock(&self.raw_rx).take() else {
            warn!("Connectivity monitor receiver unavailable");
            return;
        };

        let debouncer = Debouncer {
            debounce: self.debounce,
            state_tx: Arc::clone(&self.state_tx),
            events_tx: self.events_tx.clone(),
        };
        let shutdown_rx = self.shutdown_tx.subscribe();
        *task = Some(tokio::spawn(debouncer.run(raw_rx, shutdown_rx)));
        debug!(debounce_ms = self.debounce.as_millis() as u64, "Connectivity monitor started");
    }

    /// Stop the debounce task and wait for it to exit
    pub async fn stop(&self) {
        let handle = lock(&self.task).take();
        let Some(handle) = handle else {
            return;
        };
        let _ = self.shutdown_tx.send(());
        match handle.await {
            Ok(raw_rx) => {
                *lock(&self.raw_rx) = Some(raw_rx);
            }
            Err(e) => warn!(error = %e, "Connectivity monitor task failed"),
        }
        debug!("Connectivity monitor stopped");
    }
}

struct Debouncer {
    debounce: Duration,
    state_tx: Arc<watch::Sender<bool>>,
    events_tx: broadcast::Sender<ConnectivityEvent>,
}

impl Debouncer {
    async fn run(
        self,
        mut raw_rx: mpsc::Receiver<bool>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> mpsc::Receiver<bool> {
        let mut candidate: Option<bool> = None;
        let sleep = tokio::time::sleep(self.debounce);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                raw = raw_rx.recv() => {
                    let Some(online) = raw else { break };
                    debug!(online, "Raw connectivity report");
                    if online == *self.state_tx.borrow() {
                        // Flapped back before the window elapsed
                        candidate = None;
                    } else if candidate != Some(online) {
                        candidate = Some(online);
                        sleep.as_mut().reset(Instant::now() + self.debounce);
                    }
                }
                _ = &mut sleep, if candidate.is_some() => {
                    if let Some(online) = candidate.take() {
                        self.publish(online);
                    }
                }
            }
        }

        raw_rx
    }

    fn publish(&self, online: bool) {
        self.state_tx.send_replace(online);
        info!(online, "Connectivity changed");
        // No subscribers is fine
        let _ = self.events_tx.send(ConnectivityEvent::from_online(online));
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::TryRecvError;
    use tokio::time::sleep;

    #[tokio::test(start_paused = true)]
    async fn test_flicker_is_coalesced() {
        let monitor = ConnectivityMonitor::new(false, Duration::from_secs(2));
        let mut events = monitor.subscribe();
        monitor.start();
        let raw = monitor.raw_sender();

        for online in [true, false, true, false] {
            raw.send(online).await.unwrap();
            sleep(Duration::from_millis(500)).await;
        }
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
        assert!(!monitor.current());

        raw.send(true).await.unwrap();
        sleep(Duration::from_millis(2100)).await;
        assert_eq!(events.try_recv().unwrap(), ConnectivityEvent::Online);
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
        assert!(monitor.current());

        monitor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_reports_do_not_extend_window() {
        let monitor = ConnectivityMonitor::new(true, Duration::from_secs(2));
        let mut events = monitor.subscribe();
        monitor.start();
        let raw = monitor.raw_sender();

        raw.send(false).await.unwrap();
        sleep(Duration::from_millis(1500)).await;
        raw.send(false).await.unwrap();
        sleep(Duration::from_millis(600)).await;

        assert_eq!(events.try_recv().unwrap(), ConnectivityEvent::Offline);
        assert!(!monitor.current());
        monitor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_state_is_not_published() {
        let monitor = ConnectivityMonitor::new(true, Duration::from_millis(100));
        let mut events = monitor.subscribe();
        monitor.start();

        monitor.raw_sender().send(true).await.unwrap();
        sleep(Duration::from_millis(500)).await;
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
        monitor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_after_stop() {
        let monitor = ConnectivityMonitor::new(false, Duration::from_millis(100));
        monitor.start();
        assert!(monitor.is_running());
        monitor.stop().await;
        assert!(!monitor.is_running());

        monitor.start();
        monitor.raw_sender().send(true).await.unwrap();
        sleep(Duration::from_millis(200)).await;
        assert!(monitor.current());
        monitor.stop().await;
    }
}
