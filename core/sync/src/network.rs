//! Network reachability monitoring.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use offsync_common::{Error, Result};

/// Source of online/offline state.
///
/// The engine asks once at startup and before every drain pass, and
/// follows [`subscribe`](NetworkMonitor::subscribe) for transitions. There
/// is no debouncing at this layer.
#[async_trait]
pub trait NetworkMonitor: Send + Sync {
    /// Current reachability.
    ///
    /// # Errors
    /// - Reachability could not be determined. Callers treat this as online.
    async fn is_online(&self) -> Result<bool>;

    /// Receiver that observes every reachability change.
    ///
    /// Dropping the receiver unsubscribes.
    fn subscribe(&self) -> watch::Receiver<bool>;
}

/// Reachability driven by the application.
///
/// Platform glue (or a test) calls [`set_online`](Self::set_online)
/// whenever the OS reports a connectivity change.
pub struct ManualNetworkMonitor {
    tx: watch::Sender<bool>,
    fail_checks: AtomicBool,
}

impl ManualNetworkMonitor {
    /// Create a monitor with the given initial state.
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(online);
        Self {
            tx,
            fail_checks: AtomicBool::new(false),
        }
    }

    /// Record a reachability change. Returns whether the state changed.
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            info!("Network is now {}", if online { "online" } else { "offline" });
        }
        changed
    }

    /// Make `is_online` fail, simulating a broken platform API.
    pub fn set_check_failure(&self, fail: bool) {
        self.fail_checks.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl NetworkMonitor for ManualNetworkMonitor {
    async fn is_online(&self) -> Result<bool> {
        if self.fail_checks.load(Ordering::SeqCst) {
            return Err(Error::Network("Reachability check unavailable".to_string()));
        }
        Ok(*self.tx.borrow())
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Settings for [`ProbeNetworkMonitor`].
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// `host:port` to connect to.
    pub address: String,
    /// Time between background probes.
    pub interval: Duration,
    /// Connect timeout per probe.
    pub timeout: Duration,
}

impl ProbeConfig {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            interval: Duration::from_secs(15),
            timeout: Duration::from_secs(3),
        }
    }
}

/// Reachability determined by opening a TCP connection to a known host.
pub struct ProbeNetworkMonitor {
    config: ProbeConfig,
    tx: watch::Sender<bool>,
    cancel: CancellationToken,
}

impl ProbeNetworkMonitor {
    /// Create the monitor and start probing in the background.
    ///
    /// Must be called from within a tokio runtime. Probing stops when the
    /// monitor is dropped.
    pub fn spawn(config: ProbeConfig) -> Arc<Self> {
        let (tx, _rx) = watch::channel(true);
        let monitor = Arc::new(Self {
            config,
            tx,
            cancel: CancellationToken::new(),
        });

        let weak = Arc::downgrade(&monitor);
        let cancel = monitor.cancel.clone();
        let interval = monitor.config.interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(monitor) = weak.upgrade() else { break };
                        monitor.probe().await;
                    }
                }
            }
            debug!("Network probe stopped");
        });

        monitor
    }

    /// Probe once and publish the result.
    async fn probe(&self) -> bool {
        let online = matches!(
            timeout(self.config.timeout, TcpStream::connect(&self.config.address)).await,
            Ok(Ok(_))
        );
        let changed = self.tx.send_if_modified(|current| {
            let changed = *current != online;
            *current = online;
            changed
        });
        if changed {
            info!(
                "Probe of {} reports network {}",
                self.config.address,
                if online { "online" } else { "offline" }
            );
        }
        online
    }
}

impl Drop for ProbeNetworkMonitor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[async_trait]
impl NetworkMonitor for ProbeNetworkMonitor {
    async fn is_online(&self) -> Result<bool> {
        Ok(self.probe().await)
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}
