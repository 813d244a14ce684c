//! Background worker that decides when drain passes run.

use std::future::pending;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::time::{interval_at, sleep_until, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::engine::{SyncSummary, WeakSyncEngine};

/// Why a pass was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainTrigger {
    /// Enqueue while online, or an explicit nudge.
    Requested,
    /// The periodic safety-net timer.
    Periodic,
    /// The connection came back and stayed up for the settle delay.
    Reconnected,
}

/// Single consumer of the queue.
///
/// Runs until cancelled or until every engine handle is dropped. Passes
/// never overlap: the worker awaits each one before selecting again, and
/// the engine's pass guard covers passes started from elsewhere.
pub(crate) struct SyncWorker {
    engine: WeakSyncEngine,
    trigger: Arc<Notify>,
    cancel: CancellationToken,
    network: watch::Receiver<bool>,
    periodic_interval: Option<Duration>,
    settle_delay: Duration,
}

impl SyncWorker {
    pub(crate) fn new(
        engine: WeakSyncEngine,
        trigger: Arc<Notify>,
        cancel: CancellationToken,
        network: watch::Receiver<bool>,
        config: &SyncConfig,
    ) -> Self {
        Self {
            engine,
            trigger,
            cancel,
            network,
            periodic_interval: config.periodic_interval,
            settle_delay: config.settle_delay,
        }
    }

    pub(crate) async fn run(self) {
        let Self {
            engine,
            trigger,
            cancel,
            mut network,
            periodic_interval,
            settle_delay,
        } = self;

        let mut ticker = periodic_interval.map(|period| {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });
        let mut was_online = *network.borrow_and_update();
        let mut settle_deadline: Option<Instant> = None;
        let mut network_closed = false;

        info!("Sync worker started");

        loop {
            let trigger_kind = tokio::select! {
                _ = cancel.cancelled() => break,

                _ = trigger.notified() => DrainTrigger::Requested,

                _ = tick(&mut ticker) => DrainTrigger::Periodic,

                changed = network.changed(), if !network_closed => {
                    if changed.is_err() {
                        warn!("Network monitor went away; relying on periodic drains");
                        network_closed = true;
                        continue;
                    }
                    let online = *network.borrow_and_update();
                    let Some(engine) = engine.upgrade() else { break };
                    engine.set_online(online);

                    if online && !was_online {
                        debug!("Back online; draining after {:?} unless the connection drops", settle_delay);
                        settle_deadline = Some(Instant::now() + settle_delay);
                    } else if !online {
                        settle_deadline = None;
                    }
                    was_online = online;
                    continue;
                }

                _ = settle(settle_deadline) => {
                    settle_deadline = None;
                    if !*network.borrow() {
                        continue;
                    }
                    DrainTrigger::Reconnected
                }
            };

            let Some(engine) = engine.upgrade() else { break };
            debug!("Drain triggered: {:?}", trigger_kind);
            let summary = engine.drain().await;
            log_summary(trigger_kind, &summary);
        }

        info!("Sync worker stopped");
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => pending().await,
    }
}

async fn settle(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}

fn log_summary(trigger: DrainTrigger, summary: &SyncSummary) {
    if summary.skipped {
        debug!("{:?} drain skipped", trigger);
    } else if summary.failed > 0 {
        warn!(
            "{:?} drain: {} processed, {} failed: {}",
            trigger,
            summary.processed,
            summary.failed,
            summary.errors.join("; ")
        );
    } else if summary.processed > 0 {
        info!("{:?} drain: {} processed", trigger, summary.processed);
    }
}
