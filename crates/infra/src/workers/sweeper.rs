use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::engine::SyncEngine;

/// Handle to stop and join a running sweeper.
#[derive(Debug)]
pub struct SweeperHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl SweeperHandle {
    /// Request graceful shutdown and wait for the current pass to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.join.await {
            warn!(error = %e, "sweeper task ended abnormally");
        }
    }
}

/// Periodic outbox relay, dead-letter replay and search reconciliation.
///
/// - relay and replay run every `relay_interval`
/// - reconciliation runs every `reconcile_interval`
/// - a failed pass is logged and retried on the next tick
#[derive(Debug)]
pub struct Sweeper;

impl Sweeper {
    pub fn spawn(engine: Arc<SyncEngine>) -> SweeperHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(sweep_loop(engine, shutdown_rx));
        SweeperHandle {
            shutdown: shutdown_tx,
            join,
        }
    }
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval(period.max(Duration::from_millis(1)));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval
}

async fn sweep_loop(engine: Arc<SyncEngine>, mut shutdown_rx: watch::Receiver<bool>) {
    let mut relay = ticker(engine.config().relay_interval());
    let mut reconcile = ticker(engine.config().reconcile_interval());
    info!("sweeper started");

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            _ = relay.tick() => {
                match engine.relay_outbox().await {
                    Ok(report) if report.relayed > 0 || report.blocked_tenants > 0 => {
                        info!(relayed = report.relayed, blocked_tenants = report.blocked_tenants, "outbox relayed");
                    }
                    Ok(_) => debug!("outbox empty"),
                    Err(e) => warn!(error = %e, "outbox relay failed"),
                }
                match engine.replay_dead_letters().await {
                    Ok(report) if report.replayed > 0 || report.failed > 0 => {
                        info!(replayed = report.replayed, failed = report.failed, "dead letters replayed");
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "dead letter replay failed"),
                }
            }
            _ = reconcile.tick() => {
                if let Err(e) = engine.reconcile_all().await {
                    warn!(error = %e, "reconciliation failed");
                }
            }
        }
    }

    info!("sweeper stopped");
}
