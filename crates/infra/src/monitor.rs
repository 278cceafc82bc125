//! Timer-driven background work: growth scans and policy resync.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use warden_policy::PolicyGrowthMonitor;

use crate::pipeline::PermissionPipeline;
use crate::workers::BlockingPool;

/// Handle to stop and join the scheduler task.
#[derive(Debug)]
pub struct MonitorHandle {
    shutdown: oneshot::Sender<()>,
    join: JoinHandle<()>,
}

impl MonitorHandle {
    /// Request shutdown and wait for the running tick, if any, to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        let _ = self.join.await;
    }
}

/// Runs `PolicyGrowthMonitor::scan` every `interval` on the blocking pool.
/// The first scan happens immediately. A tick that cannot be dispatched is
/// skipped.
pub fn spawn_growth_monitor(
    monitor: Arc<PolicyGrowthMonitor>,
    pool: Arc<BlockingPool>,
    interval: Duration,
) -> MonitorHandle {
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

    let join = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_secs = interval.as_secs(), "policy growth monitor started");

        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                _ = ticker.tick() => {
                    let monitor = monitor.clone();
                    match pool.run(move || monitor.scan(Utc::now())).await {
                        Ok((stats, _)) => debug!(
                            total = stats.total_policies,
                            level = ?stats.level,
                            "policy growth scan complete"
                        ),
                        Err(e) => warn!(error = %e, "policy growth scan skipped"),
                    }
                }
            }
        }
        info!("policy growth monitor stopped");
    });

    MonitorHandle {
        shutdown: shutdown_tx,
        join,
    }
}

/// Resyncs the engine from the store every `interval`, so an instance that
/// missed an invalidation converges without one. The interval should not
/// exceed the cache TTLs. The first tick is skipped: the engine was just
/// loaded.
pub fn spawn_policy_resync(pipeline: Arc<PermissionPipeline>, interval: Duration) -> MonitorHandle {
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

    let join = tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_ms = interval.as_millis() as u64, "policy resync started");

        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                _ = ticker.tick() => match pipeline.resync().await {
                    Ok(changed) if changed.is_empty() => debug!("policy model up to date"),
                    Ok(changed) => info!(domains = ?changed, "policy model resynced"),
                    Err(e) => warn!(error = %e, "policy resync skipped"),
                },
            }
        }
        info!("policy resync stopped");
    });

    MonitorHandle {
        shutdown: shutdown_tx,
        join,
    }
}
