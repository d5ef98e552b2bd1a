use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::Monitor;
use crate::alerts::AlertEvent;

/// How long shutdown waits for in-flight alert deliveries.
const ALERT_DRAIN: Duration = Duration::from_secs(15);

/// Main scheduler loop. Ticks at a fixed cadence until `cancel` fires.
///
/// Cycles never overlap: a cycle that overruns its tick makes the loop skip
/// the missed ticks instead of bursting to catch up.
pub async fn run_monitor_loop(monitor: Arc<Monitor>, tick_interval: Duration, cancel: CancellationToken) {
    info!(
        interval_secs = tick_interval.as_secs_f64(),
        targets = monitor.targets().count(),
        "scheduler started"
    );

    let mut interval = tokio::time::interval(tick_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut deliveries: Vec<JoinHandle<AlertEvent>> = Vec::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let tick = monitor.next_tick();
                let mut report = monitor.run_cycle(tick).await;
                deliveries.retain(|h| !h.is_finished());
                deliveries.extend(report.take_alerts());
            }
        }
    }

    info!(pending_alerts = deliveries.len(), "scheduler stopping");
    let drain = async {
        for handle in deliveries {
            let _ = handle.await;
        }
    };
    if tokio::time::timeout(ALERT_DRAIN, drain).await.is_err() {
        warn!("alert deliveries still pending at shutdown, abandoned");
    }
}
