//! One target's work for one tick: probe, extract, classify, persist, alert.

use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{Components, TargetSlot};
use crate::alerts::AlertEvent;
use crate::detect::VerdictState;
use crate::storage::ProbeRecord;

/// What happened to a target on one tick.
#[derive(Debug)]
pub struct TargetOutcome {
    pub target: String,
    pub tick: u64,
    pub state: VerdictState,
    pub is_anomalous: bool,
    pub persisted: bool,
    /// Delivery task for an alert raised on this tick. Detached if dropped.
    pub alert: Option<JoinHandle<AlertEvent>>,
}

/// Run the pipeline for `slot` on `tick`. Probing is cut off at `deadline`;
/// attempts that had not answered by then count as lost.
///
/// Returns `None` if a later tick already evaluated this target.
pub async fn run_target(
    slot: Arc<TargetSlot>,
    components: Arc<Components>,
    tick: u64,
    deadline: Instant,
) -> Option<TargetOutcome> {
    let target = &slot.target;

    let results = components.prober.run_until(target, Some(deadline)).await;

    let mut state = slot.state.lock().await;
    if state.last_tick.is_some_and(|t| t >= tick) {
        warn!(target = %target.id, tick, "stale results from an overrun cycle dropped");
        return None;
    }

    state.window.push(&results);
    let snapshot = state.window.snapshot(&target.id, Utc::now());
    let (verdict, alert) = {
        let st = &mut *state;
        components
            .detector
            .evaluate(target, &mut st.machine, &snapshot, tick)
    };

    debug!(
        target = %target.id,
        tick,
        state = %verdict.state,
        score = ?verdict.score,
        loss = verdict.features.loss_ratio,
        fill = snapshot.fill,
        "target evaluated"
    );

    // Appended under the target lock so per-target records land in tick order.
    let record = ProbeRecord::new(&verdict, &results);
    let persisted = match components.writer.append(record).await {
        Ok(()) => true,
        Err(e) => {
            warn!(target = %target.id, tick, error = %e, "probe record dropped");
            false
        }
    };

    state.last_tick = Some(tick);
    state.last_verdict = Some(verdict.clone());
    drop(state);

    let outcome_state = verdict.state;
    let is_anomalous = verdict.is_anomalous;

    let alert = alert.then(|| {
        let event = AlertEvent::new(target, verdict);
        let dispatcher = components.dispatcher.clone();
        let writer = components.writer.clone();
        tokio::spawn(async move {
            let event = dispatcher.dispatch(event).await;
            if let Err(e) = writer.record_alert(&event).await {
                warn!(target = %event.target, id = %event.id, error = %e, "alert event not persisted");
            }
            event
        })
    });

    Some(TargetOutcome {
        target: target.id.clone(),
        tick,
        state: outcome_state,
        is_anomalous,
        persisted,
        alert,
    })
}
