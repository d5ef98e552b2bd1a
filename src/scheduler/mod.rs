//! Tick-driven monitor: fans each cycle out over the due targets.

pub mod engine;
pub mod pipeline;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::alerts::{AlertDispatcher, AlertEvent};
use crate::analysis::FeatureWindow;
use crate::config::MonitorConfig;
use crate::detect::{AnomalyDetector, AnomalyVerdict, StateMachine, VerdictState};
use crate::probes::{ProbeKind, Prober, Target};
use crate::storage::RecordWriter;

pub use engine::run_monitor_loop;
pub use pipeline::TargetOutcome;

/// Upper bound on the time allowed after the probe deadline for stragglers
/// to persist. Never more than half the headroom left in the tick.
const JOIN_GRACE: Duration = Duration::from_millis(500);

/// Shared services every target pipeline uses.
pub struct Components {
    pub prober: Prober,
    pub detector: AnomalyDetector,
    pub writer: RecordWriter,
    pub dispatcher: Arc<AlertDispatcher>,
}

/// Mutable per-target state, owned by exactly one slot.
pub struct TargetState {
    pub window: FeatureWindow,
    pub machine: StateMachine,
    pub last_tick: Option<u64>,
    pub last_verdict: Option<AnomalyVerdict>,
}

pub struct TargetSlot {
    pub target: Target,
    pub state: tokio::sync::Mutex<TargetState>,
}

/// Summary of one cycle.
#[derive(Debug, Default)]
pub struct CycleReport {
    pub tick: u64,
    pub outcomes: Vec<TargetOutcome>,
    /// Targets still running when the cycle was closed.
    pub overrun: Vec<String>,
    /// Targets whose task panicked.
    pub failed: Vec<String>,
}

impl CycleReport {
    pub fn outcome(&self, target: &str) -> Option<&TargetOutcome> {
        self.outcomes.iter().find(|o| o.target == target)
    }

    /// Take the alert delivery handles raised this cycle.
    pub fn take_alerts(&mut self) -> Vec<JoinHandle<AlertEvent>> {
        self.outcomes.iter_mut().filter_map(|o| o.alert.take()).collect()
    }
}

/// Current view of a target for the status API.
#[derive(Debug, Clone, Serialize)]
pub struct TargetStatus {
    pub id: String,
    pub address: String,
    pub kind: ProbeKind,
    pub state: VerdictState,
    pub last_tick: Option<u64>,
    pub last_seen: Option<DateTime<Utc>>,
    pub score: Option<f64>,
    pub cutoff: Option<f64>,
    pub method: Option<String>,
    pub window_fill: usize,
    pub has_model: bool,
}

fn join_grace(tick: Duration, budget: Duration) -> Duration {
    JOIN_GRACE.min(tick.saturating_sub(budget) / 2)
}

pub struct Monitor {
    slots: Vec<Arc<TargetSlot>>,
    components: Arc<Components>,
    cycle_budget: Duration,
    join_grace: Duration,
    next_tick: AtomicU64,
}

impl Monitor {
    pub fn new(config: &MonitorConfig, components: Components, first_tick: u64) -> Self {
        let det = &config.detector;
        let slots = config
            .targets()
            .into_iter()
            .map(|target| {
                Arc::new(TargetSlot {
                    target,
                    state: tokio::sync::Mutex::new(TargetState {
                        window: FeatureWindow::new(det.window_size, det.min_fill),
                        machine: StateMachine::new(det.debounce_cycles, det.cooldown_cycles),
                        last_tick: None,
                        last_verdict: None,
                    }),
                })
            })
            .collect::<Vec<Arc<TargetSlot>>>();

        // Every model read after this comes from the cache or `refresh()`.
        components
            .detector
            .models()
            .preload(slots.iter().map(|s| s.target.id.as_str()));

        Self {
            slots,
            components: Arc::new(components),
            cycle_budget: config.cycle_budget(),
            join_grace: join_grace(config.tick_interval(), config.cycle_budget()),
            next_tick: AtomicU64::new(first_tick),
        }
    }

    pub fn targets(&self) -> impl Iterator<Item = &Target> {
        self.slots.iter().map(|s| &s.target)
    }

    pub fn dispatcher(&self) -> &Arc<AlertDispatcher> {
        &self.components.dispatcher
    }

    /// Claim the next tick number.
    pub fn next_tick(&self) -> u64 {
        self.next_tick.fetch_add(1, Ordering::SeqCst)
    }

    /// Run one cycle: probe every due target concurrently and wait for them
    /// until the cycle budget (plus a short grace) runs out. The cycle always
    /// closes before the next tick is due. A target that
    /// hangs or panics only affects its own outcome.
    pub async fn run_cycle(&self, tick: u64) -> CycleReport {
        let start = Instant::now();
        let deadline = start + self.cycle_budget;

        let handles: Vec<(String, JoinHandle<Option<TargetOutcome>>)> = self
            .slots
            .iter()
            .filter(|s| s.target.is_due(tick))
            .map(|slot| {
                let id = slot.target.id.clone();
                let task = pipeline::run_target(slot.clone(), self.components.clone(), tick, deadline);
                (id, tokio::spawn(task))
            })
            .collect();

        let due = handles.len();
        let mut report = CycleReport {
            tick,
            ..CycleReport::default()
        };

        for (id, handle) in handles {
            match tokio::time::timeout_at(deadline + self.join_grace, handle).await {
                Ok(Ok(Some(outcome))) => report.outcomes.push(outcome),
                Ok(Ok(None)) => {}
                Ok(Err(e)) => {
                    error!(target = %id, tick, error = %e, "target task failed");
                    report.failed.push(id);
                }
                Err(_) => {
                    warn!(target = %id, tick, "target still running at cycle close, detached");
                    report.overrun.push(id);
                }
            }
        }

        let alerts = report.outcomes.iter().filter(|o| o.alert.is_some()).count();
        if alerts > 0 || !report.failed.is_empty() || !report.overrun.is_empty() {
            info!(
                tick,
                due,
                completed = report.outcomes.len(),
                alerts,
                failed = report.failed.len(),
                overrun = report.overrun.len(),
                elapsed_ms = start.elapsed().as_millis() as u64,
                "cycle finished"
            );
        } else {
            debug!(tick, due, elapsed_ms = start.elapsed().as_millis() as u64, "cycle finished");
        }

        report
    }

    pub async fn status(&self) -> Vec<TargetStatus> {
        let models = self.components.detector.models();
        let mut out = Vec::with_capacity(self.slots.len());
        for slot in &self.slots {
            let has_model = models.cached(&slot.target.id).is_model();
            let state = slot.state.lock().await;
            let last = state.last_verdict.as_ref();
            out.push(TargetStatus {
                id: slot.target.id.clone(),
                address: slot.target.address.clone(),
                kind: slot.target.kind,
                state: state.machine.state(),
                last_tick: state.last_tick,
                last_seen: last.map(|v| v.timestamp),
                score: last.and_then(|v| v.score),
                cutoff: last.and_then(|v| v.cutoff),
                method: last.map(|v| v.method.label()),
                window_fill: state.window.len(),
                has_model,
            });
        }
        out
    }
}
