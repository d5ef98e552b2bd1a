use std::sync::Arc;

use tracing::{error, warn};

use crate::analysis::model::Scorer;
use crate::analysis::{FeatureVector, ModelLookup, ModelStore, WindowSnapshot};
use crate::detect::state::{Observation, StateMachine};
use crate::detect::{AnomalyVerdict, ScoreMethod, VerdictState};
use crate::probes::Target;

/// Score of one ready feature vector.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Classification {
    pub score: f64,
    pub cutoff: f64,
    pub is_anomalous: bool,
    pub loss_outage: bool,
    pub method: ScoreMethod,
}

/// Applies the target's model (or its static thresholds) and drives the
/// per-target state machine.
pub struct AnomalyDetector {
    models: Arc<ModelStore>,
}

impl AnomalyDetector {
    pub fn new(models: Arc<ModelStore>) -> Self {
        Self { models }
    }

    pub fn models(&self) -> &Arc<ModelStore> {
        &self.models
    }

    /// Model score when a usable artifact exists and the window has RTT
    /// data, static thresholds otherwise. Loss at or above the target's
    /// limit is an outage under either policy.
    pub fn classify(&self, target: &Target, features: &FeatureVector) -> Classification {
        let loss_outage = target.thresholds.loss_breached(features);

        if let ModelLookup::Model(model) = self.models.lookup(&target.id) {
            if features.has_rtt() {
                match model.score(features) {
                    Ok(score) => {
                        let cutoff = target.score_cutoff.unwrap_or_else(|| model.cutoff());
                        return Classification {
                            score,
                            cutoff,
                            is_anomalous: score <= cutoff || loss_outage,
                            loss_outage,
                            method: ScoreMethod::Model {
                                version: model.version,
                            },
                        };
                    }
                    Err(e) => {
                        error!(
                            target = %target.id,
                            version = model.version,
                            error = %e,
                            "model scoring failed, using static thresholds"
                        );
                    }
                }
            }
        }

        let th = &target.thresholds;
        // Static scoring cannot fail; the Result exists for the trait.
        let score = th.score(features).unwrap_or(f64::NEG_INFINITY);
        Classification {
            score,
            cutoff: th.cutoff(),
            is_anomalous: th.is_anomalous(score) || loss_outage,
            loss_outage,
            method: ScoreMethod::Static,
        }
    }

    /// Evaluate one tick for a target. Returns the verdict and whether an
    /// alert must be raised.
    pub fn evaluate(
        &self,
        target: &Target,
        machine: &mut StateMachine,
        snapshot: &WindowSnapshot,
        tick: u64,
    ) -> (AnomalyVerdict, bool) {
        let features = snapshot.features.clone();

        if !snapshot.is_ready() {
            let (state, alert) = machine.step(Observation::Insufficient);
            let verdict = AnomalyVerdict {
                target: target.id.clone(),
                tick,
                timestamp: features.timestamp,
                score: None,
                cutoff: None,
                is_anomalous: false,
                loss_outage: false,
                state,
                method: ScoreMethod::None,
                features,
            };
            return (verdict, alert);
        }

        let c = self.classify(target, &features);
        let before = machine.state();
        let (state, alert) = machine.step(Observation::Sample {
            anomalous: c.is_anomalous,
        });

        if alert {
            warn!(
                target = %target.id,
                tick,
                score = c.score,
                cutoff = c.cutoff,
                method = %c.method.label(),
                loss_percent = features.loss_percent(),
                from = %before,
                "target entered alerting"
            );
        } else if state != before && state != VerdictState::Cooldown {
            tracing::debug!(target = %target.id, tick, from = %before, to = %state, "state change");
        }

        let verdict = AnomalyVerdict {
            target: target.id.clone(),
            tick,
            timestamp: features.timestamp,
            score: Some(c.score),
            cutoff: Some(c.cutoff),
            is_anomalous: c.is_anomalous,
            loss_outage: c.loss_outage,
            state,
            method: c.method,
            features,
        };
        (verdict, alert)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::model::tests::forest;
    use crate::analysis::FeatureWindow;
    use crate::probes::ProbeResult;
    use chrono::Utc;
    use std::time::Duration;

    fn replies(ms: u64, n: usize) -> Vec<ProbeResult> {
        (0..n)
            .map(|_| ProbeResult::reply("t", Duration::from_millis(ms)))
            .collect()
    }

    fn target() -> Target {
        let mut t = Target::icmp("t");
        t.id = "t".into();
        t
    }

    fn snapshot(results: &[ProbeResult]) -> WindowSnapshot {
        let mut w = FeatureWindow::new(10, 1);
        w.push(results);
        w.snapshot("t", Utc::now())
    }

    #[test]
    fn test_static_fallback_without_model() {
        let dir = tempfile::tempdir().unwrap();
        let det = AnomalyDetector::new(Arc::new(ModelStore::new(dir.path())));

        let c = det.classify(&target(), &snapshot(&replies(20, 4)).features);
        assert_eq!(c.method, ScoreMethod::Static);
        assert!(!c.is_anomalous);

        let c = det.classify(&target(), &snapshot(&replies(500, 4)).features);
        assert!(c.is_anomalous);
        assert!(!c.loss_outage);
    }

    #[test]
    fn test_model_used_when_present() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ModelStore::new(dir.path()));
        forest("t", 7, -0.6).save(&store.artifact_path("t")).unwrap();
        let det = AnomalyDetector::new(store);

        let c = det.classify(&target(), &snapshot(&replies(20, 4)).features);
        assert_eq!(c.method, ScoreMethod::Model { version: 7 });
        assert_eq!(c.cutoff, -0.6);
        assert!(!c.is_anomalous);

        let c = det.classify(&target(), &snapshot(&replies(500, 4)).features);
        assert!(c.is_anomalous);
    }

    #[test]
    fn test_target_cutoff_overrides_model() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ModelStore::new(dir.path()));
        forest("t", 1, -0.6).save(&store.artifact_path("t")).unwrap();
        let det = AnomalyDetector::new(store);

        let mut t = target();
        t.score_cutoff = Some(-0.3);
        let c = det.classify(&t, &snapshot(&replies(20, 4)).features);
        assert_eq!(c.cutoff, -0.3);
        assert!(c.is_anomalous);
    }

    #[test]
    fn test_loss_outage_overrides_model() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ModelStore::new(dir.path()));
        forest("t", 1, -0.6).save(&store.artifact_path("t")).unwrap();
        let det = AnomalyDetector::new(store);

        let mut results = replies(20, 2);
        results.extend(ProbeResult::full_loss("t", 2));
        let c = det.classify(&target(), &snapshot(&results).features);
        assert!(matches!(c.method, ScoreMethod::Model { .. }));
        assert!(c.loss_outage);
        assert!(c.is_anomalous);
    }

    #[test]
    fn test_full_loss_with_model_falls_back_to_static() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ModelStore::new(dir.path()));
        forest("t", 1, -0.6).save(&store.artifact_path("t")).unwrap();
        let det = AnomalyDetector::new(store);

        let c = det.classify(&target(), &snapshot(&ProbeResult::full_loss("t", 4)).features);
        assert_eq!(c.method, ScoreMethod::Static);
        assert!(c.is_anomalous && c.loss_outage);
    }

    #[test]
    fn test_insufficient_window_is_never_scored() {
        let dir = tempfile::tempdir().unwrap();
        let det = AnomalyDetector::new(Arc::new(ModelStore::new(dir.path())));
        let mut machine = StateMachine::new(1, 1);

        let mut w = FeatureWindow::new(10, 5);
        w.push(&ProbeResult::full_loss("t", 4));
        let (verdict, alert) = det.evaluate(&target(), &mut machine, &w.snapshot("t", Utc::now()), 0);
        assert!(!alert);
        assert_eq!(verdict.state, VerdictState::Insufficient);
        assert!(!verdict.is_anomalous);
        assert!(verdict.score.is_none());
        assert_eq!(verdict.method, ScoreMethod::None);
    }
}
