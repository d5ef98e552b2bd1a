use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::stats::z_score;
use super::window::{FeatureSchema, FeatureVector, FEATURE_NAMES};

/// Euler-Mascheroni constant, used by the isolation forest path normaliser.
const EULER_GAMMA: f64 = 0.577_215_664_9;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("feature schema mismatch: model expects {expected}, extractor produces {found}")]
    SchemaMismatch { expected: String, found: String },

    #[error("artifact belongs to target '{found}', expected '{expected}'")]
    TargetMismatch { expected: String, found: String },

    #[error("malformed model: {0}")]
    Malformed(String),

    #[error("feature vector has no RTT statistics")]
    MissingFeatures,

    #[error("failed to read artifact: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse artifact: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Anything that can turn a feature vector into an anomaly score.
///
/// Lower is more anomalous; a sample is anomalous when its score is at or
/// below `cutoff()`.
pub trait Scorer {
    fn score(&self, features: &FeatureVector) -> Result<f64, ModelError>;
    fn cutoff(&self) -> f64;

    fn is_anomalous(&self, score: f64) -> bool {
        score <= self.cutoff()
    }
}

// ---------------------------------------------------------------------------
// Static thresholds
// ---------------------------------------------------------------------------

/// Fallback policy for targets without a trained model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StaticThresholds {
    pub max_rtt_ms: f64,
    pub max_loss_percent: f64,
}

impl Default for StaticThresholds {
    fn default() -> Self {
        Self {
            max_rtt_ms: 200.0,
            max_loss_percent: 50.0,
        }
    }
}

impl StaticThresholds {
    pub fn loss_breached(&self, features: &FeatureVector) -> bool {
        features.loss_percent() >= self.max_loss_percent
    }
}

impl Scorer for StaticThresholds {
    /// Headroom left below the tightest limit: 1.0 is idle, 0.0 is on the
    /// limit, negative is past it. Loss is always scored; RTT only when a
    /// reply was seen.
    fn score(&self, features: &FeatureVector) -> Result<f64, ModelError> {
        let loss_term = 1.0 - features.loss_percent() / self.max_loss_percent;
        Ok(match features.rtt_mean_ms {
            Some(mean) => loss_term.min(1.0 - mean / self.max_rtt_ms),
            None => loss_term,
        })
    }

    fn cutoff(&self) -> f64 {
        0.0
    }
}

// ---------------------------------------------------------------------------
// Trained artifacts
// ---------------------------------------------------------------------------

/// A per-target model written by the offline trainer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub target: String,
    pub version: u64,
    pub trained_at: DateTime<Utc>,
    pub schema: FeatureSchema,
    pub model: ModelKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelKind {
    IsolationForest {
        max_samples: usize,
        /// Learned decision cutoff on the score.
        offset: f64,
        trees: Vec<IsolationTree>,
    },
    Baseline {
        means: Vec<f64>,
        std_devs: Vec<f64>,
        z_threshold: f64,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsolationTree {
    pub nodes: Vec<TreeNode>,
}

/// Samples with `x[feature] <= threshold` go left.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TreeNode {
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
    Leaf {
        size: usize,
    },
}

impl ModelArtifact {
    pub fn load(path: &Path) -> Result<Self, ModelError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), ModelError> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Check the artifact is usable for `target` with the current extractor.
    pub fn validate(&self, target: &str) -> Result<(), ModelError> {
        if self.target != target {
            return Err(ModelError::TargetMismatch {
                expected: target.to_string(),
                found: self.target.clone(),
            });
        }

        let current = FeatureSchema::current();
        if self.schema != current {
            return Err(ModelError::SchemaMismatch {
                expected: self.schema.to_string(),
                found: current.to_string(),
            });
        }

        match &self.model {
            ModelKind::IsolationForest {
                max_samples,
                offset,
                trees,
            } => {
                if *max_samples == 0 {
                    return Err(ModelError::Malformed("max_samples must be positive".into()));
                }
                if !offset.is_finite() {
                    return Err(ModelError::Malformed("offset must be finite".into()));
                }
                if trees.is_empty() {
                    return Err(ModelError::Malformed("forest has no trees".into()));
                }
                for (i, tree) in trees.iter().enumerate() {
                    tree.validate()
                        .map_err(|e| ModelError::Malformed(format!("tree {}: {}", i, e)))?;
                }
            }
            ModelKind::Baseline {
                means,
                std_devs,
                z_threshold,
            } => {
                let n = FEATURE_NAMES.len();
                if means.len() != n || std_devs.len() != n {
                    return Err(ModelError::Malformed(format!(
                        "baseline needs {} means and std_devs, got {} and {}",
                        n,
                        means.len(),
                        std_devs.len()
                    )));
                }
                if means.iter().any(|m| !m.is_finite()) {
                    return Err(ModelError::Malformed("non-finite mean".into()));
                }
                if std_devs.iter().any(|s| !s.is_finite() || *s < 0.0) {
                    return Err(ModelError::Malformed("negative or non-finite std_dev".into()));
                }
                if !z_threshold.is_finite() || *z_threshold <= 0.0 {
                    return Err(ModelError::Malformed("z_threshold must be positive".into()));
                }
            }
        }
        Ok(())
    }

    /// Ordering used for hot swaps: version first, then training time.
    pub fn is_newer_than(&self, other: &ModelArtifact) -> bool {
        (self.version, self.trained_at) > (other.version, other.trained_at)
    }

    pub fn kind_name(&self) -> &'static str {
        match self.model {
            ModelKind::IsolationForest { .. } => "isolation_forest",
            ModelKind::Baseline { .. } => "baseline",
        }
    }
}

impl Scorer for ModelArtifact {
    fn score(&self, features: &FeatureVector) -> Result<f64, ModelError> {
        let x = features.values().ok_or(ModelError::MissingFeatures)?;
        if x.len() != self.schema.features.len() {
            return Err(ModelError::SchemaMismatch {
                expected: self.schema.to_string(),
                found: FeatureSchema::current().to_string(),
            });
        }

        match &self.model {
            ModelKind::IsolationForest {
                max_samples, trees, ..
            } => {
                let total: f64 = trees.iter().map(|t| t.path_length(&x)).sum();
                let mean_depth = total / trees.len() as f64;
                let norm = average_path_length(*max_samples);
                if norm <= 0.0 {
                    return Err(ModelError::Malformed("degenerate max_samples".into()));
                }
                Ok(-(2f64.powf(-mean_depth / norm)))
            }
            ModelKind::Baseline {
                means, std_devs, ..
            } => {
                let worst = x
                    .iter()
                    .zip(means.iter().zip(std_devs))
                    .map(|(v, (m, s))| z_score(*v, *m, *s).abs())
                    .fold(0.0, f64::max);
                Ok(-worst)
            }
        }
    }

    fn cutoff(&self) -> f64 {
        match &self.model {
            ModelKind::IsolationForest { offset, .. } => *offset,
            ModelKind::Baseline { z_threshold, .. } => -z_threshold,
        }
    }
}

impl IsolationTree {
    fn validate(&self) -> Result<(), String> {
        if self.nodes.is_empty() {
            return Err("empty tree".into());
        }
        for (i, node) in self.nodes.iter().enumerate() {
            if let TreeNode::Split {
                feature,
                threshold,
                left,
                right,
            } = node
            {
                if *feature >= FEATURE_NAMES.len() {
                    return Err(format!("node {} splits on unknown feature {}", i, feature));
                }
                if !threshold.is_finite() {
                    return Err(format!("node {} has non-finite threshold", i));
                }
                // Children strictly after the parent rules out cycles.
                for child in [*left, *right] {
                    if child <= i || child >= self.nodes.len() {
                        return Err(format!("node {} has invalid child {}", i, child));
                    }
                }
            }
        }
        Ok(())
    }

    /// Depth of the leaf `x` lands in, plus the expected remaining depth of
    /// the samples that leaf still holds.
    fn path_length(&self, x: &[f64]) -> f64 {
        let mut idx = 0;
        let mut depth = 0.0;
        loop {
            match &self.nodes[idx] {
                TreeNode::Leaf { size } => return depth + average_path_length(*size),
                TreeNode::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    idx = if x[*feature] <= *threshold { *left } else { *right };
                    depth += 1.0;
                }
            }
        }
    }
}

/// Average path length of an unsuccessful BST search over `n` samples.
pub fn average_path_length(n: usize) -> f64 {
    match n {
        0 | 1 => 0.0,
        2 => 1.0,
        _ => {
            let n = n as f64;
            2.0 * ((n - 1.0).ln() + EULER_GAMMA) - 2.0 * (n - 1.0) / n
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::probes::ProbeResult;
    use std::time::Duration;

    pub(crate) fn forest(target: &str, version: u64, offset: f64) -> ModelArtifact {
        // rtt_mean <= 100 is the dense region; above it isolates in one split.
        let tree = IsolationTree {
            nodes: vec![
                TreeNode::Split { feature: 0, threshold: 100.0, left: 1, right: 2 },
                TreeNode::Split { feature: 0, threshold: 50.0, left: 3, right: 4 },
                TreeNode::Leaf { size: 1 },
                TreeNode::Leaf { size: 60 },
                TreeNode::Leaf { size: 60 },
            ],
        };
        ModelArtifact {
            target: target.to_string(),
            version,
            trained_at: Utc::now(),
            schema: FeatureSchema::current(),
            model: ModelKind::IsolationForest {
                max_samples: 128,
                offset,
                trees: vec![tree],
            },
        }
    }

    fn features(rtt_ms: u64) -> FeatureVector {
        let results: Vec<_> = (0..4)
            .map(|_| ProbeResult::reply("t", Duration::from_millis(rtt_ms)))
            .collect();
        FeatureVector::from_results("t", &results, Utc::now())
    }

    #[test]
    fn test_average_path_length() {
        assert_eq!(average_path_length(1), 0.0);
        assert_eq!(average_path_length(2), 1.0);
        assert!((average_path_length(256) - 10.2448).abs() < 1e-3);
    }

    #[test]
    fn test_static_scoring() {
        let th = StaticThresholds::default();
        let calm = th.score(&features(20)).unwrap();
        assert!((calm - 0.9).abs() < 1e-9);
        assert!(!th.is_anomalous(calm));

        let slow = th.score(&features(400)).unwrap();
        assert!(th.is_anomalous(slow));

        let down = FeatureVector::from_results("t", &ProbeResult::full_loss("t", 4), Utc::now());
        let s = th.score(&down).unwrap();
        assert_eq!(s, -1.0);
        assert!(th.loss_breached(&down));
    }

    #[test]
    fn test_forest_scores_outlier_lower() {
        let model = forest("t", 1, -0.6);
        model.validate("t").unwrap();

        let normal = model.score(&features(20)).unwrap();
        let outlier = model.score(&features(500)).unwrap();
        assert!(outlier < normal);
        assert!(!model.is_anomalous(normal));
        assert!(model.is_anomalous(outlier));
    }

    #[test]
    fn test_baseline_scoring() {
        let model = ModelArtifact {
            target: "t".into(),
            version: 1,
            trained_at: Utc::now(),
            schema: FeatureSchema::current(),
            model: ModelKind::Baseline {
                means: vec![20.0, 25.0, 2.0, 0.0, 12.0],
                std_devs: vec![5.0, 5.0, 1.0, 0.1, 24.0],
                z_threshold: 3.0,
            },
        };
        model.validate("t").unwrap();
        assert_eq!(model.cutoff(), -3.0);
        assert!(model.is_anomalous(model.score(&features(200)).unwrap()));
    }

    #[test]
    fn test_no_rtt_cannot_be_model_scored() {
        let model = forest("t", 1, -0.6);
        let down = FeatureVector::from_results("t", &ProbeResult::full_loss("t", 4), Utc::now());
        assert!(matches!(model.score(&down), Err(ModelError::MissingFeatures)));
    }

    #[test]
    fn test_schema_drift_rejected() {
        let mut model = forest("t", 1, -0.6);
        model.schema.features.swap(0, 1);
        assert!(matches!(model.validate("t"), Err(ModelError::SchemaMismatch { .. })));

        let mut model = forest("t", 1, -0.6);
        model.schema.version = 2;
        assert!(matches!(model.validate("t"), Err(ModelError::SchemaMismatch { .. })));
    }

    #[test]
    fn test_wrong_target_rejected() {
        let model = forest("a", 1, -0.6);
        assert!(matches!(model.validate("b"), Err(ModelError::TargetMismatch { .. })));
    }

    #[test]
    fn test_cyclic_tree_rejected() {
        let mut model = forest("t", 1, -0.6);
        if let ModelKind::IsolationForest { trees, .. } = &mut model.model {
            trees[0].nodes[1] = TreeNode::Split { feature: 0, threshold: 1.0, left: 0, right: 4 };
        }
        assert!(matches!(model.validate("t"), Err(ModelError::Malformed(_))));
    }

    #[test]
    fn test_non_finite_parameters_rejected() {
        let baseline = |means: Vec<f64>, std_devs: Vec<f64>| ModelArtifact {
            target: "t".into(),
            version: 1,
            trained_at: Utc::now(),
            schema: FeatureSchema::current(),
            model: ModelKind::Baseline {
                means,
                std_devs,
                z_threshold: 3.0,
            },
        };
        let ok = vec![1.0; 5];
        assert!(baseline(ok.clone(), ok.clone()).validate("t").is_ok());

        let mut nan_mean = ok.clone();
        nan_mean[0] = f64::NAN;
        assert!(matches!(
            baseline(nan_mean, ok.clone()).validate("t"),
            Err(ModelError::Malformed(_))
        ));

        let mut inf_std = ok.clone();
        inf_std[2] = f64::INFINITY;
        assert!(matches!(
            baseline(ok.clone(), inf_std).validate("t"),
            Err(ModelError::Malformed(_))
        ));

        let mut model = forest("t", 1, -0.6);
        if let ModelKind::IsolationForest { trees, .. } = &mut model.model {
            trees[0].nodes[0] = TreeNode::Split {
                feature: 0,
                threshold: f64::INFINITY,
                left: 1,
                right: 2,
            };
        }
        assert!(matches!(model.validate("t"), Err(ModelError::Malformed(_))));
    }

    #[test]
    fn test_artifact_json_shape() {
        let json = serde_json::to_value(forest("t", 3, -0.5)).unwrap();
        assert_eq!(json["model"]["kind"], "isolation_forest");
        assert_eq!(json["model"]["trees"][0]["nodes"][2]["size"], 1);
        let back: ModelArtifact = serde_json::from_value(json).unwrap();
        assert_eq!(back.version, 3);
        assert_eq!(back.cutoff(), -0.5);
    }

    #[test]
    fn test_newer_ordering() {
        let a = forest("t", 1, -0.6);
        let mut b = forest("t", 1, -0.6);
        b.trained_at = a.trained_at + chrono::Duration::seconds(1);
        assert!(b.is_newer_than(&a));
        assert!(!a.is_newer_than(&b));
        assert!(!a.is_newer_than(&a));
    }
}
