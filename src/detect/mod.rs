//! Anomaly classification and the per-target verdict state machine.

pub mod engine;
pub mod state;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::analysis::FeatureVector;

pub use engine::{AnomalyDetector, Classification};
pub use state::{Observation, StateMachine};

/// Severity levels for alerts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(Severity::Info),
            "warning" => Ok(Severity::Warning),
            "critical" => Ok(Severity::Critical),
            other => Err(format!("unknown severity '{}'", other)),
        }
    }
}

/// Externally visible state of a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerdictState {
    /// Window below minimum fill. Neither normal nor anomalous.
    Insufficient,
    Normal,
    Suspected,
    Alerting,
    Cooldown,
}

impl std::fmt::Display for VerdictState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            VerdictState::Insufficient => "insufficient",
            VerdictState::Normal => "normal",
            VerdictState::Suspected => "suspected",
            VerdictState::Alerting => "alerting",
            VerdictState::Cooldown => "cooldown",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for VerdictState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "insufficient" => Ok(VerdictState::Insufficient),
            "normal" => Ok(VerdictState::Normal),
            "suspected" => Ok(VerdictState::Suspected),
            "alerting" => Ok(VerdictState::Alerting),
            "cooldown" => Ok(VerdictState::Cooldown),
            other => Err(format!("unknown verdict state '{}'", other)),
        }
    }
}

/// Which policy produced a score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum ScoreMethod {
    /// Not scored (insufficient data).
    None,
    Model { version: u64 },
    Static,
}

impl ScoreMethod {
    pub fn label(&self) -> String {
        match self {
            ScoreMethod::None => "none".to_string(),
            ScoreMethod::Model { version } => format!("model:v{}", version),
            ScoreMethod::Static => "static".to_string(),
        }
    }
}

/// Result of evaluating one target on one tick.
#[derive(Debug, Clone, Serialize)]
pub struct AnomalyVerdict {
    pub target: String,
    pub tick: u64,
    pub timestamp: DateTime<Utc>,
    pub score: Option<f64>,
    pub cutoff: Option<f64>,
    pub is_anomalous: bool,
    /// Loss at or above the target's outage threshold.
    pub loss_outage: bool,
    pub state: VerdictState,
    pub method: ScoreMethod,
    pub features: FeatureVector,
}

impl AnomalyVerdict {
    pub fn severity(&self) -> Severity {
        if self.loss_outage {
            Severity::Critical
        } else if self.is_anomalous {
            Severity::Warning
        } else {
            Severity::Info
        }
    }
}
