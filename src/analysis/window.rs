//! Rolling probe window and the feature vector computed from it.

use std::collections::VecDeque;

use chrono::{DateTime, Local, Timelike, Utc};
use serde::{Deserialize, Serialize};

use super::stats::TimeSeries;
use crate::probes::{loss_ratio, ProbeResult};

/// Version of the feature layout below. Bump when names or order change.
pub const FEATURE_SCHEMA_VERSION: u32 = 1;

/// Ordered feature names the trainer and the scorer agree on.
pub const FEATURE_NAMES: [&str; 5] = [
    "rtt_mean_ms",
    "rtt_max_ms",
    "jitter_ms",
    "loss_ratio",
    "hour_of_day",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSchema {
    pub version: u32,
    pub features: Vec<String>,
}

impl FeatureSchema {
    pub fn current() -> Self {
        Self {
            version: FEATURE_SCHEMA_VERSION,
            features: FEATURE_NAMES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl std::fmt::Display for FeatureSchema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{} [{}]", self.version, self.features.join(", "))
    }
}

/// Aggregate statistics over one target's window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub target: String,
    pub timestamp: DateTime<Utc>,
    /// RTT statistics are absent when the window holds no reply.
    pub rtt_mean_ms: Option<f64>,
    pub rtt_max_ms: Option<f64>,
    pub jitter_ms: Option<f64>,
    pub loss_ratio: f64,
    pub hour_of_day: u32,
    pub samples: usize,
}

impl FeatureVector {
    pub fn from_results(target: &str, results: &[ProbeResult], now: DateTime<Utc>) -> Self {
        let rtts = TimeSeries::new(results.iter().filter_map(|r| r.rtt_ms).collect());
        Self {
            target: target.to_string(),
            timestamp: now,
            rtt_mean_ms: rtts.mean(),
            rtt_max_ms: rtts.max(),
            jitter_ms: rtts.jitter(),
            loss_ratio: loss_ratio(results),
            hour_of_day: now.with_timezone(&Local).hour(),
            samples: results.len(),
        }
    }

    pub fn loss_percent(&self) -> f64 {
        self.loss_ratio * 100.0
    }

    pub fn has_rtt(&self) -> bool {
        self.rtt_mean_ms.is_some()
    }

    /// Values in `FEATURE_NAMES` order, or `None` if an RTT statistic is
    /// missing and the vector cannot be model-scored.
    pub fn values(&self) -> Option<Vec<f64>> {
        Some(vec![
            self.rtt_mean_ms?,
            self.rtt_max_ms?,
            self.jitter_ms?,
            self.loss_ratio,
            self.hour_of_day as f64,
        ])
    }
}

/// Features plus how full the window was when they were computed.
#[derive(Debug, Clone)]
pub struct WindowSnapshot {
    pub features: FeatureVector,
    pub fill: usize,
    pub min_fill: usize,
}

impl WindowSnapshot {
    /// Below the minimum fill the target reports "insufficient data".
    pub fn is_ready(&self) -> bool {
        self.fill >= self.min_fill
    }
}

/// Fixed-size ring buffer of recent probe results for one target.
#[derive(Debug)]
pub struct FeatureWindow {
    results: VecDeque<ProbeResult>,
    capacity: usize,
    min_fill: usize,
}

impl FeatureWindow {
    pub fn new(capacity: usize, min_fill: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            results: VecDeque::with_capacity(capacity),
            capacity,
            min_fill: min_fill.clamp(1, capacity),
        }
    }

    /// Append results, evicting the oldest once the window is full.
    pub fn push(&mut self, results: &[ProbeResult]) {
        for r in results {
            if self.results.len() == self.capacity {
                self.results.pop_front();
            }
            self.results.push_back(r.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn is_ready(&self) -> bool {
        self.results.len() >= self.min_fill
    }

    pub fn snapshot(&self, target: &str, now: DateTime<Utc>) -> WindowSnapshot {
        let results: Vec<ProbeResult> = self.results.iter().cloned().collect();
        WindowSnapshot {
            features: FeatureVector::from_results(target, &results, now),
            fill: self.results.len(),
            min_fill: self.min_fill,
        }
    }
}
