//! Alert events and their delivery to an external notification gateway.

pub mod dispatcher;
pub mod gateway;
pub mod rate_limiter;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::detect::{AnomalyVerdict, Severity};
use crate::probes::Target;

pub use dispatcher::AlertDispatcher;
pub use gateway::{build_gateway, Gateway, GatewayError};
pub use rate_limiter::RateLimiter;

/// Delivery status. Only `Pending` may change, and only once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    Pending,
    Sent,
    Failed,
    /// Alerting disabled or no gateway configured.
    Suppressed,
    RateLimited,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::Pending => "pending",
            AlertStatus::Sent => "sent",
            AlertStatus::Failed => "failed",
            AlertStatus::Suppressed => "suppressed",
            AlertStatus::RateLimited => "rate_limited",
        }
    }
}

impl std::fmt::Display for AlertStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AlertStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(AlertStatus::Pending),
            "sent" => Ok(AlertStatus::Sent),
            "failed" => Ok(AlertStatus::Failed),
            "suppressed" => Ok(AlertStatus::Suppressed),
            "rate_limited" => Ok(AlertStatus::RateLimited),
            other => Err(format!("unknown alert status '{}'", other)),
        }
    }
}

/// One alert raised by a target entering `Alerting`.
#[derive(Debug, Clone, Serialize)]
pub struct AlertEvent {
    pub id: Uuid,
    pub target: String,
    pub address: String,
    pub created_at: DateTime<Utc>,
    pub severity: Severity,
    pub status: AlertStatus,
    /// Delivery attempts beyond the first.
    pub retries: u32,
    pub last_error: Option<String>,
    pub verdict: AnomalyVerdict,
}

impl AlertEvent {
    pub fn new(target: &Target, verdict: AnomalyVerdict) -> Self {
        Self {
            id: Uuid::new_v4(),
            target: target.id.clone(),
            address: target.address.clone(),
            created_at: Utc::now(),
            severity: verdict.severity(),
            status: AlertStatus::Pending,
            retries: 0,
            last_error: None,
            verdict,
        }
    }

    /// Move out of `Pending`. Returns false (and changes nothing) if the
    /// event was already settled or `status` is `Pending` itself.
    pub fn settle(&mut self, status: AlertStatus) -> bool {
        if self.status != AlertStatus::Pending || status == AlertStatus::Pending {
            return false;
        }
        self.status = status;
        true
    }

    pub fn title(&self) -> &'static str {
        if self.verdict.loss_outage {
            "Connectivity outage"
        } else {
            "Latency anomaly"
        }
    }

    /// One-line description used in logs, storage and notifications.
    pub fn summary(&self) -> String {
        let f = &self.verdict.features;
        let rtt = f
            .rtt_mean_ms
            .map(|v| format!("{:.1} ms", v))
            .unwrap_or_else(|| "n/a".to_string());
        let score = match (self.verdict.score, self.verdict.cutoff) {
            (Some(s), Some(c)) => format!("{:.3} (cutoff {:.3}, {})", s, c, self.verdict.method.label()),
            _ => "n/a".to_string(),
        };
        format!(
            "{} on {}: loss {:.0}%, mean RTT {}, score {}",
            self.title(),
            self.target,
            f.loss_percent(),
            rtt,
            score
        )
    }

    pub fn payload(&self) -> AlertPayload {
        let f = &self.verdict.features;
        AlertPayload {
            id: self.id,
            target: self.target.clone(),
            address: self.address.clone(),
            timestamp: self.verdict.timestamp,
            title: self.title().to_string(),
            summary: self.summary(),
            severity: self.severity,
            state: self.verdict.state.to_string(),
            score: self.verdict.score,
            cutoff: self.verdict.cutoff,
            method: self.verdict.method.label(),
            loss_percent: f.loss_percent(),
            rtt_mean_ms: f.rtt_mean_ms,
            rtt_max_ms: f.rtt_max_ms,
            jitter_ms: f.jitter_ms,
        }
    }
}

/// What a gateway receives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertPayload {
    pub id: Uuid,
    pub target: String,
    pub address: String,
    pub timestamp: DateTime<Utc>,
    pub title: String,
    pub summary: String,
    pub severity: Severity,
    pub state: String,
    pub score: Option<f64>,
    pub cutoff: Option<f64>,
    pub method: String,
    pub loss_percent: f64,
    pub rtt_mean_ms: Option<f64>,
    pub rtt_max_ms: Option<f64>,
    pub jitter_ms: Option<f64>,
}
