//! Reachability probes and the per-target prober.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::analysis::model::StaticThresholds;

pub mod icmp;
pub mod tcp;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeKind {
    #[default]
    Icmp,
    Tcp,
}

impl std::fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbeKind::Icmp => write!(f, "icmp"),
            ProbeKind::Tcp => write!(f, "tcp"),
        }
    }
}

/// A monitored endpoint. Immutable after the config is loaded.
#[derive(Debug, Clone, PartialEq)]
pub struct Target {
    pub id: String,
    pub address: String,
    pub kind: ProbeKind,
    pub port: Option<u16>,
    pub interval: Duration,
    /// Probe on every n-th scheduler tick.
    pub every_ticks: u64,
    pub probe_count: u32,
    /// Bound on a single attempt.
    pub timeout: Duration,
    pub thresholds: StaticThresholds,
    /// Overrides the model's learned cutoff.
    pub score_cutoff: Option<f64>,
}

impl Target {
    /// Minimal ICMP target with global defaults, for one-shot probes and tests.
    pub fn icmp(address: &str) -> Self {
        Self {
            id: address.to_string(),
            address: address.to_string(),
            kind: ProbeKind::Icmp,
            port: None,
            interval: Duration::from_secs(10),
            every_ticks: 1,
            probe_count: 4,
            timeout: Duration::from_secs(2),
            thresholds: StaticThresholds::default(),
            score_cutoff: None,
        }
    }

    pub fn is_due(&self, tick: u64) -> bool {
        tick % self.every_ticks.max(1) == 0
    }
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("invalid target address '{0}'")]
    InvalidAddress(String),

    #[error("no reply from {0}")]
    NoReply(String),

    #[error("attempt timed out after {0:?}")]
    Timeout(Duration),

    #[error("failed to run probe: {0}")]
    Io(#[from] std::io::Error),

    #[error("no probe registered for kind {0}")]
    Unsupported(ProbeKind),
}

/// Outcome of one reachability attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub target: String,
    pub timestamp: DateTime<Utc>,
    /// Round-trip time in milliseconds; absent on failure.
    pub rtt_ms: Option<f64>,
    pub success: bool,
}

impl ProbeResult {
    pub fn reply(target: &str, rtt: Duration) -> Self {
        Self {
            target: target.to_string(),
            timestamp: Utc::now(),
            rtt_ms: Some(rtt.as_secs_f64() * 1000.0),
            success: true,
        }
    }

    pub fn lost(target: &str) -> Self {
        Self {
            target: target.to_string(),
            timestamp: Utc::now(),
            rtt_ms: None,
            success: false,
        }
    }

    /// A full-loss batch, used when a target produced nothing within the cycle.
    pub fn full_loss(target: &str, count: u32) -> Vec<Self> {
        (0..count.max(1)).map(|_| Self::lost(target)).collect()
    }
}

/// Loss ratio in [0, 1] over a set of results.
pub fn loss_ratio(results: &[ProbeResult]) -> f64 {
    if results.is_empty() {
        return 1.0;
    }
    let lost = results.iter().filter(|r| !r.success).count();
    lost as f64 / results.len() as f64
}

/// A single reachability check against a target.
///
/// Implementations report the round-trip time or an error; the prober turns
/// both into `ProbeResult`s so unreachability never escapes as a failure.
#[async_trait::async_trait]
pub trait Probe: Send + Sync {
    async fn attempt(&self, target: &Target) -> Result<Duration, ProbeError>;
}

/// Runs `probe_count` attempts per target through the probe for its kind.
pub struct Prober {
    probes: HashMap<ProbeKind, Arc<dyn Probe>>,
}

impl Default for Prober {
    fn default() -> Self {
        Self::system()
    }
}

impl Prober {
    /// Prober backed by the system `ping` and TCP connects.
    pub fn system() -> Self {
        Self::empty()
            .with_probe(ProbeKind::Icmp, Arc::new(icmp::IcmpProbe))
            .with_probe(ProbeKind::Tcp, Arc::new(tcp::TcpProbe))
    }

    pub fn empty() -> Self {
        Self {
            probes: HashMap::new(),
        }
    }

    pub fn with_probe(mut self, kind: ProbeKind, probe: Arc<dyn Probe>) -> Self {
        self.probes.insert(kind, probe);
        self
    }

    /// Attempt `probe_count` checks, each bounded by the target timeout.
    /// No retries beyond the configured count.
    pub async fn run(&self, target: &Target) -> Vec<ProbeResult> {
        self.run_until(target, None).await
    }

    /// Like [`run`](Self::run), but no attempt outlives `deadline`. Replies
    /// gathered before the deadline are kept; only attempts cut short or
    /// never started count as lost.
    pub async fn run_until(&self, target: &Target, deadline: Option<Instant>) -> Vec<ProbeResult> {
        let count = target.probe_count.max(1);
        let Some(probe) = self.probes.get(&target.kind) else {
            debug!(target = %target.id, kind = %target.kind, "{}", ProbeError::Unsupported(target.kind));
            return ProbeResult::full_loss(&target.id, count);
        };

        let mut results = Vec::with_capacity(count as usize);
        for seq in 0..count {
            let budget = match deadline {
                Some(d) => target.timeout.min(d.saturating_duration_since(Instant::now())),
                None => target.timeout,
            };
            if budget.is_zero() {
                warn!(
                    target = %target.id,
                    abandoned = count - seq,
                    "probe attempts abandoned at cycle deadline"
                );
                results.extend((seq..count).map(|_| ProbeResult::lost(&target.id)));
                break;
            }

            let outcome = match tokio::time::timeout(budget, probe.attempt(target)).await {
                Ok(r) => r,
                Err(_) => Err(ProbeError::Timeout(budget)),
            };
            match outcome {
                Ok(rtt) => results.push(ProbeResult::reply(&target.id, rtt)),
                Err(e) => {
                    debug!(target = %target.id, seq, error = %e, "probe attempt failed");
                    results.push(ProbeResult::lost(&target.id));
                }
            }
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Flaky {
        calls: AtomicU32,
    }

    #[async_trait::async_trait]
    impl Probe for Flaky {
        async fn attempt(&self, target: &Target) -> Result<Duration, ProbeError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n % 2 == 0 {
                Ok(Duration::from_millis(12))
            } else {
                Err(ProbeError::NoReply(target.address.clone()))
            }
        }
    }

    struct Stuck;

    #[async_trait::async_trait]
    impl Probe for Stuck {
        async fn attempt(&self, _target: &Target) -> Result<Duration, ProbeError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(Duration::from_millis(1))
        }
    }

    #[tokio::test]
    async fn test_runs_exactly_probe_count_attempts() {
        let flaky = Arc::new(Flaky {
            calls: AtomicU32::new(0),
        });
        let prober = Prober::empty().with_probe(ProbeKind::Icmp, flaky.clone());
        let target = Target::icmp("192.0.2.1");

        let results = prober.run(&target).await;
        assert_eq!(results.len(), 4);
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 4);
        assert_eq!(results.iter().filter(|r| r.success).count(), 2);
        assert_eq!(loss_ratio(&results), 0.5);
        assert!(results.iter().all(|r| r.success == r.rtt_ms.is_some()));
    }

    #[tokio::test]
    async fn test_timeout_becomes_lost_result() {
        let prober = Prober::empty().with_probe(ProbeKind::Icmp, Arc::new(Stuck));
        let mut target = Target::icmp("192.0.2.1");
        target.probe_count = 2;
        target.timeout = Duration::from_millis(20);

        let results = prober.run(&target).await;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| !r.success && r.rtt_ms.is_none()));
    }

    /// Replies at once, except the fourth attempt which stalls.
    struct SlowLast {
        calls: AtomicU32,
    }

    #[async_trait::async_trait]
    impl Probe for SlowLast {
        async fn attempt(&self, _target: &Target) -> Result<Duration, ProbeError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 3 {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            Ok(Duration::from_millis(8))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_keeps_earlier_replies() {
        let prober = Prober::empty().with_probe(
            ProbeKind::Icmp,
            Arc::new(SlowLast {
                calls: AtomicU32::new(0),
            }),
        );
        let mut target = Target::icmp("192.0.2.1");
        target.probe_count = 6;
        target.timeout = Duration::from_millis(200);

        let deadline = Instant::now() + Duration::from_millis(100);
        let results = prober.run_until(&target, Some(deadline)).await;
        assert_eq!(results.len(), 6);
        assert_eq!(results.iter().filter(|r| r.success).count(), 3);
        assert!(results[..3].iter().all(|r| r.success));
        assert_eq!(loss_ratio(&results), 0.5);
        assert!(Instant::now() <= deadline + Duration::from_millis(1));
    }

    #[tokio::test]
    async fn test_missing_probe_kind_is_full_loss() {
        let prober = Prober::empty();
        let results = prober.run(&Target::icmp("192.0.2.1")).await;
        assert_eq!(results.len(), 4);
        assert_eq!(loss_ratio(&results), 1.0);
    }

    #[test]
    fn test_is_due() {
        let mut t = Target::icmp("192.0.2.1");
        assert!(t.is_due(0) && t.is_due(7));
        t.every_ticks = 3;
        assert!(t.is_due(0));
        assert!(!t.is_due(1));
        assert!(t.is_due(6));
    }
}
