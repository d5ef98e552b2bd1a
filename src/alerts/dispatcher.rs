use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, error, info, warn};

use super::gateway::{build_gateway, Gateway, GatewayError};
use super::rate_limiter::RateLimiter;
use super::{AlertEvent, AlertStatus};
use crate::config::AlertConfig;

/// Delivers alert events through the configured gateway.
///
/// Delivery never fails the caller: every event comes back settled as
/// `Sent`, `Failed`, `Suppressed` or `RateLimited`.
pub struct AlertDispatcher {
    enabled: bool,
    gateway: Option<Arc<dyn Gateway>>,
    limiter: Mutex<RateLimiter>,
    max_retries: u32,
    backoff: Duration,
    timeout: Duration,
    notify_lifecycle: bool,
}

impl AlertDispatcher {
    pub fn new(config: &AlertConfig, gateway: Option<Arc<dyn Gateway>>) -> Self {
        Self {
            enabled: config.enabled,
            gateway,
            limiter: Mutex::new(RateLimiter::new(config.max_per_minute)),
            max_retries: config.max_retries,
            backoff: Duration::from_millis(config.backoff_ms),
            timeout: Duration::from_secs(config.timeout_secs.max(1)),
            notify_lifecycle: config.notify_lifecycle,
        }
    }

    /// Build the gateway named in the config, if alerting is enabled.
    pub fn from_config(config: &AlertConfig) -> Result<Self> {
        let gateway = match (&config.gateway, config.enabled) {
            (Some(gw), true) => Some(build_gateway(gw)?),
            _ => None,
        };
        Ok(Self::new(config, gateway))
    }

    pub fn is_active(&self) -> bool {
        self.enabled && self.gateway.is_some()
    }

    pub async fn dispatch(&self, mut event: AlertEvent) -> AlertEvent {
        let gateway = match (&self.gateway, self.enabled) {
            (Some(gw), true) => gw.clone(),
            _ => {
                info!(target = %event.target, id = %event.id, "alerting disabled, event suppressed: {}", event.summary());
                event.settle(AlertStatus::Suppressed);
                return event;
            }
        };

        let allowed = self.limiter.lock().try_acquire();
        if !allowed {
            warn!(target = %event.target, id = %event.id, "alert rate limit reached, event not delivered");
            event.settle(AlertStatus::RateLimited);
            return event;
        }

        let payload = event.payload();
        let attempts = self.max_retries + 1;
        for attempt in 0..attempts {
            if attempt > 0 {
                let delay = self.backoff_delay(attempt);
                debug!(target = %event.target, attempt, delay_ms = delay.as_millis() as u64, "retrying alert delivery");
                tokio::time::sleep(delay).await;
                event.retries = attempt;
            }

            let outcome = match tokio::time::timeout(self.timeout, gateway.deliver(&payload)).await {
                Ok(r) => r,
                Err(_) => Err(GatewayError::Timeout(self.timeout)),
            };

            match outcome {
                Ok(()) => {
                    info!(
                        target = %event.target,
                        id = %event.id,
                        gateway = gateway.name(),
                        retries = event.retries,
                        "alert delivered"
                    );
                    event.last_error = None;
                    event.settle(AlertStatus::Sent);
                    return event;
                }
                Err(e) => {
                    debug!(target = %event.target, attempt, error = %e, "alert delivery attempt failed");
                    event.last_error = Some(e.to_string());
                }
            }
        }

        error!(
            target = %event.target,
            id = %event.id,
            gateway = gateway.name(),
            attempts,
            error = event.last_error.as_deref().unwrap_or("unknown"),
            "alert delivery failed"
        );
        event.settle(AlertStatus::Failed);
        event
    }

    /// Best-effort operator notice. Failures are logged, never retried.
    pub async fn announce(&self, text: &str) {
        if !self.notify_lifecycle {
            return;
        }
        let Some(gateway) = self.gateway.as_ref().filter(|_| self.enabled) else {
            return;
        };
        match tokio::time::timeout(self.timeout, gateway.announce(text)).await {
            Ok(Ok(())) => debug!(gateway = gateway.name(), "notice sent"),
            Ok(Err(e)) => warn!(gateway = gateway.name(), error = %e, "failed to send notice"),
            Err(_) => warn!(gateway = gateway.name(), "notice timed out"),
        }
    }

    /// `backoff * 2^(attempt-1)` plus up to half of that again as jitter.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.backoff.saturating_mul(1u32 << (attempt - 1).min(16));
        let max_jitter = (base.as_millis() as u64) / 2;
        let jitter = if max_jitter > 0 {
            rand::thread_rng().gen_range(0..=max_jitter)
        } else {
            0
        };
        base + Duration::from_millis(jitter)
    }
}
