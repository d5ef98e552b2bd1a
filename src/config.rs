//! TOML configuration for the monitor.
//!
//! A static snapshot loaded at startup: global scheduler, detector, model,
//! storage and alerting settings plus one `[[target]]` table per monitored
//! endpoint. Every section has compiled-in defaults so a file only needs to
//! list its targets.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::analysis::model::StaticThresholds;
use crate::probes::{ProbeKind, Target};

/// Environment variable that overrides the config file location.
pub const CONFIG_ENV: &str = "PINGWARDEN_CONFIG";

/// Standard system location checked when no path is given.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/pingwarden/pingwarden.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for the monitor process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub models: ModelConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub alerts: AlertConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default, rename = "target")]
    pub targets: Vec<TargetConfig>,
}

impl MonitorConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config = Self::from_toml(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), targets = config.targets.len(), "loaded monitor configuration");
        Ok(config)
    }

    /// Parse configuration from TOML text.
    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Resolve the configuration, in order:
    /// 1. An explicit path (from `--config`); failure to load it is an error.
    /// 2. The path named by `PINGWARDEN_CONFIG`.
    /// 3. `/etc/pingwarden/pingwarden.toml`.
    /// 4. Compiled-in defaults.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "PINGWARDEN_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Ok(Self::default())
    }

    /// Reject configurations the monitor cannot run safely with.
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.tick_interval_secs == 0 {
            bail!("scheduler.tick_interval_secs must be greater than zero");
        }
        if let Some(ms) = self.scheduler.cycle_timeout_ms {
            if ms == 0 || ms >= self.scheduler.tick_interval_secs * 1000 {
                bail!(
                    "scheduler.cycle_timeout_ms ({}) must be non-zero and shorter than the tick interval ({}s)",
                    ms,
                    self.scheduler.tick_interval_secs
                );
            }
        }

        let det = &self.detector;
        if det.min_fill == 0 || det.min_fill > det.window_size {
            bail!(
                "detector.min_fill ({}) must be between 1 and detector.window_size ({})",
                det.min_fill,
                det.window_size
            );
        }
        if det.debounce_cycles == 0 {
            bail!("detector.debounce_cycles must be at least 1");
        }
        validate_thresholds(&det.thresholds, "detector.thresholds")?;

        if self.alerts.enabled && self.alerts.gateway.is_none() {
            bail!("alerts.enabled is true but no [alerts.gateway] is configured");
        }

        if self.targets.is_empty() {
            bail!("no [[target]] entries configured");
        }

        let mut seen = HashSet::new();
        for t in &self.targets {
            let id = t.id();
            if t.address.trim().is_empty() {
                bail!("target with empty address");
            }
            if !seen.insert(id.clone()) {
                bail!("duplicate target id '{}'", id);
            }
            if t.probe_count == 0 {
                bail!("target '{}': probe_count must be at least 1", id);
            }
            if t.timeout_ms == 0 {
                bail!("target '{}': timeout_ms must be greater than zero", id);
            }
            if t.kind == ProbeKind::Tcp && t.port.is_none() {
                bail!("target '{}': tcp probes need a port", id);
            }
            if let Some(overrides) = &t.thresholds {
                validate_thresholds(&overrides.apply(&det.thresholds), &format!("target '{}' thresholds", id))?;
            }

            let worst_case = Duration::from_millis(t.timeout_ms) * t.probe_count;
            if worst_case >= self.cycle_budget() {
                warn!(
                    target = %id,
                    worst_case_ms = worst_case.as_millis() as u64,
                    budget_ms = self.cycle_budget().as_millis() as u64,
                    "probe_count x timeout exceeds the cycle budget; slow cycles will be cut short"
                );
            }
        }

        Ok(())
    }

    /// Fixed cadence of the scheduler loop.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler.tick_interval_secs)
    }

    /// Wall-clock bound on a single cycle. Defaults to 80% of the tick.
    pub fn cycle_budget(&self) -> Duration {
        match self.scheduler.cycle_timeout_ms {
            Some(ms) => Duration::from_millis(ms),
            None => self.tick_interval().mul_f64(0.8),
        }
    }

    /// Build the runtime targets, merging per-target overrides over globals.
    pub fn targets(&self) -> Vec<Target> {
        let tick = self.tick_interval();
        self.targets
            .iter()
            .map(|t| {
                let interval = t
                    .interval_secs
                    .map(Duration::from_secs)
                    .unwrap_or(tick);
                Target {
                    id: t.id(),
                    address: t.address.clone(),
                    kind: t.kind,
                    port: t.port,
                    interval,
                    every_ticks: ticks_per_interval(interval, tick),
                    probe_count: t.probe_count,
                    timeout: Duration::from_millis(t.timeout_ms),
                    thresholds: t
                        .thresholds
                        .as_ref()
                        .map(|o| o.apply(&self.detector.thresholds))
                        .unwrap_or(self.detector.thresholds),
                    score_cutoff: t.thresholds.as_ref().and_then(|o| o.score_cutoff),
                }
            })
            .collect()
    }
}

fn validate_thresholds(t: &StaticThresholds, section: &str) -> Result<()> {
    if t.max_rtt_ms.is_nan() || t.max_rtt_ms <= 0.0 {
        bail!("{}: max_rtt_ms must be positive", section);
    }
    if t.max_loss_percent.is_nan() || t.max_loss_percent <= 0.0 || t.max_loss_percent > 100.0 {
        bail!("{}: max_loss_percent must be in (0, 100]", section);
    }
    Ok(())
}

/// Number of ticks between probes of a target, rounded up, at least one.
fn ticks_per_interval(interval: Duration, tick: Duration) -> u64 {
    if tick.is_zero() || interval <= tick {
        return 1;
    }
    let ratio = interval.as_secs_f64() / tick.as_secs_f64();
    ratio.ceil().max(1.0) as u64
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Seconds between ticks.
    pub tick_interval_secs: u64,
    /// Hard bound on one cycle (milliseconds). Must be shorter than the tick.
    pub cycle_timeout_ms: Option<u64>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 10,
            cycle_timeout_ms: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Detector
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Probe results kept per target.
    pub window_size: usize,
    /// Results required before a target is scored.
    pub min_fill: usize,
    /// Consecutive anomalous cycles before alerting.
    pub debounce_cycles: u32,
    /// Cycles of suppression after an alert.
    pub cooldown_cycles: u32,
    /// Global static thresholds used when no model is available.
    pub thresholds: StaticThresholds,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            window_size: 20,
            min_fill: 8,
            debounce_cycles: 3,
            cooldown_cycles: 6,
            thresholds: StaticThresholds::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Models
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Directory the training job writes `model_<target>.json` files into.
    pub dir: PathBuf,
    /// Seconds between checks for newer artifacts.
    pub reload_interval_secs: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("models"),
            reload_interval_secs: 60,
        }
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database holding probe history and alert events.
    pub db_path: PathBuf,
    /// Extra attempts after a failed append.
    pub write_retries: u32,
    /// Delay between append attempts (milliseconds).
    pub retry_delay_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/pingwarden.db"),
            write_retries: 3,
            retry_delay_ms: 50,
        }
    }
}

// ---------------------------------------------------------------------------
// Alerts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    /// When false, alert events are recorded as `suppressed` and never sent.
    pub enabled: bool,
    pub gateway: Option<GatewayConfig>,
    /// Extra delivery attempts after the first failure.
    pub max_retries: u32,
    /// Base backoff between attempts (milliseconds), doubled each retry.
    pub backoff_ms: u64,
    /// Bound on a single delivery attempt.
    pub timeout_secs: u64,
    /// Deliveries allowed per rolling minute across all targets.
    pub max_per_minute: usize,
    /// Send "monitor started/stopped" notices.
    pub notify_lifecycle: bool,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            gateway: None,
            max_retries: 3,
            backoff_ms: 500,
            timeout_secs: 10,
            max_per_minute: 6,
            notify_lifecycle: true,
        }
    }
}

/// Outbound notification gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayConfig {
    /// Telegram Bot API `sendMessage`.
    Telegram {
        bot_token: String,
        chat_id: String,
        #[serde(default = "default_telegram_api")]
        api_base: String,
    },
    /// Generic JSON POST.
    Webhook { url: String },
}

fn default_telegram_api() -> String {
    "https://api.telegram.org".to_string()
}

// ---------------------------------------------------------------------------
// API / Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Address for the read-only status API. Disabled when unset.
    pub bind: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON log lines.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Targets
// ---------------------------------------------------------------------------

/// One monitored endpoint as written in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Display id; defaults to the address (`address:port` for tcp).
    #[serde(default)]
    pub name: Option<String>,
    pub address: String,
    #[serde(default)]
    pub kind: ProbeKind,
    #[serde(default)]
    pub port: Option<u16>,
    /// Seconds between probes; defaults to the tick interval.
    #[serde(default)]
    pub interval_secs: Option<u64>,
    #[serde(default = "default_probe_count")]
    pub probe_count: u32,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub thresholds: Option<ThresholdOverride>,
}

fn default_probe_count() -> u32 {
    4
}

fn default_timeout_ms() -> u64 {
    2000
}

impl TargetConfig {
    pub fn id(&self) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }
        match (self.kind, self.port) {
            (ProbeKind::Tcp, Some(port)) => format!("{}:{}", self.address, port),
            _ => self.address.clone(),
        }
    }
}

/// Per-target alert threshold override. Unset fields inherit the globals.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThresholdOverride {
    pub max_rtt_ms: Option<f64>,
    pub max_loss_percent: Option<f64>,
    /// Replaces the model's learned cutoff for this target.
    pub score_cutoff: Option<f64>,
}

impl ThresholdOverride {
    pub fn apply(&self, global: &StaticThresholds) -> StaticThresholds {
        StaticThresholds {
            max_rtt_ms: self.max_rtt_ms.unwrap_or(global.max_rtt_ms),
            max_loss_percent: self.max_loss_percent.unwrap_or(global.max_loss_percent),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = r#"
[scheduler]
tick_interval_secs = 5

[detector]
window_size = 12
min_fill = 6
debounce_cycles = 2
cooldown_cycles = 3

[detector.thresholds]
max_rtt_ms = 150.0
max_loss_percent = 40.0

[alerts]
enabled = true
max_retries = 2

[alerts.gateway]
type = "telegram"
bot_token = "123:abc"
chat_id = "42"

[[target]]
address = "8.8.8.8"

[[target]]
name = "edge-router"
address = "10.0.0.1"
kind = "tcp"
port = 22
interval_secs = 12
probe_count = 2
timeout_ms = 500

[target.thresholds]
max_rtt_ms = 20.0
score_cutoff = -0.6
"#;

    #[test]
    fn test_defaults_are_sane() {
        let cfg = MonitorConfig::default();
        assert_eq!(cfg.scheduler.tick_interval_secs, 10);
        assert_eq!(cfg.detector.window_size, 20);
        assert_eq!(cfg.detector.min_fill, 8);
        assert_eq!(cfg.detector.debounce_cycles, 3);
        assert_eq!(cfg.detector.cooldown_cycles, 6);
        assert_eq!(cfg.detector.thresholds.max_loss_percent, 50.0);
        assert_eq!(cfg.models.dir, PathBuf::from("models"));
        assert_eq!(cfg.storage.db_path, PathBuf::from("data/pingwarden.db"));
        assert!(!cfg.alerts.enabled);
        assert!(cfg.api.bind.is_none());
        assert_eq!(cfg.logging.level, "info");
        assert_eq!(cfg.cycle_budget(), Duration::from_secs(8));
    }

    #[test]
    fn test_parse_example_toml() {
        let cfg = MonitorConfig::from_toml(EXAMPLE).unwrap();
        cfg.validate().unwrap();

        assert_eq!(cfg.targets.len(), 2);
        assert!(matches!(
            cfg.alerts.gateway,
            Some(GatewayConfig::Telegram { ref api_base, .. }) if api_base == "https://api.telegram.org"
        ));

        let targets = cfg.targets();
        assert_eq!(targets[0].id, "8.8.8.8");
        assert_eq!(targets[0].kind, ProbeKind::Icmp);
        assert_eq!(targets[0].probe_count, 4);
        assert_eq!(targets[0].every_ticks, 1);
        assert_eq!(targets[0].thresholds.max_rtt_ms, 150.0);
        assert!(targets[0].score_cutoff.is_none());

        let edge = &targets[1];
        assert_eq!(edge.id, "edge-router");
        assert_eq!(edge.kind, ProbeKind::Tcp);
        assert_eq!(edge.every_ticks, 3); // 12s over a 5s tick, rounded up
        assert_eq!(edge.thresholds.max_rtt_ms, 20.0);
        assert_eq!(edge.thresholds.max_loss_percent, 40.0);
        assert_eq!(edge.score_cutoff, Some(-0.6));
    }

    #[test]
    fn test_tcp_id_includes_port() {
        let t = TargetConfig {
            name: None,
            address: "example.com".into(),
            kind: ProbeKind::Tcp,
            port: Some(443),
            interval_secs: None,
            probe_count: 1,
            timeout_ms: 100,
            thresholds: None,
        };
        assert_eq!(t.id(), "example.com:443");
    }

    #[test]
    fn test_validate_rejects_bad_window() {
        let mut cfg = MonitorConfig::from_toml(EXAMPLE).unwrap();
        cfg.detector.min_fill = 50;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_duplicate_targets() {
        let cfg = MonitorConfig::from_toml(
            r#"
[[target]]
address = "1.1.1.1"
[[target]]
address = "1.1.1.1"
"#,
        )
        .unwrap();
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("duplicate"));
    }

    #[test]
    fn test_validate_rejects_enabled_alerts_without_gateway() {
        let cfg = MonitorConfig::from_toml(
            r#"
[alerts]
enabled = true
[[target]]
address = "1.1.1.1"
"#,
        )
        .unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_cycle_timeout_longer_than_tick() {
        let cfg = MonitorConfig::from_toml(
            r#"
[scheduler]
tick_interval_secs = 2
cycle_timeout_ms = 2000
[[target]]
address = "1.1.1.1"
"#,
        )
        .unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_tcp_without_port_rejected() {
        let cfg = MonitorConfig::from_toml(
            r#"
[[target]]
address = "1.1.1.1"
kind = "tcp"
"#,
        )
        .unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_empty_targets_rejected() {
        assert!(MonitorConfig::default().validate().is_err());
    }
}
