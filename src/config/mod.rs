//! Configuration management: type-safe settings with validation and defaults.
//!
//! chatcast reads a TOML settings file once at startup; the dispatch core
//! consumes the resulting snapshot. There is no hot-reload watcher: a reload
//! means loading a new snapshot, diffing it against the old one (see
//! [`diff`]), and rebuilding the scheduler/orchestrator pair.
//!
//! ```toml
//! timezone = "Asia/Tokyo"
//!
//! [profiles.discord]
//! enabled = true
//! channel = "general"
//!
//! [quota.per_channel]
//! day = 12
//! window_min = 15
//! burst_limit = 2
//!
//! [scheduler]
//! jitter_range_seconds = [60, 180]
//!
//! [scheduler.queue]
//! threshold = 3
//! window_sec = 180.0
//! ```

pub mod diff;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default)]
    pub profiles: ProfilesConfig,
    #[serde(default)]
    pub cooldown: CooldownConfig,
    #[serde(default)]
    pub dedupe: DedupeConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub report: ReportConfig,
}

fn default_timezone() -> String {
    "Asia/Tokyo".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            timezone: default_timezone(),
            profiles: ProfilesConfig::default(),
            cooldown: CooldownConfig::default(),
            dedupe: DedupeConfig::default(),
            quota: QuotaConfig::default(),
            scheduler: SchedulerConfig::default(),
            metrics: MetricsConfig::default(),
            report: ReportConfig::default(),
        }
    }
}

/// Platform profiles. Exactly the enabled ones are candidates for sending;
/// Discord wins when both are enabled.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfilesConfig {
    #[serde(default)]
    pub discord: ProfileConfig,
    #[serde(default)]
    pub misskey: ProfileConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CooldownConfig {
    pub window_sec: u64,
    pub mult_min: f64,
    pub mult_max: f64,
    #[serde(default)]
    pub coeff: CooldownCoefficients,
}

impl Default for CooldownConfig {
    fn default() -> Self {
        Self {
            window_sec: 3600,
            mult_min: 0.5,
            mult_max: 2.0,
            coeff: CooldownCoefficients::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CooldownCoefficients {
    pub rate: f64,
    pub time: f64,
    pub eng: f64,
}

impl Default for CooldownCoefficients {
    fn default() -> Self {
        Self {
            rate: 0.1,
            time: 0.0,
            eng: 0.2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupeConfig {
    pub enabled: bool,
    pub recent_k: usize,
    pub sim_threshold: f64,
}

impl Default for DedupeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            recent_k: 20,
            sim_threshold: 0.93,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuotaConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_channel: Option<PerChannelQuotaConfig>,
}

/// Compact burst/day quota pair; normalised into tiers by the permit gate.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PerChannelQuotaConfig {
    pub day: u32,
    pub window_min: u32,
    pub burst_limit: u32,
}

impl PerChannelQuotaConfig {
    pub fn window_seconds(&self) -> u64 {
        u64::from(self.window_min) * 60
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// `[lo, hi]` uniform jitter applied between close dispatches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jitter_range_seconds: Option<Vec<u32>>,
    #[serde(default)]
    pub queue: QueueConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            jitter_range_seconds: None,
            queue: QueueConfig::default(),
        }
    }
}

impl SchedulerConfig {
    /// Validated jitter pair, falling back to the built-in range.
    pub fn jitter_range(&self) -> (u32, u32) {
        match self.jitter_range_seconds.as_deref() {
            Some([lo, hi]) => (*lo, *hi),
            _ => (60, 180),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Message count that forces a batch ready early.
    pub threshold: usize,
    /// Coalesce window in seconds.
    pub window_sec: f64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            threshold: 3,
            window_sec: 180.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    /// Only the in-memory backend exists.
    pub backend: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention_days: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export: Option<String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            backend: "memory".to_string(),
            retention_days: None,
            export: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportConfig {
    pub enabled: bool,
    pub job: String,
    /// Daily trigger minute, "HH:MM".
    pub schedule: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default)]
    pub priority: i32,
    /// Permit key overrides for the report job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permit: Option<ReportPermitConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
    /// Body used when the snapshot holds nothing worth posting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<String>,
    /// Failure ratio above which the report is flagged degraded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_threshold: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReportPermitConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job: Option<String>,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            job: "weekly_report".to_string(),
            schedule: "09:00".to_string(),
            channel: None,
            priority: 5,
            permit: None,
            locale: None,
            fallback: None,
            failure_threshold: None,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file and validate it.
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file '{}': {}", path, e))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file '{}': {}", path, e))?;
        config.validate()?;
        Ok(config)
    }

    /// Write a default configuration file.
    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config {
            profiles: ProfilesConfig {
                discord: ProfileConfig {
                    enabled: true,
                    channel: Some("general".to_string()),
                },
                misskey: ProfileConfig::default(),
            },
            quota: QuotaConfig {
                per_channel: Some(PerChannelQuotaConfig {
                    day: 12,
                    window_min: 15,
                    burst_limit: 2,
                }),
            },
            ..Config::default()
        };
        let content = toml::to_string_pretty(&config)?;
        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file '{}': {}", path, e))?;
        Ok(())
    }

    /// Validate every value that must be fatal at startup.
    pub fn validate(&self) -> Result<()> {
        self.timezone
            .parse::<chrono_tz::Tz>()
            .map_err(|_| anyhow!("unknown timezone: {}", self.timezone))?;

        if self.cooldown.mult_min > self.cooldown.mult_max {
            return Err(anyhow!(
                "cooldown.mult_min {} exceeds cooldown.mult_max {}",
                self.cooldown.mult_min,
                self.cooldown.mult_max
            ));
        }
        if self.cooldown.window_sec == 0 {
            return Err(anyhow!("cooldown.window_sec must be positive"));
        }

        if self.dedupe.recent_k == 0 {
            return Err(anyhow!("dedupe.recent_k must be positive"));
        }
        if !(0.0..=1.0).contains(&self.dedupe.sim_threshold) {
            return Err(anyhow!("dedupe.sim_threshold must be in [0, 1]"));
        }

        if let Some(per_channel) = &self.quota.per_channel {
            if per_channel.day == 0 || per_channel.window_min == 0 || per_channel.burst_limit == 0 {
                return Err(anyhow!(
                    "quota.per_channel requires positive day, window_min, and burst_limit"
                ));
            }
        }

        if let Some(pair) = self.scheduler.jitter_range_seconds.as_deref() {
            match pair {
                [lo, hi] if *lo > 0 && *hi > 0 && lo <= hi => {}
                _ => {
                    return Err(anyhow!(
                        "scheduler.jitter_range_seconds must be two positive integers [lo, hi] with lo <= hi"
                    ))
                }
            }
        }
        if self.scheduler.queue.threshold == 0 {
            return Err(anyhow!("scheduler.queue.threshold must be positive"));
        }
        if self.scheduler.queue.window_sec < 0.0 {
            return Err(anyhow!("scheduler.queue.window_sec must be non-negative"));
        }

        if self.metrics.enabled && self.metrics.backend != "memory" {
            return Err(anyhow!(
                "unsupported metrics backend: {:?}",
                self.metrics.backend
            ));
        }
        if let Some(days) = self.metrics.retention_days {
            if days < 1 {
                return Err(anyhow!("metrics.retention_days must be at least 1"));
            }
        }

        if self.report.enabled && !is_hhmm(&self.report.schedule) {
            return Err(anyhow!(
                "report.schedule must be HH:MM, got {:?}",
                self.report.schedule
            ));
        }
        if let Some(threshold) = self.report.failure_threshold {
            if !(0.0..=1.0).contains(&threshold) {
                return Err(anyhow!("report.failure_threshold must be in [0, 1]"));
            }
        }

        Ok(())
    }

    pub fn timezone(&self) -> chrono_tz::Tz {
        self.timezone
            .parse()
            .expect("timezone validated at construction")
    }
}

fn is_hhmm(value: &str) -> bool {
    let Some((hh, mm)) = value.split_once(':') else {
        return false;
    };
    matches!(hh.parse::<u8>(), Ok(h) if h < 24) && matches!(mm.parse::<u8>(), Ok(m) if m < 60)
}
