//! Hierarchical quota permit gate.
//!
//! A gate is an ordered list of quota *levels* (e.g. per-channel, then
//! per-platform). Each level keys its own post history and carries an ordered
//! list of *tiers* (narrowest window first, e.g. burst before daily). A
//! request is admitted only when every level admits; the first denying level
//! and its first exceeded tier drive the denial. Denials may carry a
//! re-evaluation outcome, either from a static tier tag or from an
//! `on_rejection` hook (the hook wins).

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use log::warn;
use thiserror::Error;

use super::{system_clock, Clock};
use crate::metrics::MetricsRecorder;

pub const DAY_SECONDS: u64 = 86_400;

/// Quota configuration problems are fatal at construction time.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QuotaConfigError {
    #[error("permit gate requires at least one quota level")]
    EmptyLevels,
    #[error("quota level name must be non-empty")]
    EmptyLevelName,
    #[error("quota must define tiers or burst/day limits")]
    MissingDefinition,
    #[error("quota tier must define a code")]
    MissingTierCode,
    #[error("quota tier {code} limit must be positive")]
    NonPositiveLimit { code: String },
    #[error("quota tier {code} window must be positive")]
    NonPositiveWindow { code: String },
}

/// One admission tier: at most `limit` posts inside `window_seconds`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaTier {
    pub code: String,
    pub message: String,
    pub retryable: bool,
    pub limit: u32,
    pub window_seconds: u64,
    /// Static re-evaluation tag reported on denial unless a hook overrides it.
    pub reevaluation: Option<String>,
}

impl QuotaTier {
    pub fn new(
        code: impl Into<String>,
        message: impl Into<String>,
        retryable: bool,
        limit: u32,
        window_seconds: u64,
    ) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            retryable,
            limit,
            window_seconds,
            reevaluation: None,
        }
    }

    pub fn with_reevaluation(mut self, tag: impl Into<String>) -> Self {
        self.reevaluation = Some(tag.into());
        self
    }

    fn validate(&self) -> Result<(), QuotaConfigError> {
        if self.code.is_empty() {
            return Err(QuotaConfigError::MissingTierCode);
        }
        if self.limit == 0 {
            return Err(QuotaConfigError::NonPositiveLimit {
                code: self.code.clone(),
            });
        }
        if self.window_seconds == 0 {
            return Err(QuotaConfigError::NonPositiveWindow {
                code: self.code.clone(),
            });
        }
        Ok(())
    }
}

/// A quota definition: either the compact burst/day pair or explicit tiers.
/// Normalised into an ordered tier list at gate construction; mixed or
/// incomplete definitions are rejected.
#[derive(Debug, Clone)]
pub enum QuotaSpec {
    /// `burst_limit` posts per `window_seconds`, plus `day` posts per day.
    BurstDay {
        burst_limit: u32,
        window_seconds: u64,
        day: u32,
    },
    Tiers(Vec<QuotaTier>),
}

impl QuotaSpec {
    fn normalize(&self) -> Result<Vec<QuotaTier>, QuotaConfigError> {
        match self {
            QuotaSpec::Tiers(tiers) => {
                if tiers.is_empty() {
                    return Err(QuotaConfigError::MissingDefinition);
                }
                for tier in tiers {
                    tier.validate()?;
                }
                Ok(tiers.clone())
            }
            QuotaSpec::BurstDay {
                burst_limit,
                window_seconds,
                day,
            } => {
                let burst = QuotaTier::new(
                    "burst_limit",
                    "burst limit reached",
                    true,
                    *burst_limit,
                    *window_seconds,
                );
                let daily =
                    QuotaTier::new("daily_limit", "daily limit reached", false, *day, DAY_SECONDS);
                burst.validate()?;
                daily.validate()?;
                Ok(vec![burst, daily])
            }
        }
    }
}

/// Maps (platform, channel, job) onto the two-part history key of a level.
pub type KeyFn = Arc<dyn Fn(&str, Option<&str>, Option<&str>) -> (String, String) + Send + Sync>;

fn default_key(platform: &str, channel: Option<&str>, _job: Option<&str>) -> (String, String) {
    let p = if platform.is_empty() { "-" } else { platform };
    (p.to_string(), channel.unwrap_or("-").to_string())
}

/// One named quota level with its own history keying.
pub struct QuotaLevel {
    pub name: String,
    tiers: Vec<QuotaTier>,
    key_fn: KeyFn,
}

impl std::fmt::Debug for QuotaLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaLevel")
            .field("name", &self.name)
            .field("tiers", &self.tiers)
            .finish()
    }
}

impl QuotaLevel {
    pub fn new(name: impl Into<String>, spec: &QuotaSpec) -> Result<Self, QuotaConfigError> {
        Self::with_key_fn(name, spec, Arc::new(default_key))
    }

    pub fn with_key_fn(
        name: impl Into<String>,
        spec: &QuotaSpec,
        key_fn: KeyFn,
    ) -> Result<Self, QuotaConfigError> {
        let name = name.into();
        if name.is_empty() {
            return Err(QuotaConfigError::EmptyLevelName);
        }
        Ok(Self {
            name,
            tiers: spec.normalize()?,
            key_fn,
        })
    }
}

/// Result of a rejection hook: how and when the denied batch may come back.
#[derive(Debug, Clone, PartialEq)]
pub struct ReevaluationOutcome {
    pub level: String,
    pub reason: String,
    pub retry_after: Option<f64>,
    pub allowed: Option<bool>,
}

/// What a denial carries about re-evaluation: the tier's static tag, or the
/// richer outcome produced by the rejection hook.
#[derive(Debug, Clone, PartialEq)]
pub enum Reevaluation {
    Tag(String),
    Outcome(ReevaluationOutcome),
}

impl Reevaluation {
    pub fn retry_after(&self) -> Option<f64> {
        match self {
            Reevaluation::Outcome(outcome) => outcome.retry_after,
            Reevaluation::Tag(_) => None,
        }
    }

    pub fn level(&self) -> Option<&str> {
        match self {
            Reevaluation::Outcome(outcome) => Some(outcome.level.as_str()),
            Reevaluation::Tag(_) => None,
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Reevaluation::Outcome(outcome) => Some(outcome.reason.as_str()),
            Reevaluation::Tag(tag) => Some(tag.as_str()),
        }
    }

    pub fn allowed(&self) -> Option<bool> {
        match self {
            Reevaluation::Outcome(outcome) => outcome.allowed,
            Reevaluation::Tag(_) => None,
        }
    }
}

/// Context handed to the rejection hook.
#[derive(Debug, Clone)]
pub struct RejectionContext {
    pub platform: String,
    pub channel: Option<String>,
    pub job: Option<String>,
    pub level: String,
    pub code: String,
    pub message: String,
}

pub type RejectionHook =
    Arc<dyn Fn(&RejectionContext) -> Option<ReevaluationOutcome> + Send + Sync>;

pub const PERMIT_REEVALUATION_RETRY_SOURCE: &str = "permit_reeval";

/// The per-call verdict of the gate.
#[derive(Debug, Clone, PartialEq)]
pub struct PermitDecision {
    pub allowed: bool,
    pub reason: Option<String>,
    pub retryable: bool,
    pub job: Option<String>,
    pub reevaluation: Option<Reevaluation>,
    pub retry_after: Option<f64>,
    pub level: Option<String>,
    pub retry_metadata: Option<BTreeMap<String, String>>,
}

impl PermitDecision {
    pub fn allow(job: Option<&str>) -> Self {
        Self {
            allowed: true,
            reason: None,
            retryable: true,
            job: job.map(str::to_string),
            reevaluation: None,
            retry_after: None,
            level: None,
            retry_metadata: None,
        }
    }
}

/// Admission controller enforcing the configured quota levels.
pub struct PermitGate {
    levels: Vec<QuotaLevel>,
    history: HashMap<(String, String, String), VecDeque<f64>>,
    hook: Option<RejectionHook>,
    metrics: Option<Arc<dyn MetricsRecorder>>,
    clock: Clock,
    retention_window: f64,
}

impl std::fmt::Debug for PermitGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermitGate")
            .field("levels", &self.levels)
            .field("retention_window", &self.retention_window)
            .finish()
    }
}

impl PermitGate {
    pub fn new(levels: Vec<QuotaLevel>) -> Result<Self, QuotaConfigError> {
        if levels.is_empty() {
            return Err(QuotaConfigError::EmptyLevels);
        }
        let retention = levels
            .iter()
            .flat_map(|level| level.tiers.iter().map(|t| t.window_seconds))
            .max()
            .unwrap_or(DAY_SECONDS)
            .max(DAY_SECONDS);
        Ok(Self {
            levels,
            history: HashMap::new(),
            hook: None,
            metrics: None,
            clock: system_clock(),
            retention_window: retention as f64,
        })
    }

    pub fn with_hook(mut self, hook: RejectionHook) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsRecorder>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Evaluate all levels in declaration order. Appends `now` to every
    /// traversed history only when every level admits.
    pub fn permit(
        &mut self,
        platform: &str,
        channel: Option<&str>,
        job: Option<&str>,
    ) -> PermitDecision {
        let now = (self.clock)();
        let mut pending: Vec<(String, String, String)> = Vec::with_capacity(self.levels.len());
        let mut denial: Option<(usize, QuotaTier, f64)> = None;

        'levels: for (idx, level) in self.levels.iter().enumerate() {
            let (k1, k2) = (level.key_fn)(platform, channel, job);
            let key = (level.name.clone(), k1, k2);
            let history = self.history.entry(key.clone()).or_default();
            let cutoff = now - self.retention_window;
            while history.front().is_some_and(|ts| *ts < cutoff) {
                history.pop_front();
            }
            for tier in &level.tiers {
                if let Some(retry_after) = tier_retry_after(history, now, tier) {
                    denial = Some((idx, tier.clone(), retry_after));
                    break 'levels;
                }
            }
            pending.push(key);
        }

        if let Some((level_idx, tier, retry_after)) = denial {
            let level_name = self.levels[level_idx].name.clone();
            return self.deny(platform, channel, job, &level_name, &tier, retry_after);
        }

        for key in pending {
            if let Some(history) = self.history.get_mut(&key) {
                history.push_back(now);
            }
        }
        PermitDecision::allow(job)
    }

    fn deny(
        &self,
        platform: &str,
        channel: Option<&str>,
        job: Option<&str>,
        level: &str,
        tier: &QuotaTier,
        retry_after: f64,
    ) -> PermitDecision {
        let hook_outcome = self.hook.as_ref().and_then(|hook| {
            hook(&RejectionContext {
                platform: platform.to_string(),
                channel: channel.map(str::to_string),
                job: job.map(str::to_string),
                level: level.to_string(),
                code: tier.code.clone(),
                message: tier.message.clone(),
            })
        });

        let reevaluation = match (&hook_outcome, &tier.reevaluation) {
            (Some(outcome), _) => Some(Reevaluation::Outcome(outcome.clone())),
            (None, Some(tag)) => Some(Reevaluation::Tag(tag.clone())),
            (None, None) => None,
        };

        let mut tags = BTreeMap::new();
        tags.insert("platform".to_string(), or_dash(platform));
        tags.insert("channel".to_string(), channel.map_or_else(|| "-".to_string(), str::to_string));
        tags.insert("code".to_string(), tier.code.clone());
        tags.insert("level".to_string(), level.to_string());
        tags.insert("retryable".to_string(), bool_str(tier.retryable).to_string());
        tags.insert("window_sec".to_string(), tier.window_seconds.to_string());
        tags.insert("retry_after_sec".to_string(), format!("{retry_after:.0}"));
        if let Some(tag) = &tier.reevaluation {
            tags.insert("reevaluation".to_string(), tag.clone());
        } else {
            let reason_hint = hook_outcome
                .as_ref()
                .map(|o| o.reason.clone())
                .filter(|r| !r.is_empty())
                .unwrap_or_else(|| tier.message.clone());
            tags.insert("reeval_reason".to_string(), reason_hint);
        }

        let retry_metadata = if tier.reevaluation.is_some() || hook_outcome.is_some() {
            let mut meta = BTreeMap::new();
            meta.insert(
                "retry_source".to_string(),
                PERMIT_REEVALUATION_RETRY_SOURCE.to_string(),
            );
            meta.insert("permit_level".to_string(), level.to_string());
            let hint = hook_outcome
                .as_ref()
                .map(|o| o.reason.clone())
                .or_else(|| tier.reevaluation.clone());
            if let Some(hint) = hint.filter(|h| !h.is_empty()) {
                meta.insert("retry_reason".to_string(), hint);
            }
            Some(meta)
        } else {
            None
        };

        if let Some(metrics) = &self.metrics {
            metrics.increment("quota_denied", &tags);
        }
        warn!(
            "quota denied for {}/{} at level {}: {}",
            or_dash(platform),
            channel.unwrap_or("-"),
            level,
            tier.message
        );

        PermitDecision {
            allowed: false,
            reason: Some(tier.message.clone()),
            retryable: tier.retryable,
            job: job.map(str::to_string),
            reevaluation,
            retry_after: Some(retry_after),
            level: Some(level.to_string()),
            retry_metadata,
        }
    }
}

/// `Some(retry_after)` when the tier is exceeded: the window remaining until
/// the entry that must expire before the next post is admitted.
fn tier_retry_after(history: &VecDeque<f64>, now: f64, tier: &QuotaTier) -> Option<f64> {
    let cutoff = now - tier.window_seconds as f64;
    let recent: Vec<f64> = history.iter().copied().filter(|ts| *ts >= cutoff).collect();
    if (recent.len() as u32) < tier.limit {
        return None;
    }
    let threshold_ts = recent[recent.len() - tier.limit as usize];
    Some((tier.window_seconds as f64 - (now - threshold_ts)).max(0.0))
}

fn or_dash(s: &str) -> String {
    if s.is_empty() {
        "-".to_string()
    } else {
        s.to_string()
    }
}

fn bool_str(v: bool) -> &'static str {
    if v {
        "true"
    } else {
        "false"
    }
}
