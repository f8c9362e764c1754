//! # Chatcast - Dispatch Core for a Multi-Platform Posting Bot
//!
//! Chatcast decides *whether*, *when*, and *in what shape* a generated
//! message is delivered to a downstream chat platform (Discord, Misskey).
//! Feature producers hand it candidate messages; it runs each through a
//! pipeline of admission gates, coalesces nearby messages into prioritised
//! batches, spaces dispatches with jitter, and drives a wire-level sender
//! with bounded retry and structured telemetry.
//!
//! ## Features
//!
//! - **Hierarchical Quotas**: Ordered quota levels (per-channel, per-platform)
//!   with burst and daily tiers, re-evaluation hooks, and precise
//!   retry-after reporting.
//! - **Coalescing Queue**: Nearby messages merge into priority-aware batches;
//!   a ledger guarantees a batch id never dispatches twice while tracked.
//! - **Cooldown & Dedupe**: Sliding-window posting cooldown and trigram
//!   near-duplicate rejection in front of every send.
//! - **Bounded Retry**: `Retry-After` aware retries with exponential backoff
//!   and a strict retryable/fatal taxonomy.
//! - **Structured Telemetry**: JSON log lines and correlated metrics for
//!   every terminal outcome, aggregated into a weekly snapshot.
//! - **Async Design**: Built with Tokio; one cooperative worker per
//!   orchestrator, so sends on a (job, channel) never interleave.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use chatcast::config::Config;
//! use chatcast::build_runtime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     let mut runtime = build_runtime(&config, None)?;
//!     runtime.scheduler.run_forever().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`core`] - Gates, queue, scheduler, and the orchestrator pipeline
//! - [`adapters`] - Sender contract, retry executor, Discord/Misskey wire adapters
//! - [`metrics`] - Record store, global aggregator, weekly snapshot
//! - [`config`] - Configuration management and reload diffing
//! - [`logutil`] - Structured JSON log line helpers
//!
//! ## Data Flow
//!
//! ```text
//! ┌──────────────────┐
//! │ Feature producer │ ← weather / news / fortune / digest (external)
//! └──────────────────┘
//!          │ trigger (HH:MM + jitter)
//! ┌──────────────────┐
//! │ Coalescing queue │ ← batch by (job, channel), hold ledger
//! └──────────────────┘
//!          │ pop (priority, age)
//! ┌──────────────────┐
//! │   Orchestrator   │ ← permit → dedupe → send → cooldown note
//! └──────────────────┘
//!          │ one message at a time
//! ┌──────────────────┐
//! │ Platform sender  │ ← bounded retry, Retry-After, JSON telemetry
//! └──────────────────┘
//! ```

pub mod adapters;
pub mod config;
pub mod core;
pub mod logutil;
pub mod metrics;

use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};

use crate::adapters::Sender;
use crate::config::Config;
use crate::core::orchestrator::{PermitEvaluator, PermitOverride};
use crate::core::permit::{PermitGate, QuotaLevel, QuotaSpec};
use crate::core::scheduler::{Producer, Scheduler};
use crate::core::{CoalesceQueue, CooldownGate, MessageEnvelope, NearDuplicateFilter, Orchestrator};
use crate::metrics::{MetricsHandle, MetricsRecorder, MetricsService};

/// A fully wired dispatch core built from one settings snapshot. Rebuild it
/// to apply new settings.
pub struct Runtime {
    pub scheduler: Scheduler,
    pub orchestrator: Arc<Orchestrator>,
    pub queue: Arc<Mutex<CoalesceQueue>>,
    pub platform: String,
    pub default_channel: Option<String>,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("platform", &self.platform)
            .field("default_channel", &self.default_channel)
            .finish()
    }
}

/// Pick the active platform profile: Discord wins when both are enabled.
fn resolve_profile(config: &Config) -> Result<(String, Option<String>)> {
    if config.profiles.discord.enabled {
        Ok(("discord".to_string(), config.profiles.discord.channel.clone()))
    } else if config.profiles.misskey.enabled {
        Ok(("misskey".to_string(), config.profiles.misskey.channel.clone()))
    } else {
        Err(anyhow!("no sending profiles enabled"))
    }
}

#[cfg(feature = "wire-adapters")]
fn default_sender(platform: &str) -> Arc<dyn Sender> {
    match platform {
        "discord" => Arc::new(adapters::discord::DiscordSender::new(None, None)),
        _ => Arc::new(adapters::misskey::MisskeySender::new(None, None)),
    }
}

/// Assemble gates, queue, orchestrator, and scheduler from a validated
/// settings snapshot. `sender` overrides the platform adapter (tests inject
/// stubs here); without the `wire-adapters` feature it is required.
pub fn build_runtime(config: &Config, sender: Option<Arc<dyn Sender>>) -> Result<Runtime> {
    config.validate()?;
    let (platform, default_channel) = resolve_profile(config)?;

    let sender: Arc<dyn Sender> = match sender {
        Some(sender) => sender,
        #[cfg(feature = "wire-adapters")]
        None => default_sender(&platform),
        #[cfg(not(feature = "wire-adapters"))]
        None => {
            return Err(anyhow!(
                "no sender supplied and wire adapters are compiled out"
            ))
        }
    };

    let cooldown = Arc::new(Mutex::new(CooldownGate::new(
        config.cooldown.window_sec,
        config.cooldown.mult_min,
        config.cooldown.mult_max,
        config.cooldown.coeff.rate,
        config.cooldown.coeff.time,
        config.cooldown.coeff.eng,
    )));

    // A disabled filter keeps the pipeline shape but can never reject.
    let threshold = if config.dedupe.enabled {
        config.dedupe.sim_threshold
    } else {
        f64::INFINITY
    };
    let dedupe = Arc::new(Mutex::new(NearDuplicateFilter::new(
        config.dedupe.recent_k,
        threshold,
    )));

    let metrics_service: Option<Arc<MetricsService>> = if config.metrics.enabled {
        metrics::set_retention_days(config.metrics.retention_days);
        let service = match config.metrics.retention_days {
            Some(days) => MetricsService::new().with_retention_days(days),
            None => MetricsService::new(),
        };
        Some(Arc::new(service))
    } else {
        metrics::set_retention_days(None);
        metrics::configure_backend(None);
        None
    };

    let per_channel = config
        .quota
        .per_channel
        .ok_or_else(|| anyhow!("quota.per_channel must be configured"))?;
    let level = QuotaLevel::new(
        "per_channel",
        &QuotaSpec::BurstDay {
            burst_limit: per_channel.burst_limit,
            window_seconds: per_channel.window_seconds(),
            day: per_channel.day,
        },
    )?;
    let mut gate = PermitGate::new(vec![level])?;
    if let Some(service) = &metrics_service {
        gate = gate.with_metrics(Arc::clone(service) as Arc<dyn MetricsRecorder>);
    }
    let permit: Arc<dyn PermitEvaluator> = Arc::new(Mutex::new(gate));

    let queue = Arc::new(Mutex::new(CoalesceQueue::new(
        config.scheduler.queue.window_sec,
        config.scheduler.queue.threshold,
    )));

    let report_channel = config.report.channel.clone().or(default_channel.clone());

    let mut builder = Orchestrator::builder(sender, cooldown, dedupe, permit)
        .platform(platform.clone())
        .queue(Arc::clone(&queue));
    if let Some(service) = &metrics_service {
        builder = builder.metrics(MetricsHandle::Service(Arc::clone(service)));
    }
    if config.report.enabled {
        // The report's quota is charged against its permit key, which may
        // redirect to another job's bucket; absent overrides fall back to
        // the report's own posting key.
        let permit_cfg = config.report.permit.clone().unwrap_or_default();
        builder = builder.permit_override(
            config.report.job.clone(),
            PermitOverride {
                platform: permit_cfg.platform.unwrap_or_else(|| platform.clone()),
                channel: permit_cfg.channel.or_else(|| report_channel.clone()),
                job: permit_cfg.job.unwrap_or_else(|| config.report.job.clone()),
            },
        );
    }
    let orchestrator = Arc::new(builder.build());

    let mut scheduler = Scheduler::new(
        config.timezone(),
        Arc::clone(&queue),
        Arc::clone(&orchestrator),
    )
    .jitter(true, config.scheduler.jitter_range());
    if let Some(service) = &metrics_service {
        scheduler = scheduler.metrics(Arc::clone(service) as Arc<dyn MetricsRecorder>);
    }

    if config.report.enabled {
        let fallback = config.report.fallback.clone().filter(|s| !s.is_empty());
        let failure_threshold = config.report.failure_threshold;
        let producer: Producer = Arc::new(move || {
            let fallback = fallback.clone();
            Box::pin(async move {
                let snapshot = metrics::weekly_snapshot();
                let body = metrics::render_weekly_report(&snapshot).or(fallback)?;
                let degraded = failure_threshold.is_some_and(|threshold| {
                    snapshot["success_rate"]
                        .as_object()
                        .is_some_and(|rates| {
                            rates.values().any(|payload| {
                                payload["ratio"].as_f64().is_some_and(|r| 1.0 - r >= threshold)
                            })
                        })
                });
                let body = if degraded {
                    format!("[degraded] {body}")
                } else {
                    body
                };
                Some(MessageEnvelope::new(body))
            })
        });
        scheduler.every_day(
            config.report.job.clone(),
            config.report.schedule.clone(),
            producer,
            report_channel,
            config.report.priority,
        );
    }

    Ok(Runtime {
        scheduler,
        orchestrator,
        queue,
        platform,
        default_channel,
    })
}
