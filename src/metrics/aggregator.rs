//! Process-global metrics aggregator.
//!
//! One aggregator per process, initialised lazily behind a `OnceLock`. The
//! orchestrator reports terminal send outcomes and permit denials here; the
//! weekly report reads them back as a JSON snapshot. A configurable backend
//! recorder receives the same events as live counters/observations so an
//! attached [`MetricsService`] sees them too.
//!
//! Retention default is seven days; `weekly_snapshot` trims older records and
//! persists the trimmed lists back.

use std::sync::{Arc, Mutex, OnceLock};

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde_json::{json, Map, Value};

use super::service::{UtcClock, DEFAULT_RETENTION_DAYS};
use super::{MetricsRecorder, NullMetricsRecorder, Tags};

const LATENCY_BUCKETS: [(f64, &str); 3] = [(1.0, "1s"), (3.0, "3s"), (f64::INFINITY, ">3s")];

fn select_bucket(value: f64) -> &'static str {
    for (threshold, label) in LATENCY_BUCKETS {
        if value <= threshold {
            return label;
        }
    }
    LATENCY_BUCKETS[LATENCY_BUCKETS.len() - 1].1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendOutcome {
    Success,
    Failure,
}

struct SendEventRecord {
    recorded_at: DateTime<Utc>,
    job: String,
    outcome: SendOutcome,
    duration: f64,
}

struct PermitDenialRecord {
    recorded_at: DateTime<Utc>,
    payload: Tags,
}

struct AggregatorState {
    backend: Arc<dyn MetricsRecorder>,
    backend_configured: bool,
    send_events: Vec<SendEventRecord>,
    permit_denials: Vec<PermitDenialRecord>,
    retention_days: i64,
    clock: Option<UtcClock>,
}

impl AggregatorState {
    fn now(&self) -> DateTime<Utc> {
        match &self.clock {
            Some(clock) => clock(),
            None => Utc::now(),
        }
    }
}

struct GlobalAggregator {
    state: Mutex<AggregatorState>,
}

static AGGREGATOR: OnceLock<GlobalAggregator> = OnceLock::new();

fn aggregator() -> &'static GlobalAggregator {
    AGGREGATOR.get_or_init(|| GlobalAggregator {
        state: Mutex::new(AggregatorState {
            backend: Arc::new(NullMetricsRecorder),
            backend_configured: false,
            send_events: Vec::new(),
            permit_denials: Vec::new(),
            retention_days: DEFAULT_RETENTION_DAYS,
            clock: None,
        }),
    })
}

fn lock_state() -> std::sync::MutexGuard<'static, AggregatorState> {
    aggregator()
        .state
        .lock()
        .expect("metrics aggregator mutex poisoned")
}

/// Install (or clear) the live backend recorder.
pub fn configure_backend(recorder: Option<Arc<dyn MetricsRecorder>>) {
    let mut state = lock_state();
    match recorder {
        Some(recorder) => {
            state.backend = recorder;
            state.backend_configured = true;
        }
        None => {
            state.backend = Arc::new(NullMetricsRecorder);
            state.backend_configured = false;
        }
    }
}

pub fn backend_configured() -> bool {
    lock_state().backend_configured
}

/// Override the retention window; `None` restores the default of seven days.
pub fn set_retention_days(retention_days: Option<i64>) {
    let mut state = lock_state();
    state.retention_days = retention_days.map_or(DEFAULT_RETENTION_DAYS, |d| d.max(1));
}

/// Test hook: pin the aggregator clock. `None` restores the system clock.
pub fn set_clock_for_test(clock: Option<UtcClock>) {
    lock_state().clock = clock;
}

fn base_tags(job: &str, platform: &str, channel: Option<&str>) -> Tags {
    let mut tags = Tags::new();
    tags.insert("job".into(), job.to_string());
    tags.insert("platform".into(), platform.to_string());
    tags.insert("channel".into(), channel.unwrap_or("-").to_string());
    tags
}

fn merged(base: &Tags, extra: Option<&Tags>) -> Tags {
    let mut tags = base.clone();
    if let Some(extra) = extra {
        for (k, v) in extra {
            tags.insert(k.clone(), v.clone());
        }
    }
    tags
}

pub fn report_send_success(
    job: &str,
    platform: &str,
    channel: Option<&str>,
    duration_seconds: f64,
    permit_tags: Option<&Tags>,
) {
    let base = base_tags(job, platform, channel);
    let tags = merged(&base, permit_tags);
    let mut duration_tags = base;
    duration_tags.insert("unit".into(), "seconds".into());
    let backend = {
        let mut state = lock_state();
        if state.backend_configured {
            let recorded_at = state.now();
            state.send_events.push(SendEventRecord {
                recorded_at,
                job: job.to_string(),
                outcome: SendOutcome::Success,
                duration: duration_seconds,
            });
        }
        Arc::clone(&state.backend)
    };
    backend.increment("send.success", &tags);
    backend.observe("send.duration", duration_seconds, &duration_tags);
}

pub fn report_send_failure(
    job: &str,
    platform: &str,
    channel: Option<&str>,
    duration_seconds: f64,
    error_type: &str,
) {
    let base = base_tags(job, platform, channel);
    let mut increment_tags = base.clone();
    increment_tags.insert("error".into(), error_type.to_string());
    let mut duration_tags = base;
    duration_tags.insert("unit".into(), "seconds".into());
    let backend = {
        let mut state = lock_state();
        if state.backend_configured {
            let recorded_at = state.now();
            state.send_events.push(SendEventRecord {
                recorded_at,
                job: job.to_string(),
                outcome: SendOutcome::Failure,
                duration: duration_seconds,
            });
        }
        Arc::clone(&state.backend)
    };
    backend.increment("send.failure", &increment_tags);
    backend.observe("send.duration", duration_seconds, &duration_tags);
}

pub fn report_permit_denied(
    job: &str,
    platform: &str,
    channel: Option<&str>,
    reason: &str,
    permit_tags: Option<&Tags>,
) {
    let base = base_tags(job, platform, channel);
    let mut tags = merged(&base, permit_tags);
    tags.insert("reason".into(), reason.to_string());
    let backend = {
        let mut state = lock_state();
        if state.backend_configured {
            let recorded_at = state.now();
            state.permit_denials.push(PermitDenialRecord {
                recorded_at,
                payload: tags.clone(),
            });
        }
        Arc::clone(&state.backend)
    };
    backend.increment("send.denied", &tags);
}

#[allow(clippy::too_many_arguments)]
pub fn report_permit_reevaluation(
    job: &str,
    platform: &str,
    channel: Option<&str>,
    level: &str,
    reason: &str,
    retry_after_seconds: f64,
    decision: &str,
) {
    let mut tags = base_tags(job, platform, channel);
    tags.insert("level".into(), level.to_string());
    tags.insert("reason".into(), reason.to_string());
    tags.insert("decision".into(), decision.to_string());
    tags.insert(
        "retry_after".into(),
        super::format_metric_value(retry_after_seconds),
    );
    let backend = Arc::clone(&lock_state().backend);
    backend.increment("send.permit_reevaluation", &tags);
}

/// Rolling snapshot over the retention window: success ratios per job,
/// latency histogram, and the raw permit denial tag maps. Records outside the
/// window are dropped for good.
pub fn weekly_snapshot() -> Value {
    let mut state = lock_state();
    let generated_at = state.now();
    let cutoff = generated_at - Duration::days(state.retention_days);
    state.send_events.retain(|r| r.recorded_at >= cutoff);
    state.permit_denials.retain(|r| r.recorded_at >= cutoff);

    let mut success: Map<String, Value> = Map::new();
    let mut failure_counts: std::collections::BTreeMap<String, (u64, u64)> = Default::default();
    let mut histogram: std::collections::BTreeMap<String, std::collections::BTreeMap<String, u64>> =
        Default::default();
    for record in &state.send_events {
        let buckets = histogram.entry(record.job.clone()).or_default();
        *buckets.entry(select_bucket(record.duration).to_string()).or_insert(0) += 1;
        let entry = failure_counts.entry(record.job.clone()).or_insert((0, 0));
        match record.outcome {
            SendOutcome::Success => entry.0 += 1,
            SendOutcome::Failure => entry.1 += 1,
        }
    }
    for (job, (ok, failed)) in &failure_counts {
        let total = ok + failed;
        if total == 0 {
            continue;
        }
        success.insert(
            job.clone(),
            json!({
                "success": ok,
                "failure": failed,
                "ratio": *ok as f64 / total as f64,
            }),
        );
    }

    let histogram_value: Map<String, Value> = histogram
        .into_iter()
        .map(|(job, buckets)| {
            let series: Map<String, Value> = buckets
                .into_iter()
                .map(|(label, count)| (label, Value::from(count)))
                .collect();
            (job, Value::Object(series))
        })
        .collect();

    let denials: Vec<Value> = state
        .permit_denials
        .iter()
        .map(|record| {
            let map: Map<String, Value> = record
                .payload
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect();
            Value::Object(map)
        })
        .collect();

    json!({
        "generated_at": generated_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        "success_rate": Value::Object(success),
        "latency_histogram_seconds": Value::Object(histogram_value),
        "permit_denials": denials,
    })
}

/// Test hook: clear every record, the backend, and the retention override.
pub fn reset_for_test() {
    let mut state = lock_state();
    state.backend = Arc::new(NullMetricsRecorder);
    state.backend_configured = false;
    state.send_events.clear();
    state.permit_denials.clear();
    state.retention_days = DEFAULT_RETENTION_DAYS;
    state.clock = None;
}

/// Render the weekly snapshot as a plain text report body. Returns `None`
/// when the window holds nothing worth posting.
pub fn render_weekly_report(snapshot: &Value) -> Option<String> {
    let mut lines: Vec<String> = Vec::new();
    if let Some(rates) = snapshot.get("success_rate").and_then(Value::as_object) {
        for (job, payload) in rates {
            let ratio = payload.get("ratio").and_then(Value::as_f64).unwrap_or(0.0);
            let success = payload.get("success").and_then(Value::as_u64).unwrap_or(0);
            let failure = payload.get("failure").and_then(Value::as_u64).unwrap_or(0);
            lines.push(format!(
                "{job}: {:.0}% ({success} ok / {failure} failed)",
                ratio * 100.0
            ));
        }
    }
    let denials = snapshot
        .get("permit_denials")
        .and_then(Value::as_array)
        .map_or(0, Vec::len);
    if denials > 0 {
        lines.push(format!("permit denials: {denials}"));
    }
    if lines.is_empty() {
        return None;
    }
    let mut body = String::from("weekly dispatch report\n");
    body.push_str(&lines.join("\n"));
    Some(body)
}

// Suppression plumbing for MetricsBoundary: swap the backend for a no-op
// placeholder and restore it only if nothing else reconfigured the backend in
// the meantime.

pub(crate) struct SuppressToken {
    original: Arc<dyn MetricsRecorder>,
    placeholder: Arc<dyn MetricsRecorder>,
    originally_configured: bool,
}

pub(crate) fn begin_suppression(
    self_recorder: &Arc<dyn MetricsRecorder>,
    include_self: bool,
    has_real_recorder: bool,
) -> Option<SuppressToken> {
    let mut state = lock_state();
    let should_replace =
        !has_real_recorder || (include_self && Arc::ptr_eq(&state.backend, self_recorder));
    if !should_replace {
        return None;
    }
    let placeholder: Arc<dyn MetricsRecorder> = Arc::new(NullMetricsRecorder);
    let original = std::mem::replace(&mut state.backend, Arc::clone(&placeholder));
    Some(SuppressToken {
        original,
        placeholder,
        originally_configured: state.backend_configured,
    })
}

pub(crate) fn end_suppression(token: SuppressToken) {
    let mut state = lock_state();
    // An external configure_backend during suppression wins.
    if Arc::ptr_eq(&state.backend, &token.placeholder) {
        state.backend = token.original;
        state.backend_configured = token.originally_configured;
    }
}

pub(crate) fn backend_is(recorder: &Arc<dyn MetricsRecorder>) -> bool {
    Arc::ptr_eq(&lock_state().backend, recorder)
}
