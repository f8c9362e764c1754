//! Metrics: a per-instance record store ([`MetricsService`]), a process-global
//! aggregator feeding the weekly report, and the boundary object the
//! orchestrator uses to keep the two from double-counting.
//!
//! All recording paths are synchronous and lock-guarded; nothing here
//! suspends. Snapshots are rebuilt from raw records on demand, trimming
//! anything older than the retention window as a side effect.

pub mod aggregator;
pub mod boundary;
pub mod service;

use std::collections::BTreeMap;

pub use aggregator::{
    configure_backend, render_weekly_report, report_permit_denied, report_permit_reevaluation,
    report_send_failure, report_send_success, reset_for_test, set_clock_for_test,
    set_retention_days, weekly_snapshot,
};
pub use boundary::{MetricsBoundary, MetricsHandle};
pub use service::{
    CounterSnapshot, MetricsService, ObservationSnapshot, TagsKey, WeeklyMetricsSnapshot,
};

/// Tag map attached to every metric record. Ordered so that identical tag
/// sets always produce identical series keys.
pub type Tags = BTreeMap<String, String>;

/// Sink for counters and observations. Implemented by [`MetricsService`] and
/// by test recorders.
pub trait MetricsRecorder: Send + Sync {
    fn increment(&self, name: &str, tags: &Tags);
    fn observe(&self, name: &str, value: f64, tags: &Tags);
}

/// Recorder that drops everything.
pub struct NullMetricsRecorder;

impl MetricsRecorder for NullMetricsRecorder {
    fn increment(&self, _name: &str, _tags: &Tags) {}
    fn observe(&self, _name: &str, _value: f64, _tags: &Tags) {}
}

/// Build a tag map from string pairs.
pub fn tags(pairs: &[(&str, &str)]) -> Tags {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Format a float tag value to at most three decimals, trimming trailing
/// zeros ("0.930" -> "0.93", "2.000" -> "2").
pub fn format_metric_value(value: f64) -> String {
    let formatted = format!("{value:.3}");
    let trimmed = formatted.trim_end_matches('0').trim_end_matches('.');
    if trimmed.is_empty() {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}
