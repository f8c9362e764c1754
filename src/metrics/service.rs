//! Per-instance metric record store with a rolling weekly window.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};

use super::{MetricsRecorder, Tags};

pub const DEFAULT_RETENTION_DAYS: i64 = 7;

/// Tag series key: sorted (key, value) pairs.
pub type TagsKey = Vec<(String, String)>;

fn normalize_tags(tags: &Tags) -> TagsKey {
    // BTreeMap iteration is already sorted by key.
    tags.iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MetricKind {
    Counter,
    Observation,
}

#[derive(Debug, Clone)]
struct MetricRecord {
    name: String,
    recorded_at: DateTime<Utc>,
    tags: TagsKey,
    kind: MetricKind,
    value: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ObservationSnapshot {
    pub count: u64,
    pub minimum: f64,
    pub maximum: f64,
    pub total: f64,
    pub average: f64,
}

/// Summary of everything recorded inside `[start, end]`.
#[derive(Debug, Clone)]
pub struct WeeklyMetricsSnapshot {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub counters: HashMap<String, HashMap<TagsKey, CounterSnapshot>>,
    pub observations: HashMap<String, HashMap<TagsKey, ObservationSnapshot>>,
}

impl WeeklyMetricsSnapshot {
    pub fn empty(now: DateTime<Utc>) -> Self {
        Self {
            start: now,
            end: now,
            counters: HashMap::new(),
            observations: HashMap::new(),
        }
    }

    /// Total count across one counter's series.
    pub fn counter_total(&self, name: &str) -> u64 {
        self.counters
            .get(name)
            .map_or(0, |series| series.values().map(|c| c.count).sum())
    }
}

pub type UtcClock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

fn system_utc_clock() -> UtcClock {
    Arc::new(Utc::now)
}

/// Thread-safe metric store. Records are appended under a lock; the weekly
/// snapshot trims records older than the retention window and keeps the rest.
pub struct MetricsService {
    clock: UtcClock,
    retention_days: i64,
    records: Mutex<Vec<MetricRecord>>,
}

impl MetricsService {
    pub fn new() -> Self {
        Self::with_clock(system_utc_clock())
    }

    pub fn with_clock(clock: UtcClock) -> Self {
        Self {
            clock,
            retention_days: DEFAULT_RETENTION_DAYS,
            records: Mutex::new(Vec::new()),
        }
    }

    pub fn with_retention_days(mut self, days: i64) -> Self {
        self.retention_days = days.max(1);
        self
    }

    /// Record a named event: one measurement becomes an observation,
    /// no measurement becomes a counter increment.
    pub fn record_event(&self, name: &str, tags: &Tags, measurement: Option<f64>) {
        match measurement {
            Some(value) => self.store(name, value, tags, MetricKind::Observation),
            None => self.store(name, 1.0, tags, MetricKind::Counter),
        }
    }

    pub fn collect_weekly_snapshot(&self, now: Option<DateTime<Utc>>) -> WeeklyMetricsSnapshot {
        let reference = now.unwrap_or_else(|| (self.clock)());
        let start = reference - Duration::days(self.retention_days);
        let relevant: Vec<MetricRecord> = {
            let mut records = self.records.lock().expect("metrics record mutex poisoned");
            let relevant = records
                .iter()
                .filter(|r| r.recorded_at >= start && r.recorded_at <= reference)
                .cloned()
                .collect();
            records.retain(|r| r.recorded_at >= start);
            relevant
        };

        let mut counters: HashMap<String, HashMap<TagsKey, CounterSnapshot>> = HashMap::new();
        let mut observations: HashMap<String, HashMap<TagsKey, Vec<f64>>> = HashMap::new();
        for record in relevant {
            match record.kind {
                MetricKind::Counter => {
                    counters
                        .entry(record.name)
                        .or_default()
                        .entry(record.tags)
                        .or_insert(CounterSnapshot { count: 0 })
                        .count += 1;
                }
                MetricKind::Observation => {
                    observations
                        .entry(record.name)
                        .or_default()
                        .entry(record.tags)
                        .or_default()
                        .push(record.value);
                }
            }
        }

        let observations = observations
            .into_iter()
            .map(|(name, series)| {
                let materialized = series
                    .into_iter()
                    .filter(|(_, values)| !values.is_empty())
                    .map(|(tags, values)| {
                        let total: f64 = values.iter().sum();
                        let count = values.len() as u64;
                        (
                            tags,
                            ObservationSnapshot {
                                count,
                                minimum: values.iter().copied().fold(f64::INFINITY, f64::min),
                                maximum: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
                                total,
                                average: total / count as f64,
                            },
                        )
                    })
                    .collect();
                (name, materialized)
            })
            .collect();

        WeeklyMetricsSnapshot {
            start,
            end: reference,
            counters,
            observations,
        }
    }

    fn store(&self, name: &str, value: f64, tags: &Tags, kind: MetricKind) {
        let record = MetricRecord {
            name: name.to_string(),
            recorded_at: (self.clock)(),
            tags: normalize_tags(tags),
            kind,
            value,
        };
        self.records
            .lock()
            .expect("metrics record mutex poisoned")
            .push(record);
    }
}

impl Default for MetricsService {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRecorder for MetricsService {
    fn increment(&self, name: &str, tags: &Tags) {
        self.record_event(name, tags, None);
    }

    fn observe(&self, name: &str, value: f64, tags: &Tags) {
        self.record_event(name, tags, Some(value));
    }
}
