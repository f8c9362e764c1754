//! Hierarchical permit gate behavior across levels and windows.

mod common;

use std::sync::Arc;

use chatcast::core::permit::{PermitGate, QuotaLevel, QuotaSpec, QuotaTier};
use chatcast::core::Clock;
use common::{RecordingMetrics, SimTime};

fn clock_of(sim: &Arc<SimTime>) -> Clock {
    sim.clock()
}

fn two_level_gate(metrics: Arc<RecordingMetrics>, clock: Clock) -> PermitGate {
    let per_channel = QuotaLevel::new(
        "per_channel",
        &QuotaSpec::Tiers(vec![QuotaTier::new(
            "burst_limit",
            "burst limit reached",
            true,
            1,
            60,
        )]),
    )
    .unwrap();
    let per_platform = QuotaLevel::with_key_fn(
        "per_platform",
        &QuotaSpec::Tiers(vec![QuotaTier::new(
            "daily_limit",
            "daily limit reached",
            false,
            1,
            300,
        )]),
        Arc::new(|platform: &str, _channel, _job| (platform.to_string(), "*".to_string())),
    )
    .unwrap();
    PermitGate::new(vec![per_channel, per_platform])
        .unwrap()
        .with_metrics(metrics)
        .with_clock(clock)
}

#[test]
fn first_denying_level_is_reported_with_exact_retry_after() {
    let sim = SimTime::at(0.0);
    let metrics = RecordingMetrics::new();
    let mut gate = two_level_gate(Arc::clone(&metrics), clock_of(&sim));

    let first = gate.permit("discord", Some("general"), Some("news"));
    assert!(first.allowed);

    // At t=61 the channel burst window (60s) has expired, so the platform
    // daily tier is the first denier.
    sim.advance(61.0);
    let denied = gate.permit("discord", Some("general"), Some("news"));
    assert!(!denied.allowed);
    assert_eq!(denied.level.as_deref(), Some("per_platform"));
    assert!(!denied.retryable);
    let retry_after = denied.retry_after.unwrap();
    assert!((retry_after - 239.0).abs() < 1e-9);

    let tags = metrics.find_counter("quota_denied").expect("denial metric");
    assert_eq!(tags.get("level").unwrap(), "per_platform");
    assert_eq!(tags.get("code").unwrap(), "daily_limit");
    assert_eq!(tags.get("retryable").unwrap(), "false");
    assert_eq!(tags.get("window_sec").unwrap(), "300");
    assert_eq!(tags.get("retry_after_sec").unwrap(), "239");
}

#[test]
fn burst_denies_before_daily_within_one_level() {
    let sim = SimTime::at(0.0);
    let metrics = RecordingMetrics::new();
    let level = QuotaLevel::new(
        "per_channel",
        &QuotaSpec::BurstDay {
            burst_limit: 1,
            window_seconds: 60,
            day: 5,
        },
    )
    .unwrap();
    let mut gate = PermitGate::new(vec![level])
        .unwrap()
        .with_metrics(metrics.clone())
        .with_clock(clock_of(&sim));

    assert!(gate.permit("discord", Some("general"), None).allowed);
    let denied = gate.permit("discord", Some("general"), None);
    assert_eq!(denied.reason.as_deref(), Some("burst limit reached"));
    assert!(denied.retryable);
    let tags = metrics.find_counter("quota_denied").unwrap();
    assert_eq!(tags.get("code").unwrap(), "burst_limit");
    assert_eq!(tags.get("window_sec").unwrap(), "60");
}

#[test]
fn window_reset_readmits() {
    let sim = SimTime::at(1_000.0);
    let metrics = RecordingMetrics::new();
    let level = QuotaLevel::new(
        "per_channel",
        &QuotaSpec::BurstDay {
            burst_limit: 2,
            window_seconds: 120,
            day: 100,
        },
    )
    .unwrap();
    let mut gate = PermitGate::new(vec![level])
        .unwrap()
        .with_metrics(metrics)
        .with_clock(clock_of(&sim));

    assert!(gate.permit("discord", Some("general"), None).allowed);
    assert!(gate.permit("discord", Some("general"), None).allowed);
    assert!(!gate.permit("discord", Some("general"), None).allowed);

    sim.advance(121.0);
    assert!(gate.permit("discord", Some("general"), None).allowed);
}

#[test]
fn distinct_channels_have_independent_budgets() {
    let sim = SimTime::at(0.0);
    let level = QuotaLevel::new(
        "per_channel",
        &QuotaSpec::BurstDay {
            burst_limit: 1,
            window_seconds: 60,
            day: 10,
        },
    )
    .unwrap();
    let mut gate = PermitGate::new(vec![level]).unwrap().with_clock(clock_of(&sim));

    assert!(gate.permit("discord", Some("general"), None).allowed);
    assert!(gate.permit("discord", Some("random"), None).allowed);
    assert!(!gate.permit("discord", Some("general"), None).allowed);
}

#[test]
fn per_window_count_never_exceeds_limit() {
    // Hammer the gate and assert the invariant: admissions inside any window
    // never exceed the tier limit.
    let sim = SimTime::at(0.0);
    let level = QuotaLevel::new(
        "per_channel",
        &QuotaSpec::BurstDay {
            burst_limit: 3,
            window_seconds: 100,
            day: 1_000,
        },
    )
    .unwrap();
    let mut gate = PermitGate::new(vec![level]).unwrap().with_clock(clock_of(&sim));

    let mut admitted: Vec<f64> = Vec::new();
    for _ in 0..200 {
        if gate.permit("discord", Some("general"), None).allowed {
            admitted.push(sim.now());
        }
        sim.advance(7.0);
    }
    for window_start in admitted.clone() {
        let in_window = admitted
            .iter()
            .filter(|ts| **ts >= window_start && **ts < window_start + 100.0)
            .count();
        assert!(in_window <= 3, "window starting at {window_start} admitted {in_window}");
    }
}
