//! Orchestrator pipeline flows: success, duplicate, denial, re-evaluation,
//! failure, and lifecycle.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chatcast::adapters::{SendError, Sender, Sleeper};
use chatcast::core::orchestrator::{OrchestratorError, PermitEvaluator};
use chatcast::core::permit::{
    PermitGate, QuotaLevel, QuotaSpec, ReevaluationOutcome, RejectionHook,
};
use chatcast::core::{
    CoalesceQueue, CooldownGate, Engagement, MessageEnvelope, NearDuplicateFilter, Orchestrator,
    QueueBatch,
};
use chatcast::metrics::{self, MetricsHandle, MetricsService};
use common::{aggregator_guard, SimTime, StubSender};

struct Fixture {
    orchestrator: Orchestrator,
    sender: Arc<StubSender>,
    cooldown: Arc<Mutex<CooldownGate>>,
    queue: Arc<Mutex<CoalesceQueue>>,
    service: Arc<MetricsService>,
    sim: Arc<SimTime>,
}

fn burst_gate(sim: &Arc<SimTime>, burst: u32, hook: Option<RejectionHook>) -> Arc<dyn PermitEvaluator> {
    let level = QuotaLevel::new(
        "per_channel",
        &QuotaSpec::BurstDay {
            burst_limit: burst,
            window_seconds: 60,
            day: 100,
        },
    )
    .unwrap();
    let mut gate = PermitGate::new(vec![level]).unwrap().with_clock(sim.clock());
    if let Some(hook) = hook {
        gate = gate.with_hook(hook);
    }
    Arc::new(Mutex::new(gate))
}

fn fixture(outcomes: Vec<Result<(), SendError>>, burst: u32, hook: Option<RejectionHook>) -> Fixture {
    let sim = SimTime::at(10_000.0);
    let sender = Arc::new(StubSender::new().script(outcomes));
    let cooldown = Arc::new(Mutex::new(CooldownGate::with_clock(
        3600, 0.5, 2.0, 0.1, 0.0, 0.2,
        sim.clock(),
    )));
    let dedupe = Arc::new(Mutex::new(NearDuplicateFilter::new(20, 0.93)));
    let queue = Arc::new(Mutex::new(CoalesceQueue::new(60.0, 5)));
    let service = Arc::new(MetricsService::new());
    let orchestrator = Orchestrator::builder(
        Arc::clone(&sender) as Arc<dyn Sender>,
        Arc::clone(&cooldown),
        Arc::clone(&dedupe),
        burst_gate(&sim, burst, hook),
    )
    .platform("discord")
    .queue(Arc::clone(&queue))
    .metrics(MetricsHandle::Service(Arc::clone(&service)))
    .clock(sim.clock())
    .sleeper(Arc::clone(&sim) as Arc<dyn Sleeper>)
    .build();
    Fixture {
        orchestrator,
        sender,
        cooldown,
        queue,
        service,
        sim,
    }
}

#[tokio::test]
async fn success_flow_sends_notes_cooldown_and_counts() {
    let _guard = aggregator_guard();
    metrics::reset_for_test();
    let fx = fixture(vec![], 10, None);

    let corr = fx
        .orchestrator
        .enqueue("good morning", "weather", "discord", Some("general"), None)
        .await
        .unwrap();
    assert!(!corr.is_empty());
    fx.orchestrator.flush(Duration::from_secs(2)).await.unwrap();

    let sent = fx.sender.sent.lock().unwrap().clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, "good morning");
    assert_eq!(sent[0].1.as_deref(), Some("general"));
    assert_eq!(sent[0].2.as_deref(), Some("weather"));

    let snapshot = fx.service.collect_weekly_snapshot(None);
    assert_eq!(snapshot.counter_total("send.success"), 1);
    assert!(snapshot.observations.contains_key("send.duration"));

    let cooldown = fx.cooldown.lock().unwrap();
    assert_eq!(cooldown.window_count("discord", "general", "weather"), 1);
}

#[tokio::test]
async fn engagement_metadata_becomes_success_tags() {
    let _guard = aggregator_guard();
    metrics::reset_for_test();
    let fx = fixture(vec![], 10, None);

    let envelope = MessageEnvelope::with_engagement(
        "clear skies tomorrow",
        Engagement {
            score: Some(0.93),
            recent: Some(0.5),
            long_term: Some(0.4),
            permit_quota: Some(0.25),
        },
    );
    fx.orchestrator
        .enqueue(envelope, "weather", "discord", Some("general"), None)
        .await
        .unwrap();
    fx.orchestrator.flush(Duration::from_secs(2)).await.unwrap();

    let snapshot = fx.service.collect_weekly_snapshot(None);
    let series = snapshot.counters.get("send.success").expect("success series");
    let tags = series.keys().next().unwrap();
    let get = |key: &str| {
        tags.iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    };
    assert_eq!(get("engagement_score").as_deref(), Some("0.93"));
    assert_eq!(get("engagement_trend").as_deref(), Some("0.5"));
    assert_eq!(get("permit_quota").as_deref(), Some("0.25"));
}

#[tokio::test]
async fn near_duplicate_is_skipped_exactly_once() {
    let _guard = aggregator_guard();
    metrics::reset_for_test();
    let fx = fixture(vec![], 10, None);

    fx.orchestrator
        .enqueue(
            "Tomorrow will be sunny with a high of 25 degrees",
            "weather",
            "discord",
            Some("general"),
            None,
        )
        .await
        .unwrap();
    fx.orchestrator
        .enqueue(
            "Tomorrow will be sunny with a high of 25 degrees!",
            "weather",
            "discord",
            Some("general"),
            None,
        )
        .await
        .unwrap();
    fx.orchestrator.flush(Duration::from_secs(2)).await.unwrap();

    assert_eq!(fx.sender.sent.lock().unwrap().len(), 1);
    let snapshot = fx.service.collect_weekly_snapshot(None);
    assert_eq!(snapshot.counter_total("send.duplicate"), 1);
    assert_eq!(snapshot.counter_total("send.success"), 1);
}

#[tokio::test]
async fn permit_denial_is_terminal_without_reevaluation() {
    let _guard = aggregator_guard();
    metrics::reset_for_test();
    let fx = fixture(vec![], 1, None);

    fx.orchestrator
        .enqueue("first", "news", "discord", Some("general"), None)
        .await
        .unwrap();
    fx.orchestrator
        .enqueue("second distinct text", "news", "discord", Some("general"), None)
        .await
        .unwrap();
    fx.orchestrator.flush(Duration::from_secs(2)).await.unwrap();

    assert_eq!(fx.sender.sent.lock().unwrap().len(), 1);
    let snapshot = fx.service.collect_weekly_snapshot(None);
    assert_eq!(snapshot.counter_total("send.denied"), 1);
    assert_eq!(snapshot.counter_total("send.success"), 1);
    // Burst denials carry no re-evaluation outcome: nothing was rescheduled.
    assert_eq!(fx.queue.lock().unwrap().pending_len(), 0);
}

#[tokio::test]
async fn reevaluation_outcome_reschedules_the_batch() {
    let _guard = aggregator_guard();
    metrics::reset_for_test();
    let hook: RejectionHook = Arc::new(|ctx| {
        Some(ReevaluationOutcome {
            level: ctx.level.clone(),
            reason: "quota pressure".to_string(),
            retry_after: Some(30.0),
            allowed: None,
        })
    });
    let fx = fixture(vec![], 1, Some(hook));
    let t0 = fx.sim.now();

    let first = QueueBatch {
        priority: 2,
        text: "headline one".to_string(),
        channel: Some("general".to_string()),
        job: "news".to_string(),
        created_at: t0,
        batch_id: "batch-allowed".to_string(),
        engagement: None,
    };
    let second = QueueBatch {
        priority: 2,
        text: "headline two".to_string(),
        channel: Some("general".to_string()),
        job: "news".to_string(),
        created_at: t0,
        batch_id: "batch-denied".to_string(),
        engagement: None,
    };
    fx.orchestrator.enqueue_batch(&first).await.unwrap();
    fx.orchestrator.enqueue_batch(&second).await.unwrap();
    fx.orchestrator.flush(Duration::from_secs(2)).await.unwrap();
    // Let the spawned re-evaluation timer run (its sleep is simulated).
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(fx.sender.sent.lock().unwrap().len(), 1);
    let snapshot = fx.service.collect_weekly_snapshot(None);
    assert!(snapshot.counter_total("send.permit_reevaluation") >= 1);

    // The denied batch came back to the queue after the hold expired.
    let mut queue = fx.queue.lock().unwrap();
    assert_eq!(queue.pending_len(), 1);
    let ready = queue.pop_ready(fx.sim.now() + 120.0);
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].batch_id, "batch-denied");
    assert_eq!(ready[0].text, "headline two");
}

#[tokio::test]
async fn permit_override_charges_the_configured_bucket() {
    let _guard = aggregator_guard();
    metrics::reset_for_test();

    let sim = SimTime::at(0.0);
    let sender = Arc::new(StubSender::new());
    let service = Arc::new(MetricsService::new());
    let orchestrator = Orchestrator::builder(
        Arc::clone(&sender) as Arc<dyn Sender>,
        Arc::new(Mutex::new(CooldownGate::with_clock(
            3600, 0.5, 2.0, 0.1, 0.0, 0.2,
            sim.clock(),
        ))),
        Arc::new(Mutex::new(NearDuplicateFilter::new(20, 0.93))),
        burst_gate(&sim, 1, None),
    )
    .platform("discord")
    .metrics(MetricsHandle::Service(Arc::clone(&service)))
    .permit_override(
        "weekly_report",
        chatcast::core::orchestrator::PermitOverride {
            platform: "discord".to_string(),
            channel: Some("reports".to_string()),
            job: "weekly_report".to_string(),
        },
    )
    .build();

    // The news post exhausts the burst budget for (discord, general).
    orchestrator
        .enqueue("morning headlines", "news", "discord", Some("general"), None)
        .await
        .unwrap();
    // The report also posts to general, but its quota is charged against
    // (discord, reports), so it passes.
    orchestrator
        .enqueue(
            "weekly dispatch report for the desk",
            "weekly_report",
            "discord",
            Some("general"),
            None,
        )
        .await
        .unwrap();
    orchestrator.flush(Duration::from_secs(2)).await.unwrap();
    assert_eq!(sender.sent.lock().unwrap().len(), 2);
    // Both messages posted to the channel they were addressed to.
    let sent = sender.sent.lock().unwrap().clone();
    assert!(sent.iter().all(|(_, channel, _)| channel.as_deref() == Some("general")));

    // The override consumed the (discord, reports) bucket: a direct send
    // there is now denied.
    orchestrator
        .enqueue(
            "completely different announcement",
            "news",
            "discord",
            Some("reports"),
            None,
        )
        .await
        .unwrap();
    orchestrator.flush(Duration::from_secs(2)).await.unwrap();
    assert_eq!(sender.sent.lock().unwrap().len(), 2);
    let snapshot = service.collect_weekly_snapshot(None);
    assert_eq!(snapshot.counter_total("send.denied"), 1);
}

#[tokio::test]
async fn job_hint_shim_retries_once_without_job() {
    let _guard = aggregator_guard();
    metrics::reset_for_test();
    let fx = fixture(vec![Err(SendError::JobUnsupported), Ok(())], 10, None);

    fx.orchestrator
        .enqueue("legacy sender text", "news", "discord", None, None)
        .await
        .unwrap();
    fx.orchestrator.flush(Duration::from_secs(2)).await.unwrap();

    let sent = fx.sender.sent.lock().unwrap().clone();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].2.as_deref(), Some("news"));
    assert_eq!(sent[1].2, None);
    let snapshot = fx.service.collect_weekly_snapshot(None);
    assert_eq!(snapshot.counter_total("send.success"), 1);
    assert_eq!(snapshot.counter_total("send.failure"), 0);
}

#[tokio::test]
async fn send_failure_counts_and_skips_cooldown() {
    let _guard = aggregator_guard();
    metrics::reset_for_test();
    let fx = fixture(vec![Err(SendError::Status { status: 404 })], 10, None);

    fx.orchestrator
        .enqueue("doomed", "news", "discord", Some("general"), None)
        .await
        .unwrap();
    fx.orchestrator.flush(Duration::from_secs(2)).await.unwrap();

    let snapshot = fx.service.collect_weekly_snapshot(None);
    assert_eq!(snapshot.counter_total("send.failure"), 1);
    assert_eq!(snapshot.counter_total("send.success"), 0);
    let failure_series = snapshot.counters.get("send.failure").unwrap();
    let tags = failure_series.keys().next().unwrap();
    assert!(tags.iter().any(|(k, v)| k == "error" && v == "Status"));
    assert!(snapshot.observations.contains_key("send.duration"));

    let cooldown = fx.cooldown.lock().unwrap();
    assert_eq!(cooldown.window_count("discord", "general", "news"), 0);
}

#[tokio::test]
async fn requests_are_processed_in_arrival_order() {
    let _guard = aggregator_guard();
    metrics::reset_for_test();
    let fx = fixture(vec![], 10, None);
    for i in 0..5 {
        fx.orchestrator
            .enqueue(
                format!("message number {i} with unique body {i}{i}"),
                "news",
                "discord",
                None,
                None,
            )
            .await
            .unwrap();
    }
    fx.orchestrator.flush(Duration::from_secs(2)).await.unwrap();
    let texts = fx.sender.sent_texts();
    assert_eq!(texts.len(), 5);
    for (i, text) in texts.iter().enumerate() {
        assert!(text.starts_with(&format!("message number {i}")));
    }
}

#[tokio::test]
async fn close_is_idempotent_and_rejects_new_work() {
    let _guard = aggregator_guard();
    metrics::reset_for_test();
    let fx = fixture(vec![], 10, None);

    fx.orchestrator
        .enqueue("before close", "news", "discord", None, None)
        .await
        .unwrap();
    fx.orchestrator.close().await;
    fx.orchestrator.close().await;

    // Work enqueued before close was drained.
    assert_eq!(fx.sender.sent.lock().unwrap().len(), 1);
    let err = fx
        .orchestrator
        .enqueue("after close", "news", "discord", None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::Closed));
}

#[tokio::test]
async fn flush_times_out_when_the_worker_is_stuck() {
    let _guard = aggregator_guard();
    metrics::reset_for_test();

    struct SlowSender;
    #[async_trait::async_trait]
    impl Sender for SlowSender {
        async fn send(
            &self,
            _text: &str,
            _channel: Option<&str>,
            _job: Option<&str>,
        ) -> Result<(), SendError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        }
    }

    let sim = SimTime::at(0.0);
    let orchestrator = Orchestrator::builder(
        Arc::new(SlowSender),
        Arc::new(Mutex::new(CooldownGate::new(3600, 0.5, 2.0, 0.1, 0.0, 0.2))),
        Arc::new(Mutex::new(NearDuplicateFilter::new(20, 0.93))),
        burst_gate(&sim, 10, None),
    )
    .platform("discord")
    .build();

    orchestrator
        .enqueue("slow one", "news", "discord", None, None)
        .await
        .unwrap();
    let err = orchestrator.flush(Duration::from_millis(20)).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::FlushTimeout(_)));
}
