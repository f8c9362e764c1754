//! The orchestrator: a bounded request queue drained by a single worker task.
//!
//! Producers enqueue message candidates; the worker runs each through the
//! processor pipeline in arrival order, so within one orchestrator no two
//! sends are ever in flight at once. The orchestrator never retries a send
//! itself; permit re-evaluation is the only re-queueing path, and wire-level
//! retries belong to the adapters.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use log::Level;
use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::adapters::{Sender, Sleeper, TokioSleeper};
use crate::logutil::JsonEvent;
use crate::metrics::{self, MetricsBoundary, MetricsHandle, WeeklyMetricsSnapshot};

use super::cooldown::CooldownGate;
use super::dedupe::NearDuplicateFilter;
use super::permit::{PermitDecision, PermitGate};
use super::processor::Pipeline;
use super::queue::CoalesceQueue;
use super::{system_clock, Clock, Engagement, MessageEnvelope, QueueBatch};

/// Admission decision source. Deterministic given the same clock and inputs;
/// may mutate internal history on allow.
pub trait PermitEvaluator: Send + Sync {
    fn permit(&self, platform: &str, channel: Option<&str>, job: &str) -> PermitDecision;
}

impl PermitEvaluator for Mutex<PermitGate> {
    fn permit(&self, platform: &str, channel: Option<&str>, job: &str) -> PermitDecision {
        self.lock()
            .expect("permit gate mutex poisoned")
            .permit(platform, channel, Some(job))
    }
}

/// Everything needed to re-push a denied batch during re-evaluation.
#[derive(Debug, Clone)]
pub struct BatchRef {
    pub batch_id: String,
    pub priority: i32,
}

/// Permit-gate key override for one job: quota is charged against this key
/// instead of the key the job posts under, so e.g. the weekly report can
/// ride another job's quota bucket. Resolved to concrete values when
/// registered.
#[derive(Debug, Clone)]
pub struct PermitOverride {
    pub platform: String,
    pub channel: Option<String>,
    pub job: String,
}

/// One unit of work for the orchestrator. Created at enqueue, destroyed at a
/// terminal outcome; the correlation id follows it into every log and metric.
#[derive(Debug, Clone)]
pub struct SendRequest {
    pub text: String,
    pub job: String,
    pub platform: String,
    pub channel: Option<String>,
    pub correlation_id: String,
    pub engagement: Option<Engagement>,
    pub batch: Option<BatchRef>,
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("orchestrator is closed")]
    Closed,
    #[error("flush timed out after {0:?}")]
    FlushTimeout(Duration),
}

struct Inflight {
    count: Mutex<usize>,
    drained: Notify,
}

impl Inflight {
    fn increment(&self) {
        *self.count.lock().expect("inflight mutex poisoned") += 1;
    }

    fn decrement(&self) {
        let mut count = self.count.lock().expect("inflight mutex poisoned");
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.drained.notify_waiters();
        }
    }

    fn is_drained(&self) -> bool {
        *self.count.lock().expect("inflight mutex poisoned") == 0
    }
}

pub struct OrchestratorBuilder {
    sender: Arc<dyn Sender>,
    cooldown: Arc<Mutex<CooldownGate>>,
    dedupe: Arc<Mutex<NearDuplicateFilter>>,
    permit: Arc<dyn PermitEvaluator>,
    metrics: Option<MetricsHandle>,
    queue: Option<Arc<Mutex<CoalesceQueue>>>,
    permit_overrides: HashMap<String, PermitOverride>,
    platform: String,
    queue_size: usize,
    clock: Clock,
    sleeper: Arc<dyn Sleeper>,
}

impl OrchestratorBuilder {
    pub fn metrics(mut self, metrics: MetricsHandle) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Share the coalescing queue so permit re-evaluation can re-push batches.
    pub fn queue(mut self, queue: Arc<Mutex<CoalesceQueue>>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Charge quota for `job` against `key` instead of the job's own
    /// platform/channel/job.
    pub fn permit_override(mut self, job: impl Into<String>, key: PermitOverride) -> Self {
        self.permit_overrides.insert(job.into(), key);
        self
    }

    pub fn platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = platform.into();
        self
    }

    pub fn queue_size(mut self, size: usize) -> Self {
        self.queue_size = size.max(1);
        self
    }

    pub fn clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn build(self) -> Orchestrator {
        let boundary = Arc::new(MetricsBoundary::resolve(self.metrics));
        let pipeline = Arc::new(Pipeline {
            sender: self.sender,
            cooldown: self.cooldown,
            dedupe: self.dedupe,
            permit: self.permit,
            boundary,
            queue: self.queue,
            permit_overrides: self.permit_overrides,
            clock: self.clock,
            sleeper: self.sleeper,
            reeval_tasks: Mutex::new(Vec::new()),
        });
        let (tx, mut rx) = mpsc::channel::<SendRequest>(self.queue_size);
        let inflight = Arc::new(Inflight {
            count: Mutex::new(0),
            drained: Notify::new(),
        });
        let worker_pipeline = Arc::clone(&pipeline);
        let worker_inflight = Arc::clone(&inflight);
        let worker = tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                worker_pipeline.process(request).await;
                worker_inflight.decrement();
            }
        });
        Orchestrator {
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            inflight,
            closed: AtomicBool::new(false),
            default_platform: self.platform,
            pipeline,
        }
    }
}

pub struct Orchestrator {
    tx: Mutex<Option<mpsc::Sender<SendRequest>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    inflight: Arc<Inflight>,
    closed: AtomicBool,
    default_platform: String,
    pipeline: Arc<Pipeline>,
}

impl Orchestrator {
    pub fn builder(
        sender: Arc<dyn Sender>,
        cooldown: Arc<Mutex<CooldownGate>>,
        dedupe: Arc<Mutex<NearDuplicateFilter>>,
        permit: Arc<dyn PermitEvaluator>,
    ) -> OrchestratorBuilder {
        OrchestratorBuilder {
            sender,
            cooldown,
            dedupe,
            permit,
            metrics: None,
            queue: None,
            permit_overrides: HashMap::new(),
            platform: "-".to_string(),
            queue_size: 128,
            clock: system_clock(),
            sleeper: Arc::new(TokioSleeper),
        }
    }

    pub fn default_platform(&self) -> &str {
        &self.default_platform
    }

    /// Queue a candidate for dispatch. Returns the correlation id that will
    /// appear on every log and metric for this message. Suspends when the
    /// internal queue is full.
    pub async fn enqueue(
        &self,
        envelope: impl Into<MessageEnvelope>,
        job: &str,
        platform: &str,
        channel: Option<&str>,
        correlation_id: Option<String>,
    ) -> Result<String, OrchestratorError> {
        self.enqueue_request(envelope, job, platform, channel, correlation_id, None)
            .await
    }

    /// Queue a ready batch coming off the coalescing queue, preserving its
    /// batch identity so a permit re-evaluation can re-push it.
    pub async fn enqueue_batch(&self, batch: &QueueBatch) -> Result<String, OrchestratorError> {
        let platform = self.default_platform.clone();
        let envelope = match batch.engagement {
            Some(engagement) => MessageEnvelope::with_engagement(batch.text.clone(), engagement),
            None => MessageEnvelope::new(batch.text.clone()),
        };
        self.enqueue_request(
            envelope,
            &batch.job,
            &platform,
            batch.channel.as_deref(),
            None,
            Some(BatchRef {
                batch_id: batch.batch_id.clone(),
                priority: batch.priority,
            }),
        )
        .await
    }

    async fn enqueue_request(
        &self,
        envelope: impl Into<MessageEnvelope>,
        job: &str,
        platform: &str,
        channel: Option<&str>,
        correlation_id: Option<String>,
        batch: Option<BatchRef>,
    ) -> Result<String, OrchestratorError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(OrchestratorError::Closed);
        }
        let tx = {
            let guard = self.tx.lock().expect("sender mutex poisoned");
            guard.clone().ok_or(OrchestratorError::Closed)?
        };
        let envelope = envelope.into();
        let correlation_id =
            correlation_id.unwrap_or_else(|| Uuid::new_v4().simple().to_string());
        let request = SendRequest {
            text: envelope.text,
            job: job.to_string(),
            platform: platform.to_string(),
            channel: channel.map(str::to_string),
            correlation_id: correlation_id.clone(),
            engagement: envelope.engagement,
            batch,
        };
        self.inflight.increment();
        if tx.send(request).await.is_err() {
            self.inflight.decrement();
            return Err(OrchestratorError::Closed);
        }
        Ok(correlation_id)
    }

    /// Convenience: enqueue on the default platform, then wait for the queue
    /// to drain.
    pub async fn send(
        &self,
        envelope: impl Into<MessageEnvelope>,
        channel: Option<&str>,
        job: &str,
    ) -> Result<(), OrchestratorError> {
        let platform = self.default_platform.clone();
        self.enqueue(envelope, job, &platform, channel, None).await?;
        self.flush(Duration::from_secs(5)).await
    }

    /// Wait until every enqueued request has reached a terminal outcome.
    pub async fn flush(&self, timeout: Duration) -> Result<(), OrchestratorError> {
        let wait = async {
            loop {
                // Register for the notification before checking the counter
                // so a decrement between the two is not lost.
                let notified = self.inflight.drained.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.inflight.is_drained() {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| OrchestratorError::FlushTimeout(timeout))
    }

    /// Drain and stop the worker, and cancel outstanding re-evaluation
    /// timers. Idempotent; later `enqueue` calls fail with [`OrchestratorError::Closed`].
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Dropping the sender lets the worker finish whatever is queued and
        // then stop on channel close.
        {
            let mut guard = self.tx.lock().expect("sender mutex poisoned");
            guard.take();
        }
        let worker = {
            let mut guard = self.worker.lock().expect("worker mutex poisoned");
            guard.take()
        };
        if let Some(worker) = worker {
            let _ = worker.await;
        }
        let tasks = {
            let mut guard = self
                .pipeline
                .reeval_tasks
                .lock()
                .expect("reeval task mutex poisoned");
            std::mem::take(&mut *guard)
        };
        for task in tasks {
            if !task.handle.is_finished() {
                task.handle.abort();
                self.pipeline.boundary.recorder().increment(
                    "send.cancelled",
                    &metrics::tags(&[("job", task.job.as_str())]),
                );
                JsonEvent::new("send_cancelled", "orchestrator", &task.correlation_id)
                    .field("job", task.job.as_str())
                    .emit(Level::Info);
            }
        }
    }

    /// Weekly metrics window from the attached service; empty when metrics
    /// are disabled.
    pub fn weekly_snapshot(&self) -> WeeklyMetricsSnapshot {
        match self.pipeline.boundary.service() {
            Some(service) => service.collect_weekly_snapshot(None),
            None => WeeklyMetricsSnapshot::empty(Utc::now()),
        }
    }
}
