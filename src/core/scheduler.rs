//! Time-of-day job scheduler with jittered batch dispatch.
//!
//! Jobs register a local clock-minute (`HH:MM`) in a fixed IANA zone. The
//! trigger loop wakes once per minute, runs the producers whose minute
//! matched, pushes any produced text into the coalescing queue, then drains
//! ready batches into the orchestrator. When two dispatches land close
//! together a uniform jitter delay spreads them out.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{TimeZone, Utc};
use chrono_tz::Tz;
use log::{debug, warn};

use crate::adapters::{Sleeper, TokioSleeper};
use crate::metrics::{self, MetricsRecorder};

use super::jitter::next_slot;
use super::orchestrator::Orchestrator;
use super::queue::CoalesceQueue;
use super::{system_clock, Clock, MessageEnvelope};

/// A feature producer: runs at its trigger time and yields the message to
/// post, or `None` to suppress that tick.
pub type ProducerFuture = Pin<Box<dyn Future<Output = Option<MessageEnvelope>> + Send>>;
pub type Producer = Arc<dyn Fn() -> ProducerFuture + Send + Sync>;

/// Lifecycle of one registered job across a trigger cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Idle,
    Triggered,
    Submitted,
    Drained,
    Closed,
}

struct ScheduledJob {
    name: String,
    hhmm: String,
    handler: Producer,
    channel: Option<String>,
    priority: i32,
    state: JobState,
}

pub struct Scheduler {
    tz: Tz,
    jobs: Vec<ScheduledJob>,
    queue: Arc<Mutex<CoalesceQueue>>,
    orchestrator: Arc<Orchestrator>,
    jitter_enabled: bool,
    jitter_range: (u32, u32),
    last_dispatch_ts: Option<f64>,
    sleeper: Arc<dyn Sleeper>,
    clock: Clock,
    metrics: Option<Arc<dyn MetricsRecorder>>,
    closed: Arc<AtomicBool>,
}

impl Scheduler {
    pub fn new(tz: Tz, queue: Arc<Mutex<CoalesceQueue>>, orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            tz,
            jobs: Vec::new(),
            queue,
            orchestrator,
            jitter_enabled: true,
            jitter_range: (60, 180),
            last_dispatch_ts: None,
            sleeper: Arc::new(TokioSleeper),
            clock: system_clock(),
            metrics: None,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn jitter(mut self, enabled: bool, range: (u32, u32)) -> Self {
        self.jitter_enabled = enabled;
        self.jitter_range = range;
        self
    }

    pub fn sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn metrics(mut self, metrics: Arc<dyn MetricsRecorder>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Handle for stopping `run_forever` from another task.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.closed)
    }

    /// Register a producer for a daily local clock-minute ("HH:MM").
    pub fn every_day(
        &mut self,
        name: impl Into<String>,
        hhmm: impl Into<String>,
        handler: Producer,
        channel: Option<String>,
        priority: i32,
    ) {
        self.jobs.push(ScheduledJob {
            name: name.into(),
            hhmm: hhmm.into(),
            handler,
            channel,
            priority,
            state: JobState::Idle,
        });
    }

    pub fn job_state(&self, name: &str) -> Option<JobState> {
        self.jobs.iter().find(|j| j.name == name).map(|j| j.state)
    }

    /// Trigger loop: wake at each minute boundary, run matching producers,
    /// push their output, and drain the queue. Returns once closed.
    pub async fn run_forever(&mut self) {
        while !self.closed.load(Ordering::SeqCst) {
            let now_epoch = (self.clock)();
            self.trigger_matching(now_epoch).await;
            self.dispatch_ready_batches(None).await;
            let second = self.local_now(now_epoch).map_or(0, |t| {
                use chrono::Timelike;
                t.second() as u64
            });
            self.sleeper.sleep((60 - second.min(59)) as f64).await;
        }
        for job in &mut self.jobs {
            job.state = JobState::Closed;
        }
    }

    async fn trigger_matching(&mut self, now_epoch: f64) {
        let Some(local) = self.local_now(now_epoch) else {
            return;
        };
        let hhmm = local.format("%H:%M").to_string();
        let due: Vec<usize> = self
            .jobs
            .iter()
            .enumerate()
            .filter(|(_, job)| job.hhmm == hhmm)
            .map(|(idx, _)| idx)
            .collect();
        for idx in due {
            self.jobs[idx].state = JobState::Triggered;
            let handler = Arc::clone(&self.jobs[idx].handler);
            let produced = handler().await;
            match produced {
                Some(envelope) => {
                    let job = &mut self.jobs[idx];
                    let mut queue = self.queue.lock().expect("queue mutex poisoned");
                    queue.push_envelope(
                        &envelope,
                        job.priority,
                        &job.name,
                        now_epoch,
                        job.channel.as_deref(),
                        None,
                    );
                    job.state = JobState::Submitted;
                }
                None => {
                    debug!("job {} produced nothing this tick", self.jobs[idx].name);
                    self.jobs[idx].state = JobState::Idle;
                }
            }
        }
    }

    /// Drain ready batches into the orchestrator, spacing consecutive
    /// dispatches with jitter when they land inside the jitter window.
    pub async fn dispatch_ready_batches(&mut self, now: Option<f64>) {
        let now = now.unwrap_or_else(|| (self.clock)());
        let ready = {
            let mut queue = self.queue.lock().expect("queue mutex poisoned");
            queue.pop_ready(now)
        };
        for batch in ready {
            let delay = if self.jitter_enabled {
                let clash = self
                    .last_dispatch_ts
                    .is_some_and(|last| now - last <= f64::from(self.jitter_range.1));
                next_slot(now, clash, self.jitter_range) - now
            } else {
                0.0
            };
            self.sleeper.sleep(delay).await;
            if self.jitter_enabled {
                if let Some(recorder) = &self.metrics {
                    recorder.observe(
                        "send.delay_seconds",
                        delay,
                        &metrics::tags(&[
                            ("job", batch.job.as_str()),
                            ("platform", self.orchestrator.default_platform()),
                            ("channel", batch.channel.as_deref().unwrap_or("-")),
                            ("unit", "seconds"),
                        ]),
                    );
                }
            }
            if let Err(err) = self.orchestrator.enqueue_batch(&batch).await {
                warn!("dropping ready batch for job {}: {err}", batch.job);
                continue;
            }
            self.last_dispatch_ts = Some(now);
            if let Some(job) = self.jobs.iter_mut().find(|j| j.name == batch.job) {
                job.state = JobState::Drained;
            }
        }
    }

    fn local_now(&self, now_epoch: f64) -> Option<chrono::DateTime<Tz>> {
        let secs = now_epoch.floor() as i64;
        let nanos = ((now_epoch - secs as f64) * 1e9) as u32;
        match Utc.timestamp_opt(secs, nanos) {
            chrono::LocalResult::Single(dt) => Some(dt.with_timezone(&self.tz)),
            _ => None,
        }
    }
}
