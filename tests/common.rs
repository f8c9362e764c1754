//! Shared test doubles: stub senders, a simulated clock/sleeper pair, and a
//! recording metrics sink.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use async_trait::async_trait;
use chatcast::adapters::{SendError, Sender, Sleeper};
use chatcast::core::Clock;
use chatcast::metrics::{MetricsRecorder, Tags};

/// Serialises tests that touch the process-global metrics aggregator.
pub fn aggregator_guard() -> MutexGuard<'static, ()> {
    static GUARD: OnceLock<Mutex<()>> = OnceLock::new();
    GUARD
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Sender that records everything and answers from a scripted outcome queue
/// (defaults to success when the script runs dry).
pub struct StubSender {
    pub sent: Mutex<Vec<(String, Option<String>, Option<String>)>>,
    outcomes: Mutex<VecDeque<Result<(), SendError>>>,
}

impl StubSender {
    pub fn new() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            outcomes: Mutex::new(VecDeque::new()),
        }
    }

    pub fn script(self, outcomes: Vec<Result<(), SendError>>) -> Self {
        *self.outcomes.lock().unwrap() = outcomes.into();
        self
    }

    pub fn sent_texts(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(text, _, _)| text.clone())
            .collect()
    }
}

#[async_trait]
impl Sender for StubSender {
    async fn send(
        &self,
        text: &str,
        channel: Option<&str>,
        job: Option<&str>,
    ) -> Result<(), SendError> {
        self.sent.lock().unwrap().push((
            text.to_string(),
            channel.map(str::to_string),
            job.map(str::to_string),
        ));
        self.outcomes.lock().unwrap().pop_front().unwrap_or(Ok(()))
    }
}

/// Simulated time: a clock the sleeper advances, so awaited delays are
/// observable without wall-clock waits. Sleeps land a hair past the
/// requested deadline, the way real time always does.
pub struct SimTime {
    now: Arc<Mutex<f64>>,
    pub delays: Mutex<Vec<f64>>,
}

impl SimTime {
    pub fn at(start: f64) -> Arc<Self> {
        Arc::new(Self {
            now: Arc::new(Mutex::new(start)),
            delays: Mutex::new(Vec::new()),
        })
    }

    pub fn clock(self: &Arc<Self>) -> Clock {
        let now = Arc::clone(&self.now);
        Arc::new(move || *now.lock().unwrap())
    }

    pub fn now(&self) -> f64 {
        *self.now.lock().unwrap()
    }

    pub fn advance(&self, seconds: f64) {
        *self.now.lock().unwrap() += seconds;
    }

    pub fn recorded_delays(&self) -> Vec<f64> {
        self.delays.lock().unwrap().clone()
    }
}

#[async_trait]
impl Sleeper for SimTime {
    async fn sleep(&self, seconds: f64) {
        self.delays.lock().unwrap().push(seconds);
        *self.now.lock().unwrap() += seconds + 1e-3;
    }
}

/// Metrics sink that remembers every call.
#[derive(Default)]
pub struct RecordingMetrics {
    pub counters: Mutex<Vec<(String, Tags)>>,
    pub observations: Mutex<Vec<(String, f64, Tags)>>,
}

impl RecordingMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn counter_names(&self) -> Vec<String> {
        self.counters
            .lock()
            .unwrap()
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn find_counter(&self, name: &str) -> Option<Tags> {
        self.counters
            .lock()
            .unwrap()
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, tags)| tags.clone())
    }

    pub fn count(&self, name: &str) -> usize {
        self.counters
            .lock()
            .unwrap()
            .iter()
            .filter(|(n, _)| n == name)
            .count()
    }
}

impl MetricsRecorder for RecordingMetrics {
    fn increment(&self, name: &str, tags: &Tags) {
        self.counters
            .lock()
            .unwrap()
            .push((name.to_string(), tags.clone()));
    }

    fn observe(&self, name: &str, value: f64, tags: &Tags) {
        self.observations
            .lock()
            .unwrap()
            .push((name.to_string(), value, tags.clone()));
    }
}
