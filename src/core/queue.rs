//! Coalescing queue: merges nearby messages into priority-aware batches and
//! keeps a ledger so a batch id never dispatches twice while its record lives.
//!
//! Lower integer priority means more urgent. A pending batch accepts another
//! message when job and channel match, the incoming priority is not more
//! urgent than the batch, and the push lands inside the coalesce window.
//! Re-submitting with an explicit `batch_id` replaces the batch content
//! instead of appending, which is what permit re-evaluation relies on.

use std::collections::HashMap;

use uuid::Uuid;

use super::{Engagement, MessageEnvelope};

/// Frozen batch emitted by [`CoalesceQueue::pop_ready`].
#[derive(Debug, Clone, PartialEq)]
pub struct QueueBatch {
    pub priority: i32,
    pub text: String,
    pub channel: Option<String>,
    pub job: String,
    pub created_at: f64,
    pub batch_id: String,
    /// Engagement metadata survives only while a batch holds a single
    /// message; joining drops it.
    pub engagement: Option<Engagement>,
}

#[derive(Debug)]
struct PendingBatch {
    start: f64,
    job: String,
    messages: Vec<String>,
    priority: i32,
    channel: Option<String>,
    ready_at: f64,
    force_ready: bool,
    batch_id: String,
    engagement: Option<Engagement>,
}

#[derive(Debug)]
struct BatchRecord {
    job: String,
    channel: Option<String>,
    last_seen: f64,
    holds: HashMap<String, f64>,
}

impl BatchRecord {
    fn expire(&mut self, now: f64) {
        self.holds.retain(|_, until| now < *until);
    }

    fn note_seen(&mut self, ts: f64) {
        if ts > self.last_seen {
            self.last_seen = ts;
        }
    }
}

const LEDGER_CAPACITY: usize = 1024;

/// Merge nearby messages into priority-aware batches.
pub struct CoalesceQueue {
    window: f64,
    threshold: usize,
    pending: Vec<PendingBatch>,
    // Ledger entries in LRU order: index 0 is the coldest record.
    ledger_order: Vec<String>,
    ledger: HashMap<String, BatchRecord>,
}

impl CoalesceQueue {
    pub fn new(window_seconds: f64, threshold: usize) -> Self {
        Self {
            window: window_seconds,
            threshold: threshold.max(1),
            pending: Vec::new(),
            ledger_order: Vec::new(),
            ledger: HashMap::new(),
        }
    }

    pub fn window_seconds(&self) -> f64 {
        self.window
    }

    /// Insert into a compatible pending batch or open a new one.
    pub fn push(
        &mut self,
        text: &str,
        priority: i32,
        job: &str,
        created_at: f64,
        channel: Option<&str>,
        batch_id: Option<&str>,
    ) {
        let envelope = MessageEnvelope::new(text);
        self.push_envelope(&envelope, priority, job, created_at, channel, batch_id);
    }

    /// Like [`push`](Self::push), keeping the envelope's engagement metadata
    /// for as long as the batch holds a single message.
    pub fn push_envelope(
        &mut self,
        envelope: &MessageEnvelope,
        priority: i32,
        job: &str,
        created_at: f64,
        channel: Option<&str>,
        batch_id: Option<&str>,
    ) {
        let ts = created_at;
        let text = envelope.text.as_str();
        if let Some(id) = batch_id {
            if self.should_skip(id, ts, job, channel) {
                return;
            }
        }

        let touched = match self.find_batch(ts, channel, job, priority, batch_id) {
            Some(idx) => {
                let batch = &mut self.pending[idx];
                batch.priority = batch.priority.min(priority);
                let same_id = batch_id.is_some_and(|id| id == batch.batch_id);
                if same_id {
                    batch.start = batch.start.min(ts);
                    batch.channel = channel.map(str::to_string);
                    batch.messages = vec![text.to_string()];
                    batch.engagement = envelope.engagement;
                    batch.ready_at = ts + self.window;
                    batch.force_ready = false;
                } else {
                    batch.messages.push(text.to_string());
                    batch.engagement = None;
                    if batch.messages.len() >= self.threshold {
                        batch.force_ready = true;
                        batch.ready_at = batch.ready_at.min(ts);
                    }
                }
                idx
            }
            None => {
                let resolved_id = batch_id
                    .map(str::to_string)
                    .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
                self.pending.push(PendingBatch {
                    start: ts,
                    job: job.to_string(),
                    messages: vec![text.to_string()],
                    priority,
                    channel: channel.map(str::to_string),
                    ready_at: ts + self.window,
                    force_ready: false,
                    batch_id: resolved_id,
                    engagement: envelope.engagement,
                });
                self.pending.len() - 1
            }
        };

        let (id, job_owned, channel_owned) = {
            let batch = &self.pending[touched];
            (batch.batch_id.clone(), batch.job.clone(), batch.channel.clone())
        };
        self.remember(&id, ts, &job_owned, channel_owned.as_deref());
    }

    /// Remove and return every batch whose time has come, most urgent first.
    pub fn pop_ready(&mut self, now: f64) -> Vec<QueueBatch> {
        let mut ready = Vec::new();
        let mut remaining = Vec::new();
        for batch in self.pending.drain(..) {
            if batch.force_ready || now >= batch.ready_at {
                let single = batch.messages.len() == 1;
                let text = if single {
                    batch.messages[0].clone()
                } else {
                    batch.messages.join("\n")
                };
                ready.push(QueueBatch {
                    priority: batch.priority,
                    text,
                    channel: batch.channel,
                    job: batch.job,
                    created_at: batch.start,
                    batch_id: batch.batch_id,
                    engagement: if single { batch.engagement } else { None },
                });
            } else {
                remaining.push(batch);
            }
        }
        self.pending = remaining;
        ready.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(a.created_at.total_cmp(&b.created_at))
        });
        ready
    }

    /// Record a re-evaluation hold: pushes with this batch id are skipped
    /// until `until`. The level key lets independent levels hold in parallel.
    pub fn mark_reevaluation_pending(
        &mut self,
        batch_id: &str,
        job: &str,
        channel: Option<&str>,
        level: &str,
        until: f64,
    ) {
        assert!(!level.is_empty(), "reevaluation level must be non-empty");
        match self.ledger.get_mut(batch_id) {
            None => {
                self.ledger.insert(
                    batch_id.to_string(),
                    BatchRecord {
                        job: job.to_string(),
                        channel: channel.map(str::to_string),
                        last_seen: until,
                        holds: HashMap::new(),
                    },
                );
                self.ledger_order.push(batch_id.to_string());
            }
            Some(record) => {
                if record.job != job {
                    return;
                }
                if let (Some(ch), Some(recorded)) = (channel, record.channel.as_deref()) {
                    if recorded != ch {
                        return;
                    }
                }
                if record.channel.is_none() {
                    record.channel = channel.map(str::to_string);
                }
                record.expire(until);
                record.note_seen(until);
            }
        }
        if let Some(record) = self.ledger.get_mut(batch_id) {
            record.holds.insert(level.to_string(), until);
        }
        self.touch(batch_id);
        self.evict_ledger();
    }

    fn find_batch(
        &mut self,
        ts: f64,
        channel: Option<&str>,
        job: &str,
        priority: i32,
        batch_id: Option<&str>,
    ) -> Option<usize> {
        if let Some(id) = batch_id {
            if let Some(idx) = self.pending.iter().position(|b| b.batch_id == id) {
                return Some(idx);
            }
        }
        self.pending.iter().position(|batch| {
            batch.channel.as_deref() == channel
                && batch.job == job
                && priority >= batch.priority
                && ts - batch.start <= self.window
        })
    }

    fn should_skip(&mut self, batch_id: &str, ts: f64, job: &str, channel: Option<&str>) -> bool {
        let Some(record) = self.ledger.get_mut(batch_id) else {
            return false;
        };
        record.expire(ts);
        if record.job != job {
            return true;
        }
        if let Some(ch) = channel {
            match record.channel.as_deref() {
                None => record.channel = Some(ch.to_string()),
                Some(recorded) if recorded != ch => return true,
                Some(_) => {}
            }
        }
        if let Some(hold_until) = record.holds.values().copied().fold(None, |acc: Option<f64>, v| {
            Some(acc.map_or(v, |a| a.max(v)))
        }) {
            if ts < hold_until {
                return true;
            }
        }
        ts <= record.last_seen
    }

    fn remember(&mut self, batch_id: &str, ts: f64, job: &str, channel: Option<&str>) {
        match self.ledger.get_mut(batch_id) {
            None => {
                self.ledger.insert(
                    batch_id.to_string(),
                    BatchRecord {
                        job: job.to_string(),
                        channel: channel.map(str::to_string),
                        last_seen: ts,
                        holds: HashMap::new(),
                    },
                );
                self.ledger_order.push(batch_id.to_string());
            }
            Some(record) => {
                if record.job != job {
                    record.job = job.to_string();
                }
                if record.channel.is_none() {
                    record.channel = channel.map(str::to_string);
                }
                record.expire(ts);
                record.note_seen(ts);
            }
        }
        self.touch(batch_id);
        self.evict_ledger();
    }

    fn touch(&mut self, batch_id: &str) {
        if let Some(pos) = self.ledger_order.iter().position(|id| id == batch_id) {
            let id = self.ledger_order.remove(pos);
            self.ledger_order.push(id);
        }
    }

    fn evict_ledger(&mut self) {
        while self.ledger_order.len() > LEDGER_CAPACITY {
            let coldest = self.ledger_order.remove(0);
            self.ledger.remove(&coldest);
        }
    }

    /// Pending batch count (test hook).
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Whether the ledger currently tracks `batch_id` (test hook).
    pub fn remembers(&self, batch_id: &str) -> bool {
        self.ledger.contains_key(batch_id)
    }
}
