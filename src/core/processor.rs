//! The per-request pipeline: permit -> dedupe -> send -> cooldown note.
//!
//! Every terminal outcome (success, denied, duplicate, failure) emits exactly
//! one metric event and one JSON log line sharing the request's correlation
//! id. Denials with a re-evaluation outcome additionally schedule a deferred
//! re-push of the original batch and place a hold in the queue ledger.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use log::Level;
use tokio::task::JoinHandle;

use crate::adapters::{SendError, Sender, Sleeper};
use crate::logutil::JsonEvent;
use crate::metrics::{self, format_metric_value, MetricsBoundary, Tags};

use super::cooldown::CooldownGate;
use super::dedupe::NearDuplicateFilter;
use super::orchestrator::{PermitEvaluator, PermitOverride, SendRequest};
use super::queue::CoalesceQueue;
use super::Clock;

const ADAPTER: &str = "orchestrator";

pub(crate) struct ReevalTask {
    pub correlation_id: String,
    pub job: String,
    pub handle: JoinHandle<()>,
}

/// Everything the worker needs to process one request.
pub(crate) struct Pipeline {
    pub sender: Arc<dyn Sender>,
    pub cooldown: Arc<Mutex<CooldownGate>>,
    pub dedupe: Arc<Mutex<NearDuplicateFilter>>,
    pub permit: Arc<dyn PermitEvaluator>,
    pub boundary: Arc<MetricsBoundary>,
    pub queue: Option<Arc<Mutex<CoalesceQueue>>>,
    pub permit_overrides: HashMap<String, PermitOverride>,
    pub clock: Clock,
    pub sleeper: Arc<dyn Sleeper>,
    pub reeval_tasks: Mutex<Vec<ReevalTask>>,
}

impl Pipeline {
    pub async fn process(self: &Arc<Self>, request: SendRequest) {
        // A registered override charges quota against its key; the message
        // still posts under the request's own platform/channel.
        let decision = match self.permit_overrides.get(&request.job) {
            Some(key) => self
                .permit
                .permit(&key.platform, key.channel.as_deref(), &key.job),
            None => self
                .permit
                .permit(&request.platform, request.channel.as_deref(), &request.job),
        };
        let job_name = decision.job.clone().unwrap_or_else(|| request.job.clone());
        let base_tags = metrics::tags(&[
            ("job", job_name.as_str()),
            ("platform", request.platform.as_str()),
            ("channel", request.channel.as_deref().unwrap_or("-")),
        ]);
        let metrics_enabled = self.boundary.is_enabled();

        if !decision.allowed {
            self.handle_denial(&request, &decision, &job_name, &base_tags, metrics_enabled);
            return;
        }

        let duplicate = {
            let mut dedupe = self.dedupe.lock().expect("dedupe mutex poisoned");
            !dedupe.permit(&request.text)
        };
        if duplicate {
            let mut tags = base_tags.clone();
            tags.insert("status".into(), "duplicate".into());
            tags.insert("retryable".into(), "false".into());
            self.boundary.recorder().increment("send.duplicate", &tags);
            JsonEvent::new("send_duplicate_skip", ADAPTER, &request.correlation_id)
                .field("job", job_name.as_str())
                .field("platform", request.platform.as_str())
                .opt_field("channel", request.channel.as_deref())
                .field("status", "duplicate")
                .field("retryable", false)
                .text_field("text", &request.text)
                .emit(Level::Info);
            return;
        }

        let started = Instant::now();
        let mut outcome = self
            .sender
            .send(&request.text, request.channel.as_deref(), Some(&job_name))
            .await;
        if matches!(outcome, Err(SendError::JobUnsupported)) {
            // Compat shim: retry exactly once without the job hint.
            outcome = self
                .sender
                .send(&request.text, request.channel.as_deref(), None)
                .await;
        }
        let duration = started.elapsed().as_secs_f64();

        match outcome {
            Err(error) => {
                self.handle_failure(
                    &request,
                    &job_name,
                    &base_tags,
                    duration,
                    &error,
                    metrics_enabled,
                );
            }
            Ok(()) => {
                self.handle_success(&request, &job_name, &base_tags, duration, metrics_enabled);
            }
        }
    }

    fn handle_denial(
        self: &Arc<Self>,
        request: &SendRequest,
        decision: &super::permit::PermitDecision,
        job_name: &str,
        base_tags: &Tags,
        metrics_enabled: bool,
    ) {
        let retryable = decision.retryable;
        let reason = decision.reason.clone().unwrap_or_else(|| "unknown".into());
        let reevaluation = decision.reevaluation.as_ref();
        let reeval_level = reevaluation.and_then(|r| r.level()).map(str::to_string);
        let reeval_reason = reevaluation.and_then(|r| r.reason()).map(str::to_string);
        let allowed_hint = reevaluation.and_then(|r| r.allowed());
        let retry_after = reevaluation
            .and_then(|r| r.retry_after())
            .or(decision.retry_after)
            .filter(|ra| *ra >= 0.0);

        let mut permit_payload = Tags::new();
        permit_payload.insert("retryable".into(), bool_tag(retryable).into());
        if let Some(level) = &reeval_level {
            permit_payload.insert("reevaluation_level".into(), level.clone());
        }
        if let Some(r) = &reeval_reason {
            permit_payload.insert("reevaluation_reason".into(), r.clone());
        }
        if let (Some(ra), true) = (retry_after, reevaluation.is_some()) {
            permit_payload.insert("reevaluation_retry_after".into(), format_metric_value(ra));
        }
        if let Some(allowed) = allowed_hint {
            permit_payload.insert("reevaluation_allowed".into(), bool_tag(allowed).into());
        }
        if let Some(meta) = &decision.retry_metadata {
            for (key, value) in meta {
                permit_payload.entry(key.clone()).or_insert_with(|| value.clone());
            }
        }
        if metrics_enabled {
            let _guard = self.boundary.suppress_backend(false);
            metrics::report_permit_denied(
                job_name,
                &request.platform,
                request.channel.as_deref(),
                &reason,
                Some(&permit_payload),
            );
        }
        JsonEvent::new("send_permit_denied", ADAPTER, &request.correlation_id)
            .field("job", job_name)
            .field("platform", request.platform.as_str())
            .opt_field("channel", request.channel.as_deref())
            .field("reason", reason.as_str())
            .field("retryable", retryable)
            .emit(Level::Info);

        let Some(retry_after) = retry_after else {
            return;
        };
        if reevaluation.is_none() {
            return;
        }
        let level = reeval_level.unwrap_or_else(|| "unspecified".into());
        let reeval_reason = reeval_reason.unwrap_or_else(|| reason.clone());
        let decision_label = match allowed_hint {
            Some(true) => "allow",
            Some(false) => "deny",
            None => "pending",
        };
        let mut reeval_tags = base_tags.clone();
        reeval_tags.insert("level".into(), level.clone());
        reeval_tags.insert("decision".into(), decision_label.into());
        reeval_tags.insert("reason".into(), reeval_reason.clone());
        reeval_tags.insert("retry_after".into(), format_metric_value(retry_after));
        self.boundary
            .recorder()
            .increment("send.permit_reevaluation", &reeval_tags);
        if metrics_enabled {
            let _guard = self.boundary.suppress_backend(false);
            metrics::report_permit_reevaluation(
                job_name,
                &request.platform,
                request.channel.as_deref(),
                &level,
                &reeval_reason,
                retry_after,
                decision_label,
            );
        }
        JsonEvent::new("send_permit_reevaluation", ADAPTER, &request.correlation_id)
            .field("job", job_name)
            .field("platform", request.platform.as_str())
            .opt_field("channel", request.channel.as_deref())
            .field("reason", reeval_reason.as_str())
            .field("retry_after", retry_after)
            .field("decision", decision_label)
            .emit(Level::Info);

        self.schedule_reevaluation(request, &level, retry_after);
    }

    /// Defer a re-push of the request's batch by `retry_after` seconds and
    /// place a ledger hold so duplicate pushes during the wait are skipped.
    fn schedule_reevaluation(self: &Arc<Self>, request: &SendRequest, level: &str, retry_after: f64) {
        let Some(queue) = self.queue.clone() else {
            log::debug!(
                "no queue attached; dropping re-evaluation for correlation_id={}",
                request.correlation_id
            );
            return;
        };
        let Some(batch) = request.batch.clone() else {
            log::debug!(
                "request has no batch reference; dropping re-evaluation for correlation_id={}",
                request.correlation_id
            );
            return;
        };
        let until = (self.clock)() + retry_after;
        {
            let mut queue = queue.lock().expect("queue mutex poisoned");
            queue.mark_reevaluation_pending(
                &batch.batch_id,
                &request.job,
                request.channel.as_deref(),
                level,
                until,
            );
        }

        let correlation_id = request.correlation_id.clone();
        let job = request.job.clone();
        let pipeline = Arc::clone(self);
        let request = request.clone();
        let handle = tokio::spawn(async move {
            pipeline.sleeper.sleep(retry_after).await;
            let now = (pipeline.clock)();
            if let Some(queue) = &pipeline.queue {
                let mut queue = queue.lock().expect("queue mutex poisoned");
                if let Some(batch) = &request.batch {
                    queue.push(
                        &request.text,
                        batch.priority,
                        &request.job,
                        now,
                        request.channel.as_deref(),
                        Some(&batch.batch_id),
                    );
                }
            }
        });
        self.reeval_tasks
            .lock()
            .expect("reeval task mutex poisoned")
            .push(ReevalTask {
                correlation_id,
                job,
                handle,
            });
    }

    fn handle_failure(
        self: &Arc<Self>,
        request: &SendRequest,
        job_name: &str,
        base_tags: &Tags,
        duration: f64,
        error: &SendError,
        metrics_enabled: bool,
    ) {
        let error_type = error.kind();
        if metrics_enabled {
            let _guard = self.boundary.suppress_backend(true);
            metrics::report_send_failure(
                job_name,
                &request.platform,
                request.channel.as_deref(),
                duration,
                error_type,
            );
        }
        let mut duration_tags = base_tags.clone();
        duration_tags.insert("unit".into(), "seconds".into());
        self.boundary
            .recorder()
            .observe("send.duration", duration, &duration_tags);
        let mut failure_tags = base_tags.clone();
        failure_tags.insert("error".into(), error_type.into());
        self.boundary.recorder().increment("send.failure", &failure_tags);
        let mut event_tags = failure_tags;
        event_tags.insert("unit".into(), "seconds".into());
        self.boundary
            .record_event("send.failure", &event_tags, Some(duration), true);
        JsonEvent::new("send_failure", ADAPTER, &request.correlation_id)
            .field("job", job_name)
            .field("platform", request.platform.as_str())
            .opt_field("channel", request.channel.as_deref())
            .field("error_type", error_type)
            .field("error_message", error.to_string())
            .field("duration_sec", duration)
            .emit(Level::Error);
    }

    fn handle_success(
        self: &Arc<Self>,
        request: &SendRequest,
        job_name: &str,
        base_tags: &Tags,
        duration: f64,
        metrics_enabled: bool,
    ) {
        let mut success_tags = base_tags.clone();
        let mut permit_tags = Tags::new();
        if let Some(engagement) = &request.engagement {
            if let Some(score) = engagement.score {
                let formatted = format_metric_value(score);
                success_tags.insert("engagement_score".into(), formatted.clone());
                permit_tags.insert("engagement_score".into(), formatted);
            }
            if let Some(recent) = engagement.recent {
                let formatted = format_metric_value(recent);
                success_tags.insert("engagement_trend".into(), formatted.clone());
                permit_tags.insert("engagement_trend".into(), formatted);
            }
            if let Some(quota) = engagement.permit_quota {
                let formatted = format_metric_value(quota);
                success_tags.insert("permit_quota".into(), formatted.clone());
                permit_tags.insert("permit_quota".into(), formatted);
            }
        }
        if metrics_enabled {
            let _guard = self.boundary.suppress_backend(false);
            metrics::report_send_success(
                job_name,
                &request.platform,
                request.channel.as_deref(),
                duration,
                if permit_tags.is_empty() {
                    None
                } else {
                    Some(&permit_tags)
                },
            );
        }
        self.boundary
            .record_event("send.success", &success_tags, Some(duration), false);
        {
            let mut cooldown = self.cooldown.lock().expect("cooldown mutex poisoned");
            cooldown.note_post(
                &request.platform,
                request.channel.as_deref().unwrap_or("-"),
                job_name,
            );
        }
        let mut event = JsonEvent::new("send_success", ADAPTER, &request.correlation_id)
            .field("job", job_name)
            .field("platform", request.platform.as_str())
            .opt_field("channel", request.channel.as_deref())
            .field("duration_sec", duration);
        if let Some(engagement) = &request.engagement {
            event = event
                .opt_field("engagement_score", engagement.score)
                .opt_field("engagement_trend", engagement.recent)
                .opt_field("permit_quota", engagement.permit_quota);
        }
        event.emit(Level::Info);
    }
}

fn bool_tag(v: bool) -> &'static str {
    if v {
        "true"
    } else {
        "false"
    }
}
