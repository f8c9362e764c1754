//! Dispatch core: admission gates, coalescing queue, scheduler, and the
//! orchestrator pipeline that ties them to a platform sender.
//!
//! The components here are deliberately decoupled: each gate owns its own
//! history, the queue owns its ledger, and the orchestrator only sequences
//! them. Everything that needs "now" takes either an injected [`Clock`] or an
//! explicit timestamp argument so tests can drive time deterministically.

pub mod cooldown;
pub mod dedupe;
pub mod jitter;
pub mod orchestrator;
pub mod permit;
pub mod processor;
pub mod queue;
pub mod scheduler;

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

pub use cooldown::CooldownGate;
pub use dedupe::NearDuplicateFilter;
pub use orchestrator::{Orchestrator, OrchestratorError};
pub use permit::{PermitDecision, PermitGate, ReevaluationOutcome};
pub use queue::{CoalesceQueue, QueueBatch};
pub use scheduler::Scheduler;

/// Injectable wall clock, in epoch seconds. Gates and queues never call
/// `SystemTime` directly; they go through one of these.
pub type Clock = Arc<dyn Fn() -> f64 + Send + Sync>;

/// The default clock: seconds since the Unix epoch, sub-second precision.
pub fn system_clock() -> Clock {
    Arc::new(|| {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    })
}

/// Engagement metadata a feature producer may attach to a message. All fields
/// are optional; absent values simply omit the corresponding metric tags.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Engagement {
    /// Overall engagement score for the generated content.
    pub score: Option<f64>,
    /// Recent engagement level (drives `engagement_trend` tagging).
    pub recent: Option<f64>,
    /// Long-term engagement baseline.
    pub long_term: Option<f64>,
    /// Fraction of the permit quota already consumed when the message was built.
    pub permit_quota: Option<f64>,
}

impl Engagement {
    pub fn is_empty(&self) -> bool {
        self.score.is_none()
            && self.recent.is_none()
            && self.long_term.is_none()
            && self.permit_quota.is_none()
    }
}

/// What a feature producer hands to the scheduler: opaque text plus optional
/// engagement metadata. Immutable after creation.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageEnvelope {
    pub text: String,
    pub engagement: Option<Engagement>,
}

impl MessageEnvelope {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            engagement: None,
        }
    }

    pub fn with_engagement(text: impl Into<String>, engagement: Engagement) -> Self {
        let engagement = if engagement.is_empty() {
            None
        } else {
            Some(engagement)
        };
        Self {
            text: text.into(),
            engagement,
        }
    }
}

impl From<String> for MessageEnvelope {
    fn from(text: String) -> Self {
        Self::new(text)
    }
}

impl From<&str> for MessageEnvelope {
    fn from(text: &str) -> Self {
        Self::new(text)
    }
}
