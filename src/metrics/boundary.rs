//! The boundary between the orchestrator's fast-path recorder and the
//! process-global aggregator.
//!
//! Some report paths write through both the recorder and a dedicated
//! aggregator call; `suppress_backend` temporarily swaps the aggregator's
//! backend for a no-op so those events are not counted twice. The swap is
//! undone by an RAII guard on every exit path, except when something else
//! reconfigured the backend in the meantime: that configuration wins.

use std::sync::Arc;

use super::{aggregator, MetricsRecorder, MetricsService, NullMetricsRecorder, Tags};

/// What the orchestrator was handed at construction.
pub enum MetricsHandle {
    /// A full service: used as recorder and registered as the aggregator
    /// backend; snapshots come from it.
    Service(Arc<MetricsService>),
    /// A bare recorder: fast path only, no snapshot source.
    Recorder(Arc<dyn MetricsRecorder>),
}

/// Composes the fast-path recorder with the aggregator.
pub struct MetricsBoundary {
    recorder: Arc<dyn MetricsRecorder>,
    service: Option<Arc<MetricsService>>,
    has_real_recorder: bool,
}

impl MetricsBoundary {
    /// Resolve a boundary from an optional metrics handle and register the
    /// recorder as the aggregator backend (clearing it when absent).
    pub fn resolve(metrics: Option<MetricsHandle>) -> Self {
        let (recorder, service, has_real_recorder): (
            Arc<dyn MetricsRecorder>,
            Option<Arc<MetricsService>>,
            bool,
        ) = match metrics {
            Some(MetricsHandle::Service(service)) => (
                Arc::clone(&service) as Arc<dyn MetricsRecorder>,
                Some(service),
                true,
            ),
            Some(MetricsHandle::Recorder(recorder)) => (recorder, None, true),
            None => (Arc::new(NullMetricsRecorder), None, false),
        };
        if has_real_recorder {
            aggregator::configure_backend(Some(Arc::clone(&recorder)));
        } else {
            aggregator::configure_backend(None);
        }
        Self {
            recorder,
            service,
            has_real_recorder,
        }
    }

    pub fn recorder(&self) -> &Arc<dyn MetricsRecorder> {
        &self.recorder
    }

    pub fn service(&self) -> Option<&Arc<MetricsService>> {
        self.service.as_ref()
    }

    /// Whether events are going anywhere at all.
    pub fn is_enabled(&self) -> bool {
        if !self.has_real_recorder {
            return false;
        }
        if self.service.is_some() {
            return true;
        }
        aggregator::backend_configured()
    }

    /// Swap the aggregator backend for a no-op for the guard's lifetime.
    /// `include_self` also suppresses when the backend is this boundary's
    /// own recorder (the double-write case).
    pub fn suppress_backend(&self, include_self: bool) -> SuppressGuard {
        SuppressGuard {
            token: aggregator::begin_suppression(
                &self.recorder,
                include_self,
                self.has_real_recorder,
            ),
        }
    }

    /// Record a measured event on the snapshot service. Events without a
    /// measurement are counters handled by the recorder path and skipped
    /// here. Without `force`, the event is also skipped while the aggregator
    /// backend is this boundary's recorder (it would arrive twice).
    pub fn record_event(
        &self,
        name: &str,
        tags: &Tags,
        measurement: Option<f64>,
        force: bool,
    ) {
        let Some(service) = &self.service else {
            return;
        };
        let Some(value) = measurement else {
            return;
        };
        if !force && aggregator::backend_is(&self.recorder) {
            return;
        }
        service.record_event(name, tags, Some(value));
    }
}

/// Restores the aggregator backend when dropped.
pub struct SuppressGuard {
    token: Option<aggregator::SuppressToken>,
}

impl Drop for SuppressGuard {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            aggregator::end_suppression(token);
        }
    }
}
