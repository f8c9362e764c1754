//! Bounded retry around a wire attempt.
//!
//! Classification per attempt: transport errors and HTTP 429/5xx are
//! retryable, 2xx is success, anything else fails immediately. A 429 with a
//! `Retry-After` header (seconds or HTTP-date) overrides the exponential
//! backoff for that attempt. Every decision emits one JSON log line with a
//! stable schema.

use std::future::Future;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::Level;
use thiserror::Error;

use crate::logutil::JsonEvent;

/// Retry budget and backoff shape.
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    /// Attempts including the first request. 1 means no retry.
    pub max_attempts: u32,
    /// Delay before the first retry, in seconds.
    pub base_backoff: f64,
    /// Cap on the exponential growth, in seconds.
    pub max_backoff: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: 1.0,
            max_backoff: 8.0,
        }
    }
}

impl RetryConfig {
    /// Backoff for attempt `i` (1-indexed): `base * 2^(i-1)`, capped.
    fn backoff(&self, attempt: u32) -> f64 {
        let power = attempt.saturating_sub(1);
        let delay = self.base_backoff * 2f64.powi(power as i32);
        delay.min(self.max_backoff)
    }
}

/// Minimal view of an HTTP response the retry layer needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireResponse {
    pub status: u16,
    /// Raw `Retry-After` header value, if any.
    pub retry_after: Option<String>,
}

impl WireResponse {
    pub fn ok() -> Self {
        Self {
            status: 200,
            retry_after: None,
        }
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            retry_after: None,
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    fn is_retryable(&self) -> bool {
        self.status == 429 || (500..600).contains(&self.status)
    }
}

/// Errors below the HTTP layer. Always retryable.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("network: {0}")]
    Network(String),
}

/// Terminal outcome of the retry loop.
#[derive(Debug, Error)]
pub enum RetryError {
    #[error(transparent)]
    Transport(TransportError),
    #[error("request failed with status {}", .0.status)]
    Status(WireResponse),
}

/// Cooperative sleep, injectable so tests can observe the exact delays.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, seconds: f64);
}

/// Default sleeper backed by the tokio timer.
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, seconds: f64) {
        if seconds > 0.0 {
            tokio::time::sleep(std::time::Duration::from_secs_f64(seconds)).await;
        }
    }
}

/// Parse a `Retry-After` value: numeric seconds, or an HTTP-date whose delta
/// from `now` is clamped to zero.
fn retry_after_seconds(value: &str, now: DateTime<Utc>) -> Option<f64> {
    if let Ok(seconds) = value.trim().parse::<f64>() {
        return Some(seconds);
    }
    let parsed = DateTime::parse_from_rfc2822(value.trim()).ok()?;
    let delta = (parsed.with_timezone(&Utc) - now).num_milliseconds() as f64 / 1000.0;
    Some(delta.max(0.0))
}

/// Drive `attempt` to a terminal outcome under the retry budget.
///
/// Returns the successful response, or the classified error after a fatal
/// status or budget exhaustion. Suspends only in its own sleeps.
pub async fn run_with_retry<F, Fut>(
    adapter: &str,
    correlation_id: &str,
    target: &str,
    mut attempt: F,
    config: RetryConfig,
    sleeper: &dyn Sleeper,
) -> Result<WireResponse, RetryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<WireResponse, TransportError>>,
{
    let max = config.max_attempts.max(1);
    let mut last: Option<Result<WireResponse, TransportError>> = None;

    for current in 1..=max {
        let outcome = attempt().await;
        let (retryable, status_code, error_text) = match &outcome {
            Ok(response) if response.is_success() => {
                JsonEvent::new("send_success", adapter, correlation_id)
                    .field("attempt", current)
                    .field("max_attempts", max)
                    .field("status_code", response.status)
                    .field("target", target)
                    .emit(Level::Info);
                return Ok(response.clone());
            }
            Ok(response) => (response.is_retryable(), Some(response.status), None),
            Err(err) => (true, None, Some(err.to_string())),
        };

        if !retryable {
            JsonEvent::new("send_failed", adapter, correlation_id)
                .field("attempt", current)
                .field("max_attempts", max)
                .opt_field("status_code", status_code)
                .field("target", target)
                .emit(Level::Error);
            return Err(classify(outcome));
        }

        if current == max {
            JsonEvent::new("retry_exhausted", adapter, correlation_id)
                .field("attempt", current)
                .field("max_attempts", max)
                .opt_field("status_code", status_code)
                .field("target", target)
                .opt_field("error", error_text)
                .emit(Level::Error);
            return Err(classify(outcome));
        }

        let retry_in = match &outcome {
            Ok(response) if response.status == 429 => response
                .retry_after
                .as_deref()
                .and_then(|v| retry_after_seconds(v, Utc::now()))
                .unwrap_or_else(|| config.backoff(current)),
            _ => config.backoff(current),
        };

        JsonEvent::new("retry_scheduled", adapter, correlation_id)
            .field("attempt", current)
            .field("max_attempts", max)
            .opt_field("status_code", status_code)
            .field("target", target)
            .field("retry_in", retry_in)
            .opt_field("error", error_text)
            .emit(Level::Warn);
        last = Some(outcome);
        sleeper.sleep(retry_in).await;
    }

    // Unreachable with max >= 1; keep the last outcome as the error anyway.
    Err(classify(last.expect("retry loop ran at least once")))
}

fn classify(outcome: Result<WireResponse, TransportError>) -> RetryError {
    match outcome {
        Ok(response) => RetryError::Status(response),
        Err(err) => RetryError::Transport(err),
    }
}
