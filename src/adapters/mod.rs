//! Platform adapters: the abstract [`Sender`] boundary the orchestrator talks
//! to, the retry executor wrapping wire attempts, and the concrete Discord /
//! Misskey senders (behind the `wire-adapters` feature).
//!
//! Implementations receive one message at a time; batching happens upstream.
//! A sender must be idempotent within its retry window since the retry
//! executor may re-invoke it once per attempt.

pub mod retry;

#[cfg(feature = "wire-adapters")]
pub mod discord;
#[cfg(feature = "wire-adapters")]
pub mod misskey;

use async_trait::async_trait;
use thiserror::Error;

pub use retry::{run_with_retry, RetryConfig, Sleeper, TokioSleeper, TransportError, WireResponse};

/// Terminal failure of one send, after any wire-level retries.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("send timed out: {0}")]
    Timeout(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("request rejected with status {status}")]
    Status { status: u16 },
    /// The implementation does not accept a job hint. The pipeline retries
    /// exactly once without one; a second failure is terminal.
    #[error("sender does not accept a job hint")]
    JobUnsupported,
    #[error("{0}")]
    Other(String),
}

impl SendError {
    /// Stable short name used as the `error` metric tag.
    pub fn kind(&self) -> &'static str {
        match self {
            SendError::Timeout(_) => "Timeout",
            SendError::Transport(_) => "Transport",
            SendError::Status { .. } => "Status",
            SendError::JobUnsupported => "JobUnsupported",
            SendError::Other(_) => "Other",
        }
    }
}

impl From<retry::RetryError> for SendError {
    fn from(err: retry::RetryError) -> Self {
        match err {
            retry::RetryError::Transport(TransportError::Timeout(msg)) => SendError::Timeout(msg),
            retry::RetryError::Transport(TransportError::Network(msg)) => {
                SendError::Transport(msg)
            }
            retry::RetryError::Status(response) => SendError::Status {
                status: response.status,
            },
        }
    }
}

/// Wire-level boundary to a chat platform.
#[async_trait]
pub trait Sender: Send + Sync {
    /// Deliver one message. `channel` falls back to the adapter's default;
    /// `job` is an optional hint some platforms thread into their payload.
    async fn send(
        &self,
        text: &str,
        channel: Option<&str>,
        job: Option<&str>,
    ) -> Result<(), SendError>;
}
