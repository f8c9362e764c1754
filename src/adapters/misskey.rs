//! Misskey sender: creates a note on the configured instance.
//!
//! Credentials come from the environment (`MISSKEY_INSTANCE`,
//! `MISSKEY_TOKEN`) unless supplied explicitly. Misskey has no channel
//! routing for plain notes; the `channel` argument is accepted for contract
//! parity and ignored, as is `job`.

use async_trait::async_trait;
use log::debug;
use uuid::Uuid;

use super::retry::{run_with_retry, RetryConfig, Sleeper, TokioSleeper, TransportError, WireResponse};
use super::{SendError, Sender};

pub struct MisskeySender {
    instance: String,
    token: String,
    client: reqwest::Client,
    retry: RetryConfig,
    sleeper: Box<dyn Sleeper>,
}

impl MisskeySender {
    pub fn new(instance: Option<String>, token: Option<String>) -> Self {
        Self {
            instance: instance
                .or_else(|| std::env::var("MISSKEY_INSTANCE").ok())
                .unwrap_or_else(|| "misskey.io".to_string()),
            token: token
                .or_else(|| std::env::var("MISSKEY_TOKEN").ok())
                .unwrap_or_default(),
            client: reqwest::Client::new(),
            retry: RetryConfig::default(),
            sleeper: Box::new(TokioSleeper),
        }
    }

    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    async fn attempt(&self, url: &str, text: &str) -> Result<WireResponse, TransportError> {
        let result = self
            .client
            .post(url)
            .json(&serde_json::json!({ "i": self.token, "text": text }))
            .timeout(std::time::Duration::from_secs(20))
            .send()
            .await;
        match result {
            Ok(response) => {
                let retry_after = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                Ok(WireResponse {
                    status: response.status().as_u16(),
                    retry_after,
                })
            }
            Err(err) if err.is_timeout() => Err(TransportError::Timeout(err.to_string())),
            Err(err) => Err(TransportError::Network(err.to_string())),
        }
    }
}

#[async_trait]
impl Sender for MisskeySender {
    async fn send(
        &self,
        text: &str,
        _channel: Option<&str>,
        _job: Option<&str>,
    ) -> Result<(), SendError> {
        if self.instance.is_empty() || self.token.is_empty() {
            debug!("misskey sender not configured; dropping message");
            return Ok(());
        }
        let url = format!("https://{}/api/notes/create", self.instance);
        let correlation_id = Uuid::new_v4().simple().to_string();
        run_with_retry(
            "misskey",
            &correlation_id,
            &url,
            || self.attempt(&url, text),
            self.retry,
            self.sleeper.as_ref(),
        )
        .await
        .map(|_| ())
        .map_err(SendError::from)
    }
}
