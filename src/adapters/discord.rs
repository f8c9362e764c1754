//! Discord sender: posts a message to a channel through the bot API.
//!
//! Credentials come from the environment (`DISCORD_BOT_TOKEN`,
//! `DISCORD_CHANNEL_ID`) unless supplied explicitly. Wire failures go through
//! the shared retry executor; the `job` hint has no Discord representation
//! and is ignored.

use async_trait::async_trait;
use log::debug;
use uuid::Uuid;

use super::retry::{run_with_retry, RetryConfig, Sleeper, TokioSleeper, TransportError, WireResponse};
use super::{SendError, Sender};

const API_BASE: &str = "https://discord.com/api/v10";

pub struct DiscordSender {
    token: String,
    channel_id: String,
    client: reqwest::Client,
    retry: RetryConfig,
    sleeper: Box<dyn Sleeper>,
}

impl DiscordSender {
    pub fn new(token: Option<String>, channel_id: Option<String>) -> Self {
        Self {
            token: token
                .or_else(|| std::env::var("DISCORD_BOT_TOKEN").ok())
                .unwrap_or_default(),
            channel_id: channel_id
                .or_else(|| std::env::var("DISCORD_CHANNEL_ID").ok())
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
            .header("Authorization", format!("Bot {}", self.token))
            .json(&serde_json::json!({ "content": text }))
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
impl Sender for DiscordSender {
    async fn send(
        &self,
        text: &str,
        channel: Option<&str>,
        _job: Option<&str>,
    ) -> Result<(), SendError> {
        let channel_id = channel.unwrap_or(&self.channel_id);
        if self.token.is_empty() || channel_id.is_empty() {
            debug!("discord sender not configured; dropping message");
            return Ok(());
        }
        let url = format!("{API_BASE}/channels/{channel_id}/messages");
        let correlation_id = Uuid::new_v4().simple().to_string();
        run_with_retry(
            "discord",
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
