//! Webhook publisher
//!
//! Platform OAuth lives outside Syndicast, in a relay service that holds the
//! tokens. This publisher POSTs the request as JSON to the relay endpoint
//! configured for a channel and expects `{"id": "..."}` (or `{"post_id": ...}`)
//! back.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;

use crate::config::WebhookConfig;
use crate::error::{PlatformError, Result};
use crate::platforms::{PublishRequest, Publisher};
use crate::types::Channel;

pub struct WebhookPublisher {
    channel: Channel,
    endpoint: String,
    token: Option<String>,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct RelayResponse {
    #[serde(alias = "post_id", alias = "postId")]
    id: String,
}

impl WebhookPublisher {
    pub fn new(channel: Channel, config: &WebhookConfig) -> Result<Self> {
        if config.endpoint.trim().is_empty() {
            return Err(PlatformError::NotConfigured(format!(
                "{} webhook endpoint is empty",
                channel
            ))
            .into());
        }

        let client = reqwest::Client::builder()
            .user_agent(concat!("syndicast/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| PlatformError::Network(e.to_string()))?;

        Ok(Self {
            channel,
            endpoint: config.endpoint.clone(),
            token: config.token.clone(),
            client,
        })
    }
}

/// Map a non-success relay status to the matching platform error
fn status_error(channel: Channel, status: StatusCode, body: &str) -> PlatformError {
    let detail = format!("{} relay returned {}: {}", channel, status, body.trim());
    match status {
        StatusCode::TOO_MANY_REQUESTS => PlatformError::RateLimit(detail),
        s if s.is_server_error() => PlatformError::Network(detail),
        _ => PlatformError::Posting(detail),
    }
}

#[async_trait]
impl Publisher for WebhookPublisher {
    fn channel(&self) -> Channel {
        self.channel
    }

    async fn publish(&self, request: &PublishRequest) -> Result<String> {
        let mut call = self.client.post(&self.endpoint).json(request);
        if let Some(token) = &self.token {
            call = call.bearer_auth(token);
        }

        let response = call
            .send()
            .await
            .map_err(|e| PlatformError::Network(format!("{} relay: {}", self.channel, e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(self.channel, status, &body).into());
        }

        let parsed: RelayResponse = response.json().await.map_err(|e| {
            PlatformError::Posting(format!("{} relay sent an unreadable reply: {}", self.channel, e))
        })?;

        Ok(parsed.id)
    }
}
