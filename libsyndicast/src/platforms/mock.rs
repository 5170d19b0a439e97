//! Mock publisher for testing and dry runs
//!
//! Can simulate successes, failures and slow platforms, and records every
//! request it receives so tests can assert on what was (or was not) sent.
//! `synd-send --dry-run` registers one per channel in place of the webhooks.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;
use tracing::info;

use crate::error::{PlatformError, Result};
use crate::platforms::{PublishRequest, Publisher};
use crate::types::Channel;

/// Configuration for mock publisher behavior
#[derive(Debug, Clone)]
pub struct MockConfig {
    pub channel: Channel,

    /// Whether publishing should succeed
    pub publish_succeeds: bool,

    /// Error to return on publishing failure
    pub publish_error: Option<String>,

    /// Delay before completing (simulates network latency)
    pub delay: Duration,

    /// Requests that have been published (for verification)
    pub published: Arc<Mutex<Vec<PublishRequest>>>,

    /// Number of times publish has been called
    pub publish_call_count: Arc<Mutex<usize>>,
}

impl MockConfig {
    pub fn new(channel: Channel) -> Self {
        Self {
            channel,
            publish_succeeds: true,
            publish_error: None,
            delay: Duration::from_millis(0),
            published: Arc::new(Mutex::new(Vec::new())),
            publish_call_count: Arc::new(Mutex::new(0)),
        }
    }
}

pub struct MockPublisher {
    config: MockConfig,
}

impl MockPublisher {
    pub fn new(config: MockConfig) -> Self {
        Self { config }
    }

    /// A publisher that always succeeds
    pub fn success(channel: Channel) -> Self {
        Self::new(MockConfig::new(channel))
    }

    /// A publisher whose every publish fails with `error`
    pub fn post_failure(channel: Channel, error: &str) -> Self {
        Self::new(MockConfig {
            publish_succeeds: false,
            publish_error: Some(error.to_string()),
            ..MockConfig::new(channel)
        })
    }

    /// A publisher that takes `delay` to answer
    pub fn with_delay(channel: Channel, delay: Duration) -> Self {
        Self::new(MockConfig {
            delay,
            ..MockConfig::new(channel)
        })
    }

    pub fn publish_call_count(&self) -> usize {
        *self.config.publish_call_count.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn published(&self) -> Vec<PublishRequest> {
        self.config.published.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl Publisher for MockPublisher {
    fn channel(&self) -> Channel {
        self.config.channel
    }

    async fn publish(&self, request: &PublishRequest) -> Result<String> {
        *self.config.publish_call_count.lock().unwrap_or_else(|e| e.into_inner()) += 1;

        if !self.config.delay.is_zero() {
            sleep(self.config.delay).await;
        }

        if !self.config.publish_succeeds {
            let error_msg = self
                .config
                .publish_error
                .clone()
                .unwrap_or_else(|| "Mock publishing failed".to_string());
            return Err(PlatformError::Posting(error_msg).into());
        }

        self.config.published.lock().unwrap_or_else(|e| e.into_inner()).push(request.clone());
        info!(channel = %self.config.channel, post_id = %request.post_id, "mock publish");

        Ok(format!("{}:mock-{}", self.config.channel, uuid::Uuid::new_v4()))
    }
}
