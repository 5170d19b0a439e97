//! Publish adapters
//!
//! A [`Publisher`] pushes one piece of copy to one channel and hands back the
//! platform's id for the created post. The dispatch step picks the publisher
//! for a scheduled post's channel from a [`Publishers`] registry.
//!
//! # Examples
//!
//! ```no_run
//! use libsyndicast::platforms::{Publisher, PublishRequest, webhook::WebhookPublisher};
//! use libsyndicast::config::WebhookConfig;
//! use libsyndicast::types::Channel;
//!
//! # async fn example() -> libsyndicast::error::Result<()> {
//! let config = WebhookConfig {
//!     endpoint: "https://relay.example.com/linkedin".to_string(),
//!     token: None,
//! };
//! let publisher = WebhookPublisher::new(Channel::Linkedin, &config)?;
//!
//! let request = PublishRequest {
//!     post_id: "scheduled-post-42-0".to_string(),
//!     content: "New article is live".to_string(),
//!     image_url: None,
//!     hashtags: vec!["rust".to_string()],
//! };
//! let platform_post_id = publisher.publish(&request).await?;
//! println!("Published: {}", platform_post_id);
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::ChannelsConfig;
use crate::error::Result;
use crate::types::Channel;

pub mod mock;
pub mod webhook;

/// What a publisher receives for one scheduled post
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PublishRequest {
    /// Our identifier (`scheduled-<article>-<index>`), useful for relay-side dedupe
    pub post_id: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub hashtags: Vec<String>,
}

#[async_trait]
pub trait Publisher: Send + Sync {
    /// The channel this publisher posts to
    fn channel(&self) -> Channel;

    /// Publish the request and return the platform post id
    ///
    /// # Errors
    ///
    /// Returns `PlatformError::Posting` when the platform rejects the post and
    /// `PlatformError::Network` when it cannot be reached.
    async fn publish(&self, request: &PublishRequest) -> Result<String>;
}

/// Channel → publisher lookup
#[derive(Clone, Default)]
pub struct Publishers {
    by_channel: HashMap<Channel, Arc<dyn Publisher>>,
}

impl Publishers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Webhook publishers for every channel with an endpoint configured
    pub fn from_config(config: &ChannelsConfig) -> Result<Self> {
        let mut publishers = Self::new();
        for channel in Channel::ALL {
            if let Some(webhook) = config.get(channel) {
                publishers.register(Arc::new(webhook::WebhookPublisher::new(channel, webhook)?));
            }
        }
        Ok(publishers)
    }

    /// Replaces any publisher already registered for the same channel
    pub fn register(&mut self, publisher: Arc<dyn Publisher>) {
        self.by_channel.insert(publisher.channel(), publisher);
    }

    pub fn with(mut self, publisher: Arc<dyn Publisher>) -> Self {
        self.register(publisher);
        self
    }

    pub fn get(&self, channel: Channel) -> Option<Arc<dyn Publisher>> {
        self.by_channel.get(&channel).cloned()
    }

    pub fn channels(&self) -> Vec<Channel> {
        let mut channels: Vec<_> = self.by_channel.keys().copied().collect();
        channels.sort();
        channels
    }
}
