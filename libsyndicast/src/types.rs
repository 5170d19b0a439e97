//! Core types for Syndicast

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::SyndicastError;

/// Social destination a scheduled post is published to
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Linkedin,
    Facebook,
    Instagram,
}

impl Channel {
    pub const ALL: [Channel; 3] = [Channel::Linkedin, Channel::Facebook, Channel::Instagram];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Linkedin => "linkedin",
            Channel::Facebook => "facebook",
            Channel::Instagram => "instagram",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = SyndicastError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "linkedin" => Ok(Channel::Linkedin),
            "facebook" => Ok(Channel::Facebook),
            "instagram" => Ok(Channel::Instagram),
            other => Err(SyndicastError::InvalidInput(format!(
                "Unknown channel '{}'. Valid channels: linkedin, facebook, instagram",
                other
            ))),
        }
    }
}

/// Kinds of derived content that can be (re)generated for an article
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Newsletter,
    Linkedin,
    Facebook,
    Instagram,
    Medium,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Newsletter => "newsletter",
            ContentType::Linkedin => "linkedin",
            ContentType::Facebook => "facebook",
            ContentType::Instagram => "instagram",
            ContentType::Medium => "medium",
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContentType {
    type Err = SyndicastError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "newsletter" => Ok(ContentType::Newsletter),
            "linkedin" => Ok(ContentType::Linkedin),
            "facebook" => Ok(ContentType::Facebook),
            "instagram" => Ok(ContentType::Instagram),
            "medium" => Ok(ContentType::Medium),
            other => Err(SyndicastError::InvalidInput(format!(
                "Unknown content type '{}'",
                other
            ))),
        }
    }
}

/// Lifecycle of a scheduled post. `Published` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PostStatus {
    Scheduled,
    Published,
    Failed,
}

impl PostStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PostStatus::Scheduled)
    }
}

impl fmt::Display for PostStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PostStatus::Scheduled => f.write_str("scheduled"),
            PostStatus::Published => f.write_str("published"),
            PostStatus::Failed => f.write_str("failed"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduledPost {
    pub channel: Channel,
    pub content: String,
    pub scheduled_at: DateTime<Utc>,
    pub status: PostStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hashtags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform_post_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
}

impl ScheduledPost {
    pub fn new(channel: Channel, content: String, scheduled_at: DateTime<Utc>) -> Self {
        Self {
            channel,
            content,
            scheduled_at,
            status: PostStatus::Scheduled,
            image_url: None,
            hashtags: Vec::new(),
            platform_post_id: None,
            error: None,
            published_at: None,
        }
    }

    pub fn mark_published(&mut self, platform_post_id: String, at: DateTime<Utc>) {
        self.status = PostStatus::Published;
        self.platform_post_id = Some(platform_post_id);
        self.published_at = Some(at);
        self.error = None;
    }

    pub fn mark_failed(&mut self, error: String) {
        self.status = PostStatus::Failed;
        self.error = Some(error);
    }
}

/// Per-article container for derived content and its scheduled posts
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Distribution {
    pub article_id: String,
    /// Bumped on every write of `scheduled_posts`
    pub revision: i64,
    pub scheduled_posts: Vec<ScheduledPost>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Distribution {
    pub fn new(article_id: &str) -> Self {
        let now = Utc::now().timestamp();
        Self {
            article_id: article_id.to_string(),
            revision: 0,
            scheduled_posts: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// A `scheduled` entry whose time has come, as found by the polling sweep
#[derive(Debug, Clone, PartialEq)]
pub struct DuePost {
    pub article_id: String,
    pub index: usize,
    pub post: ScheduledPost,
}

/// Identifier handed back to callers for a scheduled post
pub fn scheduled_post_id(article_id: &str, index: usize) -> String {
    format!("scheduled-{}-{}", article_id, index)
}
