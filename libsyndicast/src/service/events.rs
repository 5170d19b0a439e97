//! Event system for scheduling and dispatch progress
//!
//! In-process event bus built on `tokio::sync::broadcast`. The scheduler and
//! the dispatcher emit events as scheduled posts move through their
//! lifecycle; the daemon logs them and embedders can forward them anywhere.
//!
//! # Non-Blocking Behavior
//!
//! If no subscribers exist, events are dropped immediately. Subscribers can
//! lag without blocking emitters.
//!
//! # Example
//!
//! ```no_run
//! use libsyndicast::service::events::{EventBus, Event};
//! use libsyndicast::types::Channel;
//!
//! # async fn example() {
//! let event_bus = EventBus::new(100);
//! let mut receiver = event_bus.subscribe();
//!
//! event_bus.emit(Event::DispatchStarted {
//!     article_id: "post-42".to_string(),
//!     index: 0,
//!     channel: Channel::Linkedin,
//! });
//!
//! if let Ok(event) = receiver.recv().await {
//!     println!("Received: {:?}", event);
//! }
//! # }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::types::Channel;

pub type EventReceiver = broadcast::Receiver<Event>;

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a new event bus with the specified capacity
    ///
    /// The capacity determines how many events can be buffered per subscriber
    /// before older events are dropped (if the subscriber is lagging).
    ///
    /// # Example
    ///
    /// ```
    /// use libsyndicast::service::events::EventBus;
    ///
    /// let event_bus = EventBus::new(100);
    /// ```
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Receives every event emitted after subscription
    pub fn subscribe(&self) -> EventReceiver {
        self.sender.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Never blocks. With no subscribers the event is dropped; lagging
    /// subscribers lose the oldest events first.
    pub fn emit(&self, event: Event) {
        // Err only means nobody is listening
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(100)
    }
}

/// Lifecycle events for scheduled posts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A post was appended to an article's schedule
    PostScheduled {
        article_id: String,
        index: usize,
        channel: Channel,
        scheduled_at: DateTime<Utc>,
    },

    /// A post was removed; later indices shifted down by one
    PostCancelled { article_id: String, index: usize },

    /// Guards passed and the publisher is being called
    DispatchStarted {
        article_id: String,
        index: usize,
        channel: Channel,
    },

    PostPublished {
        article_id: String,
        index: usize,
        channel: Channel,
        platform_post_id: String,
    },

    PostFailed {
        article_id: String,
        index: usize,
        channel: Channel,
        error: String,
    },
}

impl Event {
    pub fn article_id(&self) -> &str {
        match self {
            Event::PostScheduled { article_id, .. }
            | Event::PostCancelled { article_id, .. }
            | Event::DispatchStarted { article_id, .. }
            | Event::PostPublished { article_id, .. }
            | Event::PostFailed { article_id, .. } => article_id,
        }
    }
}
