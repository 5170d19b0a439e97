//! Service layer for Syndicast
//!
//! `SyndicastService` is the facade the binaries (and any embedder) talk to.
//! It wires the shared pieces together and applies the cooldowns:
//!
//! - `Scheduler`: append, list and cancel scheduled posts
//! - `Dispatcher`: the `scheduled → published | failed` state machine, the
//!   polling sweep and queue draining
//! - `Recommender`: posting-time suggestions
//! - `RateLimiter`: generation and scheduling cooldowns
//! - `EventBus`: lifecycle events
//!
//! # Example
//!
//! ```no_run
//! use chrono::{Duration, Utc};
//! use libsyndicast::service::{ScheduleRequest, SyndicastService};
//! use libsyndicast::types::Channel;
//! use libsyndicast::Config;
//!
//! # async fn example() -> libsyndicast::Result<()> {
//! let config = Config::load()?;
//! let (service, _queue) = SyndicastService::open(&config).await?;
//!
//! let response = service
//!     .schedule(ScheduleRequest {
//!         article_id: "post-42".to_string(),
//!         channel: Channel::Linkedin,
//!         content: "New article is live".to_string(),
//!         scheduled_at: Utc::now() + Duration::hours(2),
//!         image_url: None,
//!         hashtags: vec![],
//!     })
//!     .await;
//! println!("{:?}", response.scheduled_post_id);
//! # Ok(())
//! # }
//! ```

pub mod dispatch;
pub mod events;
pub mod scheduler;
pub mod sweep;

pub use dispatch::Dispatcher;
pub use scheduler::{CancelResponse, ScheduleRequest, ScheduleResponse, Scheduler};
pub use sweep::DispatchReport;

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::info;

use self::events::{EventBus, EventReceiver};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::db::Database;
use crate::error::Result;
use crate::platforms::Publishers;
use crate::queue::{DelayedExecutor, DispatchJob, JobQueue};
use crate::rate_limiter::{generation_key, schedule_key, RateLimitPolicy, RateLimitStatus, RateLimiter};
use crate::recommend::Recommender;
use crate::store::DistributionStore;
use crate::types::{ContentType, ScheduledPost};

pub struct SyndicastService {
    scheduler: Scheduler,
    dispatcher: Dispatcher,
    recommender: Recommender,
    limiter: RateLimiter,
    policy: RateLimitPolicy,
    event_bus: EventBus,
}

impl SyndicastService {
    /// Build a service from its collaborators with default windows and timeout
    pub fn new(
        store: Arc<dyn DistributionStore>,
        executor: Arc<dyn DelayedExecutor>,
        publishers: Publishers,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let event_bus = EventBus::new(100);
        let scheduler = Scheduler::new(
            Arc::clone(&store),
            executor,
            Arc::clone(&clock),
            event_bus.clone(),
        );
        let dispatcher = Dispatcher::new(store, publishers, Arc::clone(&clock), event_bus.clone());

        Self {
            scheduler,
            dispatcher,
            recommender: Recommender::new(Arc::clone(&clock)),
            limiter: RateLimiter::new(clock),
            policy: RateLimitPolicy::default(),
            event_bus,
        }
    }

    /// Open the configured SQLite database and wire webhook publishers.
    ///
    /// Returns the job queue too, for callers that drain it.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migrated, or a
    /// configured webhook is unusable.
    pub async fn open(config: &Config) -> Result<(Self, JobQueue)> {
        let publishers = Publishers::from_config(&config.channels)?;
        Self::open_with_publishers(config, publishers).await
    }

    /// As [`SyndicastService::open`] with an explicit publisher registry
    pub async fn open_with_publishers(
        config: &Config,
        publishers: Publishers,
    ) -> Result<(Self, JobQueue)> {
        let db = Database::new(&config.database.path).await?;
        let queue = JobQueue::new(&db);
        info!(path = %config.database.path, channels = ?publishers.channels(), "service ready");

        let service = Self::new(
            Arc::new(db),
            Arc::new(queue.clone()),
            publishers,
            Arc::new(SystemClock),
        )
        .with_config(config);
        Ok((service, queue))
    }

    /// Apply the cooldown windows and publish timeout from `config`
    pub fn with_config(mut self, config: &Config) -> Self {
        self.policy = RateLimitPolicy::from(&config.rate_limits);
        self.dispatcher = self
            .dispatcher
            .with_publish_timeout(config.scheduling.publish_timeout());
        self
    }

    pub fn with_rate_limits(mut self, policy: RateLimitPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Schedule a post, subject to the per-article scheduling cooldown.
    ///
    /// A cooldown refusal is `success: false` with `retry_after_ms` set.
    /// Only a schedule that lands starts the cooldown; a rejected or failed
    /// request hands it back.
    pub async fn schedule(&self, request: ScheduleRequest) -> ScheduleResponse {
        let key = schedule_key(&request.article_id);
        let status = self.limiter.acquire(&key, self.policy.schedule_window);
        if !status.allowed {
            let retry_after_ms = status.remaining_ms.unwrap_or_default();
            info!(article_id = %request.article_id, retry_after_ms, "schedule rate limited");
            return ScheduleResponse::rate_limited(retry_after_ms);
        }

        let response = self.scheduler.schedule_post(request).await;
        if !response.success {
            self.limiter.release(&key);
        }
        response
    }

    /// Consume the generation cooldown for `content_type` on an article
    pub fn check_generation(&self, content_type: ContentType, article_id: &str) -> RateLimitStatus {
        self.limiter.acquire(
            &generation_key(content_type, article_id),
            self.policy.generation_window,
        )
    }

    /// Peek at the generation cooldown without consuming it
    pub fn generation_status(&self, content_type: ContentType, article_id: &str) -> RateLimitStatus {
        self.limiter.status(
            &generation_key(content_type, article_id),
            self.policy.generation_window,
        )
    }

    pub async fn cancel(&self, article_id: &str, index: usize) -> CancelResponse {
        self.scheduler.cancel_scheduled_post(article_id, index).await
    }

    pub async fn scheduled_posts(&self, article_id: &str) -> Result<Vec<ScheduledPost>> {
        self.scheduler.get_scheduled_posts(article_id).await
    }

    pub async fn dispatch(&self, job: &DispatchJob) -> Result<String> {
        self.dispatcher.dispatch(job).await
    }

    pub async fn sweep_due(&self, now: DateTime<Utc>) -> Result<DispatchReport> {
        self.dispatcher.sweep_due(now).await
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn recommender(&self) -> &Recommender {
        &self.recommender
    }

    /// Subscribe to lifecycle events
    ///
    /// ```no_run
    /// # use libsyndicast::service::SyndicastService;
    /// # async fn example(service: SyndicastService) {
    /// let mut events = service.subscribe();
    /// tokio::spawn(async move {
    ///     while let Ok(event) = events.recv().await {
    ///         println!("Event: {:?}", event);
    ///     }
    /// });
    /// # }
    /// ```
    pub fn subscribe(&self) -> EventReceiver {
        self.event_bus.subscribe()
    }
}
