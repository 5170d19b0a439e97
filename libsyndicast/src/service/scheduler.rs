//! Scheduling, listing and cancelling posts
//!
//! An article's posts live in one index-addressed sequence on its
//! distribution record. Every change is a read-modify-write of the whole
//! sequence guarded by the record's revision; see [`modify_posts`].

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::events::{Event, EventBus};
use crate::clock::Clock;
use crate::error::{Result, SyndicastError};
use crate::queue::{DelayedExecutor, DispatchJob};
use crate::store::{fetch_or_create, DistributionStore};
use crate::types::{scheduled_post_id, Channel, ScheduledPost};

/// Attempts at a revision-checked write before giving up with `Conflict`
pub const MAX_WRITE_ATTEMPTS: usize = 5;

#[derive(Debug, Clone)]
pub struct ScheduleRequest {
    pub article_id: String,
    pub channel: Channel,
    pub content: String,
    pub scheduled_at: DateTime<Utc>,
    pub image_url: Option<String>,
    pub hashtags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduleResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduled_post_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Set when the request was refused by the scheduling cooldown
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl ScheduleResponse {
    fn scheduled(article_id: &str, index: usize) -> Self {
        Self {
            success: true,
            scheduled_post_id: Some(scheduled_post_id(article_id, index)),
            index: Some(index),
            error: None,
            retry_after_ms: None,
        }
    }

    pub(crate) fn failed(error: String) -> Self {
        Self {
            success: false,
            scheduled_post_id: None,
            index: None,
            error: Some(error),
            retry_after_ms: None,
        }
    }

    pub(crate) fn rate_limited(retry_after_ms: u64) -> Self {
        Self {
            retry_after_ms: Some(retry_after_ms),
            ..Self::failed("Rate limited".to_string())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CancelResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Read-modify-write of an article's scheduled posts under the revision check.
///
/// `apply` sees a fresh copy of the sequence on every attempt, so it must
/// re-validate whatever it depends on. An `Err` from `apply` aborts without
/// writing. When `create` is false a missing distribution is an
/// `InvalidInput` error.
pub(crate) async fn modify_posts<T, F>(
    store: &dyn DistributionStore,
    article_id: &str,
    create: bool,
    mut apply: F,
) -> Result<T>
where
    F: FnMut(&mut Vec<ScheduledPost>) -> Result<T>,
{
    for attempt in 1..=MAX_WRITE_ATTEMPTS {
        let distribution = if create {
            fetch_or_create(store, article_id).await?
        } else {
            store.fetch(article_id).await?.ok_or_else(|| {
                SyndicastError::InvalidInput(format!("No distribution for article {}", article_id))
            })?
        };

        let mut posts = distribution.scheduled_posts;
        let value = apply(&mut posts)?;

        if store
            .replace_scheduled_posts(article_id, distribution.revision, &posts)
            .await?
        {
            return Ok(value);
        }
        debug!(article_id, attempt, "revision moved, retrying write");
    }

    Err(SyndicastError::Conflict(format!(
        "scheduled posts for article {} kept changing after {} attempts",
        article_id, MAX_WRITE_ATTEMPTS
    )))
}

#[derive(Clone)]
pub struct Scheduler {
    store: Arc<dyn DistributionStore>,
    executor: Arc<dyn DelayedExecutor>,
    clock: Arc<dyn Clock>,
    events: EventBus,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn DistributionStore>,
        executor: Arc<dyn DelayedExecutor>,
        clock: Arc<dyn Clock>,
        events: EventBus,
    ) -> Self {
        Self {
            store,
            executor,
            clock,
            events,
        }
    }

    /// Append a `scheduled` post and enqueue its dispatch.
    ///
    /// Never returns an error; failures come back as `success: false`.
    pub async fn schedule_post(&self, request: ScheduleRequest) -> ScheduleResponse {
        match self.try_schedule(&request).await {
            Ok(index) => ScheduleResponse::scheduled(&request.article_id, index),
            Err(e) => {
                warn!(article_id = %request.article_id, channel = %request.channel, "schedule failed: {}", e);
                ScheduleResponse::failed(e.to_string())
            }
        }
    }

    async fn try_schedule(&self, request: &ScheduleRequest) -> Result<usize> {
        if request.article_id.trim().is_empty() {
            return Err(SyndicastError::InvalidInput(
                "article id cannot be empty".to_string(),
            ));
        }
        if request.content.trim().is_empty() {
            return Err(SyndicastError::InvalidInput(
                "content cannot be empty".to_string(),
            ));
        }
        if request.scheduled_at <= self.clock.now() {
            return Err(SyndicastError::InvalidInput(
                "scheduled_at must be in the future".to_string(),
            ));
        }

        let mut post = ScheduledPost::new(
            request.channel,
            request.content.clone(),
            request.scheduled_at,
        );
        post.image_url = request.image_url.clone();
        post.hashtags = request.hashtags.clone();

        let index = modify_posts(self.store.as_ref(), &request.article_id, true, |posts| {
            posts.push(post.clone());
            Ok(posts.len() - 1)
        })
        .await?;

        // The entry is durable at this point. If the enqueue is lost the
        // polling sweep still dispatches it once it is due.
        let job = DispatchJob::for_post(&request.article_id, index, &post);
        if let Err(e) = self.executor.send(job).await {
            warn!(article_id = %request.article_id, index, "enqueue failed, leaving it to the sweep: {}", e);
        }

        info!(
            article_id = %request.article_id,
            index,
            channel = %request.channel,
            scheduled_at = %request.scheduled_at,
            "post scheduled"
        );
        self.events.emit(Event::PostScheduled {
            article_id: request.article_id.clone(),
            index,
            channel: request.channel,
            scheduled_at: request.scheduled_at,
        });

        Ok(index)
    }

    /// Remove the entry at `index`; later entries shift down by one
    pub async fn cancel_scheduled_post(&self, article_id: &str, index: usize) -> CancelResponse {
        let result = modify_posts(self.store.as_ref(), article_id, false, |posts| {
            if index >= posts.len() {
                return Err(SyndicastError::InvalidInput(format!(
                    "Invalid index {} for article {} ({} scheduled posts)",
                    index,
                    article_id,
                    posts.len()
                )));
            }
            Ok(posts.remove(index))
        })
        .await;

        match result {
            Ok(removed) => {
                info!(article_id, index, channel = %removed.channel, status = %removed.status, "scheduled post cancelled");
                self.events.emit(Event::PostCancelled {
                    article_id: article_id.to_string(),
                    index,
                });
                CancelResponse {
                    success: true,
                    error: None,
                }
            }
            Err(e) => CancelResponse {
                success: false,
                error: Some(e.to_string()),
            },
        }
    }

    /// The article's current sequence; empty when it has none
    pub async fn get_scheduled_posts(&self, article_id: &str) -> Result<Vec<ScheduledPost>> {
        Ok(self
            .store
            .fetch(article_id)
            .await?
            .map(|distribution| distribution.scheduled_posts)
            .unwrap_or_default())
    }

    /// When the article's last scheduled post goes out, if it has any
    pub async fn latest_scheduled_at(&self, article_id: &str) -> Result<Option<DateTime<Utc>>> {
        let posts = self.get_scheduled_posts(article_id).await?;
        Ok(posts.iter().map(|post| post.scheduled_at).max())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::queue::MemoryQueue;
    use crate::store::MemoryStore;
    use crate::types::{Distribution, PostStatus};
    use async_trait::async_trait;
    use chrono::{Duration, TimeZone};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 2, 8, 0, 0).unwrap()
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        queue: Arc<MemoryQueue>,
        events: EventBus,
        scheduler: Scheduler,
    }

    fn fixture() -> Fixture {
        fixture_with_queue(MemoryQueue::new())
    }

    fn fixture_with_queue(queue: MemoryQueue) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(queue);
        let events = EventBus::new(16);
        let scheduler = Scheduler::new(
            store.clone(),
            queue.clone(),
            Arc::new(ManualClock::new(now())),
            events.clone(),
        );
        Fixture {
            store,
            queue,
            events,
            scheduler,
        }
    }

    fn request(article: &str, channel: Channel, at: DateTime<Utc>) -> ScheduleRequest {
        ScheduleRequest {
            article_id: article.to_string(),
            channel,
            content: format!("New on the blog ({})", channel),
            scheduled_at: at,
            image_url: None,
            hashtags: vec!["rust".to_string()],
        }
    }

    #[tokio::test]
    async fn test_schedule_appends_and_enqueues() {
        let f = fixture();
        let mut events = f.events.subscribe();
        let at = now() + Duration::hours(1);

        let response = f
            .scheduler
            .schedule_post(request("post-42", Channel::Linkedin, at))
            .await;
        assert!(response.success, "{:?}", response.error);
        assert_eq!(response.index, Some(0));
        assert_eq!(response.scheduled_post_id.as_deref(), Some("scheduled-post-42-0"));

        let posts = f.scheduler.get_scheduled_posts("post-42").await.unwrap();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].status, PostStatus::Scheduled);
        assert_eq!(posts[0].hashtags, vec!["rust".to_string()]);

        let jobs = f.queue.sent();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].scheduled_post_index, 0);
        assert_eq!(jobs[0].scheduled_at, at);

        assert!(matches!(
            events.recv().await.unwrap(),
            Event::PostScheduled { index: 0, .. }
        ));
    }

    #[tokio::test]
    async fn test_indices_follow_append_order() {
        let f = fixture();
        for (i, channel) in Channel::ALL.into_iter().enumerate() {
            let response = f
                .scheduler
                .schedule_post(request("a1", channel, now() + Duration::hours(i as i64 + 1)))
                .await;
            assert_eq!(response.index, Some(i));
        }
        assert_eq!(f.scheduler.get_scheduled_posts("a1").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_past_or_present_time_rejected_without_side_effects() {
        let f = fixture();

        for at in [now() - Duration::hours(1), now()] {
            let response = f
                .scheduler
                .schedule_post(request("a1", Channel::Facebook, at))
                .await;
            assert!(!response.success);
            assert_eq!(
                response.error.as_deref(),
                Some("Invalid input: scheduled_at must be in the future")
            );
        }

        assert!(f.store.fetch("a1").await.unwrap().is_none());
        assert!(f.queue.sent().is_empty());
    }

    #[tokio::test]
    async fn test_empty_fields_rejected() {
        let f = fixture();
        let at = now() + Duration::hours(1);

        let mut blank = request("a1", Channel::Linkedin, at);
        blank.content = "  ".to_string();
        assert!(!f.scheduler.schedule_post(blank).await.success);

        let no_article = request("", Channel::Linkedin, at);
        assert!(!f.scheduler.schedule_post(no_article).await.success);
        assert!(f.queue.sent().is_empty());
    }

    #[tokio::test]
    async fn test_enqueue_failure_keeps_entry() {
        let f = fixture_with_queue(MemoryQueue::rejecting("queue offline"));
        let response = f
            .scheduler
            .schedule_post(request("a1", Channel::Instagram, now() + Duration::hours(2)))
            .await;

        assert!(response.success);
        assert_eq!(f.scheduler.get_scheduled_posts("a1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_removes_exactly_one() {
        let f = fixture();
        for h in 1..=3 {
            f.scheduler
                .schedule_post(request("a1", Channel::Linkedin, now() + Duration::hours(h)))
                .await;
        }

        let response = f.scheduler.cancel_scheduled_post("a1", 1).await;
        assert!(response.success);

        let posts = f.scheduler.get_scheduled_posts("a1").await.unwrap();
        assert_eq!(posts.len(), 2);
        assert_eq!(posts[0].scheduled_at, now() + Duration::hours(1));
        assert_eq!(posts[1].scheduled_at, now() + Duration::hours(3));
    }

    #[tokio::test]
    async fn test_cancel_invalid_index_or_article() {
        let f = fixture();
        f.scheduler
            .schedule_post(request("a1", Channel::Linkedin, now() + Duration::hours(1)))
            .await;

        let out_of_range = f.scheduler.cancel_scheduled_post("a1", 5).await;
        assert!(!out_of_range.success);
        assert!(out_of_range.error.unwrap().contains("Invalid index 5"));

        let missing = f.scheduler.cancel_scheduled_post("ghost", 0).await;
        assert!(!missing.success);
        assert!(missing.error.unwrap().contains("No distribution"));

        assert_eq!(f.scheduler.get_scheduled_posts("a1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_get_scheduled_posts_empty_for_unknown_article() {
        let f = fixture();
        assert!(f.scheduler.get_scheduled_posts("nope").await.unwrap().is_empty());
        assert_eq!(f.scheduler.latest_scheduled_at("nope").await.unwrap(), None);
    }

    /// Store that lets a rival writer bump the revision before each of our
    /// first `interference` writes
    struct ContendedStore {
        inner: MemoryStore,
        interference: AtomicUsize,
    }

    #[async_trait]
    impl DistributionStore for ContendedStore {
        async fn fetch(&self, article_id: &str) -> Result<Option<Distribution>> {
            self.inner.fetch(article_id).await
        }

        async fn create(&self, article_id: &str) -> Result<Distribution> {
            self.inner.create(article_id).await
        }

        async fn replace_scheduled_posts(
            &self,
            article_id: &str,
            expected_revision: i64,
            posts: &[ScheduledPost],
        ) -> Result<bool> {
            if self.interference.load(Ordering::SeqCst) > 0 {
                self.interference.fetch_sub(1, Ordering::SeqCst);
                let current = self.inner.fetch(article_id).await?.unwrap();
                let mut rival = current.scheduled_posts.clone();
                rival.push(ScheduledPost::new(
                    Channel::Facebook,
                    "rival".to_string(),
                    now() + Duration::days(1),
                ));
                self.inner
                    .replace_scheduled_posts(article_id, current.revision, &rival)
                    .await?;
            }
            self.inner
                .replace_scheduled_posts(article_id, expected_revision, posts)
                .await
        }

        async fn due_posts(&self, now: DateTime<Utc>) -> Result<Vec<crate::types::DuePost>> {
            self.inner.due_posts(now).await
        }
    }

    #[tokio::test]
    async fn test_conflict_retry_keeps_both_writes() {
        let store = ContendedStore {
            inner: MemoryStore::new(),
            interference: AtomicUsize::new(2),
        };
        let posts = modify_posts(&store, "a1", true, |posts| {
            posts.push(ScheduledPost::new(
                Channel::Linkedin,
                "ours".to_string(),
                now() + Duration::hours(1),
            ));
            Ok(posts.len() - 1)
        })
        .await
        .unwrap();

        // two rival writes landed first
        assert_eq!(posts, 2);
        let stored = store.inner.fetch("a1").await.unwrap().unwrap();
        let contents: Vec<_> = stored.scheduled_posts.iter().map(|p| p.content.as_str()).collect();
        assert_eq!(contents, vec!["rival", "rival", "ours"]);
    }

    #[tokio::test]
    async fn test_conflict_gives_up_after_bounded_attempts() {
        let store = ContendedStore {
            inner: MemoryStore::new(),
            interference: AtomicUsize::new(usize::MAX),
        };
        let result = modify_posts(&store, "a1", true, |posts| {
            posts.clear();
            Ok(())
        })
        .await;

        let err = result.unwrap_err();
        assert!(matches!(err, SyndicastError::Conflict(_)));
        assert!(err.is_retryable());
    }
}
