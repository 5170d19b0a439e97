//! Dispatch of due scheduled posts
//!
//! A dispatch moves one entry from `scheduled` to `published` or `failed`.
//! Before any publisher is called the entry must still exist at the job's
//! index, still be `scheduled`, and still be the post the job was created
//! for (same channel and time). A cancel shifts later indices down, and such
//! a job is stale. Within one process a second dispatch of the same
//! `(article, index)` is refused while the first is running.
//!
//! When the platform accepts a post but the store write fails, the platform
//! post id is remembered and the next dispatch of the same entry records it
//! instead of publishing again.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, info, warn};

use super::events::{Event, EventBus};
use super::scheduler::modify_posts;
use crate::clock::Clock;
use crate::error::{DispatchError, PlatformError, Result, SyndicastError};
use crate::platforms::{PublishRequest, Publishers};
use crate::queue::DispatchJob;
use crate::store::DistributionStore;
use crate::types::{scheduled_post_id, Channel, PostStatus, ScheduledPost};

pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(30);

type InFlight = Arc<Mutex<HashSet<(String, usize)>>>;

/// A publish the platform accepted but the store never recorded
#[derive(Debug, Clone)]
struct UnrecordedPublish {
    channel: Channel,
    scheduled_at: DateTime<Utc>,
    platform_post_id: String,
}

type Unrecorded = Arc<Mutex<HashMap<(String, usize), UnrecordedPublish>>>;

/// Holds an `(article, index)` slot in the in-flight set until dropped
struct InFlightGuard {
    set: InFlight,
    key: (String, usize),
}

impl InFlightGuard {
    fn acquire(set: &InFlight, article_id: &str, index: usize) -> Option<Self> {
        let key = (article_id.to_string(), index);
        let inserted = set
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.clone());
        inserted.then(|| Self {
            set: Arc::clone(set),
            key,
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.key);
    }
}

/// Guard checks against the entry currently stored at the job's index
pub(crate) fn check_entry(
    job: &DispatchJob,
    posts: &[ScheduledPost],
) -> std::result::Result<(), DispatchError> {
    let index = job.scheduled_post_index;
    let entry = posts.get(index).ok_or_else(|| DispatchError::MissingEntry {
        article_id: job.article_id.clone(),
        index,
    })?;

    if entry.channel != job.channel || entry.scheduled_at != job.scheduled_at {
        return Err(DispatchError::StaleDispatch {
            article_id: job.article_id.clone(),
            index,
        });
    }

    if entry.status != PostStatus::Scheduled {
        return Err(DispatchError::AlreadyDispatched {
            article_id: job.article_id.clone(),
            index,
            status: entry.status.to_string(),
        });
    }

    Ok(())
}

#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<dyn DistributionStore>,
    publishers: Publishers,
    clock: Arc<dyn Clock>,
    events: EventBus,
    publish_timeout: Duration,
    in_flight: InFlight,
    unrecorded: Unrecorded,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn DistributionStore>,
        publishers: Publishers,
        clock: Arc<dyn Clock>,
        events: EventBus,
    ) -> Self {
        Self {
            store,
            publishers,
            clock,
            events,
            publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            unrecorded: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    pub fn store(&self) -> &dyn DistributionStore {
        self.store.as_ref()
    }

    /// Publish the job's post and record the outcome.
    ///
    /// Returns the platform post id. A publish failure or timeout marks the
    /// entry `failed` and is returned as the error. Guard failures are
    /// returned as `SyndicastError::Dispatch` with nothing changed.
    ///
    /// A successful publish is never reported as a retryable error. If its
    /// outcome cannot be written the result is `OutcomeNotRecorded`, and the
    /// next dispatch of the entry writes it without calling the publisher.
    pub async fn dispatch(&self, job: &DispatchJob) -> Result<String> {
        let index = job.scheduled_post_index;
        let _guard = InFlightGuard::acquire(&self.in_flight, &job.article_id, index).ok_or_else(
            || DispatchError::InFlight {
                article_id: job.article_id.clone(),
                index,
            },
        )?;

        let distribution = self.store.fetch(&job.article_id).await?.ok_or_else(|| {
            DispatchError::MissingEntry {
                article_id: job.article_id.clone(),
                index,
            }
        })?;
        check_entry(job, &distribution.scheduled_posts)?;
        let entry = &distribution.scheduled_posts[index];

        let outcome = match self.take_unrecorded(job) {
            Some(platform_post_id) => {
                info!(article_id = %job.article_id, index, %platform_post_id, "recording earlier publish");
                Ok(platform_post_id)
            }
            None => {
                self.events.emit(Event::DispatchStarted {
                    article_id: job.article_id.clone(),
                    index,
                    channel: entry.channel,
                });

                let request = PublishRequest {
                    post_id: scheduled_post_id(&job.article_id, index),
                    content: entry.content.clone(),
                    image_url: entry.image_url.clone(),
                    hashtags: entry.hashtags.clone(),
                };
                self.publish(&request, job).await
            }
        };

        let recorded_at = self.clock.now();
        let write = modify_posts(self.store.as_ref(), &job.article_id, false, |posts| {
            // Re-checked on every attempt: a rival write may have moved the entry
            if check_entry(job, posts).is_err() {
                return Ok(false);
            }
            let entry = &mut posts[index];
            match &outcome {
                Ok(platform_post_id) => entry.mark_published(platform_post_id.clone(), recorded_at),
                Err(e) => entry.mark_failed(e.to_string()),
            }
            Ok(true)
        })
        .await;

        let recorded = match (write, &outcome) {
            (Ok(recorded), _) => recorded,
            (Err(e), Ok(platform_post_id)) => {
                error!(
                    article_id = %job.article_id,
                    index,
                    %platform_post_id,
                    "published but the outcome was not recorded: {}", e
                );
                self.remember_unrecorded(job, platform_post_id);
                return Err(DispatchError::OutcomeNotRecorded {
                    article_id: job.article_id.clone(),
                    index,
                    platform_post_id: platform_post_id.clone(),
                }
                .into());
            }
            (Err(e), Err(_)) => return Err(e),
        };

        if !recorded {
            warn!(
                article_id = %job.article_id,
                index,
                "entry changed while publishing, outcome not recorded"
            );
        }

        match outcome {
            Ok(platform_post_id) => {
                info!(article_id = %job.article_id, index, channel = %job.channel, %platform_post_id, "post published");
                self.events.emit(Event::PostPublished {
                    article_id: job.article_id.clone(),
                    index,
                    channel: job.channel,
                    platform_post_id: platform_post_id.clone(),
                });
                Ok(platform_post_id)
            }
            Err(e) => {
                warn!(article_id = %job.article_id, index, channel = %job.channel, "publish failed: {}", e);
                self.events.emit(Event::PostFailed {
                    article_id: job.article_id.clone(),
                    index,
                    channel: job.channel,
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Take a remembered publish for the job's entry, if it is the same post
    fn take_unrecorded(&self, job: &DispatchJob) -> Option<String> {
        let mut unrecorded = self.unrecorded.lock().unwrap_or_else(|e| e.into_inner());
        let key = (job.article_id.clone(), job.scheduled_post_index);
        let matches = unrecorded
            .get(&key)
            .is_some_and(|p| p.channel == job.channel && p.scheduled_at == job.scheduled_at);
        if matches {
            unrecorded.remove(&key).map(|p| p.platform_post_id)
        } else {
            None
        }
    }

    fn remember_unrecorded(&self, job: &DispatchJob, platform_post_id: &str) {
        self.unrecorded
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                (job.article_id.clone(), job.scheduled_post_index),
                UnrecordedPublish {
                    channel: job.channel,
                    scheduled_at: job.scheduled_at,
                    platform_post_id: platform_post_id.to_string(),
                },
            );
    }

    async fn publish(&self, request: &PublishRequest, job: &DispatchJob) -> Result<String> {
        let publisher = self.publishers.get(job.channel).ok_or_else(|| {
            PlatformError::NotConfigured(format!("no publisher for {}", job.channel))
        })?;

        match tokio::time::timeout(self.publish_timeout, publisher.publish(request)).await {
            Ok(result) => result,
            Err(_) => Err(SyndicastError::Platform(PlatformError::Timeout(
                self.publish_timeout.as_secs(),
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::platforms::mock::MockPublisher;
    use crate::store::MemoryStore;
    use crate::error::DbError;
    use crate::types::{Channel, Distribution};
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn at(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 2, h, 0, 0).unwrap()
    }

    fn seed(store: &MemoryStore, posts: Vec<ScheduledPost>) {
        let mut distribution = Distribution::new("a1");
        distribution.scheduled_posts = posts;
        store.insert(distribution);
    }

    fn dispatcher(store: Arc<MemoryStore>, publisher: Arc<MockPublisher>) -> Dispatcher {
        Dispatcher::new(
            store,
            Publishers::new().with(publisher),
            Arc::new(ManualClock::new(at(12))),
            EventBus::new(16),
        )
    }

    fn job_for(posts: &[ScheduledPost], index: usize) -> DispatchJob {
        DispatchJob::for_post("a1", index, &posts[index])
    }

    #[tokio::test]
    async fn test_publish_success_marks_published() {
        let store = Arc::new(MemoryStore::new());
        let mut post = ScheduledPost::new(Channel::Linkedin, "Hello".to_string(), at(9));
        post.image_url = Some("https://cdn.example.com/a.png".to_string());
        let posts = vec![post];
        seed(&store, posts.clone());

        let publisher = Arc::new(MockPublisher::success(Channel::Linkedin));
        let dispatcher = dispatcher(store.clone(), publisher.clone());
        let mut events = dispatcher.events.subscribe();

        let id = dispatcher.dispatch(&job_for(&posts, 0)).await.unwrap();
        assert!(id.starts_with("linkedin:mock-"));

        let stored = store.fetch("a1").await.unwrap().unwrap();
        let entry = &stored.scheduled_posts[0];
        assert_eq!(entry.status, PostStatus::Published);
        assert_eq!(entry.platform_post_id.as_deref(), Some(id.as_str()));
        assert_eq!(entry.published_at, Some(at(12)));

        let sent = publisher.published();
        assert_eq!(sent[0].post_id, "scheduled-a1-0");
        assert_eq!(sent[0].image_url.as_deref(), Some("https://cdn.example.com/a.png"));

        assert!(matches!(events.recv().await.unwrap(), Event::DispatchStarted { .. }));
        assert!(matches!(events.recv().await.unwrap(), Event::PostPublished { .. }));
    }

    #[tokio::test]
    async fn test_publish_failure_marks_failed_and_returns_error() {
        let store = Arc::new(MemoryStore::new());
        let posts = vec![ScheduledPost::new(Channel::Facebook, "Hi".to_string(), at(9))];
        seed(&store, posts.clone());

        let publisher = Arc::new(MockPublisher::post_failure(Channel::Facebook, "token expired"));
        let dispatcher = dispatcher(store.clone(), publisher);

        let err = dispatcher.dispatch(&job_for(&posts, 0)).await.unwrap_err();
        assert!(!err.is_retryable());

        let entry = &store.fetch("a1").await.unwrap().unwrap().scheduled_posts[0];
        assert_eq!(entry.status, PostStatus::Failed);
        assert_eq!(entry.error.as_deref(), Some("Platform error: Posting failed: token expired"));
    }

    #[tokio::test]
    async fn test_second_dispatch_does_not_publish_again() {
        let store = Arc::new(MemoryStore::new());
        let posts = vec![ScheduledPost::new(Channel::Linkedin, "Once".to_string(), at(9))];
        seed(&store, posts.clone());

        let publisher = Arc::new(MockPublisher::success(Channel::Linkedin));
        let dispatcher = dispatcher(store.clone(), publisher.clone());
        let job = job_for(&posts, 0);

        dispatcher.dispatch(&job).await.unwrap();
        let err = dispatcher.dispatch(&job).await.unwrap_err();

        assert!(matches!(
            err,
            SyndicastError::Dispatch(DispatchError::AlreadyDispatched { ref status, .. }) if status == "published"
        ));
        assert_eq!(publisher.publish_call_count(), 1);
    }

    #[tokio::test]
    async fn test_missing_entry() {
        let store = Arc::new(MemoryStore::new());
        let posts = vec![ScheduledPost::new(Channel::Linkedin, "x".to_string(), at(9))];
        let publisher = Arc::new(MockPublisher::success(Channel::Linkedin));
        let dispatcher = dispatcher(store.clone(), publisher.clone());

        // no distribution at all
        let err = dispatcher.dispatch(&job_for(&posts, 0)).await.unwrap_err();
        assert!(matches!(err, SyndicastError::Dispatch(DispatchError::MissingEntry { .. })));

        // distribution without that index
        seed(&store, posts.clone());
        let mut job = job_for(&posts, 0);
        job.scheduled_post_index = 3;
        let err = dispatcher.dispatch(&job).await.unwrap_err();
        assert!(matches!(err, SyndicastError::Dispatch(DispatchError::MissingEntry { index: 3, .. })));
        assert_eq!(publisher.publish_call_count(), 0);
    }

    #[tokio::test]
    async fn test_index_shifted_by_cancel_is_stale() {
        let store = Arc::new(MemoryStore::new());
        let posts = vec![
            ScheduledPost::new(Channel::Linkedin, "first".to_string(), at(9)),
            ScheduledPost::new(Channel::Linkedin, "second".to_string(), at(10)),
        ];
        seed(&store, posts.clone());
        let job = job_for(&posts, 1);

        // cancel index 0; the job for index 1 now points past the end
        seed(&store, vec![posts[1].clone()]);
        let publisher = Arc::new(MockPublisher::success(Channel::Linkedin));
        let dispatcher = dispatcher(store.clone(), publisher.clone());
        assert!(dispatcher.dispatch(&job).await.is_err());

        // and a job for the old index 0 now sees a different post
        let err = dispatcher.dispatch(&job_for(&posts, 0)).await.unwrap_err();
        assert!(matches!(err, SyndicastError::Dispatch(DispatchError::StaleDispatch { .. })));
        assert_eq!(publisher.publish_call_count(), 0);
        assert_eq!(
            store.fetch("a1").await.unwrap().unwrap().scheduled_posts[0].status,
            PostStatus::Scheduled
        );
    }

    #[tokio::test]
    async fn test_concurrent_duplicate_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let posts = vec![ScheduledPost::new(Channel::Instagram, "slow".to_string(), at(9))];
        seed(&store, posts.clone());

        let publisher = Arc::new(MockPublisher::with_delay(
            Channel::Instagram,
            Duration::from_millis(100),
        ));
        let dispatcher = dispatcher(store.clone(), publisher.clone());
        let job = job_for(&posts, 0);

        let (first, second) = tokio::join!(dispatcher.dispatch(&job), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            dispatcher.dispatch(&job).await
        });

        assert!(first.is_ok());
        assert!(matches!(
            second.unwrap_err(),
            SyndicastError::Dispatch(DispatchError::InFlight { .. })
        ));
        assert_eq!(publisher.publish_call_count(), 1);
    }

    #[tokio::test]
    async fn test_timeout_is_a_publish_failure() {
        let store = Arc::new(MemoryStore::new());
        let posts = vec![ScheduledPost::new(Channel::Linkedin, "slow".to_string(), at(9))];
        seed(&store, posts.clone());

        let publisher = Arc::new(MockPublisher::with_delay(Channel::Linkedin, Duration::from_secs(5)));
        let dispatcher =
            dispatcher(store.clone(), publisher).with_publish_timeout(Duration::from_millis(50));

        let err = dispatcher.dispatch(&job_for(&posts, 0)).await.unwrap_err();
        assert!(matches!(err, SyndicastError::Platform(PlatformError::Timeout(_))));

        let entry = &store.fetch("a1").await.unwrap().unwrap().scheduled_posts[0];
        assert_eq!(entry.status, PostStatus::Failed);
        assert!(entry.error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_unconfigured_channel_fails_the_post() {
        let store = Arc::new(MemoryStore::new());
        let posts = vec![ScheduledPost::new(Channel::Facebook, "x".to_string(), at(9))];
        seed(&store, posts.clone());

        // only a LinkedIn publisher is registered
        let publisher = Arc::new(MockPublisher::success(Channel::Linkedin));
        let dispatcher = dispatcher(store.clone(), publisher);

        let err = dispatcher.dispatch(&job_for(&posts, 0)).await.unwrap_err();
        assert!(err.to_string().contains("no publisher for facebook"));
        assert_eq!(
            store.fetch("a1").await.unwrap().unwrap().scheduled_posts[0].status,
            PostStatus::Failed
        );
    }

    /// Fails the next `failures` writes, then behaves like the inner store
    struct FlakyStore {
        inner: MemoryStore,
        failures: AtomicUsize,
    }

    impl FlakyStore {
        fn failing_writes(failures: usize) -> Self {
            Self {
                inner: MemoryStore::new(),
                failures: AtomicUsize::new(failures),
            }
        }
    }

    #[async_trait]
    impl DistributionStore for FlakyStore {
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
            let failing = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                let io = std::io::Error::new(std::io::ErrorKind::Other, "disk busy");
                return Err(DbError::IoError(io).into());
            }
            self.inner
                .replace_scheduled_posts(article_id, expected_revision, posts)
                .await
        }

        async fn due_posts(&self, now: DateTime<Utc>) -> Result<Vec<crate::types::DuePost>> {
            self.inner.due_posts(now).await
        }
    }

    fn flaky_dispatcher(store: Arc<FlakyStore>, publisher: Arc<MockPublisher>) -> Dispatcher {
        Dispatcher::new(
            store,
            Publishers::new().with(publisher),
            Arc::new(ManualClock::new(at(12))),
            EventBus::new(16),
        )
    }

    #[tokio::test]
    async fn test_unrecorded_publish_is_recorded_without_publishing_again() {
        let store = Arc::new(FlakyStore::failing_writes(1));
        let posts = vec![ScheduledPost::new(Channel::Linkedin, "Once".to_string(), at(9))];
        seed(&store.inner, posts.clone());

        let publisher = Arc::new(MockPublisher::success(Channel::Linkedin));
        let dispatcher = flaky_dispatcher(store.clone(), publisher.clone());
        let job = job_for(&posts, 0);

        let err = dispatcher.dispatch(&job).await.unwrap_err();
        assert!(!err.is_retryable());
        let platform_post_id = match err {
            SyndicastError::Dispatch(DispatchError::OutcomeNotRecorded {
                platform_post_id, ..
            }) => platform_post_id,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(publisher.publish_call_count(), 1);
        assert_eq!(
            store.fetch("a1").await.unwrap().unwrap().scheduled_posts[0].status,
            PostStatus::Scheduled
        );

        let id = dispatcher.dispatch(&job).await.unwrap();
        assert_eq!(id, platform_post_id);
        assert_eq!(publisher.publish_call_count(), 1);

        let entry = &store.fetch("a1").await.unwrap().unwrap().scheduled_posts[0];
        assert_eq!(entry.status, PostStatus::Published);
        assert_eq!(entry.platform_post_id.as_deref(), Some(platform_post_id.as_str()));
    }

    #[tokio::test]
    async fn test_sweep_records_unrecorded_publish() {
        let store = Arc::new(FlakyStore::failing_writes(1));
        let posts = vec![ScheduledPost::new(Channel::Linkedin, "Once".to_string(), at(9))];
        seed(&store.inner, posts);

        let publisher = Arc::new(MockPublisher::success(Channel::Linkedin));
        let dispatcher = flaky_dispatcher(store.clone(), publisher.clone());

        let first = dispatcher.sweep_due(at(12)).await.unwrap();
        assert_eq!(first.errored, 1);
        assert_eq!(first.published, 0);

        // The entry is still due, but the publisher is not called again
        let second = dispatcher.sweep_due(at(12)).await.unwrap();
        assert_eq!(second.published, 1);
        assert_eq!(publisher.publish_call_count(), 1);
        assert_eq!(
            store.fetch("a1").await.unwrap().unwrap().scheduled_posts[0].status,
            PostStatus::Published
        );
    }

    #[tokio::test]
    async fn test_failed_publish_with_failed_write_stays_retryable() {
        let store = Arc::new(FlakyStore::failing_writes(1));
        let posts = vec![ScheduledPost::new(Channel::Facebook, "x".to_string(), at(9))];
        seed(&store.inner, posts.clone());

        let publisher = Arc::new(MockPublisher::post_failure(Channel::Facebook, "rejected"));
        let dispatcher = flaky_dispatcher(store.clone(), publisher);

        let err = dispatcher.dispatch(&job_for(&posts, 0)).await.unwrap_err();
        assert!(matches!(err, SyndicastError::Database(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_in_flight_guard_releases_on_drop() {
        let set: InFlight = Arc::new(Mutex::new(HashSet::new()));
        let guard = InFlightGuard::acquire(&set, "a1", 0);
        assert!(guard.is_some());
        assert!(InFlightGuard::acquire(&set, "a1", 0).is_none());
        assert!(InFlightGuard::acquire(&set, "a1", 1).is_some());

        drop(guard);
        assert!(InFlightGuard::acquire(&set, "a1", 0).is_some());
    }
}
