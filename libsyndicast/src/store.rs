//! Distribution storage
//!
//! The scheduled-post sequence of an article is read and written as a whole.
//! Writes carry the revision the writer read; a store refuses the write when
//! the revision has moved, and the writer re-reads and tries again.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::Result;
use crate::types::{Distribution, DuePost, PostStatus, ScheduledPost};

#[async_trait]
pub trait DistributionStore: Send + Sync {
    async fn fetch(&self, article_id: &str) -> Result<Option<Distribution>>;

    /// Create an empty distribution for the article. Returns the stored record,
    /// which is the existing one if another writer created it first.
    async fn create(&self, article_id: &str) -> Result<Distribution>;

    /// Replace the whole scheduled-post sequence.
    ///
    /// Returns `false` without writing when the stored revision is no longer
    /// `expected_revision` (or the record is gone). A successful write bumps
    /// the revision by one.
    async fn replace_scheduled_posts(
        &self,
        article_id: &str,
        expected_revision: i64,
        posts: &[ScheduledPost],
    ) -> Result<bool>;

    /// Every `scheduled` entry with `scheduled_at <= now`, ordered by article
    /// then index
    async fn due_posts(&self, now: DateTime<Utc>) -> Result<Vec<DuePost>>;
}

/// Fetch the article's distribution, creating it when absent
pub async fn fetch_or_create(store: &dyn DistributionStore, article_id: &str) -> Result<Distribution> {
    match store.fetch(article_id).await? {
        Some(distribution) => Ok(distribution),
        None => store.create(article_id).await,
    }
}

pub(crate) fn collect_due(distribution: &Distribution, now: DateTime<Utc>) -> Vec<DuePost> {
    distribution
        .scheduled_posts
        .iter()
        .enumerate()
        .filter(|(_, post)| post.status == PostStatus::Scheduled && post.scheduled_at <= now)
        .map(|(index, post)| DuePost {
            article_id: distribution.article_id.clone(),
            index,
            post: post.clone(),
        })
        .collect()
}

/// In-process store for tests and embedding
#[derive(Default)]
pub struct MemoryStore {
    distributions: Mutex<HashMap<String, Distribution>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Put a record as-is, replacing any existing one
    pub fn insert(&self, distribution: Distribution) {
        self.lock()
            .insert(distribution.article_id.clone(), distribution);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Distribution>> {
        self.distributions.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl DistributionStore for MemoryStore {
    async fn fetch(&self, article_id: &str) -> Result<Option<Distribution>> {
        Ok(self.lock().get(article_id).cloned())
    }

    async fn create(&self, article_id: &str) -> Result<Distribution> {
        let mut distributions = self.lock();
        let distribution = distributions
            .entry(article_id.to_string())
            .or_insert_with(|| Distribution::new(article_id));
        Ok(distribution.clone())
    }

    async fn replace_scheduled_posts(
        &self,
        article_id: &str,
        expected_revision: i64,
        posts: &[ScheduledPost],
    ) -> Result<bool> {
        let mut distributions = self.lock();
        let Some(distribution) = distributions.get_mut(article_id) else {
            return Ok(false);
        };
        if distribution.revision != expected_revision {
            return Ok(false);
        }

        distribution.scheduled_posts = posts.to_vec();
        distribution.revision += 1;
        distribution.updated_at = Utc::now().timestamp();
        Ok(true)
    }

    async fn due_posts(&self, now: DateTime<Utc>) -> Result<Vec<DuePost>> {
        let distributions = self.lock();
        let mut article_ids: Vec<_> = distributions.keys().collect();
        article_ids.sort();

        Ok(article_ids
            .into_iter()
            .filter_map(|id| distributions.get(id))
            .flat_map(|distribution| collect_due(distribution, now))
            .collect())
    }
}
