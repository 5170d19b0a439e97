//! Durable delayed execution for scheduled-post dispatches
//!
//! Scheduling enqueues one [`DispatchJob`] per post, due at the post's
//! `scheduled_at`. `synd-send` claims due jobs, runs the dispatch and reports
//! back. Whether a failed job runs again is decided by [`RetryPolicy`]: only
//! storage trouble is retried. A publish failure has already moved the post
//! to `failed`, and a guard failure means the job is a duplicate or stale.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use crate::config::SchedulingConfig;
use crate::db::Database;
use crate::error::{DbError, Result, SyndicastError};
use crate::types::{Channel, ScheduledPost};

/// Event name carried by every dispatch job
pub const DISPATCH_EVENT: &str = "distribution/scheduled-post.dispatch";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchJob {
    pub article_id: String,
    pub channel: Channel,
    pub content: String,
    pub scheduled_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default)]
    pub hashtags: Vec<String>,
    pub scheduled_post_index: usize,
}

impl DispatchJob {
    pub fn for_post(article_id: &str, index: usize, post: &ScheduledPost) -> Self {
        Self {
            article_id: article_id.to_string(),
            channel: post.channel,
            content: post.content.clone(),
            scheduled_at: post.scheduled_at,
            image_url: post.image_url.clone(),
            hashtags: post.hashtags.clone(),
            scheduled_post_index: index,
        }
    }
}

/// Fire-and-forget enqueue of a dispatch for later execution
#[async_trait]
pub trait DelayedExecutor: Send + Sync {
    async fn send(&self, job: DispatchJob) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "running" => JobStatus::Running,
            "done" => JobStatus::Done,
            "failed" => JobStatus::Failed,
            _ => JobStatus::Pending,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A job as stored in the queue
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedJob {
    pub id: String,
    pub job: DispatchJob,
    pub run_at: DateTime<Utc>,
    pub status: JobStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: u64,
    pub running: u64,
    pub done: u64,
    pub failed: u64,
}

/// When (if ever) a failed job runs again
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&SchedulingConfig::default())
    }
}

impl From<&SchedulingConfig> for RetryPolicy {
    fn from(config: &SchedulingConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            retry_delay: Duration::from_secs(config.retry_delay),
        }
    }
}

impl RetryPolicy {
    /// Next run time for a job that failed on its `attempts`-th try, or
    /// `None` when the failure is final
    pub fn retry_at(
        &self,
        error: &SyndicastError,
        attempts: u32,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        if !error.is_retryable() || attempts >= self.max_attempts {
            return None;
        }
        let delay = chrono::Duration::from_std(self.retry_delay).ok()?;
        Some(now + delay)
    }
}

/// SQLite-backed queue sharing the distribution database
#[derive(Clone)]
pub struct JobQueue {
    pool: SqlitePool,
}

fn job_from_row(row: &SqliteRow) -> Result<QueuedJob> {
    let payload: String = row.get("payload");
    let job: DispatchJob = serde_json::from_str(&payload).map_err(DbError::Serialization)?;
    let run_at: i64 = row.get("run_at");
    let attempts: i64 = row.get("attempts");

    Ok(QueuedJob {
        id: row.get("id"),
        job,
        run_at: Utc.timestamp_opt(run_at, 0).single().unwrap_or_default(),
        status: JobStatus::parse(&row.get::<String, _>("status")),
        attempts: u32::try_from(attempts).unwrap_or(0),
        last_error: row.get("last_error"),
    })
}

impl JobQueue {
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }

    /// Enqueue a job to run at `run_at`; returns the job id
    pub async fn enqueue(&self, job: &DispatchJob, run_at: DateTime<Utc>) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let payload = serde_json::to_string(job).map_err(DbError::Serialization)?;
        let now = Utc::now().timestamp();

        sqlx::query(
            r#"
            INSERT INTO dispatch_jobs (id, name, payload, run_at, status, attempts, created_at, updated_at)
            VALUES (?, ?, ?, ?, 'pending', 0, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(DISPATCH_EVENT)
        .bind(payload)
        .bind(run_at.timestamp())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(id)
    }

    pub async fn get(&self, id: &str) -> Result<Option<QueuedJob>> {
        let row = sqlx::query(
            r#"
            SELECT id, payload, run_at, status, attempts, last_error
            FROM dispatch_jobs WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        row.as_ref().map(job_from_row).transpose()
    }

    /// Claim up to `limit` pending jobs due at `now`, oldest first.
    ///
    /// Each claim is a conditional update, so a job is handed to one caller
    /// even if two daemons poll the same database.
    pub async fn claim_due(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<QueuedJob>> {
        let rows = sqlx::query(
            r#"
            SELECT id, payload, run_at, status, attempts, last_error
            FROM dispatch_jobs
            WHERE status = 'pending' AND run_at <= ?
            ORDER BY run_at ASC, created_at ASC
            LIMIT ?
            "#,
        )
        .bind(now.timestamp())
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        let mut claimed = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut job = job_from_row(row)?;

            let result = sqlx::query(
                r#"
                UPDATE dispatch_jobs
                SET status = 'running', attempts = attempts + 1, updated_at = ?
                WHERE id = ? AND status = 'pending'
                "#,
            )
            .bind(Utc::now().timestamp())
            .bind(&job.id)
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

            if result.rows_affected() == 1 {
                job.status = JobStatus::Running;
                job.attempts += 1;
                claimed.push(job);
            }
        }

        Ok(claimed)
    }

    pub async fn complete(&self, id: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE dispatch_jobs SET status = 'done', last_error = NULL, updated_at = ? WHERE id = ?
            "#,
        )
        .bind(Utc::now().timestamp())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    /// Record a failure. With `retry_at` the job goes back to pending for
    /// that time; without it the job is failed for good.
    pub async fn fail(&self, id: &str, error: &str, retry_at: Option<DateTime<Utc>>) -> Result<()> {
        let now = Utc::now().timestamp();
        let query = match retry_at {
            Some(at) => sqlx::query(
                r#"
                UPDATE dispatch_jobs
                SET status = 'pending', run_at = ?, last_error = ?, updated_at = ?
                WHERE id = ?
                "#,
            )
            .bind(at.timestamp()),
            None => sqlx::query(
                r#"
                UPDATE dispatch_jobs
                SET status = 'failed', last_error = ?, updated_at = ?
                WHERE id = ?
                "#,
            ),
        };

        query
            .bind(error)
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(())
    }

    /// Put jobs left `running` by a crashed daemon back to pending
    pub async fn requeue_running(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE dispatch_jobs SET status = 'pending', updated_at = ? WHERE status = 'running'
            "#,
        )
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected())
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM dispatch_jobs GROUP BY status")
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        let mut stats = QueueStats::default();
        for row in rows {
            let count = u64::try_from(row.get::<i64, _>("n")).unwrap_or(0);
            match JobStatus::parse(&row.get::<String, _>("status")) {
                JobStatus::Pending => stats.pending = count,
                JobStatus::Running => stats.running = count,
                JobStatus::Done => stats.done = count,
                JobStatus::Failed => stats.failed = count,
            }
        }
        Ok(stats)
    }
}

#[async_trait]
impl DelayedExecutor for JobQueue {
    async fn send(&self, job: DispatchJob) -> Result<()> {
        let run_at = job.scheduled_at;
        let id = self.enqueue(&job, run_at).await?;
        tracing::debug!(job_id = %id, article_id = %job.article_id, index = job.scheduled_post_index, "dispatch enqueued");
        Ok(())
    }
}

/// Records sent jobs in memory
#[derive(Default)]
pub struct MemoryQueue {
    sent: Mutex<Vec<DispatchJob>>,
    reject: Option<String>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// A queue whose every send fails with `reason`
    pub fn rejecting(reason: &str) -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            reject: Some(reason.to_string()),
        }
    }

    pub fn sent(&self) -> Vec<DispatchJob> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Drain everything sent so far
    pub fn take(&self) -> Vec<DispatchJob> {
        std::mem::take(&mut *self.sent.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

#[async_trait]
impl DelayedExecutor for MemoryQueue {
    async fn send(&self, job: DispatchJob) -> Result<()> {
        if let Some(reason) = &self.reject {
            let io = std::io::Error::new(std::io::ErrorKind::Other, reason.clone());
            return Err(DbError::IoError(io).into());
        }
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(job);
        Ok(())
    }
}
