//! SQLite storage for distributions
//!
//! The scheduled-post sequence is kept as a JSON array on the article's row.
//! The `revision` column is the optimistic-concurrency token: every write is
//! an `UPDATE ... WHERE revision = ?`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use std::path::Path;

use crate::error::{DbError, Result};
use crate::store::{collect_due, DistributionStore};
use crate::types::{Distribution, DuePost, ScheduledPost};

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if needed) the database file and run migrations
    pub async fn new(db_path: &str) -> Result<Self> {
        let expanded_path = shellexpand::tilde(db_path).to_string();
        let path = Path::new(&expanded_path);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(DbError::IoError)?;
        }

        // Forward slashes work on every platform; mode=rwc creates the file
        let db_url = format!("sqlite://{}?mode=rwc", expanded_path.replace('\\', "/"));

        let pool = SqlitePool::connect(&db_url)
            .await
            .map_err(DbError::SqlxError)?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(DbError::MigrationError)?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn distribution_from_row(row: &SqliteRow) -> Result<Distribution> {
    let posts: String = row.get("scheduled_posts");
    let scheduled_posts: Vec<ScheduledPost> =
        serde_json::from_str(&posts).map_err(DbError::Serialization)?;

    Ok(Distribution {
        article_id: row.get("article_id"),
        revision: row.get("revision"),
        scheduled_posts,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

#[async_trait]
impl DistributionStore for Database {
    async fn fetch(&self, article_id: &str) -> Result<Option<Distribution>> {
        let row = sqlx::query(
            r#"
            SELECT article_id, revision, scheduled_posts, created_at, updated_at
            FROM distributions WHERE article_id = ?
            "#,
        )
        .bind(article_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        row.as_ref().map(distribution_from_row).transpose()
    }

    async fn create(&self, article_id: &str) -> Result<Distribution> {
        let now = Utc::now().timestamp();

        // Losing a creation race is fine: the existing row is returned
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO distributions (article_id, revision, scheduled_posts, created_at, updated_at)
            VALUES (?, 0, '[]', ?, ?)
            "#,
        )
        .bind(article_id)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        self.fetch(article_id)
            .await?
            .ok_or_else(|| DbError::SqlxError(sqlx::Error::RowNotFound).into())
    }

    async fn replace_scheduled_posts(
        &self,
        article_id: &str,
        expected_revision: i64,
        posts: &[ScheduledPost],
    ) -> Result<bool> {
        let payload = serde_json::to_string(posts).map_err(DbError::Serialization)?;

        let result = sqlx::query(
            r#"
            UPDATE distributions
            SET scheduled_posts = ?, revision = revision + 1, updated_at = ?
            WHERE article_id = ? AND revision = ?
            "#,
        )
        .bind(payload)
        .bind(Utc::now().timestamp())
        .bind(article_id)
        .bind(expected_revision)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    async fn due_posts(&self, now: DateTime<Utc>) -> Result<Vec<DuePost>> {
        // Narrow in SQL to rows holding any scheduled entry, then filter by time
        let rows = sqlx::query(
            r#"
            SELECT article_id, revision, scheduled_posts, created_at, updated_at
            FROM distributions
            WHERE scheduled_posts LIKE '%"status":"scheduled"%'
            ORDER BY article_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        let mut due = Vec::new();
        for row in &rows {
            due.extend(collect_due(&distribution_from_row(row)?, now));
        }
        Ok(due)
    }
}
