//! Error types for Syndicast

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SyndicastError>;

#[derive(Error, Debug)]
pub enum SyndicastError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),

    #[error("Dispatch rejected: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Concurrent update conflict: {0}")]
    Conflict(String),
}

impl SyndicastError {
    /// Returns the appropriate exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            SyndicastError::InvalidInput(_) => 3,
            SyndicastError::Config(_) | SyndicastError::Database(_) => 2,
            SyndicastError::Platform(_)
            | SyndicastError::Dispatch(_)
            | SyndicastError::Conflict(_) => 1,
        }
    }

    /// Whether the delayed-execution queue should try the job again.
    ///
    /// Publish failures are final because the scheduled post has already been
    /// moved to its terminal `failed` state. Guard failures are final because
    /// the dispatch itself is a duplicate or stale. A publish whose outcome
    /// was not recorded is final too: running it again would post twice.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyndicastError::Database(_) | SyndicastError::Conflict(_)
        )
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing required field: {0}")]
    MissingField(String),
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database operation failed: {0}")]
    SqlxError(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    MigrationError(#[from] sqlx::migrate::MigrateError),

    #[error("Corrupt record: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

#[derive(Error, Debug, Clone)]
pub enum PlatformError {
    #[error("Channel not configured: {0}")]
    NotConfigured(String),

    #[error("Posting failed: {0}")]
    Posting(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Publish timed out after {0}s")]
    Timeout(u64),

    #[error("Rate limit exceeded: {0}")]
    RateLimit(String),
}

/// Reasons a dispatch ends without recording an outcome. All but
/// `OutcomeNotRecorded` are raised before any publisher is called.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("no scheduled post at index {index} for article {article_id}")]
    MissingEntry { article_id: String, index: usize },

    #[error("scheduled post {index} for article {article_id} is already {status}")]
    AlreadyDispatched {
        article_id: String,
        index: usize,
        status: String,
    },

    #[error("scheduled post {index} for article {article_id} no longer matches the dispatch")]
    StaleDispatch { article_id: String, index: usize },

    #[error("scheduled post {index} for article {article_id} is already being dispatched")]
    InFlight { article_id: String, index: usize },

    /// The platform accepted the post but the store write failed. The id is
    /// kept in memory and recorded by the next dispatch of the entry.
    #[error("scheduled post {index} for article {article_id} was published as {platform_post_id} but not recorded")]
    OutcomeNotRecorded {
        article_id: String,
        index: usize,
        platform_post_id: String,
    },
}
