//! Syndicast - article distribution and social scheduling
//!
//! This library turns articles stored as portable text into plain, Markdown
//! and speech text, gates regeneration and scheduling with per-key
//! cooldowns, recommends posting windows per channel, and schedules copy
//! for LinkedIn, Facebook and Instagram through a durable dispatch queue.

pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod platforms;
pub mod portable_text;
pub mod queue;
pub mod rate_limiter;
pub mod recommend;
pub mod scheduling;
pub mod service;
pub mod store;
pub mod types;

// Re-export commonly used types
pub use config::Config;
pub use db::Database;
pub use error::{Result, SyndicastError};
pub use store::{DistributionStore, MemoryStore};
pub use types::{Channel, Distribution, PostStatus, ScheduledPost};
