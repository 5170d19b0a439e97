//! Cooldown tracking for generation and scheduling requests
//!
//! A key may act once per window. The window is supplied on every call, so
//! one limiter serves every policy: regenerating LinkedIn copy for an article
//! (`linkedin:<article>`) and scheduling posts for it (`schedule:<article>`)
//! are tracked side by side with different windows.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::clock::Clock;
use crate::config::RateLimitConfig;
use crate::types::ContentType;

/// Outcome of a cooldown check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitStatus {
    pub allowed: bool,
    /// Milliseconds until the key may act again; absent when allowed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_ms: Option<u64>,
}

impl RateLimitStatus {
    fn allowed() -> Self {
        Self {
            allowed: true,
            remaining_ms: None,
        }
    }
}

/// In-memory key → last-allowed-time map
pub struct RateLimiter {
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl RateLimiter {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Allow and record, or deny without touching state.
    ///
    /// The lookup and the write happen under one lock with no await point,
    /// so two concurrent callers can never both be allowed inside a window.
    pub fn check_and_record(&self, key: &str, window: Duration) -> bool {
        let now = self.clock.now();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());

        if remaining(entries.get(key), now, window).is_some() {
            return false;
        }

        entries.insert(key.to_string(), now);
        true
    }

    /// Read-only view of a key's cooldown
    pub fn status(&self, key: &str, window: Duration) -> RateLimitStatus {
        let now = self.clock.now();
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());

        match remaining(entries.get(key), now, window) {
            Some(left) => RateLimitStatus {
                allowed: false,
                remaining_ms: Some(left),
            },
            None => RateLimitStatus::allowed(),
        }
    }

    /// Check-and-record, reporting the remaining cooldown on denial
    pub fn acquire(&self, key: &str, window: Duration) -> RateLimitStatus {
        if self.check_and_record(key, window) {
            RateLimitStatus::allowed()
        } else {
            self.status(key, window)
        }
    }

    /// Drop the hit recorded by a successful `acquire` whose action then
    /// did not happen. Any earlier hit for the key had already expired, so
    /// removing the entry leaves the key as it was before.
    pub fn release(&self, key: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.remove(key);
    }
}

/// Milliseconds left in the window, or `None` if the key may act
fn remaining(last: Option<&DateTime<Utc>>, now: DateTime<Utc>, window: Duration) -> Option<u64> {
    let last = last?;
    let window_ms = u64::try_from(window.as_millis()).unwrap_or(u64::MAX);
    // A clock that stepped backwards counts as no time elapsed.
    let elapsed_ms = u64::try_from((now - *last).num_milliseconds()).unwrap_or(0);

    if elapsed_ms >= window_ms {
        None
    } else {
        Some(window_ms - elapsed_ms)
    }
}

/// Windows and key conventions used by the service layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    pub generation_window: Duration,
    pub schedule_window: Duration,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self::from(&RateLimitConfig::default())
    }
}

impl From<&RateLimitConfig> for RateLimitPolicy {
    fn from(config: &RateLimitConfig) -> Self {
        Self {
            generation_window: Duration::from_secs(config.generation_window),
            schedule_window: Duration::from_secs(config.schedule_window),
        }
    }
}

pub fn generation_key(content_type: ContentType, article_id: &str) -> String {
    format!("{}:{}", content_type, article_id)
}

pub fn schedule_key(article_id: &str) -> String {
    format!("schedule:{}", article_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;

    fn test_limiter() -> (Arc<ManualClock>, RateLimiter) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap(),
        ));
        let limiter = RateLimiter::new(clock.clone());
        (clock, limiter)
    }

    const SECOND: Duration = Duration::from_millis(1000);

    #[test]
    fn test_allows_first_call() {
        let (_clock, limiter) = test_limiter();
        assert!(limiter.check_and_record("k", SECOND));
    }

    #[test]
    fn test_blocks_inside_window_and_reopens_after() {
        let (clock, limiter) = test_limiter();

        assert!(limiter.check_and_record("k", SECOND));
        clock.advance(chrono::Duration::milliseconds(999));
        assert!(!limiter.check_and_record("k", SECOND));

        clock.advance(chrono::Duration::milliseconds(1));
        assert!(limiter.check_and_record("k", SECOND), "exactly one window later is allowed");
    }

    #[test]
    fn test_denied_calls_do_not_extend_the_wait() {
        let (clock, limiter) = test_limiter();

        assert!(limiter.check_and_record("k", SECOND));
        for _ in 0..5 {
            clock.advance(chrono::Duration::milliseconds(150));
            assert!(!limiter.check_and_record("k", SECOND));
        }
        // 750ms elapsed since the only allowed call
        clock.advance(chrono::Duration::milliseconds(250));
        assert!(limiter.check_and_record("k", SECOND));
    }

    #[test]
    fn test_release_reopens_the_key() {
        let (_clock, limiter) = test_limiter();

        assert!(limiter.acquire("schedule:a1", SECOND).allowed);
        limiter.release("schedule:a1");
        assert!(limiter.acquire("schedule:a1", SECOND).allowed);
        assert!(!limiter.acquire("schedule:a1", SECOND).allowed);
    }

    #[test]
    fn test_keys_are_independent() {
        let (_clock, limiter) = test_limiter();

        assert!(limiter.check_and_record("linkedin:a1", SECOND));
        assert!(limiter.check_and_record("facebook:a1", SECOND));
        assert!(limiter.check_and_record("linkedin:a2", SECOND));
        assert!(!limiter.check_and_record("linkedin:a1", SECOND));
    }

    #[test]
    fn test_window_is_per_call() {
        let (clock, limiter) = test_limiter();

        assert!(limiter.check_and_record("k", Duration::from_secs(300)));
        clock.advance(chrono::Duration::seconds(61));
        assert!(!limiter.check_and_record("k", Duration::from_secs(300)));
        assert!(limiter.check_and_record("k", Duration::from_secs(60)));
    }

    #[test]
    fn test_status_is_read_only() {
        let (clock, limiter) = test_limiter();

        assert_eq!(limiter.status("k", SECOND), RateLimitStatus::allowed());
        assert_eq!(limiter.status("k", SECOND), RateLimitStatus::allowed());
        // status on an unknown key must not create an entry
        assert!(limiter.check_and_record("k", SECOND));

        let first = limiter.status("k", SECOND);
        assert!(!first.allowed);
        assert_eq!(first.remaining_ms, Some(1000));

        clock.advance(chrono::Duration::milliseconds(300));
        let second = limiter.status("k", SECOND);
        assert_eq!(second.remaining_ms, Some(700));

        clock.advance(chrono::Duration::milliseconds(300));
        let third = limiter.status("k", SECOND);
        assert_eq!(third.remaining_ms, Some(400));

        clock.advance(chrono::Duration::milliseconds(400));
        assert!(limiter.status("k", SECOND).allowed);
    }

    #[test]
    fn test_clock_stepping_backwards_keeps_key_blocked() {
        let (clock, limiter) = test_limiter();

        assert!(limiter.check_and_record("k", SECOND));
        clock.advance(chrono::Duration::seconds(-10));
        let status = limiter.status("k", SECOND);
        assert!(!status.allowed);
        assert_eq!(status.remaining_ms, Some(1000));
    }

    #[test]
    fn test_acquire_reports_remaining() {
        let (clock, limiter) = test_limiter();
        let window = Duration::from_secs(300);

        assert!(limiter.acquire("schedule:a1", window).allowed);
        clock.advance(chrono::Duration::seconds(120));

        let denied = limiter.acquire("schedule:a1", window);
        assert!(!denied.allowed);
        assert_eq!(denied.remaining_ms, Some(180_000));
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_value(RateLimitStatus::allowed()).unwrap();
        assert_eq!(json, serde_json::json!({"allowed": true}));

        let json = serde_json::to_value(RateLimitStatus {
            allowed: false,
            remaining_ms: Some(42),
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({"allowed": false, "remaining_ms": 42}));
    }

    #[test]
    fn test_key_conventions() {
        assert_eq!(generation_key(ContentType::Newsletter, "post-1"), "newsletter:post-1");
        assert_eq!(schedule_key("post-1"), "schedule:post-1");
    }

    #[test]
    fn test_policy_from_config() {
        let policy = RateLimitPolicy::default();
        assert_eq!(policy.generation_window, Duration::from_secs(60));
        assert_eq!(policy.schedule_window, Duration::from_secs(300));
    }

    #[test]
    fn test_concurrent_callers_single_winner() {
        let (_clock, limiter) = test_limiter();
        let limiter = Arc::new(limiter);

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                std::thread::spawn(move || limiter.check_and_record("hot", Duration::from_secs(60)))
            })
            .collect();

        let allowed = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|allowed| *allowed)
            .count();
        assert_eq!(allowed, 1);
    }
}
