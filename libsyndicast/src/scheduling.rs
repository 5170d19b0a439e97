//! Parsing of operator-supplied publish times
//!
//! `synd-queue schedule --at` accepts:
//! - RFC 3339 instants: `2025-11-20T15:00:00Z`, `2025-11-20T10:00:00-05:00`
//! - Naive date-times, taken as UTC: `2025-11-20 15:00`
//! - Relative durations: `1h`, `30m`, `2d`, `1 hour`
//! - Natural language: `tomorrow`, `next monday 10am`
//! - Random offsets: `random:10m-20m`, counted from the article's latest
//!   scheduled post when there is one, so a batch spreads out

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use rand::Rng;

use crate::error::{Result, SyndicastError};

const MIN_RANDOM_SECONDS: i64 = 30;
const MAX_RANDOM_SECONDS: i64 = 30 * 24 * 3600; // 30 days

const NAIVE_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M"];

/// Resolve `input` against `now`.
///
/// `random_base` is where a `random:` offset starts; it falls back to `now`
/// and is never allowed to be in the past.
///
/// # Errors
///
/// Returns `InvalidInput` if the string matches none of the accepted forms.
pub fn parse_schedule_time(
    input: &str,
    now: DateTime<Utc>,
    random_base: Option<DateTime<Utc>>,
) -> Result<DateTime<Utc>> {
    let input = input.trim();
    if input.is_empty() {
        return Err(SyndicastError::InvalidInput(
            "Schedule time cannot be empty".to_string(),
        ));
    }

    if let Some(range) = input.strip_prefix("random:") {
        let base = random_base.map_or(now, |base| base.max(now));
        let offset = parse_random_offset(range)?;
        return offset_from(base, offset);
    }

    if let Ok(at) = DateTime::parse_from_rfc3339(input) {
        return Ok(at.with_timezone(&Utc));
    }

    if let Some(naive) = NAIVE_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(input, format).ok())
    {
        return Ok(naive.and_utc());
    }

    if let Ok(duration) = parse_duration(input) {
        return offset_from(now, duration);
    }

    chrono_english::parse_date_string(input, now, chrono_english::Dialect::Us).map_err(|_| {
        SyndicastError::InvalidInput(format!("Could not parse schedule time: {}", input))
    })
}

/// `base + offset`, or `InvalidInput` when that lands past the last representable time
fn offset_from(base: DateTime<Utc>, offset: Duration) -> Result<DateTime<Utc>> {
    base.checked_add_signed(offset)
        .ok_or_else(|| SyndicastError::InvalidInput("Schedule time out of range".to_string()))
}

fn parse_duration(input: &str) -> Result<Duration> {
    let std_duration = humantime::parse_duration(input).map_err(|e| {
        SyndicastError::InvalidInput(format!("Could not parse duration '{}': {}", input, e))
    })?;
    let seconds = i64::try_from(std_duration.as_secs())
        .map_err(|_| SyndicastError::InvalidInput("Duration out of range".to_string()))?;
    Duration::try_seconds(seconds)
        .ok_or_else(|| SyndicastError::InvalidInput("Duration out of range".to_string()))
}

/// `MIN-MAX` → a uniformly random offset in that range
fn parse_random_offset(range: &str) -> Result<Duration> {
    let (min_str, max_str) = range.split_once('-').ok_or_else(|| {
        SyndicastError::InvalidInput("Random format must be random:MIN-MAX".to_string())
    })?;

    let min = parse_duration(min_str.trim())?.num_seconds();
    let max = parse_duration(max_str.trim())?.num_seconds();

    if min < MIN_RANDOM_SECONDS {
        return Err(SyndicastError::InvalidInput(format!(
            "Minimum random interval must be at least {} seconds",
            MIN_RANDOM_SECONDS
        )));
    }
    if max > MAX_RANDOM_SECONDS {
        return Err(SyndicastError::InvalidInput(format!(
            "Maximum random interval must be at most {} days",
            MAX_RANDOM_SECONDS / (24 * 3600)
        )));
    }
    if min >= max {
        return Err(SyndicastError::InvalidInput(
            "Minimum must be less than maximum".to_string(),
        ));
    }

    let seconds = rand::thread_rng().gen_range(min..=max);
    Ok(Duration::seconds(seconds))
}
