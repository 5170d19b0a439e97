//! Posting-time recommendations
//!
//! Each channel has a short list of engagement-friendly hours. Hours are
//! evaluated in UTC, the server's single reference frame. The `timezone`
//! argument is validated and used only when formatting times for display.

use chrono::{DateTime, NaiveDate, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::clock::Clock;
use crate::error::{Result, SyndicastError};

const LINKEDIN_HOURS: &[u32] = &[9, 12, 17];
const FACEBOOK_HOURS: &[u32] = &[9, 13, 19];
const INSTAGRAM_HOURS: &[u32] = &[11, 14, 17, 20];

/// How far `next_optimal_times` looks ahead
const LOOKAHEAD_DAYS: usize = 7;

/// Optimal hours for a channel name; unknown names get LinkedIn's table
pub fn optimal_hours(channel: &str) -> &'static [u32] {
    match channel.trim().to_ascii_lowercase().as_str() {
        "facebook" => FACEBOOK_HOURS,
        "instagram" => INSTAGRAM_HOURS,
        _ => LINKEDIN_HOURS,
    }
}

pub fn is_optimal_time(channel: &str, at: DateTime<Utc>) -> bool {
    optimal_hours(channel).contains(&at.hour())
}

/// Accepts IANA zone names, plus empty for UTC
pub fn parse_timezone(timezone: &str) -> Result<Tz> {
    let timezone = timezone.trim();
    if timezone.is_empty() {
        return Ok(Tz::UTC);
    }
    timezone
        .parse::<Tz>()
        .map_err(|_| SyndicastError::InvalidInput(format!("Unknown timezone: {}", timezone)))
}

/// `Monday October 20, 9:00 AM`, in `timezone` when it parses, else UTC
pub fn format_recommended_time(at: DateTime<Utc>, timezone: Option<&str>) -> String {
    let tz = timezone
        .and_then(|name| parse_timezone(name).ok())
        .unwrap_or(Tz::UTC);
    at.with_timezone(&tz)
        .format("%A %B %-d, %-I:%M %p")
        .to_string()
}

fn day_slots(date: NaiveDate, hours: &[u32]) -> impl Iterator<Item = DateTime<Utc>> + '_ {
    hours
        .iter()
        .filter_map(move |hour| date.and_hms_opt(*hour, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
}

pub struct Recommender {
    clock: Arc<dyn Clock>,
}

impl Recommender {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// Future optimal slots on `date`, topped up from the following day.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if `timezone` is not a known zone.
    pub fn recommended_times(
        &self,
        channel: &str,
        date: NaiveDate,
        timezone: &str,
        count: usize,
    ) -> Result<Vec<DateTime<Utc>>> {
        parse_timezone(timezone)?;
        Ok(self.slots_from(channel, date, count))
    }

    /// Up to `count` future slots over the week starting at `start`
    pub fn next_optimal_times(
        &self,
        channel: &str,
        start: NaiveDate,
        count: usize,
    ) -> Vec<DateTime<Utc>> {
        let mut collected = BTreeSet::new();
        let days = start.iter_days().take(LOOKAHEAD_DAYS);

        for day in days {
            if collected.len() >= count {
                break;
            }
            collected.extend(self.slots_from(channel, day, count));
        }

        collected.into_iter().take(count).collect()
    }

    fn slots_from(&self, channel: &str, date: NaiveDate, count: usize) -> Vec<DateTime<Utc>> {
        let now = self.clock.now();
        let hours = optimal_hours(channel);

        let mut times: Vec<_> = day_slots(date, hours).filter(|t| *t > now).collect();
        if times.len() < count {
            if let Some(next_day) = date.succ_opt() {
                times.extend(day_slots(next_day, hours).filter(|t| *t > now));
            }
        }

        times.sort();
        times.dedup();
        times.truncate(count);
        times
    }
}
