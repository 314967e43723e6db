//! Target-time parsing for enqueued jobs
//!
//! Accepted forms, tried in order:
//! - RFC 3339 timestamps: "2025-11-20T15:00:00Z"
//! - `now`
//! - Random spacing: "random:10m-20m" (relative to the last scheduled job)
//! - Durations: "30m", "2h", "1 hour"
//! - Natural language: "tomorrow", "next friday"

use chrono::{DateTime, Duration, Utc};
use rand::Rng;

use crate::error::{CadenceError, Result};

const MIN_RANDOM_SECS: i64 = 30;
const MAX_RANDOM_SECS: i64 = 30 * 24 * 3600;

/// Resolve `input` against the current time.
pub fn parse_schedule(input: &str, last_scheduled: Option<DateTime<Utc>>) -> Result<DateTime<Utc>> {
    parse_schedule_at(input, Utc::now(), last_scheduled)
}

/// Resolve `input` relative to `now`.
pub fn parse_schedule_at(
    input: &str,
    now: DateTime<Utc>,
    last_scheduled: Option<DateTime<Utc>>,
) -> Result<DateTime<Utc>> {
    let input = input.trim();
    if input.is_empty() {
        return Err(invalid("schedule cannot be empty"));
    }

    if let Ok(at) = DateTime::parse_from_rfc3339(input) {
        return Ok(at.with_timezone(&Utc));
    }

    if input.eq_ignore_ascii_case("now") {
        return Ok(now);
    }

    if let Some(range) = input.strip_prefix("random:") {
        let (min, max) = parse_random_range(range)?;
        let base = last_scheduled.filter(|last| *last > now).unwrap_or(now);
        let secs = rand::thread_rng().gen_range(min.num_seconds()..=max.num_seconds());
        return Ok(base + Duration::seconds(secs));
    }

    if let Ok(duration) = parse_duration(input) {
        return Ok(now + duration);
    }

    chrono_english::parse_date_string(input, now, chrono_english::Dialect::Us)
        .map_err(|_| invalid(&format!("could not parse schedule '{}'", input)))
}

fn invalid(message: &str) -> CadenceError {
    CadenceError::InvalidInput(message.to_string())
}

fn parse_duration(input: &str) -> Result<Duration> {
    let std_duration = humantime::parse_duration(input)
        .map_err(|e| invalid(&format!("invalid duration '{}': {}", input, e)))?;
    Duration::from_std(std_duration).map_err(|_| invalid("duration out of range"))
}

/// "MIN-MAX" → validated (min, max)
fn parse_random_range(range: &str) -> Result<(Duration, Duration)> {
    let Some((min, max)) = range.split_once('-') else {
        return Err(invalid("random schedule must be random:MIN-MAX"));
    };
    let min = parse_duration(min.trim())?;
    let max = parse_duration(max.trim())?;

    if min.num_seconds() < MIN_RANDOM_SECS {
        return Err(invalid(&format!(
            "random minimum must be at least {} seconds",
            MIN_RANDOM_SECS
        )));
    }
    if max.num_seconds() > MAX_RANDOM_SECS {
        return Err(invalid(&format!(
            "random maximum must be at most {} days",
            MAX_RANDOM_SECS / 86_400
        )));
    }
    if min >= max {
        return Err(invalid("random minimum must be less than maximum"));
    }
    Ok((min, max))
}
