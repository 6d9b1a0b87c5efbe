//! Retry scheduling for failed dispatches.
//!
//! The schedule is staged rather than exponential: a fast ramp in 5-second
//! steps capped at five minutes, then a flat slow phase of one hour, then
//! terminal. `Retry-After` is honored on 429 responses only.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Attempts in the fast-ramp phase (`n < 30`).
pub const FAST_PHASE_ATTEMPTS: i32 = 30;

/// Attempts after which retrying stops (`n >= 60`).
pub const MAX_ATTEMPTS: i32 = 60;

const FAST_STEP: Duration = Duration::from_secs(5);
const FAST_CAP: Duration = Duration::from_secs(5 * 60);
const SLOW_DELAY: Duration = Duration::from_secs(60 * 60);

/// Delay before the next retry, or `None` when retries are exhausted.
///
/// `attempt_no` is the attempt counter of the failure just observed (zero on
/// the first failure).
pub fn next_retry(attempt_no: i32) -> Option<Duration> {
    if attempt_no < FAST_PHASE_ATTEMPTS {
        let stepped = FAST_STEP * u32::try_from(attempt_no.max(0)).unwrap_or(0);
        let delay = stepped.clamp(FAST_STEP, FAST_CAP);
        return Some(delay);
    }
    if attempt_no < MAX_ATTEMPTS {
        return Some(SLOW_DELAY);
    }
    None
}

/// Parses a `Retry-After` header value into a positive delay.
///
/// Accepts delay-seconds (integer or fractional) or an HTTP-date; a date in
/// the past yields `None`.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    if let Ok(seconds) = value.parse::<f64>() {
        if seconds > 0.0 && seconds.is_finite() {
            return Some(Duration::from_secs_f64(seconds));
        }
        return None;
    }

    if let Ok(date) = DateTime::parse_from_rfc2822(value) {
        let delta = date.with_timezone(&Utc).signed_duration_since(now);
        return delta.to_std().ok().filter(|d| !d.is_zero());
    }

    None
}
