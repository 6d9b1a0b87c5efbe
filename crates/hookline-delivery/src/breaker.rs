//! Per-destination circuit breaker decisions.
//!
//! Counters live in the `destination_health` row; this module holds the pure
//! decision logic. A breaker opens when the observed failure ratio crosses
//! the destination's threshold over at least `breaker_min_requests`
//! observations. Claims made while open defer to `open_until`. The first
//! worker to observe an elapsed cooldown resets the window.

use chrono::{DateTime, Utc};
use hookline_core::{Destination, DestinationHealth};

/// Breaker position as seen by a worker about to dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Dispatch may proceed.
    Closed,

    /// Open: defer the attempt to the contained deadline.
    Open(DateTime<Utc>),

    /// The cooldown has elapsed; reset the window, then dispatch.
    CooldownElapsed,
}

/// Classifies the health row relative to `now`.
pub fn breaker_state(health: &DestinationHealth, now: DateTime<Utc>) -> BreakerState {
    match health.open_until {
        Some(until) if until > now => BreakerState::Open(until),
        Some(_) => BreakerState::CooldownElapsed,
        None => BreakerState::Closed,
    }
}

/// True when the window says the breaker should open.
///
/// Evaluated after each failure; success outcomes never open the breaker.
pub fn should_open(health: &DestinationHealth, destination: &Destination) -> bool {
    let total = health.success_count + health.failure_count;
    total >= i64::from(destination.breaker_min_requests)
        && health.failure_ratio() >= destination.breaker_failure_ratio
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use chrono::Duration;
    use hookline_core::DestinationId;

    use super::*;

    fn destination(min_requests: i32, ratio: f64) -> Destination {
        Destination {
            id: DestinationId::new(),
            name: "dest".to_string(),
            url: "https://example.test/hook".to_string(),
            headers: sqlx::types::Json(HashMap::new()),
            secret: None,
            connect_timeout_s: 5,
            total_timeout_s: 15,
            verify_tls: true,
            max_rps: 5.0,
            burst: 10,
            max_inflight: 5,
            breaker_failure_ratio: ratio,
            breaker_min_requests: min_requests,
            breaker_cooldown_s: 60,
            append_path: false,
            created_at: Utc::now(),
        }
    }

    fn health(success: i64, failure: i64) -> DestinationHealth {
        DestinationHealth {
            destination_id: DestinationId::new(),
            success_count: success,
            failure_count: failure,
            open_until: None,
        }
    }

    #[test]
    fn stays_closed_below_min_requests() {
        let dest = destination(10, 0.5);
        // 100% failure but only 9 observations
        assert!(!should_open(&health(0, 9), &dest));
        assert!(should_open(&health(0, 10), &dest));
    }

    #[test]
    fn opens_exactly_at_ratio_threshold() {
        let dest = destination(10, 0.5);
        assert!(should_open(&health(5, 5), &dest));
        assert!(!should_open(&health(6, 5), &dest));
    }

    #[test]
    fn state_tracks_open_until() {
        let now = Utc::now();
        let mut h = health(0, 10);

        assert_eq!(breaker_state(&h, now), BreakerState::Closed);

        h.open_until = Some(now + Duration::seconds(30));
        assert!(matches!(breaker_state(&h, now), BreakerState::Open(_)));

        h.open_until = Some(now - Duration::seconds(1));
        assert_eq!(breaker_state(&h, now), BreakerState::CooldownElapsed);
    }
}
