//! Durable-store operations behind a capability trait.
//!
//! The production implementation talks to PostgreSQL; the claim is a single
//! statement whose `FOR UPDATE SKIP LOCKED` row lock guarantees that each
//! `pending -> picked` transition is observed by exactly one worker and that
//! no worker ever waits on a row held by another. The in-memory
//! implementation preserves those semantics for tests.

use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc};

use chrono::{DateTime, Utc};
use hookline_core::{
    AttemptId, AttemptStatus, Destination, DestinationHealth, DestinationId, Event, EventId,
    RouteId,
};
use sqlx::PgPool;

use crate::error::Result;

/// Identity of a claimed attempt, as returned by the claim statement.
#[derive(Debug, Clone, Copy, sqlx::FromRow)]
pub struct ClaimedAttempt {
    /// Attempt row id.
    pub id: AttemptId,
    /// Event under delivery.
    pub event_id: EventId,
    /// Route that produced the attempt.
    pub route_id: RouteId,
    /// Retry counter at claim time.
    pub attempt_no: i32,
}

/// Destination and event rows needed to dispatch one attempt.
#[derive(Debug, Clone)]
pub struct AttemptContext {
    /// Destination configuration.
    pub destination: Destination,
    /// The immutable event.
    pub event: Event,
}

/// What a dispatch produced, ready to be written onto the attempt row.
#[derive(Debug, Clone, Default)]
pub struct DispatchOutcome {
    /// HTTP status, when a response arrived.
    pub http_code: Option<i32>,
    /// Response headers (first value per name).
    pub response_headers: HashMap<String, String>,
    /// Response body, capped upstream at 64 KiB.
    pub response_body: Option<String>,
    /// Transport or policy error description, when the dispatch failed
    /// before a response.
    pub response_error: Option<String>,
    /// Wall-clock dispatch duration in milliseconds.
    pub elapsed_ms: i64,
}

type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Store operations required by the delivery worker and janitor.
pub trait DeliveryStore: Send + Sync {
    /// Claims the oldest due pending attempt, if any.
    ///
    /// Must never return the same row to two workers and must never block on
    /// a row another session holds.
    fn claim_next(
        &self,
        worker_name: String,
        worker_version: String,
    ) -> StoreFuture<'_, Option<ClaimedAttempt>>;

    /// Loads the destination and event for a claimed attempt.
    fn load_context(&self, attempt_id: AttemptId) -> StoreFuture<'_, AttemptContext>;

    /// Returns an attempt to `pending` due at `next_at` without touching its
    /// counters. Used for breaker and rate-gate deferrals.
    fn defer(&self, attempt_id: AttemptId, next_at: DateTime<Utc>) -> StoreFuture<'_, ()>;

    /// Records a successful outcome; terminal.
    fn record_success(
        &self,
        attempt_id: AttemptId,
        outcome: DispatchOutcome,
        worker_name: String,
        worker_version: String,
    ) -> StoreFuture<'_, ()>;

    /// Records a failed outcome and re-queues the attempt for `next_at`,
    /// incrementing `attempt_no`.
    fn record_retry(
        &self,
        attempt_id: AttemptId,
        next_at: DateTime<Utc>,
        outcome: DispatchOutcome,
    ) -> StoreFuture<'_, ()>;

    /// Records a failed outcome; terminal.
    fn record_failure(&self, attempt_id: AttemptId, outcome: DispatchOutcome)
        -> StoreFuture<'_, ()>;

    /// Reads a destination's health row; absent rows read as zero counters.
    fn health(&self, destination: DestinationId) -> StoreFuture<'_, DestinationHealth>;

    /// Increments a health counter (upsert) and returns the updated row.
    fn record_health(
        &self,
        destination: DestinationId,
        success: bool,
    ) -> StoreFuture<'_, DestinationHealth>;

    /// Opens the breaker until the given instant.
    fn open_breaker(
        &self,
        destination: DestinationId,
        until: DateTime<Utc>,
    ) -> StoreFuture<'_, ()>;

    /// Zeroes the health window and clears `open_until`.
    fn reset_breaker(&self, destination: DestinationId) -> StoreFuture<'_, ()>;

    /// Deletes events older than `cutoff` that have no live attempts.
    fn sweep_expired_events(&self, cutoff: DateTime<Utc>) -> StoreFuture<'_, u64>;

    /// Flips `picked` rows claimed before `cutoff` back to `pending`.
    fn requeue_stale_picked(&self, cutoff: DateTime<Utc>) -> StoreFuture<'_, u64>;
}

const DESTINATION_COLUMNS: &str =
    "d.id, d.name, d.url, d.headers, d.secret, d.connect_timeout_s, d.total_timeout_s, \
     d.verify_tls, d.max_rps, d.burst, d.max_inflight, d.breaker_failure_ratio, \
     d.breaker_min_requests, d.breaker_cooldown_s, d.append_path, d.created_at";

/// PostgreSQL-backed store.
pub struct PgDeliveryStore {
    pool: PgPool,
}

impl PgDeliveryStore {
    /// Creates a store over the given pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl DeliveryStore for PgDeliveryStore {
    fn claim_next(
        &self,
        worker_name: String,
        worker_version: String,
    ) -> StoreFuture<'_, Option<ClaimedAttempt>> {
        Box::pin(async move {
            let claimed = sqlx::query_as::<_, ClaimedAttempt>(
                r"
                WITH next AS (
                    SELECT id
                    FROM delivery_attempt
                    WHERE status = 'pending' AND next_at <= now()
                    ORDER BY next_at ASC
                    LIMIT 1
                    FOR UPDATE SKIP LOCKED
                )
                UPDATE delivery_attempt da
                SET status = 'picked', picked_at = now(),
                    worker_name = $1, worker_version = $2
                FROM next
                WHERE da.id = next.id
                RETURNING da.id, da.event_id, da.route_id, da.attempt_no
                ",
            )
            .bind(&worker_name)
            .bind(&worker_version)
            .fetch_optional(&self.pool)
            .await?;

            Ok(claimed)
        })
    }

    fn load_context(&self, attempt_id: AttemptId) -> StoreFuture<'_, AttemptContext> {
        Box::pin(async move {
            let destination = sqlx::query_as::<_, Destination>(&format!(
                r"
                SELECT {DESTINATION_COLUMNS}
                FROM delivery_attempt da
                JOIN route r ON r.id = da.route_id
                JOIN destination d ON d.id = r.destination_id
                WHERE da.id = $1
                "
            ))
            .bind(attempt_id)
            .fetch_one(&self.pool)
            .await?;

            let event = sqlx::query_as::<_, Event>(
                r"
                SELECT e.id, e.source_id, e.received_at, e.content_type, e.headers, e.body,
                       e.body_size, e.source_ip, e.idempotency_key, e.body_hash,
                       e.method, e.path, e.query
                FROM delivery_attempt da
                JOIN event e ON e.id = da.event_id
                WHERE da.id = $1
                ",
            )
            .bind(attempt_id)
            .fetch_one(&self.pool)
            .await?;

            Ok(AttemptContext { destination, event })
        })
    }

    fn defer(&self, attempt_id: AttemptId, next_at: DateTime<Utc>) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            sqlx::query("UPDATE delivery_attempt SET status = 'pending', next_at = $2 WHERE id = $1")
                .bind(attempt_id)
                .bind(next_at)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
    }

    fn record_success(
        &self,
        attempt_id: AttemptId,
        outcome: DispatchOutcome,
        worker_name: String,
        worker_version: String,
    ) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            sqlx::query(
                r"
                UPDATE delivery_attempt
                SET status = 'succeeded', succeeded_at = now(),
                    http_code = $2, response_headers = $3, response_body = $4,
                    response_error = NULL, elapsed_ms = $5,
                    worker_name = $6, worker_version = $7
                WHERE id = $1
                ",
            )
            .bind(attempt_id)
            .bind(outcome.http_code)
            .bind(sqlx::types::Json(&outcome.response_headers))
            .bind(&outcome.response_body)
            .bind(outcome.elapsed_ms)
            .bind(&worker_name)
            .bind(&worker_version)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
    }

    fn record_retry(
        &self,
        attempt_id: AttemptId,
        next_at: DateTime<Utc>,
        outcome: DispatchOutcome,
    ) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            sqlx::query(
                r"
                UPDATE delivery_attempt
                SET status = 'pending', next_at = $2, attempt_no = attempt_no + 1,
                    http_code = $3, response_headers = $4, response_body = $5,
                    response_error = $6, elapsed_ms = $7
                WHERE id = $1
                ",
            )
            .bind(attempt_id)
            .bind(next_at)
            .bind(outcome.http_code)
            .bind(sqlx::types::Json(&outcome.response_headers))
            .bind(&outcome.response_body)
            .bind(&outcome.response_error)
            .bind(outcome.elapsed_ms)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
    }

    fn record_failure(
        &self,
        attempt_id: AttemptId,
        outcome: DispatchOutcome,
    ) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            sqlx::query(
                r"
                UPDATE delivery_attempt
                SET status = 'failed', failed_at = now(),
                    http_code = $2, response_headers = $3, response_body = $4,
                    response_error = $5, elapsed_ms = $6
                WHERE id = $1
                ",
            )
            .bind(attempt_id)
            .bind(outcome.http_code)
            .bind(sqlx::types::Json(&outcome.response_headers))
            .bind(&outcome.response_body)
            .bind(&outcome.response_error)
            .bind(outcome.elapsed_ms)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
    }

    fn health(&self, destination: DestinationId) -> StoreFuture<'_, DestinationHealth> {
        Box::pin(async move {
            let health = sqlx::query_as::<_, DestinationHealth>(
                r"
                SELECT destination_id, success_count, failure_count, open_until
                FROM destination_health
                WHERE destination_id = $1
                ",
            )
            .bind(destination)
            .fetch_optional(&self.pool)
            .await?;

            Ok(health.unwrap_or(DestinationHealth {
                destination_id: destination,
                success_count: 0,
                failure_count: 0,
                open_until: None,
            }))
        })
    }

    fn record_health(
        &self,
        destination: DestinationId,
        success: bool,
    ) -> StoreFuture<'_, DestinationHealth> {
        Box::pin(async move {
            let health = sqlx::query_as::<_, DestinationHealth>(
                r"
                INSERT INTO destination_health (destination_id, success_count, failure_count)
                VALUES ($1, CASE WHEN $2 THEN 1 ELSE 0 END, CASE WHEN $2 THEN 0 ELSE 1 END)
                ON CONFLICT (destination_id) DO UPDATE SET
                    success_count = destination_health.success_count
                                    + CASE WHEN $2 THEN 1 ELSE 0 END,
                    failure_count = destination_health.failure_count
                                    + CASE WHEN $2 THEN 0 ELSE 1 END
                RETURNING destination_id, success_count, failure_count, open_until
                ",
            )
            .bind(destination)
            .bind(success)
            .fetch_one(&self.pool)
            .await?;

            Ok(health)
        })
    }

    fn open_breaker(
        &self,
        destination: DestinationId,
        until: DateTime<Utc>,
    ) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            sqlx::query("UPDATE destination_health SET open_until = $2 WHERE destination_id = $1")
                .bind(destination)
                .bind(until)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
    }

    fn reset_breaker(&self, destination: DestinationId) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            sqlx::query(
                r"
                UPDATE destination_health
                SET success_count = 0, failure_count = 0, open_until = NULL
                WHERE destination_id = $1
                ",
            )
            .bind(destination)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
    }

    fn sweep_expired_events(&self, cutoff: DateTime<Utc>) -> StoreFuture<'_, u64> {
        Box::pin(async move {
            let result = sqlx::query(
                r"
                DELETE FROM event e
                WHERE e.received_at < $1
                  AND NOT EXISTS (
                    SELECT 1 FROM delivery_attempt da
                    WHERE da.event_id = e.id
                      AND da.status IN ('pending', 'picked')
                  )
                ",
            )
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

            Ok(result.rows_affected())
        })
    }

    fn requeue_stale_picked(&self, cutoff: DateTime<Utc>) -> StoreFuture<'_, u64> {
        Box::pin(async move {
            let result = sqlx::query(
                r"
                UPDATE delivery_attempt
                SET status = 'pending', next_at = now()
                WHERE status = 'picked' AND picked_at < $1
                ",
            )
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

            Ok(result.rows_affected())
        })
    }
}

pub mod memory {
    //! In-memory store for tests and single-process experiments.
    //!
    //! Claim semantics match the SQL store: at most one caller observes each
    //! `pending -> picked` transition, chosen oldest `next_at` first.

    use hookline_core::{Clock, DeliveryAttempt, Route};
    use tokio::sync::Mutex;

    use super::*;
    use crate::error::DeliveryError;

    #[derive(Default)]
    struct Inner {
        destinations: HashMap<DestinationId, Destination>,
        routes: HashMap<RouteId, Route>,
        events: HashMap<EventId, Event>,
        attempts: Vec<DeliveryAttempt>,
        health: HashMap<DestinationId, DestinationHealth>,
    }

    /// In-memory [`DeliveryStore`].
    pub struct MemoryDeliveryStore {
        inner: Mutex<Inner>,
        clock: Arc<dyn Clock>,
    }

    impl MemoryDeliveryStore {
        /// Creates an empty store driven by the given clock.
        pub fn new(clock: Arc<dyn Clock>) -> Self {
            Self { inner: Mutex::new(Inner::default()), clock }
        }

        /// Registers a destination.
        pub async fn insert_destination(&self, destination: Destination) {
            self.inner.lock().await.destinations.insert(destination.id, destination);
        }

        /// Registers a route.
        pub async fn insert_route(&self, route: Route) {
            self.inner.lock().await.routes.insert(route.id, route);
        }

        /// Stores an event and queues one pending attempt for it on the
        /// given route, due immediately. Returns the attempt id.
        pub async fn enqueue(&self, event: Event, route_id: RouteId) -> AttemptId {
            let now = self.clock.now_utc();
            let attempt = DeliveryAttempt {
                id: AttemptId::new(),
                event_id: event.id,
                route_id,
                attempt_no: 0,
                status: AttemptStatus::Pending,
                next_at: now,
                created_at: now,
                picked_at: None,
                succeeded_at: None,
                failed_at: None,
                http_code: None,
                response_headers: None,
                response_body: None,
                response_error: None,
                elapsed_ms: None,
                worker_name: None,
                worker_version: None,
            };
            let id = attempt.id;

            let mut inner = self.inner.lock().await;
            inner.events.insert(event.id, event);
            inner.attempts.push(attempt);
            id
        }

        /// Overrides an attempt's retry counter (test setup).
        pub async fn set_attempt_no(&self, id: AttemptId, attempt_no: i32) {
            let mut inner = self.inner.lock().await;
            if let Some(attempt) = inner.attempts.iter_mut().find(|a| a.id == id) {
                attempt.attempt_no = attempt_no;
            }
        }

        /// Snapshot of an attempt row.
        pub async fn attempt(&self, id: AttemptId) -> Option<DeliveryAttempt> {
            self.inner.lock().await.attempts.iter().find(|a| a.id == id).cloned()
        }

        /// Snapshot of a destination's health row.
        pub async fn health_snapshot(&self, id: DestinationId) -> Option<DestinationHealth> {
            self.inner.lock().await.health.get(&id).cloned()
        }

        /// Number of stored events (janitor tests).
        pub async fn event_count(&self) -> usize {
            self.inner.lock().await.events.len()
        }

        fn with_attempt<T>(
            inner: &mut Inner,
            id: AttemptId,
            f: impl FnOnce(&mut DeliveryAttempt) -> T,
        ) -> Result<T> {
            inner
                .attempts
                .iter_mut()
                .find(|a| a.id == id)
                .map(f)
                .ok_or_else(|| DeliveryError::Database(format!("attempt {id} not found")))
        }

        fn apply_outcome(attempt: &mut DeliveryAttempt, outcome: &DispatchOutcome) {
            attempt.http_code = outcome.http_code;
            attempt.response_headers =
                Some(sqlx::types::Json(outcome.response_headers.clone()));
            attempt.response_body = outcome.response_body.clone();
            attempt.response_error = outcome.response_error.clone();
            attempt.elapsed_ms = Some(outcome.elapsed_ms);
        }
    }

    impl DeliveryStore for MemoryDeliveryStore {
        fn claim_next(
            &self,
            worker_name: String,
            worker_version: String,
        ) -> StoreFuture<'_, Option<ClaimedAttempt>> {
            let now = self.clock.now_utc();
            Box::pin(async move {
                let mut inner = self.inner.lock().await;
                let due = inner
                    .attempts
                    .iter_mut()
                    .filter(|a| a.status == AttemptStatus::Pending && a.next_at <= now)
                    .min_by_key(|a| a.next_at);

                Ok(due.map(|attempt| {
                    attempt.status = AttemptStatus::Picked;
                    attempt.picked_at = Some(now);
                    attempt.worker_name = Some(worker_name);
                    attempt.worker_version = Some(worker_version);
                    ClaimedAttempt {
                        id: attempt.id,
                        event_id: attempt.event_id,
                        route_id: attempt.route_id,
                        attempt_no: attempt.attempt_no,
                    }
                }))
            })
        }

        fn load_context(&self, attempt_id: AttemptId) -> StoreFuture<'_, AttemptContext> {
            Box::pin(async move {
                let inner = self.inner.lock().await;
                let attempt = inner
                    .attempts
                    .iter()
                    .find(|a| a.id == attempt_id)
                    .ok_or_else(|| DeliveryError::Database(format!("attempt {attempt_id} not found")))?;
                let route = inner
                    .routes
                    .get(&attempt.route_id)
                    .ok_or_else(|| DeliveryError::Database("route not found".to_string()))?;
                let destination = inner
                    .destinations
                    .get(&route.destination_id)
                    .cloned()
                    .ok_or_else(|| DeliveryError::Database("destination not found".to_string()))?;
                let event = inner
                    .events
                    .get(&attempt.event_id)
                    .cloned()
                    .ok_or_else(|| DeliveryError::Database("event not found".to_string()))?;

                Ok(AttemptContext { destination, event })
            })
        }

        fn defer(&self, attempt_id: AttemptId, next_at: DateTime<Utc>) -> StoreFuture<'_, ()> {
            Box::pin(async move {
                let mut inner = self.inner.lock().await;
                Self::with_attempt(&mut inner, attempt_id, |attempt| {
                    attempt.status = AttemptStatus::Pending;
                    attempt.next_at = next_at;
                })
            })
        }

        fn record_success(
            &self,
            attempt_id: AttemptId,
            outcome: DispatchOutcome,
            worker_name: String,
            worker_version: String,
        ) -> StoreFuture<'_, ()> {
            let now = self.clock.now_utc();
            Box::pin(async move {
                let mut inner = self.inner.lock().await;
                Self::with_attempt(&mut inner, attempt_id, |attempt| {
                    attempt.status = AttemptStatus::Succeeded;
                    attempt.succeeded_at = Some(now);
                    attempt.worker_name = Some(worker_name);
                    attempt.worker_version = Some(worker_version);
                    Self::apply_outcome(attempt, &outcome);
                    attempt.response_error = None;
                })
            })
        }

        fn record_retry(
            &self,
            attempt_id: AttemptId,
            next_at: DateTime<Utc>,
            outcome: DispatchOutcome,
        ) -> StoreFuture<'_, ()> {
            Box::pin(async move {
                let mut inner = self.inner.lock().await;
                Self::with_attempt(&mut inner, attempt_id, |attempt| {
                    attempt.status = AttemptStatus::Pending;
                    attempt.next_at = next_at;
                    attempt.attempt_no += 1;
                    Self::apply_outcome(attempt, &outcome);
                })
            })
        }

        fn record_failure(
            &self,
            attempt_id: AttemptId,
            outcome: DispatchOutcome,
        ) -> StoreFuture<'_, ()> {
            let now = self.clock.now_utc();
            Box::pin(async move {
                let mut inner = self.inner.lock().await;
                Self::with_attempt(&mut inner, attempt_id, |attempt| {
                    attempt.status = AttemptStatus::Failed;
                    attempt.failed_at = Some(now);
                    Self::apply_outcome(attempt, &outcome);
                })
            })
        }

        fn health(&self, destination: DestinationId) -> StoreFuture<'_, DestinationHealth> {
            Box::pin(async move {
                let inner = self.inner.lock().await;
                Ok(inner.health.get(&destination).cloned().unwrap_or(DestinationHealth {
                    destination_id: destination,
                    success_count: 0,
                    failure_count: 0,
                    open_until: None,
                }))
            })
        }

        fn record_health(
            &self,
            destination: DestinationId,
            success: bool,
        ) -> StoreFuture<'_, DestinationHealth> {
            Box::pin(async move {
                let mut inner = self.inner.lock().await;
                let entry = inner.health.entry(destination).or_insert(DestinationHealth {
                    destination_id: destination,
                    success_count: 0,
                    failure_count: 0,
                    open_until: None,
                });
                if success {
                    entry.success_count += 1;
                } else {
                    entry.failure_count += 1;
                }
                Ok(entry.clone())
            })
        }

        fn open_breaker(
            &self,
            destination: DestinationId,
            until: DateTime<Utc>,
        ) -> StoreFuture<'_, ()> {
            Box::pin(async move {
                let mut inner = self.inner.lock().await;
                if let Some(entry) = inner.health.get_mut(&destination) {
                    entry.open_until = Some(until);
                }
                Ok(())
            })
        }

        fn reset_breaker(&self, destination: DestinationId) -> StoreFuture<'_, ()> {
            Box::pin(async move {
                let mut inner = self.inner.lock().await;
                if let Some(entry) = inner.health.get_mut(&destination) {
                    entry.success_count = 0;
                    entry.failure_count = 0;
                    entry.open_until = None;
                }
                Ok(())
            })
        }

        fn sweep_expired_events(&self, cutoff: DateTime<Utc>) -> StoreFuture<'_, u64> {
            Box::pin(async move {
                let mut inner = self.inner.lock().await;
                let live: Vec<EventId> = inner
                    .attempts
                    .iter()
                    .filter(|a| {
                        matches!(a.status, AttemptStatus::Pending | AttemptStatus::Picked)
                    })
                    .map(|a| a.event_id)
                    .collect();

                let expired: Vec<EventId> = inner
                    .events
                    .values()
                    .filter(|e| e.received_at < cutoff && !live.contains(&e.id))
                    .map(|e| e.id)
                    .collect();

                for id in &expired {
                    inner.events.remove(id);
                    inner.attempts.retain(|a| a.event_id != *id);
                }
                Ok(expired.len() as u64)
            })
        }

        fn requeue_stale_picked(&self, cutoff: DateTime<Utc>) -> StoreFuture<'_, u64> {
            let now = self.clock.now_utc();
            Box::pin(async move {
                let mut inner = self.inner.lock().await;
                let mut requeued = 0;
                for attempt in &mut inner.attempts {
                    if attempt.status == AttemptStatus::Picked
                        && attempt.picked_at.is_some_and(|at| at < cutoff)
                    {
                        attempt.status = AttemptStatus::Pending;
                        attempt.next_at = now;
                        requeued += 1;
                    }
                }
                Ok(requeued)
            })
        }
    }
}
