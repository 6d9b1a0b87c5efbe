//! Repository for event ingestion, lookup, and replay.
//!
//! Ingestion is the one multi-statement transaction in the system: the event
//! insert and the per-route attempt fan-out either both land or neither does.

use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::{
    error::{CoreError, Result},
    models::{Event, EventId, SourceId},
};

/// Everything ingress captured about an accepted request.
#[derive(Debug, Clone)]
pub struct NewEvent {
    /// Authenticated source.
    pub source_id: SourceId,
    /// Acceptance time.
    pub received_at: DateTime<Utc>,
    /// Content type as presented, if any.
    pub content_type: Option<String>,
    /// Canonicalized headers (lowercase keys, values joined by `", "`).
    pub headers: HashMap<String, String>,
    /// Raw body bytes.
    pub body: Vec<u8>,
    /// Observed client address.
    pub source_ip: Option<String>,
    /// Caller-supplied deduplication key.
    pub idempotency_key: Option<String>,
    /// HTTP method of the ingress request.
    pub method: String,
    /// Path tail after the token segment, with leading slash.
    pub path: String,
    /// Raw query string.
    pub query: String,
}

/// Result of an ingest or replay call.
#[derive(Debug, Clone, Copy)]
pub struct IngestOutcome {
    /// The event's stable identity (existing on idempotent replay-hit).
    pub event_id: EventId,
    /// Attempts now associated with the event.
    pub attempts_created: i64,
}

/// Compact event row for operator listings; omits headers and body.
#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
pub struct EventSummary {
    /// Event identifier.
    pub id: EventId,
    /// Acceptance time.
    pub received_at: DateTime<Utc>,
    /// Content type, empty when absent.
    pub content_type: Option<String>,
    /// Body size in bytes.
    pub body_size: i32,
    /// Ingress HTTP method.
    pub method: Option<String>,
    /// Captured path tail.
    pub path: Option<String>,
    /// Captured query string.
    pub query: Option<String>,
}

/// Event repository.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Shared connection pool, for cross-repository health checks.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Finds an event by id.
    pub async fn find(&self, id: EventId) -> Result<Option<Event>> {
        let event = sqlx::query_as::<_, Event>(
            r"
            SELECT id, source_id, received_at, content_type, headers, body, body_size,
                   source_ip, idempotency_key, body_hash, method, path, query
            FROM event
            WHERE id = $1
            ",
        )
        .bind(id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(event)
    }

    /// Looks up an existing event by its idempotency key.
    pub async fn find_by_idempotency(
        &self,
        source_id: SourceId,
        key: &str,
    ) -> Result<Option<EventId>> {
        let id = sqlx::query_scalar::<_, EventId>(
            "SELECT id FROM event WHERE source_id = $1 AND idempotency_key = $2",
        )
        .bind(source_id)
        .bind(key)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(id)
    }

    /// Persists an event and fans out one pending attempt per matching
    /// enabled route, in a single transaction.
    ///
    /// Duplicate `(source, idempotency_key)` pairs return the existing event
    /// without inserting anything; the race where two concurrent requests
    /// pass the pre-check is resolved by the unique index, with the loser
    /// re-reading the winner's id.
    pub async fn ingest(&self, new: &NewEvent) -> Result<IngestOutcome> {
        if let Some(key) = new.idempotency_key.as_deref() {
            if let Some(existing) = self.find_by_idempotency(new.source_id, key).await? {
                let attempts = self.count_attempts(existing).await?;
                return Ok(IngestOutcome { event_id: existing, attempts_created: attempts });
            }
        }

        match self.insert_with_attempts(new).await {
            Ok(outcome) => Ok(outcome),
            Err(err) if err.is_unique_violation() => {
                // Lost the idempotency race: the other request's insert
                // committed first. Hand back its event id.
                let key = new.idempotency_key.as_deref().ok_or(err)?;
                let existing = self
                    .find_by_idempotency(new.source_id, key)
                    .await?
                    .ok_or_else(|| CoreError::Database("idempotent event vanished".to_string()))?;
                let attempts = self.count_attempts(existing).await?;
                Ok(IngestOutcome { event_id: existing, attempts_created: attempts })
            },
            Err(err) => Err(err),
        }
    }

    async fn insert_with_attempts(&self, new: &NewEvent) -> Result<IngestOutcome> {
        let body_size = i32::try_from(new.body.len()).unwrap_or(i32::MAX);
        let body_hash = Event::hash_body(&new.body);

        let mut tx = self.pool.begin().await?;

        let event_id = sqlx::query_scalar::<_, EventId>(
            r"
            INSERT INTO event (
                source_id, received_at, content_type, headers, body, body_size,
                source_ip, idempotency_key, body_hash, method, path, query
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            RETURNING id
            ",
        )
        .bind(new.source_id)
        .bind(new.received_at)
        .bind(&new.content_type)
        .bind(sqlx::types::Json(&new.headers))
        .bind(&new.body)
        .bind(body_size)
        .bind(&new.source_ip)
        .bind(&new.idempotency_key)
        .bind(&body_hash)
        .bind(&new.method)
        .bind(&new.path)
        .bind(&new.query)
        .fetch_one(&mut *tx)
        .await?;

        let fanout = sqlx::query(
            r"
            INSERT INTO delivery_attempt (event_id, route_id, attempt_no, status, next_at)
            SELECT $1, r.id, 0, 'pending', now()
            FROM route r
            WHERE r.source_id = $2
              AND r.enabled = TRUE
              AND (r.content_type_like IS NULL OR COALESCE($3, '') LIKE r.content_type_like)
            ",
        )
        .bind(event_id)
        .bind(new.source_id)
        .bind(&new.content_type)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(IngestOutcome {
            event_id,
            attempts_created: i64::try_from(fanout.rows_affected()).unwrap_or(i64::MAX),
        })
    }

    /// Re-inserts pending attempts at `now()` for every enabled route that
    /// currently matches the event's content type.
    ///
    /// Replays never resurrect terminated attempts; they add fresh rows.
    pub async fn replay(&self, event_id: EventId) -> Result<IngestOutcome> {
        let content_type: Option<Option<String>> =
            sqlx::query_scalar("SELECT content_type FROM event WHERE id = $1")
                .bind(event_id)
                .fetch_optional(&*self.pool)
                .await?;

        let Some(content_type) = content_type else {
            return Err(CoreError::NotFound(format!("event {event_id} not found")));
        };

        let inserted = sqlx::query(
            r"
            INSERT INTO delivery_attempt (event_id, route_id, attempt_no, status, next_at)
            SELECT $1, r.id, 0, 'pending', now()
            FROM route r
            JOIN event e ON e.source_id = r.source_id
            WHERE e.id = $1
              AND r.enabled = TRUE
              AND (r.content_type_like IS NULL OR COALESCE($2, '') LIKE r.content_type_like)
            ",
        )
        .bind(event_id)
        .bind(&content_type)
        .execute(&*self.pool)
        .await?;

        Ok(IngestOutcome {
            event_id,
            attempts_created: i64::try_from(inserted.rows_affected()).unwrap_or(i64::MAX),
        })
    }

    /// Lists a source's events, newest first.
    pub async fn list_by_source(
        &self,
        source_id: SourceId,
        limit: i64,
    ) -> Result<Vec<EventSummary>> {
        let events = sqlx::query_as::<_, EventSummary>(
            r"
            SELECT id, received_at, content_type, body_size, method, path, query
            FROM event
            WHERE source_id = $1
            ORDER BY received_at DESC
            LIMIT $2
            ",
        )
        .bind(source_id)
        .bind(limit)
        .fetch_all(&*self.pool)
        .await?;

        Ok(events)
    }

    async fn count_attempts(&self, event_id: EventId) -> Result<i64> {
        let count =
            sqlx::query_scalar::<_, i64>("SELECT count(*) FROM delivery_attempt WHERE event_id = $1")
                .bind(event_id)
                .fetch_one(&*self.pool)
                .await?;

        Ok(count)
    }
}
