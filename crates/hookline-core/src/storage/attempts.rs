//! Repository for delivery attempt listings.
//!
//! Workers mutate attempts through the delivery crate's store; this
//! repository only serves the operator read path.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::{
    error::Result,
    models::{AttemptId, AttemptStatus, EventId, RouteId},
};

/// Compact attempt row for operator listings; omits bodies and headers.
#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
pub struct AttemptSummary {
    /// Attempt identifier.
    pub id: AttemptId,
    /// Route the attempt belongs to.
    pub route_id: RouteId,
    /// Zero-based retry counter.
    pub attempt_no: i32,
    /// Current lifecycle state.
    pub status: AttemptStatus,
    /// When the attempt is next due.
    pub next_at: DateTime<Utc>,
    /// Last claim time.
    pub picked_at: Option<DateTime<Utc>>,
    /// Terminal success time.
    pub succeeded_at: Option<DateTime<Utc>>,
    /// Terminal failure time.
    pub failed_at: Option<DateTime<Utc>>,
    /// HTTP status of the last dispatch.
    pub http_code: Option<i32>,
}

/// Attempt repository.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Lists an event's attempts in creation order.
    pub async fn list_by_event(
        &self,
        event_id: EventId,
        limit: i64,
    ) -> Result<Vec<AttemptSummary>> {
        let attempts = sqlx::query_as::<_, AttemptSummary>(
            r"
            SELECT id, route_id, attempt_no, status, next_at,
                   picked_at, succeeded_at, failed_at, http_code
            FROM delivery_attempt
            WHERE event_id = $1
            ORDER BY created_at ASC
            LIMIT $2
            ",
        )
        .bind(event_id)
        .bind(limit)
        .fetch_all(&*self.pool)
        .await?;

        Ok(attempts)
    }
}
