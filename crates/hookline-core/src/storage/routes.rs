//! Repository for route operations.
//!
//! Routes connect a source to a destination; pausing a route stops new
//! attempt fan-out without touching work already queued.

use std::sync::Arc;

use sqlx::PgPool;

use crate::{
    error::{CoreError, Result},
    models::{DestinationId, Route, RouteId, SourceId},
};

/// Route joined with the names of both ends, for operator listings.
#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
pub struct RouteView {
    /// Route identifier.
    pub id: RouteId,
    /// Whether the route currently fans out.
    pub enabled: bool,
    /// Optional content-type LIKE filter.
    pub content_type_like: Option<String>,
    /// Display ordering.
    pub ord: i16,
    /// Producing source id.
    pub source_id: SourceId,
    /// Producing source name.
    pub source_name: String,
    /// Receiving destination id.
    pub destination_id: DestinationId,
    /// Receiving destination name.
    pub destination_name: String,
}

/// Route repository.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Lists all routes with source and destination names.
    pub async fn list(&self) -> Result<Vec<RouteView>> {
        let routes = sqlx::query_as::<_, RouteView>(
            r"
            SELECT r.id, r.enabled, r.content_type_like, r.ord,
                   s.id AS source_id, s.name AS source_name,
                   d.id AS destination_id, d.name AS destination_name
            FROM route r
            JOIN source s ON s.id = r.source_id
            JOIN destination d ON d.id = r.destination_id
            ORDER BY s.name, d.name
            ",
        )
        .fetch_all(&*self.pool)
        .await?;

        Ok(routes)
    }

    /// Creates a route between a source and a destination.
    ///
    /// Fails with a constraint violation when the pair already has a route.
    pub async fn create(
        &self,
        source_id: SourceId,
        destination_id: DestinationId,
        enabled: bool,
        content_type_like: Option<&str>,
        ord: i16,
    ) -> Result<Route> {
        let route = sqlx::query_as::<_, Route>(
            r"
            INSERT INTO route (source_id, destination_id, enabled, content_type_like, ord)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, source_id, destination_id, enabled, content_type_like, ord
            ",
        )
        .bind(source_id)
        .bind(destination_id)
        .bind(enabled)
        .bind(content_type_like)
        .bind(ord)
        .fetch_one(&*self.pool)
        .await?;

        Ok(route)
    }

    /// Pauses or resumes a route.
    pub async fn set_enabled(&self, id: RouteId, enabled: bool) -> Result<()> {
        let result = sqlx::query("UPDATE route SET enabled = $2 WHERE id = $1")
            .bind(id)
            .bind(enabled)
            .execute(&*self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("route {id} not found")));
        }
        Ok(())
    }

    /// Deletes a route.
    ///
    /// Refused by the foreign key while delivery attempts still reference the
    /// route; surfaces as a constraint violation.
    pub async fn delete(&self, id: RouteId) -> Result<()> {
        let result =
            sqlx::query("DELETE FROM route WHERE id = $1").bind(id).execute(&*self.pool).await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("route {id} not found")));
        }
        Ok(())
    }
}
