//! Repository for source (producer) operations.
//!
//! Token lookup is the hot path: every ingress request resolves its bearer
//! token here. Rotation replaces the token in place; deletion cascades into
//! events only when no live attempts remain.

use std::sync::Arc;

use sqlx::PgPool;

use crate::{
    error::{CoreError, Result},
    models::{Source, SourceId},
};

/// Source repository.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Resolves a bearer token to its source row.
    pub async fn find_by_token(&self, token: &str) -> Result<Option<Source>> {
        let source = sqlx::query_as::<_, Source>(
            r"
            SELECT id, name, token, enabled, ip_allow_cidrs, max_body_bytes, created_at
            FROM source
            WHERE token = $1
            ",
        )
        .bind(token)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(source)
    }

    /// Finds a source by name.
    pub async fn find_by_name(&self, name: &str) -> Result<Option<Source>> {
        let source = sqlx::query_as::<_, Source>(
            r"
            SELECT id, name, token, enabled, ip_allow_cidrs, max_body_bytes, created_at
            FROM source
            WHERE name = $1
            ",
        )
        .bind(name)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(source)
    }

    /// Lists all sources, newest first.
    pub async fn list(&self) -> Result<Vec<Source>> {
        let sources = sqlx::query_as::<_, Source>(
            r"
            SELECT id, name, token, enabled, ip_allow_cidrs, max_body_bytes, created_at
            FROM source
            ORDER BY created_at DESC
            ",
        )
        .fetch_all(&*self.pool)
        .await?;

        Ok(sources)
    }

    /// Creates a source and returns the stored row.
    pub async fn create(
        &self,
        name: &str,
        token: &str,
        enabled: bool,
        ip_allow_cidrs: &[String],
        max_body_bytes: i32,
    ) -> Result<Source> {
        let source = sqlx::query_as::<_, Source>(
            r"
            INSERT INTO source (name, token, enabled, ip_allow_cidrs, max_body_bytes)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, name, token, enabled, ip_allow_cidrs, max_body_bytes, created_at
            ",
        )
        .bind(name)
        .bind(token)
        .bind(enabled)
        .bind(ip_allow_cidrs)
        .bind(max_body_bytes)
        .fetch_one(&*self.pool)
        .await?;

        Ok(source)
    }

    /// Reads the current token for a source.
    pub async fn token(&self, id: SourceId) -> Result<String> {
        let token = sqlx::query_scalar::<_, String>("SELECT token FROM source WHERE id = $1")
            .bind(id)
            .fetch_optional(&*self.pool)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("source {id} not found")))?;

        Ok(token)
    }

    /// Replaces the token in place.
    pub async fn rotate_token(&self, id: SourceId, new_token: &str) -> Result<()> {
        let result = sqlx::query("UPDATE source SET token = $2 WHERE id = $1")
            .bind(id)
            .bind(new_token)
            .execute(&*self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("source {id} not found")));
        }
        Ok(())
    }

    /// Deletes a source, cascading into its events.
    ///
    /// Refused while any of the source's attempts are still live (`pending`
    /// or `picked`); the cascade must not pull work out from under a worker.
    pub async fn delete(&self, id: SourceId) -> Result<()> {
        let live: bool = sqlx::query_scalar(
            r"
            SELECT EXISTS (
                SELECT 1
                FROM delivery_attempt da
                JOIN event e ON e.id = da.event_id
                WHERE e.source_id = $1
                  AND da.status IN ('pending', 'picked')
            )
            ",
        )
        .bind(id)
        .fetch_one(&*self.pool)
        .await?;

        if live {
            return Err(CoreError::ConstraintViolation(
                "source has live delivery attempts".to_string(),
            ));
        }

        let result = sqlx::query("DELETE FROM source WHERE id = $1")
            .bind(id)
            .execute(&*self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("source {id} not found")));
        }
        Ok(())
    }
}
