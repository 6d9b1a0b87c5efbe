//! Repository for destination configuration.

use std::{collections::HashMap, sync::Arc};

use sqlx::PgPool;

use crate::{
    error::{CoreError, Result},
    models::{Destination, DestinationId},
};

/// Parameters accepted when creating a destination.
///
/// Optional fields fall back to the operational defaults below; rate and
/// breaker parameters are validated before insert.
#[derive(Debug, Clone)]
pub struct NewDestination {
    /// Unique name.
    pub name: String,
    /// Target URL.
    pub url: String,
    /// Static headers for every dispatch.
    pub headers: HashMap<String, String>,
    /// Optional HMAC signing key.
    pub secret: Option<String>,
    /// TCP connect timeout in seconds.
    pub connect_timeout_s: i32,
    /// End-to-end request timeout in seconds.
    pub total_timeout_s: i32,
    /// TLS certificate verification.
    pub verify_tls: bool,
    /// Token refill rate per second.
    pub max_rps: f64,
    /// Token bucket capacity.
    pub burst: i32,
    /// In-flight request cap.
    pub max_inflight: i32,
    /// Failure ratio that opens the breaker.
    pub breaker_failure_ratio: f64,
    /// Minimum observations before the ratio applies.
    pub breaker_min_requests: i32,
    /// Breaker cooldown in seconds.
    pub breaker_cooldown_s: i32,
    /// Append the event path tail and query to the URL.
    pub append_path: bool,
}

impl NewDestination {
    /// Creates parameters with operational defaults for the given name/url.
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            headers: HashMap::new(),
            secret: None,
            connect_timeout_s: 5,
            total_timeout_s: 15,
            verify_tls: true,
            max_rps: 5.0,
            burst: 10,
            max_inflight: 5,
            breaker_failure_ratio: 0.5,
            breaker_min_requests: 10,
            breaker_cooldown_s: 60,
            append_path: false,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.name.is_empty() || self.url.is_empty() {
            return Err(CoreError::InvalidInput("name and url are required".to_string()));
        }
        if self.max_rps <= 0.0 {
            return Err(CoreError::InvalidInput("max_rps must be positive".to_string()));
        }
        if self.burst < 1 {
            return Err(CoreError::InvalidInput("burst must be at least 1".to_string()));
        }
        if self.max_inflight < 1 {
            return Err(CoreError::InvalidInput("max_inflight must be at least 1".to_string()));
        }
        if !(0.0..=1.0).contains(&self.breaker_failure_ratio) {
            return Err(CoreError::InvalidInput(
                "breaker_failure_ratio must be between 0.0 and 1.0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Destination repository.
pub struct Repository {
    pool: Arc<PgPool>,
}

const ALL_COLUMNS: &str = "id, name, url, headers, secret, connect_timeout_s, total_timeout_s, \
                           verify_tls, max_rps, burst, max_inflight, breaker_failure_ratio, \
                           breaker_min_requests, breaker_cooldown_s, append_path, created_at";

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Lists all destinations, newest first.
    pub async fn list(&self) -> Result<Vec<Destination>> {
        let destinations = sqlx::query_as::<_, Destination>(&format!(
            "SELECT {ALL_COLUMNS} FROM destination ORDER BY created_at DESC"
        ))
        .fetch_all(&*self.pool)
        .await?;

        Ok(destinations)
    }

    /// Finds a destination by name.
    pub async fn find_by_name(&self, name: &str) -> Result<Option<Destination>> {
        let destination = sqlx::query_as::<_, Destination>(&format!(
            "SELECT {ALL_COLUMNS} FROM destination WHERE name = $1"
        ))
        .bind(name)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(destination)
    }

    /// Validates and inserts a destination, returning the stored row.
    pub async fn create(&self, new: NewDestination) -> Result<Destination> {
        new.validate()?;

        let destination = sqlx::query_as::<_, Destination>(&format!(
            r"
            INSERT INTO destination (
                name, url, headers, secret, connect_timeout_s, total_timeout_s, verify_tls,
                max_rps, burst, max_inflight,
                breaker_failure_ratio, breaker_min_requests, breaker_cooldown_s, append_path
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            RETURNING {ALL_COLUMNS}
            "
        ))
        .bind(&new.name)
        .bind(&new.url)
        .bind(sqlx::types::Json(&new.headers))
        .bind(&new.secret)
        .bind(new.connect_timeout_s)
        .bind(new.total_timeout_s)
        .bind(new.verify_tls)
        .bind(new.max_rps)
        .bind(new.burst)
        .bind(new.max_inflight)
        .bind(new.breaker_failure_ratio)
        .bind(new.breaker_min_requests)
        .bind(new.breaker_cooldown_s)
        .bind(new.append_path)
        .fetch_one(&*self.pool)
        .await?;

        Ok(destination)
    }

    /// Deletes a destination and its routes.
    pub async fn delete(&self, id: DestinationId) -> Result<()> {
        let result = sqlx::query("DELETE FROM destination WHERE id = $1")
            .bind(id)
            .execute(&*self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("destination {id} not found")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_parameters_validated() {
        let mut new = NewDestination::new("dest", "https://example.test/hook");
        assert!(new.validate().is_ok());

        new.max_rps = 0.0;
        assert!(new.validate().is_err());
        new.max_rps = 1.0;

        new.burst = 0;
        assert!(new.validate().is_err());
        new.burst = 1;

        new.max_inflight = 0;
        assert!(new.validate().is_err());
        new.max_inflight = 1;

        assert!(new.validate().is_ok());
    }

    #[test]
    fn name_and_url_required() {
        let new = NewDestination::new("", "https://example.test");
        assert!(new.validate().is_err());

        let new = NewDestination::new("dest", "");
        assert!(new.validate().is_err());
    }
}
