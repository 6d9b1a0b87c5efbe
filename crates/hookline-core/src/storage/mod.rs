//! Repository layer over PostgreSQL.
//!
//! The ingress and admin surfaces go through these repositories; the delivery
//! worker keeps its own store behind a capability trait so tests can swap in
//! an in-memory queue. Each repository shares one connection pool.

use std::sync::Arc;

use sqlx::PgPool;

pub mod attempts;
pub mod destinations;
pub mod events;
pub mod routes;
pub mod sources;

use crate::error::Result;

/// Container for all repository instances.
#[derive(Clone)]
pub struct Storage {
    /// Source (producer) operations.
    pub sources: Arc<sources::Repository>,

    /// Destination configuration operations.
    pub destinations: Arc<destinations::Repository>,

    /// Route operations.
    pub routes: Arc<routes::Repository>,

    /// Event ingestion, lookup, and replay.
    pub events: Arc<events::Repository>,

    /// Delivery attempt listings.
    pub attempts: Arc<attempts::Repository>,
}

impl Storage {
    /// Creates a storage instance sharing the given pool.
    pub fn new(pool: PgPool) -> Self {
        let pool = Arc::new(pool);

        Self {
            sources: Arc::new(sources::Repository::new(pool.clone())),
            destinations: Arc::new(destinations::Repository::new(pool.clone())),
            routes: Arc::new(routes::Repository::new(pool.clone())),
            events: Arc::new(events::Repository::new(pool.clone())),
            attempts: Arc::new(attempts::Repository::new(pool)),
        }
    }

    /// Verifies database connectivity with a trivial query.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&*self.events.pool()).await?;
        Ok(())
    }
}
