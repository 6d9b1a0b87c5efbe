//! Core domain types and storage layer for the hookline webhook relay.
//!
//! Provides strongly-typed identifiers, the entity models shared by the
//! ingress and delivery sides, error handling, the clock abstraction, and
//! the repository layer over PostgreSQL. All other crates depend on these
//! foundational types.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod models;
pub mod storage;
pub mod time;

pub use error::{CoreError, Result};
pub use models::{
    AttemptId, AttemptStatus, DeliveryAttempt, Destination, DestinationHealth, DestinationId,
    Event, EventId, Route, RouteId, Source, SourceId,
};
pub use time::{Clock, RealClock};

/// Embedded sqlx migrations for the relay schema.
///
/// Applied at startup by the runner binary; sqlx maintains the migrations
/// ledger table itself.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("../../migrations");
