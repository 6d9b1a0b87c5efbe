//! HTTP surface of the hookline relay.
//!
//! The ingress endpoints authenticate producers, persist events, and fan out
//! delivery attempts; the admin endpoints are the configuration seam for
//! sources, destinations, and routes. Request handling is axum with tracing
//! and timeout layers.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::sync::Arc;

use hookline_core::{storage::Storage, Clock};

pub mod config;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod server;

pub use config::{Config, Role};
pub use error::ApiError;
pub use server::{create_router, start_server};

/// Shared state injected into every handler.
#[derive(Clone)]
pub struct AppState {
    /// Repository layer.
    pub storage: Storage,
    /// Time source; handlers stamp `received_at` through this.
    pub clock: Arc<dyn Clock>,
    /// Loaded service configuration.
    pub config: Arc<Config>,
}

impl AppState {
    /// Creates the shared state.
    pub fn new(storage: Storage, clock: Arc<dyn Clock>, config: Arc<Config>) -> Self {
        Self { storage, clock, config }
    }
}
