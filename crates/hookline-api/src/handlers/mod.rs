//! HTTP request handlers.

pub mod admin;
pub mod ingest;
pub mod replay;

/// Liveness probe.
pub async fn healthz() -> &'static str {
    "ok"
}
