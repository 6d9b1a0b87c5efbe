//! Router assembly and server lifecycle.
//!
//! Requests flow through request-id injection, tracing, and a timeout layer
//! before reaching the handlers. The admin routes are only mounted when
//! admin credentials are configured, and sit behind the auth middleware.

use std::{net::SocketAddr, time::Duration};

use axum::{
    extract::Request,
    middleware::{self, Next},
    response::Response,
    routing::{delete, get, post},
    Router,
};
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::info;
use uuid::Uuid;

use crate::{handlers, middleware::auth::admin_auth, AppState};

/// Builds the full router for the ingress role.
pub fn create_router(state: AppState) -> Router {
    let public = Router::new()
        .route("/healthz", get(handlers::healthz))
        .route("/ingest", post(handlers::ingest::ingest_bearer))
        .route("/ingest/{token}", post(handlers::ingest::ingest_token))
        .route("/ingest/{token}/{*tail}", post(handlers::ingest::ingest_token_tail))
        .route("/events/{id}/replay", post(handlers::replay::replay_event));

    let mut router = public;

    if state.config.admin_enabled() {
        let admin = Router::new()
            .route(
                "/admin/sources",
                get(handlers::admin::list_sources).post(handlers::admin::create_source),
            )
            .route("/admin/sources/{id}", delete(handlers::admin::delete_source))
            .route("/admin/sources/{id}/token", get(handlers::admin::source_token))
            .route("/admin/sources/{id}/rotate", post(handlers::admin::rotate_source_token))
            .route(
                "/admin/destinations",
                get(handlers::admin::list_destinations).post(handlers::admin::create_destination),
            )
            .route("/admin/destinations/{id}", delete(handlers::admin::delete_destination))
            .route(
                "/admin/routes",
                get(handlers::admin::list_routes).post(handlers::admin::create_route),
            )
            .route("/admin/routes/{id}", delete(handlers::admin::delete_route))
            .route("/admin/routes/{id}/pause", post(handlers::admin::pause_route))
            .route("/admin/routes/{id}/resume", post(handlers::admin::resume_route))
            .route("/admin/events", get(handlers::admin::list_events))
            .route("/admin/attempts", get(handlers::admin::list_attempts))
            .layer(middleware::from_fn_with_state(state.clone(), admin_auth));
        router = router.merge(admin);
    }

    router
        .layer(TimeoutLayer::new(Duration::from_secs(state.config.request_timeout)))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(inject_request_id))
        .with_state(state)
}

/// Adds an `X-Request-Id` header to every response for cross-service
/// correlation.
async fn inject_request_id(req: Request, next: Next) -> Response {
    let request_id = Uuid::new_v4().to_string();

    let mut req = req;
    req.extensions_mut().insert(request_id.clone());

    let mut response = next.run(req).await;
    if let Ok(value) = request_id.parse() {
        response.headers_mut().insert("X-Request-Id", value);
    }
    response
}

/// Binds and serves until a shutdown signal arrives.
pub async fn start_server(state: AppState, addr: SocketAddr) -> Result<(), std::io::Error> {
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "ingress listening");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("ingress stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received CTRL+C, shutting down"),
        () = terminate => info!("received SIGTERM, shutting down"),
    }
}
