//! Admin CRUD over sources, destinations, and routes.
//!
//! Protected by the bearer-or-basic middleware. Response shapes follow the
//! data model one-for-one; source tokens and destination secrets never
//! appear in listings.

use std::collections::HashMap;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use hookline_core::{
    storage::{
        attempts::AttemptSummary, destinations::NewDestination, events::EventSummary,
        routes::RouteView,
    },
    DestinationId, EventId, RouteId, Source, SourceId,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{error::ApiError, AppState};

/// Uniform listing envelope.
#[derive(Debug, Serialize)]
pub struct Items<T> {
    /// Listed rows.
    pub items: Vec<T>,
}

// --- sources ---

/// Source row as listed; omits the token.
#[derive(Debug, Serialize)]
pub struct SourceItem {
    /// Source id.
    pub source_id: String,
    /// Unique name.
    pub name: String,
    /// Whether ingress accepts this source.
    pub enabled: bool,
    /// CIDR allow-list.
    pub ip_allow_cidrs: Vec<String>,
    /// Body cap in bytes.
    pub max_body_bytes: i32,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl From<Source> for SourceItem {
    fn from(source: Source) -> Self {
        Self {
            source_id: source.id.to_string(),
            name: source.name,
            enabled: source.enabled,
            ip_allow_cidrs: source.ip_allow_cidrs,
            max_body_bytes: source.max_body_bytes,
            created_at: source.created_at,
        }
    }
}

/// `GET /admin/sources`.
pub async fn list_sources(State(state): State<AppState>) -> Result<Json<Items<SourceItem>>, ApiError> {
    let sources = state.storage.sources.list().await.map_err(ApiError::from)?;
    Ok(Json(Items { items: sources.into_iter().map(SourceItem::from).collect() }))
}

/// Creation parameters for a source.
#[derive(Debug, Deserialize)]
pub struct CreateSource {
    /// Unique name (required).
    pub name: String,
    /// Explicit token; generated when absent.
    pub token: Option<String>,
    /// Defaults to enabled.
    pub enabled: Option<bool>,
    /// Defaults to empty (any address).
    pub ip_allow_cidrs: Option<Vec<String>>,
    /// Defaults to 1 MiB.
    pub max_body_bytes: Option<i32>,
}

/// Body of a successful source creation; the only place the token is
/// returned in full besides the token endpoint.
#[derive(Debug, Serialize)]
pub struct CreatedSource {
    /// Source id.
    pub source_id: String,
    /// Name as stored.
    pub name: String,
    /// The bearer token.
    pub token: String,
    /// Enabled flag as stored.
    pub enabled: bool,
}

/// `POST /admin/sources`.
pub async fn create_source(
    State(state): State<AppState>,
    Json(req): Json<CreateSource>,
) -> Result<Json<CreatedSource>, ApiError> {
    if req.name.is_empty() {
        return Err(ApiError::BadRequest("name required".to_string()));
    }

    let token = req
        .token
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let source = state
        .storage
        .sources
        .create(
            &req.name,
            &token,
            req.enabled.unwrap_or(true),
            &req.ip_allow_cidrs.unwrap_or_default(),
            req.max_body_bytes.unwrap_or(1_048_576),
        )
        .await
        .map_err(ApiError::from)?;

    Ok(Json(CreatedSource {
        source_id: source.id.to_string(),
        name: source.name,
        token: source.token,
        enabled: source.enabled,
    }))
}

/// Token-bearing response.
#[derive(Debug, Serialize)]
pub struct TokenResponse {
    /// The current bearer token.
    pub token: String,
}

/// `GET /admin/sources/{id}/token`.
pub async fn source_token(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<TokenResponse>, ApiError> {
    let token = state.storage.sources.token(SourceId::from(id)).await.map_err(ApiError::from)?;
    Ok(Json(TokenResponse { token }))
}

/// `POST /admin/sources/{id}/rotate` replaces the token in place.
pub async fn rotate_source_token(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<TokenResponse>, ApiError> {
    let token = Uuid::new_v4().to_string();
    state
        .storage
        .sources
        .rotate_token(SourceId::from(id), &token)
        .await
        .map_err(ApiError::from)?;
    Ok(Json(TokenResponse { token }))
}

/// `DELETE /admin/sources/{id}`; refused while live attempts remain.
pub async fn delete_source(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.storage.sources.delete(SourceId::from(id)).await.map_err(ApiError::from)?;
    Ok(StatusCode::NO_CONTENT)
}

// --- destinations ---

/// Destination row as listed; omits the signing secret.
#[derive(Debug, Serialize)]
pub struct DestinationItem {
    /// Destination id.
    pub destination_id: String,
    /// Unique name.
    pub name: String,
    /// Target URL.
    pub url: String,
    /// Static headers.
    pub headers: HashMap<String, String>,
    /// Connect timeout in seconds.
    pub connect_timeout_s: i32,
    /// Total timeout in seconds.
    pub total_timeout_s: i32,
    /// TLS verification flag.
    pub verify_tls: bool,
    /// Token refill rate.
    pub max_rps: f64,
    /// Bucket capacity.
    pub burst: i32,
    /// In-flight cap.
    pub max_inflight: i32,
    /// Breaker open threshold.
    pub breaker_failure_ratio: f64,
    /// Breaker minimum observations.
    pub breaker_min_requests: i32,
    /// Breaker cooldown seconds.
    pub breaker_cooldown_s: i32,
    /// Path-append flag.
    pub append_path: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// `GET /admin/destinations`.
pub async fn list_destinations(
    State(state): State<AppState>,
) -> Result<Json<Items<DestinationItem>>, ApiError> {
    let destinations = state.storage.destinations.list().await.map_err(ApiError::from)?;
    let items = destinations
        .into_iter()
        .map(|d| DestinationItem {
            destination_id: d.id.to_string(),
            name: d.name,
            url: d.url,
            headers: d.headers.0,
            connect_timeout_s: d.connect_timeout_s,
            total_timeout_s: d.total_timeout_s,
            verify_tls: d.verify_tls,
            max_rps: d.max_rps,
            burst: d.burst,
            max_inflight: d.max_inflight,
            breaker_failure_ratio: d.breaker_failure_ratio,
            breaker_min_requests: d.breaker_min_requests,
            breaker_cooldown_s: d.breaker_cooldown_s,
            append_path: d.append_path,
            created_at: d.created_at,
        })
        .collect();
    Ok(Json(Items { items }))
}

/// Creation parameters for a destination; omitted fields take operational
/// defaults.
#[derive(Debug, Deserialize)]
pub struct CreateDestination {
    /// Unique name (required).
    pub name: String,
    /// Target URL (required).
    pub url: String,
    /// Static headers.
    pub headers: Option<HashMap<String, String>>,
    /// HMAC signing key.
    pub secret: Option<String>,
    /// Connect timeout seconds.
    pub connect_timeout_s: Option<i32>,
    /// Total timeout seconds.
    pub total_timeout_s: Option<i32>,
    /// TLS verification.
    pub verify_tls: Option<bool>,
    /// Token refill rate; must be positive.
    pub max_rps: Option<f64>,
    /// Bucket capacity; at least 1.
    pub burst: Option<i32>,
    /// In-flight cap; at least 1.
    pub max_inflight: Option<i32>,
    /// Breaker open threshold.
    pub breaker_failure_ratio: Option<f64>,
    /// Breaker minimum observations.
    pub breaker_min_requests: Option<i32>,
    /// Breaker cooldown seconds.
    pub breaker_cooldown_s: Option<i32>,
    /// Path-append flag.
    pub append_path: Option<bool>,
}

/// Body of a successful destination creation.
#[derive(Debug, Serialize)]
pub struct CreatedDestination {
    /// Destination id.
    pub destination_id: String,
    /// Name as stored.
    pub name: String,
    /// URL as stored.
    pub url: String,
}

/// `POST /admin/destinations`.
pub async fn create_destination(
    State(state): State<AppState>,
    Json(req): Json<CreateDestination>,
) -> Result<Json<CreatedDestination>, ApiError> {
    let mut new = NewDestination::new(req.name, req.url);
    if let Some(headers) = req.headers {
        new.headers = headers;
    }
    new.secret = req.secret.filter(|s| !s.is_empty());
    if let Some(v) = req.connect_timeout_s {
        new.connect_timeout_s = v;
    }
    if let Some(v) = req.total_timeout_s {
        new.total_timeout_s = v;
    }
    if let Some(v) = req.verify_tls {
        new.verify_tls = v;
    }
    if let Some(v) = req.max_rps {
        new.max_rps = v;
    }
    if let Some(v) = req.burst {
        new.burst = v;
    }
    if let Some(v) = req.max_inflight {
        new.max_inflight = v;
    }
    if let Some(v) = req.breaker_failure_ratio {
        new.breaker_failure_ratio = v;
    }
    if let Some(v) = req.breaker_min_requests {
        new.breaker_min_requests = v;
    }
    if let Some(v) = req.breaker_cooldown_s {
        new.breaker_cooldown_s = v;
    }
    if let Some(v) = req.append_path {
        new.append_path = v;
    }

    let destination = state.storage.destinations.create(new).await.map_err(ApiError::from)?;
    Ok(Json(CreatedDestination {
        destination_id: destination.id.to_string(),
        name: destination.name,
        url: destination.url,
    }))
}

/// `DELETE /admin/destinations/{id}`.
pub async fn delete_destination(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.storage.destinations.delete(DestinationId::from(id)).await.map_err(ApiError::from)?;
    Ok(StatusCode::NO_CONTENT)
}

// --- routes ---

/// `GET /admin/routes`.
pub async fn list_routes(State(state): State<AppState>) -> Result<Json<Items<RouteView>>, ApiError> {
    let routes = state.storage.routes.list().await.map_err(ApiError::from)?;
    Ok(Json(Items { items: routes }))
}

/// Creation parameters for a route; both ends accept an id or a name.
#[derive(Debug, Deserialize)]
pub struct CreateRoute {
    /// Source id.
    pub source_id: Option<Uuid>,
    /// Source name, resolved when no id given.
    pub source_name: Option<String>,
    /// Destination id.
    pub destination_id: Option<Uuid>,
    /// Destination name, resolved when no id given.
    pub destination_name: Option<String>,
    /// Defaults to enabled.
    pub enabled: Option<bool>,
    /// Optional SQL-LIKE content type filter.
    pub content_type_like: Option<String>,
    /// Display ordering.
    pub ord: Option<i16>,
}

/// Body of a successful route creation.
#[derive(Debug, Serialize)]
pub struct CreatedRoute {
    /// Route id.
    pub route_id: String,
}

/// `POST /admin/routes`.
pub async fn create_route(
    State(state): State<AppState>,
    Json(req): Json<CreateRoute>,
) -> Result<Json<CreatedRoute>, ApiError> {
    let source_id = match (req.source_id, req.source_name.as_deref()) {
        (Some(id), _) => SourceId::from(id),
        (None, Some(name)) => state
            .storage
            .sources
            .find_by_name(name)
            .await
            .map_err(ApiError::from)?
            .map(|s| s.id)
            .ok_or_else(|| ApiError::BadRequest("unknown source".to_string()))?,
        (None, None) => return Err(ApiError::BadRequest("source required".to_string())),
    };

    let destination_id = match (req.destination_id, req.destination_name.as_deref()) {
        (Some(id), _) => DestinationId::from(id),
        (None, Some(name)) => state
            .storage
            .destinations
            .find_by_name(name)
            .await
            .map_err(ApiError::from)?
            .map(|d| d.id)
            .ok_or_else(|| ApiError::BadRequest("unknown destination".to_string()))?,
        (None, None) => return Err(ApiError::BadRequest("destination required".to_string())),
    };

    let route = state
        .storage
        .routes
        .create(
            source_id,
            destination_id,
            req.enabled.unwrap_or(true),
            req.content_type_like.as_deref(),
            req.ord.unwrap_or(0),
        )
        .await
        .map_err(ApiError::from)?;

    Ok(Json(CreatedRoute { route_id: route.id.to_string() }))
}

/// `POST /admin/routes/{id}/pause`.
pub async fn pause_route(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.storage.routes.set_enabled(RouteId::from(id), false).await.map_err(ApiError::from)?;
    Ok(StatusCode::OK)
}

/// `POST /admin/routes/{id}/resume`.
pub async fn resume_route(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.storage.routes.set_enabled(RouteId::from(id), true).await.map_err(ApiError::from)?;
    Ok(StatusCode::OK)
}

/// `DELETE /admin/routes/{id}`.
pub async fn delete_route(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.storage.routes.delete(RouteId::from(id)).await.map_err(ApiError::from)?;
    Ok(StatusCode::NO_CONTENT)
}

// --- listings ---

const DEFAULT_EVENT_LIMIT: i64 = 20;
const DEFAULT_ATTEMPT_LIMIT: i64 = 50;
const MAX_LIMIT: i64 = 200;

/// Query parameters for the event listing.
#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    /// Filter by source id.
    pub source_id: Option<Uuid>,
    /// Filter by source name when no id given.
    pub source_name: Option<String>,
    /// Page size, capped at 200.
    pub limit: Option<i64>,
}

/// `GET /admin/events?source_id=...|source_name=...&limit=20`.
pub async fn list_events(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<Items<EventSummary>>, ApiError> {
    let source_id = match (query.source_id, query.source_name.as_deref()) {
        (Some(id), _) => SourceId::from(id),
        (None, Some(name)) => state
            .storage
            .sources
            .find_by_name(name)
            .await
            .map_err(ApiError::from)?
            .map(|s| s.id)
            .ok_or_else(|| ApiError::BadRequest("unknown source".to_string()))?,
        (None, None) => {
            return Err(ApiError::BadRequest("source_id or source_name required".to_string()))
        },
    };

    let limit = query.limit.unwrap_or(DEFAULT_EVENT_LIMIT).clamp(1, MAX_LIMIT);
    let events =
        state.storage.events.list_by_source(source_id, limit).await.map_err(ApiError::from)?;
    Ok(Json(Items { items: events }))
}

/// Query parameters for the attempt listing.
#[derive(Debug, Deserialize)]
pub struct AttemptsQuery {
    /// Event whose attempts to list.
    pub event_id: Uuid,
    /// Page size, capped at 200.
    pub limit: Option<i64>,
}

/// `GET /admin/attempts?event_id=...&limit=50`.
pub async fn list_attempts(
    State(state): State<AppState>,
    Query(query): Query<AttemptsQuery>,
) -> Result<Json<Items<AttemptSummary>>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_ATTEMPT_LIMIT).clamp(1, MAX_LIMIT);
    let attempts = state
        .storage
        .attempts
        .list_by_event(EventId::from(query.event_id), limit)
        .await
        .map_err(ApiError::from)?;
    Ok(Json(Items { items: attempts }))
}
