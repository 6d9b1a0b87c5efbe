//! Event ingestion.
//!
//! Producers authenticate with a bearer token, either in the Authorization
//! header (`POST /ingest`) or as a path segment (`POST /ingest/{token}`,
//! optionally followed by a tail the event records for `append_path`
//! destinations). The accepted body is persisted verbatim; one pending
//! attempt per matching enabled route is inserted in the same transaction.

use std::{collections::HashMap, net::SocketAddr};

use axum::{
    extract::{ConnectInfo, Path, Request, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use hookline_core::storage::events::NewEvent;
use serde::Serialize;
use tracing::{debug, info, instrument};

use crate::{error::ApiError, AppState};

/// Body of the 202 response.
#[derive(Debug, Serialize)]
pub struct IngestResponse {
    /// Stable event identity.
    pub event_id: String,
    /// Attempts associated with the event.
    pub attempts_created: i64,
}

/// `POST /ingest` with `Authorization: Bearer <token>`.
pub async fn ingest_bearer(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    req: Request,
) -> Result<Response, ApiError> {
    let token = bearer_token(req.headers()).ok_or(ApiError::Unauthorized)?.to_string();
    ingest_inner(state, token, String::new(), peer, req).await
}

/// `POST /ingest/{token}`.
pub async fn ingest_token(
    State(state): State<AppState>,
    Path(token): Path<String>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    req: Request,
) -> Result<Response, ApiError> {
    ingest_inner(state, token, String::new(), peer, req).await
}

/// `POST /ingest/{token}/{tail...}`; the tail is recorded on the event.
pub async fn ingest_token_tail(
    State(state): State<AppState>,
    Path((token, tail)): Path<(String, String)>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    req: Request,
) -> Result<Response, ApiError> {
    ingest_inner(state, token, tail, peer, req).await
}

#[instrument(name = "ingest", skip_all, fields(tail = %tail))]
async fn ingest_inner(
    state: AppState,
    token: String,
    tail: String,
    peer: SocketAddr,
    req: Request,
) -> Result<Response, ApiError> {
    let source = state
        .storage
        .sources
        .find_by_token(&token)
        .await
        .map_err(ApiError::from)?
        .ok_or(ApiError::Unauthorized)?;

    if !source.enabled {
        return Err(ApiError::SourceDisabled);
    }

    let client_ip = client_ip(req.headers(), peer);
    if !source.ip_allow_cidrs.is_empty() && !ip_allowed(&client_ip, &source.ip_allow_cidrs) {
        return Err(ApiError::IpBlocked);
    }

    let method = req.method().as_str().to_string();
    let query = req.uri().query().unwrap_or_default().to_string();
    let content_type = req
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .filter(|ct| !ct.is_empty())
        .map(str::to_string);
    let idempotency_key = req
        .headers()
        .get("idempotency-key")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(str::to_string);
    let headers = canonical_headers(req.headers());

    let max_body = usize::try_from(source.max_body_bytes).unwrap_or(usize::MAX);
    let body = axum::body::to_bytes(req.into_body(), max_body)
        .await
        .map_err(|_| ApiError::PayloadTooLarge)?;

    debug!(
        source = %source.id,
        body_size = body.len(),
        idempotent = idempotency_key.is_some(),
        "ingest accepted for persistence"
    );

    let new_event = NewEvent {
        source_id: source.id,
        received_at: state.clock.now_utc(),
        content_type,
        headers,
        body: body.to_vec(),
        source_ip: Some(client_ip),
        idempotency_key,
        method,
        path: normalize_tail(&tail),
        query,
    };

    let outcome = state.storage.events.ingest(&new_event).await.map_err(ApiError::from)?;

    info!(
        event_id = %outcome.event_id,
        attempts_created = outcome.attempts_created,
        "event ingested"
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(IngestResponse {
            event_id: outcome.event_id.to_string(),
            attempts_created: outcome.attempts_created,
        }),
    )
        .into_response())
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let auth = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, rest) = auth.split_once(' ')?;
    scheme.eq_ignore_ascii_case("bearer").then(|| rest.trim()).filter(|t| !t.is_empty())
}

/// Lowercases header names and joins repeated values with `", "`.
fn canonical_headers(headers: &HeaderMap) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for name in headers.keys() {
        let joined = headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect::<Vec<_>>()
            .join(", ");
        out.insert(name.as_str().to_ascii_lowercase(), joined);
    }
    out
}

/// First `X-Forwarded-For` hop when present, else the peer address.
fn client_ip(headers: &HeaderMap, peer: SocketAddr) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|xff| xff.split(',').next())
        .map(str::trim)
        .filter(|hop| !hop.is_empty())
        .map_or_else(|| peer.ip().to_string(), str::to_string)
}

fn ip_allowed(ip: &str, cidrs: &[String]) -> bool {
    let Ok(addr) = ip.parse::<std::net::IpAddr>() else {
        return false;
    };
    cidrs
        .iter()
        .filter_map(|cidr| cidr.parse::<ipnet::IpNet>().ok())
        .any(|net| net.contains(&addr))
}

fn normalize_tail(tail: &str) -> String {
    if tail.is_empty() {
        "/".to_string()
    } else if tail.starts_with('/') {
        tail.to_string()
    } else {
        format!("/{tail}")
    }
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn headers_lowercased_and_joined() {
        let mut headers = HeaderMap::new();
        headers.insert("Content-Type", HeaderValue::from_static("application/json"));
        headers.append("X-Tag", HeaderValue::from_static("a"));
        headers.append("X-Tag", HeaderValue::from_static("b"));

        let canonical = canonical_headers(&headers);
        assert_eq!(canonical.get("content-type").unwrap(), "application/json");
        assert_eq!(canonical.get("x-tag").unwrap(), "a, b");
        assert!(!canonical.contains_key("Content-Type"));
    }

    #[test]
    fn forwarded_for_first_hop_wins() {
        let peer: SocketAddr = "198.51.100.7:443".parse().unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.5, 10.0.0.1"),
        );
        assert_eq!(client_ip(&headers, peer), "203.0.113.5");

        let headers = HeaderMap::new();
        assert_eq!(client_ip(&headers, peer), "198.51.100.7");
    }

    #[test]
    fn cidr_allow_list_matching() {
        let cidrs = vec!["203.0.113.0/24".to_string(), "2001:470::/32".to_string()];

        assert!(ip_allowed("203.0.113.99", &cidrs));
        assert!(!ip_allowed("203.0.114.1", &cidrs));
        assert!(ip_allowed("2001:470:1::1", &cidrs));
        assert!(!ip_allowed("2606:4700::1", &cidrs));
        assert!(!ip_allowed("not-an-ip", &cidrs));

        // Unparsable entries are skipped, not matched.
        let broken = vec!["garbage".to_string()];
        assert!(!ip_allowed("203.0.113.99", &broken));
    }

    #[test]
    fn tail_normalized_with_leading_slash() {
        assert_eq!(normalize_tail(""), "/");
        assert_eq!(normalize_tail("github/push"), "/github/push");
        assert_eq!(normalize_tail("/already"), "/already");
    }

    #[test]
    fn bearer_scheme_is_case_insensitive() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("BEARER tok-1"));
        assert_eq!(bearer_token(&headers), Some("tok-1"));

        headers.insert("authorization", HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer_token(&headers), None);
    }
}
