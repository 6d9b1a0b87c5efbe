//! Outbound HTTP dispatch.
//!
//! Builds the signed request for one attempt and sends it to the pinned
//! destination address. Redirects are never followed; the first response of
//! any status is the outcome. The response body is drained up to 1 MiB and
//! the first 64 KiB persisted.

use std::{collections::HashMap, sync::Arc, time::Duration};

use hmac::{Hmac, Mac};
use hookline_core::{Clock, Destination, Event};
use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE},
    redirect, Method, Url,
};
use sha2::Sha256;
use tracing::debug;

use crate::{
    error::{DeliveryError, Result},
    ssrf::{resolve_pinned, Resolver},
};

/// How much of a response body is read off the wire.
pub const RESPONSE_DRAIN_LIMIT: usize = 1 << 20;

/// How much of a response body is persisted on the attempt row.
pub const RESPONSE_PERSIST_LIMIT: usize = 64 * 1024;

/// Dispatcher-wide settings; per-destination policy rides on the
/// destination row itself.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// User agent presented to destinations.
    pub user_agent: String,

    /// Skip the SSRF block sets. Never enabled in production configuration;
    /// exists for single-host deployments dispatching to loopback.
    pub allow_private_ips: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self { user_agent: "hookline/0.3".to_string(), allow_private_ips: false }
    }
}

/// Response observed from a destination.
#[derive(Debug, Clone)]
pub struct DispatchResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response headers, first value per name.
    pub headers: HashMap<String, String>,
    /// Response body, truncated to the persist cap.
    pub body: String,
}

impl DispatchResponse {
    /// Success classification: transport succeeded and the status is 2xx.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Hardened outbound HTTP client.
pub struct Dispatcher {
    resolver: Arc<dyn Resolver>,
    clock: Arc<dyn Clock>,
    config: DispatcherConfig,
}

impl Dispatcher {
    /// Creates a dispatcher with the given resolver and clock.
    pub fn new(resolver: Arc<dyn Resolver>, clock: Arc<dyn Clock>, config: DispatcherConfig) -> Self {
        Self { resolver, clock, config }
    }

    /// Sends one attempt's request and returns the observed response.
    ///
    /// # Errors
    ///
    /// Returns `SsrfBlocked`, `Dns`, or `InvalidUrl` before any connection is
    /// opened; `Timeout`, `Tls`, or `Network` for transport failures. A
    /// non-2xx response is not an error here; the worker classifies it.
    pub async fn dispatch(&self, destination: &Destination, event: &Event) -> Result<DispatchResponse> {
        let mut url = Url::parse(&destination.url)
            .map_err(|e| DeliveryError::invalid_url(e.to_string()))?;

        if destination.append_path {
            rewrite_url(&mut url, event);
        }

        let host = url
            .host_str()
            .map(str::to_string)
            .ok_or_else(|| DeliveryError::invalid_url("missing host"))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| DeliveryError::invalid_url("unknown scheme"))?;

        let pinned =
            resolve_pinned(self.resolver.as_ref(), &host, port, self.config.allow_private_ips)
                .await?;

        debug!(url = %url, pinned = %pinned, "dispatching attempt");

        let total_timeout = Duration::from_secs(u64::try_from(destination.total_timeout_s).unwrap_or(15));
        let mut builder = reqwest::Client::builder()
            .user_agent(&self.config.user_agent)
            .connect_timeout(Duration::from_secs(
                u64::try_from(destination.connect_timeout_s).unwrap_or(5),
            ))
            .timeout(total_timeout)
            .redirect(redirect::Policy::none())
            .resolve(&host, pinned);
        if !destination.verify_tls {
            builder = builder.danger_accept_invalid_certs(true);
        }
        let client =
            builder.build().map_err(|e| DeliveryError::internal(format!("client build: {e}")))?;

        let method = event
            .method
            .as_deref()
            .filter(|m| !m.is_empty())
            .and_then(|m| Method::from_bytes(m.as_bytes()).ok())
            .unwrap_or(Method::POST);

        // Static headers first; unparsable names or values are skipped.
        let mut headers = HeaderMap::new();
        for (name, value) in &destination.headers.0 {
            if let (Ok(name), Ok(value)) =
                (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value))
            {
                headers.append(name, value);
            }
        }

        // Injected headers replace any colliding static entry; header name
        // matching is case-insensitive.
        headers.insert("x-source-id", header_value(&event.source_id.to_string())?);
        headers.insert("x-event-id", header_value(&event.id.to_string())?);
        if let Some(content_type) = event.content_type.as_deref().filter(|ct| !ct.is_empty()) {
            headers.insert(CONTENT_TYPE, header_value(content_type)?);
        }
        if let Some(secret) = destination.secret.as_deref().filter(|s| !s.is_empty()) {
            let ts = self.clock.now_utc().timestamp();
            headers.insert(
                "x-webhook-signature",
                header_value(&signature_header(secret, ts, &event.body)?)?,
            );
        }

        let request = client.request(method, url).headers(headers).body(event.body.clone());

        let response = request.send().await.map_err(|e| classify_send_error(&e, total_timeout))?;

        let status = response.status().as_u16();
        let mut headers = HashMap::new();
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                headers.entry(name.to_string()).or_insert_with(|| value.to_string());
            }
        }

        let body = drain_capped(response).await;

        Ok(DispatchResponse { status, headers, body })
    }
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| DeliveryError::internal(format!("invalid header value: {e}")))
}

/// `t={unix},v1={lowercase-hex}` signature over `ts + "\n" + body`.
pub fn signature_header(secret: &str, ts: i64, body: &[u8]) -> Result<String> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|_| DeliveryError::internal("invalid signing key"))?;
    mac.update(ts.to_string().as_bytes());
    mac.update(b"\n");
    mac.update(body);
    Ok(format!("t={ts},v1={}", hex::encode(mac.finalize().into_bytes())))
}

/// Appends the event's captured path tail and query to the destination URL.
fn rewrite_url(url: &mut Url, event: &Event) {
    let base = url.path().trim_end_matches('/').to_string();
    let mut tail = event.path.clone().unwrap_or_default();
    if tail.is_empty() {
        tail = "/".to_string();
    }
    if !tail.starts_with('/') {
        tail.insert(0, '/');
    }
    url.set_path(&format!("{base}{tail}"));

    if let Some(query) = event.query.as_deref().filter(|q| !q.is_empty()) {
        let merged = match url.query().filter(|q| !q.is_empty()) {
            Some(existing) => format!("{existing}&{query}"),
            None => query.to_string(),
        };
        url.set_query(Some(&merged));
    }
}

fn classify_send_error(err: &reqwest::Error, total_timeout: Duration) -> DeliveryError {
    if err.is_timeout() {
        return DeliveryError::timeout(total_timeout.as_secs());
    }
    let message = err.to_string();
    let chain = {
        let mut parts = vec![message.clone()];
        let mut source = std::error::Error::source(err);
        while let Some(inner) = source {
            parts.push(inner.to_string());
            source = inner.source();
        }
        parts.join(": ")
    };
    let lowered = chain.to_lowercase();
    if lowered.contains("certificate") || lowered.contains("tls") || lowered.contains("ssl") {
        return DeliveryError::tls(chain);
    }
    if err.is_connect() {
        return DeliveryError::network(format!("connection failed: {chain}"));
    }
    DeliveryError::network(chain)
}

/// Reads up to the drain limit off the wire and keeps the persist cap.
async fn drain_capped(mut response: reqwest::Response) -> String {
    let mut collected: Vec<u8> = Vec::new();
    while collected.len() < RESPONSE_DRAIN_LIMIT {
        match response.chunk().await {
            Ok(Some(chunk)) => {
                let room = RESPONSE_DRAIN_LIMIT - collected.len();
                collected.extend_from_slice(&chunk[..chunk.len().min(room)]);
            },
            Ok(None) => break,
            Err(_) => break,
        }
    }
    let keep = collected.len().min(RESPONSE_PERSIST_LIMIT);
    String::from_utf8_lossy(&collected[..keep]).into_owned()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use chrono::Utc;
    use hookline_core::{DestinationId, EventId, RealClock, SourceId};
    use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::ssrf::SystemResolver;

    fn test_destination(url: &str) -> Destination {
        Destination {
            id: DestinationId::new(),
            name: "echo".to_string(),
            url: url.to_string(),
            headers: sqlx::types::Json(HashMap::new()),
            secret: None,
            connect_timeout_s: 5,
            total_timeout_s: 10,
            verify_tls: true,
            max_rps: 5.0,
            burst: 10,
            max_inflight: 5,
            breaker_failure_ratio: 0.5,
            breaker_min_requests: 10,
            breaker_cooldown_s: 60,
            append_path: false,
            created_at: Utc::now(),
        }
    }

    fn test_event(body: &[u8], content_type: &str) -> Event {
        Event {
            id: EventId::new(),
            source_id: SourceId::new(),
            received_at: Utc::now(),
            content_type: Some(content_type.to_string()),
            headers: sqlx::types::Json(HashMap::new()),
            body: body.to_vec(),
            body_size: i32::try_from(body.len()).unwrap(),
            source_ip: None,
            idempotency_key: None,
            body_hash: Event::hash_body(body),
            method: None,
            path: Some("/".to_string()),
            query: Some(String::new()),
        }
    }

    fn test_dispatcher() -> Dispatcher {
        Dispatcher::new(
            Arc::new(SystemResolver),
            Arc::new(RealClock),
            DispatcherConfig { allow_private_ips: true, ..Default::default() },
        )
    }

    #[test]
    fn signature_is_hmac_over_ts_newline_body() {
        let header = signature_header("k", 1_700_000_000, b"{\"x\":1}").unwrap();

        let mut mac = Hmac::<Sha256>::new_from_slice(b"k").unwrap();
        mac.update(b"1700000000\n{\"x\":1}");
        let expected = hex::encode(mac.finalize().into_bytes());

        assert_eq!(header, format!("t=1700000000,v1={expected}"));
    }

    #[test]
    fn rewrite_joins_paths_and_merges_queries() {
        let event = Event {
            path: Some("/github/push".to_string()),
            query: Some("a=1".to_string()),
            ..test_event(b"", "application/json")
        };

        let mut url = Url::parse("https://example.test/base/?k=v").unwrap();
        rewrite_url(&mut url, &event);
        assert_eq!(url.path(), "/base/github/push");
        assert_eq!(url.query(), Some("k=v&a=1"));

        let mut url = Url::parse("https://example.test").unwrap();
        rewrite_url(&mut url, &event);
        assert_eq!(url.path(), "/github/push");
        assert_eq!(url.query(), Some("a=1"));
    }

    #[test]
    fn rewrite_defaults_empty_tail_to_root() {
        let event =
            Event { path: None, query: None, ..test_event(b"", "application/json") };

        let mut url = Url::parse("https://example.test/base").unwrap();
        rewrite_url(&mut url, &event);
        assert_eq!(url.path(), "/base/");
        assert_eq!(url.query(), None);
    }

    #[tokio::test]
    async fn delivers_body_verbatim_with_identity_headers() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .and(matchers::path("/hook"))
            .and(matchers::body_bytes(b"{\"x\":1}".to_vec()))
            .and(matchers::header("content-type", "application/json"))
            .and(matchers::header_exists("X-Source-Id"))
            .and(matchers::header_exists("X-Event-Id"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .expect(1)
            .mount(&server)
            .await;

        let destination = test_destination(&format!("{}/hook", server.uri()));
        let event = test_event(b"{\"x\":1}", "application/json");

        let response = test_dispatcher().dispatch(&destination, &event).await.unwrap();
        assert!(response.is_success());
        assert_eq!(response.status, 200);
        assert_eq!(response.body, "ok");
    }

    #[tokio::test]
    async fn signature_header_verifies_against_secret() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .and(matchers::header_exists("X-Webhook-Signature"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let destination = Destination {
            secret: Some("k".to_string()),
            ..test_destination(&server.uri())
        };
        let body = b"{\"x\":1}";
        let event = test_event(body, "application/json");

        test_dispatcher().dispatch(&destination, &event).await.unwrap();

        let requests = server.received_requests().await.unwrap();
        let header = requests[0].headers.get("X-Webhook-Signature").unwrap().to_str().unwrap();

        let (ts_part, sig_part) = header.split_once(',').unwrap();
        let ts: i64 = ts_part.strip_prefix("t=").unwrap().parse().unwrap();
        let expected = signature_header("k", ts, body).unwrap();
        assert_eq!(header, expected);
        assert!(sig_part.starts_with("v1="));
    }

    #[tokio::test]
    async fn redirects_are_not_followed() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(
                ResponseTemplate::new(302).append_header("location", "https://elsewhere.test/"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let destination = test_destination(&server.uri());
        let event = test_event(b"x", "text/plain");

        let response = test_dispatcher().dispatch(&destination, &event).await.unwrap();
        assert_eq!(response.status, 302);
        assert!(!response.is_success());
        assert_eq!(response.headers.get("location").unwrap(), "https://elsewhere.test/");
    }

    #[tokio::test]
    async fn static_headers_are_applied() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .and(matchers::header("X-Static", "yes"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let mut destination = test_destination(&server.uri());
        destination.headers.0.insert("X-Static".to_string(), "yes".to_string());
        let event = test_event(b"x", "text/plain");

        let response = test_dispatcher().dispatch(&destination, &event).await.unwrap();
        assert!(response.is_success());
    }

    #[tokio::test]
    async fn injected_headers_replace_colliding_static_entries() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let mut destination = test_destination(&server.uri());
        destination.headers.0.insert("Content-Type".to_string(), "text/plain".to_string());
        destination.headers.0.insert("x-source-id".to_string(), "spoofed".to_string());
        let event = test_event(b"{}", "application/json");

        test_dispatcher().dispatch(&destination, &event).await.unwrap();

        let requests = server.received_requests().await.unwrap();

        // Exactly one value on the wire, and it is the injected one.
        let content_types: Vec<_> = requests[0].headers.get_all("content-type").iter().collect();
        assert_eq!(content_types.len(), 1);
        assert_eq!(content_types[0].to_str().unwrap(), "application/json");

        let source_ids: Vec<_> = requests[0].headers.get_all("x-source-id").iter().collect();
        assert_eq!(source_ids.len(), 1);
        assert_eq!(source_ids[0].to_str().unwrap(), event.source_id.to_string());
    }

    #[tokio::test]
    async fn blocked_destination_never_dials() {
        // Default config: block sets active. The metadata address must be
        // refused before any connection attempt.
        let dispatcher = Dispatcher::new(
            Arc::new(SystemResolver),
            Arc::new(RealClock),
            DispatcherConfig::default(),
        );

        let destination = test_destination("http://169.254.169.254/latest/meta-data");
        let event = test_event(b"", "application/json");

        let err = dispatcher.dispatch(&destination, &event).await.unwrap_err();
        assert!(matches!(err, DeliveryError::SsrfBlocked { .. }));
        assert!(err.to_string().starts_with("ssrf_blocked"));
    }

    #[tokio::test]
    async fn large_response_bodies_are_capped() {
        let server = MockServer::start().await;
        let big = "a".repeat(200 * 1024);
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string(big))
            .mount(&server)
            .await;

        let destination = test_destination(&server.uri());
        let event = test_event(b"x", "text/plain");

        let response = test_dispatcher().dispatch(&destination, &event).await.unwrap();
        assert_eq!(response.body.len(), RESPONSE_PERSIST_LIMIT);
    }
}
