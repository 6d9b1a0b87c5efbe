//! Domain models and strongly-typed identifiers.
//!
//! Defines sources, destinations, routes, events, delivery attempts, and the
//! per-destination health row, plus newtype UUID wrappers so the compiler
//! keeps the id spaces apart. Events are immutable after insert; attempts are
//! the mutable unit of work that the claim protocol transitions through its
//! lifecycle.

use std::{collections::HashMap, fmt};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

type PgDb = sqlx::Postgres;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

/// Declares an opaque 128-bit identifier with full sqlx plumbing.
macro_rules! relay_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Creates a new random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl sqlx::Type<PgDb> for $name {
            fn type_info() -> PgTypeInfo {
                <Uuid as sqlx::Type<PgDb>>::type_info()
            }
        }

        impl<'r> sqlx::Decode<'r, PgDb> for $name {
            fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
                let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
                Ok(Self(uuid))
            }
        }

        impl sqlx::Encode<'_, PgDb> for $name {
            fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
                <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
            }
        }
    };
}

relay_id! {
    /// Identifier of an authenticated producer.
    SourceId
}
relay_id! {
    /// Identifier of a delivery destination.
    DestinationId
}
relay_id! {
    /// Identifier of a source-to-destination route.
    RouteId
}
relay_id! {
    /// Identifier of an ingested event.
    ///
    /// This is the stable identity destinations see in `X-Event-Id`; it never
    /// changes across retries or replays.
    EventId
}
relay_id! {
    /// Identifier of a single delivery attempt row.
    AttemptId
}

/// Lifecycle state of a delivery attempt.
///
/// ```text
/// pending -> picked -> succeeded
///               |
///               +----> pending (retry, attempt_no + 1)
///               +----> failed  (terminal)
/// ```
///
/// `succeeded` and `failed` are terminal and never mutated afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    /// Queued and due at `next_at`; claimable by any worker.
    Pending,

    /// Claimed by exactly one worker, dispatch in flight.
    Picked,

    /// Destination acknowledged with a 2xx response.
    Succeeded,

    /// Retries exhausted or non-recoverable outcome.
    Failed,
}

impl fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Picked => write!(f, "picked"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl sqlx::Type<PgDb> for AttemptStatus {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for AttemptStatus {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        match s {
            "pending" => Ok(Self::Pending),
            "picked" => Ok(Self::Picked),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("invalid attempt status: {s}").into()),
        }
    }
}

impl sqlx::Encode<'_, PgDb> for AttemptStatus {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <String as sqlx::Encode<PgDb>>::encode_by_ref(&self.to_string(), buf)
    }
}

/// Authenticated producer of events.
///
/// The token is the sole credential; rotation replaces it in place. When
/// `ip_allow_cidrs` is non-empty, ingress requires the client address to
/// match at least one CIDR.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Source {
    /// Unique identifier.
    pub id: SourceId,

    /// Human-readable name, unique across sources.
    pub name: String,

    /// Bearer token producers authenticate with. Secret.
    pub token: String,

    /// Disabled sources are rejected with `forbidden`.
    pub enabled: bool,

    /// Optional client-address allow-list in CIDR notation. Empty means any.
    pub ip_allow_cidrs: Vec<String>,

    /// Maximum accepted request body in bytes.
    pub max_body_bytes: i32,

    /// When this source was created.
    pub created_at: DateTime<Utc>,
}

/// Delivery destination configuration.
///
/// Carries everything a worker needs to dispatch: the URL, static headers,
/// signing secret, timeouts, TLS policy, the token-bucket parameters, and the
/// breaker thresholds. Rate parameters must satisfy `max_rps > 0`,
/// `burst >= 1`, `max_inflight >= 1`.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Destination {
    /// Unique identifier.
    pub id: DestinationId,

    /// Human-readable name, unique across destinations.
    pub name: String,

    /// Target URL.
    pub url: String,

    /// Static headers set on every request; event headers never override
    /// these.
    pub headers: sqlx::types::Json<HashMap<String, String>>,

    /// Optional HMAC key. When set, requests carry `X-Webhook-Signature`.
    pub secret: Option<String>,

    /// TCP connect timeout in seconds.
    pub connect_timeout_s: i32,

    /// End-to-end request timeout in seconds.
    pub total_timeout_s: i32,

    /// When false, TLS certificate verification is disabled. Only ever set
    /// by explicit configuration.
    pub verify_tls: bool,

    /// Token refill rate (tokens per second).
    pub max_rps: f64,

    /// Token bucket capacity.
    pub burst: i32,

    /// Cap on concurrently dispatching requests.
    pub max_inflight: i32,

    /// Failure ratio at which the breaker opens.
    pub breaker_failure_ratio: f64,

    /// Minimum observations before the ratio is considered.
    pub breaker_min_requests: i32,

    /// How long the breaker stays open, in seconds.
    pub breaker_cooldown_s: i32,

    /// When true, the event's captured path tail and query are appended to
    /// the destination URL.
    pub append_path: bool,

    /// When this destination was created.
    pub created_at: DateTime<Utc>,
}

/// Connects a source to a destination.
///
/// The `(source_id, destination_id)` pair is unique. `content_type_like`
/// filters events with SQL LIKE semantics (`%`, `_`); null matches all.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Route {
    /// Unique identifier.
    pub id: RouteId,

    /// Producing source.
    pub source_id: SourceId,

    /// Receiving destination.
    pub destination_id: DestinationId,

    /// Disabled routes receive no new attempts.
    pub enabled: bool,

    /// Optional SQL-LIKE pattern matched against the event content type.
    pub content_type_like: Option<String>,

    /// Display ordering for the operator surface.
    pub ord: i16,
}

/// Ingested event, immutable after insert.
///
/// The body is stored verbatim; headers are canonicalized to lowercase keys
/// with multi-values joined by `", "`. The pair `(source_id,
/// idempotency_key)` is unique when the key is present.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Event {
    /// Unique identifier; the stable identity carried in `X-Event-Id`.
    pub id: EventId,

    /// Producing source.
    pub source_id: SourceId,

    /// When ingress accepted the event.
    pub received_at: DateTime<Utc>,

    /// Content type as presented by the producer.
    pub content_type: Option<String>,

    /// Canonicalized request headers.
    pub headers: sqlx::types::Json<HashMap<String, String>>,

    /// Raw body bytes, verbatim.
    pub body: Vec<u8>,

    /// Body size in bytes.
    pub body_size: i32,

    /// Client address ingress observed (first `X-Forwarded-For` hop or peer).
    pub source_ip: Option<String>,

    /// Caller-supplied deduplication key, scoped to the source.
    pub idempotency_key: Option<String>,

    /// SHA-256 of the body.
    pub body_hash: Vec<u8>,

    /// HTTP method of the ingress request.
    pub method: Option<String>,

    /// Path tail after `/ingest/{token}`, with leading slash.
    pub path: Option<String>,

    /// Raw query string of the ingress request.
    pub query: Option<String>,
}

impl Event {
    /// SHA-256 digest of a body, as stored in `body_hash`.
    pub fn hash_body(body: &[u8]) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(body);
        hasher.finalize().to_vec()
    }
}

/// One unit of delivery work for an `(event, route)` pair.
///
/// Re-queued in place on retry: `attempt_no` increments and `next_at` moves
/// into the future while the row identity stays stable.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeliveryAttempt {
    /// Unique identifier.
    pub id: AttemptId,

    /// Event being delivered.
    pub event_id: EventId,

    /// Route that produced this attempt.
    pub route_id: RouteId,

    /// Zero-based retry counter, strictly monotonic per row.
    pub attempt_no: i32,

    /// Current lifecycle state.
    pub status: AttemptStatus,

    /// Earliest time the attempt is due.
    pub next_at: DateTime<Utc>,

    /// When the row was created.
    pub created_at: DateTime<Utc>,

    /// When a worker last claimed the row.
    pub picked_at: Option<DateTime<Utc>>,

    /// Terminal success time.
    pub succeeded_at: Option<DateTime<Utc>>,

    /// Terminal failure time.
    pub failed_at: Option<DateTime<Utc>>,

    /// HTTP status of the last dispatch, if a response was received.
    pub http_code: Option<i32>,

    /// Response headers of the last dispatch.
    pub response_headers: Option<sqlx::types::Json<HashMap<String, String>>>,

    /// Response body of the last dispatch, capped at 64 KiB.
    pub response_body: Option<String>,

    /// Transport-level error of the last dispatch, if any.
    pub response_error: Option<String>,

    /// Wall-clock duration of the last dispatch in milliseconds.
    pub elapsed_ms: Option<i64>,

    /// Name of the worker that last claimed the row.
    pub worker_name: Option<String>,

    /// Version of the worker that last claimed the row.
    pub worker_version: Option<String>,
}

/// Aggregated success/failure counters for one destination.
///
/// Counters are monotonic within a breaker window; an `open_until` in the
/// future means the breaker is open and claims defer to that instant.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DestinationHealth {
    /// Destination this row aggregates.
    pub destination_id: DestinationId,

    /// Successful dispatches in the current window.
    pub success_count: i64,

    /// Failed dispatches in the current window.
    pub failure_count: i64,

    /// Breaker cooldown deadline; `None` or past means closed.
    pub open_until: Option<DateTime<Utc>>,
}

impl DestinationHealth {
    /// Failure ratio over the current window, zero when empty.
    #[allow(clippy::cast_precision_loss)]
    pub fn failure_ratio(&self) -> f64 {
        let total = self.success_count + self.failure_count;
        if total == 0 {
            0.0
        } else {
            self.failure_count as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attempt_status_display_matches_storage_form() {
        assert_eq!(AttemptStatus::Pending.to_string(), "pending");
        assert_eq!(AttemptStatus::Picked.to_string(), "picked");
        assert_eq!(AttemptStatus::Succeeded.to_string(), "succeeded");
        assert_eq!(AttemptStatus::Failed.to_string(), "failed");
    }

    #[test]
    fn ids_are_distinct_types_with_stable_display() {
        let id = EventId::new();
        assert_eq!(id.to_string(), id.0.to_string());

        let raw = Uuid::new_v4();
        assert_eq!(SourceId::from(raw).0, raw);
    }

    #[test]
    fn body_hash_is_sha256() {
        let hash = Event::hash_body(b"{\"x\":1}");
        assert_eq!(hash.len(), 32);
        // Stable across calls
        assert_eq!(hash, Event::hash_body(b"{\"x\":1}"));
        assert_ne!(hash, Event::hash_body(b"{\"x\":2}"));
    }

    #[test]
    fn failure_ratio_handles_empty_window() {
        let health = DestinationHealth {
            destination_id: DestinationId::new(),
            success_count: 0,
            failure_count: 0,
            open_until: None,
        };
        assert!((health.failure_ratio() - 0.0).abs() < f64::EPSILON);

        let health = DestinationHealth { success_count: 5, failure_count: 5, ..health };
        assert!((health.failure_ratio() - 0.5).abs() < f64::EPSILON);
    }
}
