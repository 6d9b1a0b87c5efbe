//! Delivery pipeline for the hookline webhook relay.
//!
//! Workers claim due attempts from the PostgreSQL-backed queue with
//! `FOR UPDATE SKIP LOCKED`, gate them through a per-destination token
//! bucket and in-flight cap held in Redis, consult the circuit breaker, and
//! dispatch over a hardened HTTP client that pins DNS and refuses private
//! address ranges.
//!
//! ```text
//!   delivery_attempt (pending, next_at <= now)
//!        │ claim: single statement, SKIP LOCKED
//!        ▼
//!   breaker check ──open──▶ defer to open_until
//!        │
//!        ▼
//!   rate gate (rl:{dest} + if:{dest}, one Lua round trip)
//!        │ throttled ──▶ defer wait_ms
//!        ▼
//!   dispatcher (pin DNS, SNI = hostname, sign, no redirects)
//!        │
//!        ▼
//!   outcome recorded; health counters; retry schedule or terminal state
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod breaker;
pub mod dispatch;
pub mod error;
pub mod gate;
pub mod janitor;
pub mod retry;
pub mod ssrf;
pub mod store;
pub mod worker;
pub mod worker_pool;

pub use dispatch::{Dispatcher, DispatcherConfig, DispatchResponse};
pub use error::{DeliveryError, Result};
pub use gate::{Admission, MemoryRateGate, RateGate, RedisRateGate};
pub use janitor::{Janitor, JanitorConfig};
pub use ssrf::{Resolver, SystemResolver};
pub use store::{memory::MemoryDeliveryStore, DeliveryStore, PgDeliveryStore};
pub use worker::{DeliveryWorker, EngineStats, WorkerIdentity};
pub use worker_pool::{PoolConfig, WorkerPool};
