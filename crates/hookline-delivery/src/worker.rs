//! The delivery worker loop.
//!
//! Each worker repeatedly claims one due attempt and walks it through the
//! pipeline: breaker check, rate gate, dispatch, outcome recording. Nothing
//! a destination does propagates as an error; only durable-store failures
//! make the loop back off.

use std::{sync::Arc, time::Duration};

use hookline_core::{Clock, Destination};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    breaker::{breaker_state, should_open, BreakerState},
    dispatch::Dispatcher,
    error::Result,
    gate::RateGate,
    retry::{next_retry, parse_retry_after},
    store::{ClaimedAttempt, DeliveryStore, DispatchOutcome},
};

/// Sleep between polls when no attempt is due.
pub const IDLE_BACKOFF: Duration = Duration::from_millis(1500);

/// Sleep after a durable-store failure.
pub const ERROR_BACKOFF: Duration = Duration::from_secs(2);

/// Deferral applied when the rate gate itself errors.
const GATE_ERROR_DEFER: Duration = Duration::from_secs(1);

/// Worker identity stamped onto claimed rows.
#[derive(Debug, Clone)]
pub struct WorkerIdentity {
    /// Stable worker name (e.g. `worker-1`).
    pub name: String,
    /// Deployed version string.
    pub version: String,
}

/// Counters shared across the pool for observability.
#[derive(Debug, Clone, Default)]
pub struct EngineStats {
    /// Workers currently running.
    pub active_workers: usize,
    /// Attempts taken through the pipeline.
    pub attempts_processed: u64,
    /// Terminal successes.
    pub succeeded: u64,
    /// Failures re-queued for retry.
    pub retried: u64,
    /// Terminal failures.
    pub failed: u64,
    /// Deferrals (breaker open or gate throttled).
    pub deferred: u64,
}

/// A single delivery worker.
pub struct DeliveryWorker {
    id: usize,
    store: Arc<dyn DeliveryStore>,
    gate: Arc<dyn RateGate>,
    dispatcher: Arc<Dispatcher>,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
    identity: WorkerIdentity,
    stats: Arc<RwLock<EngineStats>>,
}

impl DeliveryWorker {
    /// Creates a worker over the shared pipeline components.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: usize,
        store: Arc<dyn DeliveryStore>,
        gate: Arc<dyn RateGate>,
        dispatcher: Arc<Dispatcher>,
        clock: Arc<dyn Clock>,
        cancel: CancellationToken,
        identity: WorkerIdentity,
        stats: Arc<RwLock<EngineStats>>,
    ) -> Self {
        Self { id, store, gate, dispatcher, clock, cancel, identity, stats }
    }

    /// Claims and processes attempts until cancelled.
    pub async fn run(&self) {
        info!(worker_id = self.id, name = %self.identity.name, "delivery worker starting");

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            match self.tick().await {
                Ok(true) => {},
                Ok(false) => {
                    tokio::select! {
                        () = self.clock.sleep(IDLE_BACKOFF) => {},
                        () = self.cancel.cancelled() => break,
                    }
                },
                Err(err) => {
                    error!(worker_id = self.id, error = %err, "worker pipeline error");
                    tokio::select! {
                        () = self.clock.sleep(ERROR_BACKOFF) => {},
                        () = self.cancel.cancelled() => break,
                    }
                },
            }
        }

        info!(worker_id = self.id, "delivery worker stopped");
    }

    /// Processes at most one attempt. Returns false when the queue was
    /// empty.
    pub async fn tick(&self) -> Result<bool> {
        let Some(claimed) = self
            .store
            .claim_next(self.identity.name.clone(), self.identity.version.clone())
            .await?
        else {
            return Ok(false);
        };

        self.process(claimed).await?;
        Ok(true)
    }

    async fn process(&self, claimed: ClaimedAttempt) -> Result<()> {
        let context = match self.store.load_context(claimed.id).await {
            Ok(context) => context,
            Err(err) => {
                // The row stays picked; the stale-claim sweep recovers it.
                warn!(attempt = %claimed.id, error = %err, "failed to load attempt context");
                return Ok(());
            },
        };
        let destination = &context.destination;

        // Breaker first: an open destination defers without consuming gate
        // capacity.
        let health = self.store.health(destination.id).await?;
        match breaker_state(&health, self.clock.now_utc()) {
            BreakerState::Open(until) => {
                self.store.defer(claimed.id, until).await?;
                self.bump(|s| s.deferred += 1).await;
                return Ok(());
            },
            BreakerState::CooldownElapsed => {
                self.store.reset_breaker(destination.id).await?;
            },
            BreakerState::Closed => {},
        }

        match self
            .gate
            .admit(destination.id, destination.burst, destination.max_rps, destination.max_inflight)
            .await
        {
            Ok(admission) if admission.allowed => {},
            Ok(admission) => {
                let next_at = self.clock.now_utc()
                    + chrono::Duration::from_std(admission.retry_after)
                        .unwrap_or_else(|_| chrono::Duration::milliseconds(100));
                self.store.defer(claimed.id, next_at).await?;
                self.bump(|s| s.deferred += 1).await;
                return Ok(());
            },
            Err(err) => {
                warn!(destination = %destination.id, error = %err, "rate gate error");
                let next_at = self.clock.now_utc()
                    + chrono::Duration::from_std(GATE_ERROR_DEFER).expect("constant fits");
                self.store.defer(claimed.id, next_at).await?;
                return Ok(());
            },
        }

        let started = std::time::Instant::now();
        let dispatched = self.dispatcher.dispatch(destination, &context.event).await;
        let elapsed_ms = i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX);

        let recorded = self.record_outcome(&claimed, destination, dispatched, elapsed_ms).await;

        // Release the in-flight reservation whatever happened above.
        if let Err(err) = self.gate.done(destination.id).await {
            warn!(destination = %destination.id, error = %err, "rate gate release failed");
        }

        self.bump(|s| s.attempts_processed += 1).await;
        recorded
    }

    async fn record_outcome(
        &self,
        claimed: &ClaimedAttempt,
        destination: &Destination,
        dispatched: std::result::Result<crate::dispatch::DispatchResponse, crate::error::DeliveryError>,
        elapsed_ms: i64,
    ) -> Result<()> {
        match dispatched {
            Ok(response) if response.is_success() => {
                let outcome = DispatchOutcome {
                    http_code: Some(i32::from(response.status)),
                    response_headers: response.headers,
                    response_body: Some(response.body),
                    response_error: None,
                    elapsed_ms,
                };
                self.store
                    .record_success(
                        claimed.id,
                        outcome,
                        self.identity.name.clone(),
                        self.identity.version.clone(),
                    )
                    .await?;
                self.store.record_health(destination.id, true).await?;
                self.bump(|s| s.succeeded += 1).await;

                info!(
                    worker_id = self.id,
                    attempt = %claimed.id,
                    event = %claimed.event_id,
                    elapsed_ms,
                    "attempt succeeded"
                );
                Ok(())
            },
            Ok(response) => {
                let retry_after = if response.status == 429 {
                    response
                        .headers
                        .get("retry-after")
                        .or_else(|| response.headers.get("Retry-After"))
                        .and_then(|v| parse_retry_after(v, self.clock.now_utc()))
                } else {
                    None
                };

                let outcome = DispatchOutcome {
                    http_code: Some(i32::from(response.status)),
                    response_headers: response.headers.clone(),
                    response_body: Some(response.body),
                    response_error: None,
                    elapsed_ms,
                };
                self.finish_failure(claimed, destination, outcome, retry_after).await
            },
            Err(err) => {
                let outcome = DispatchOutcome {
                    http_code: None,
                    response_headers: std::collections::HashMap::new(),
                    response_body: None,
                    response_error: Some(err.to_string()),
                    elapsed_ms,
                };
                self.finish_failure(claimed, destination, outcome, None).await
            },
        }
    }

    async fn finish_failure(
        &self,
        claimed: &ClaimedAttempt,
        destination: &Destination,
        outcome: DispatchOutcome,
        retry_after: Option<Duration>,
    ) -> Result<()> {
        let now = self.clock.now_utc();
        let delay = retry_after.or_else(|| next_retry(claimed.attempt_no));

        match delay {
            Some(delay) => {
                let next_at = now
                    + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::hours(1));
                self.store.record_retry(claimed.id, next_at, outcome).await?;
                self.bump(|s| s.retried += 1).await;
                warn!(
                    worker_id = self.id,
                    attempt = %claimed.id,
                    attempt_no = claimed.attempt_no,
                    next_at = %next_at,
                    "attempt failed, retry scheduled"
                );
            },
            None => {
                self.store.record_failure(claimed.id, outcome).await?;
                self.bump(|s| s.failed += 1).await;
                error!(
                    worker_id = self.id,
                    attempt = %claimed.id,
                    attempt_no = claimed.attempt_no,
                    "attempt failed terminally"
                );
            },
        }

        let health = self.store.record_health(destination.id, false).await?;
        if should_open(&health, destination) {
            let until = now + chrono::Duration::seconds(i64::from(destination.breaker_cooldown_s));
            self.store.open_breaker(destination.id, until).await?;
            warn!(
                destination = %destination.id,
                failure_count = health.failure_count,
                success_count = health.success_count,
                until = %until,
                "breaker opened"
            );
        }

        Ok(())
    }

    async fn bump(&self, f: impl FnOnce(&mut EngineStats)) {
        f(&mut *self.stats.write().await);
    }
}
