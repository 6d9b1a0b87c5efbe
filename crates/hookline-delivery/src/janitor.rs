//! Background housekeeping.
//!
//! Once an hour: delete events past the retention window that have no live
//! attempts, and flip long-stale `picked` rows back to `pending` so work
//! claimed by a crashed worker is recovered.

use std::{sync::Arc, time::Duration};

use hookline_core::Clock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::store::DeliveryStore;

/// Janitor settings.
#[derive(Debug, Clone)]
pub struct JanitorConfig {
    /// Events older than this many days become eligible for deletion.
    pub retention_days: u32,

    /// How often the sweep runs.
    pub sweep_interval: Duration,

    /// `picked` rows older than this are considered abandoned.
    pub stale_claim_after: Duration,
}

impl Default for JanitorConfig {
    fn default() -> Self {
        Self {
            retention_days: 7,
            sweep_interval: Duration::from_secs(60 * 60),
            stale_claim_after: Duration::from_secs(10 * 60),
        }
    }
}

/// Periodic retention and recovery sweeper.
pub struct Janitor {
    store: Arc<dyn DeliveryStore>,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
    config: JanitorConfig,
}

impl Janitor {
    /// Creates a janitor over the shared store.
    pub fn new(
        store: Arc<dyn DeliveryStore>,
        clock: Arc<dyn Clock>,
        cancel: CancellationToken,
        config: JanitorConfig,
    ) -> Self {
        Self { store, clock, cancel, config }
    }

    /// Runs sweeps on the configured interval until cancelled.
    pub async fn run(&self) {
        info!(
            retention_days = self.config.retention_days,
            interval_s = self.config.sweep_interval.as_secs(),
            "janitor starting"
        );

        loop {
            tokio::select! {
                () = self.clock.sleep(self.config.sweep_interval) => {
                    self.sweep_once().await;
                },
                () = self.cancel.cancelled() => break,
            }
        }

        info!("janitor stopped");
    }

    /// One retention-plus-recovery pass.
    pub async fn sweep_once(&self) {
        let now = self.clock.now_utc();

        let cutoff = now - chrono::Duration::days(i64::from(self.config.retention_days));
        match self.store.sweep_expired_events(cutoff).await {
            Ok(0) => {},
            Ok(deleted) => info!(deleted, "retention sweep removed expired events"),
            Err(err) => warn!(error = %err, "retention sweep failed"),
        }

        let stale = now
            - chrono::Duration::from_std(self.config.stale_claim_after)
                .unwrap_or_else(|_| chrono::Duration::minutes(10));
        match self.store.requeue_stale_picked(stale).await {
            Ok(0) => {},
            Ok(requeued) => warn!(requeued, "recovered stale picked attempts"),
            Err(err) => warn!(error = %err, "stale claim sweep failed"),
        }
    }
}
