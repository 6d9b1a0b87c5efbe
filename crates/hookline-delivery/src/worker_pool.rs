//! Worker pool lifecycle.
//!
//! Spawns the configured number of delivery workers plus the janitor under
//! one cancellation token and joins them on shutdown within a timeout.

use std::{sync::Arc, time::Duration};

use hookline_core::Clock;
use tokio::{sync::RwLock, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    dispatch::Dispatcher,
    error::{DeliveryError, Result},
    gate::RateGate,
    janitor::{Janitor, JanitorConfig},
    store::DeliveryStore,
    worker::{DeliveryWorker, EngineStats, WorkerIdentity},
};

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of concurrent delivery workers.
    pub worker_count: usize,

    /// Identity stamped on claimed rows.
    pub identity: WorkerIdentity,

    /// Maximum time to wait for workers on graceful shutdown.
    pub shutdown_timeout: Duration,

    /// Housekeeping settings.
    pub janitor: JanitorConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            identity: WorkerIdentity {
                name: "worker-1".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            shutdown_timeout: Duration::from_secs(30),
            janitor: JanitorConfig::default(),
        }
    }
}

/// Supervised pool of delivery workers and the janitor.
pub struct WorkerPool {
    store: Arc<dyn DeliveryStore>,
    gate: Arc<dyn RateGate>,
    dispatcher: Arc<Dispatcher>,
    clock: Arc<dyn Clock>,
    config: PoolConfig,
    cancel: CancellationToken,
    stats: Arc<RwLock<EngineStats>>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Creates an idle pool; call [`WorkerPool::start`] to spawn tasks.
    pub fn new(
        store: Arc<dyn DeliveryStore>,
        gate: Arc<dyn RateGate>,
        dispatcher: Arc<Dispatcher>,
        clock: Arc<dyn Clock>,
        config: PoolConfig,
    ) -> Self {
        Self {
            store,
            gate,
            dispatcher,
            clock,
            config,
            cancel: CancellationToken::new(),
            stats: Arc::new(RwLock::new(EngineStats::default())),
            handles: Vec::new(),
        }
    }

    /// Spawns all workers and the janitor. Returns immediately.
    pub async fn start(&mut self) {
        info!(
            worker_count = self.config.worker_count,
            worker = %self.config.identity.name,
            "starting delivery pool"
        );

        self.stats.write().await.active_workers = self.config.worker_count;

        for worker_id in 0..self.config.worker_count {
            let worker = DeliveryWorker::new(
                worker_id,
                self.store.clone(),
                self.gate.clone(),
                self.dispatcher.clone(),
                self.clock.clone(),
                self.cancel.clone(),
                self.config.identity.clone(),
                self.stats.clone(),
            );
            self.handles.push(tokio::spawn(async move { worker.run().await }));
        }

        let janitor = Janitor::new(
            self.store.clone(),
            self.clock.clone(),
            self.cancel.clone(),
            self.config.janitor.clone(),
        );
        self.handles.push(tokio::spawn(async move { janitor.run().await }));
    }

    /// Current stats snapshot.
    pub async fn stats(&self) -> EngineStats {
        self.stats.read().await.clone()
    }

    /// Signals cancellation and joins all tasks within the shutdown timeout.
    pub async fn shutdown_graceful(mut self) -> Result<()> {
        info!(tasks = self.handles.len(), "shutting down delivery pool");
        self.cancel.cancel();

        let timeout = self.config.shutdown_timeout;
        let join_all = async {
            for (index, handle) in std::mem::take(&mut self.handles).into_iter().enumerate() {
                if let Err(join_error) = handle.await {
                    error!(task = index, error = %join_error, "pool task panicked");
                }
            }
        };

        match tokio::time::timeout(timeout, join_all).await {
            Ok(()) => {
                self.stats.write().await.active_workers = 0;
                info!("delivery pool stopped");
                Ok(())
            },
            Err(_) => {
                warn!(timeout_s = timeout.as_secs(), "pool shutdown timed out");
                Err(DeliveryError::internal("worker pool shutdown timed out"))
            },
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if !self.handles.is_empty() && !self.cancel.is_cancelled() {
            // Dropped without shutdown_graceful: cancel so tasks don't leak.
            self.cancel.cancel();
            warn!("WorkerPool dropped while running; cancelling workers");
        }
    }
}
