//! Background sync scheduler (C6): ticks every `sync.interval_hours` and
//! fans a sync job out to every connection that isn't already running one.
//!
//! Grounded on `original_source/backend/app/services/sync_scheduler.py`'s
//! `start_scheduler`/`sync_all_connections` — APScheduler's
//! `IntervalTrigger(hours=24)` becomes a `tokio::time::interval`, and its
//! per-connection `in_progress` skip plus non-blocking dispatch become a
//! bounded `tokio::spawn` fan-out gated by a `Semaphore`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use crate::config::SyncConfig;
use crate::models::connection::SyncStatus;
use crate::orchestrator::SyncOrchestrator;
use crate::store::Store;

pub struct Scheduler {
    orchestrator: Arc<SyncOrchestrator>,
    store: Arc<dyn Store>,
    config: SyncConfig,
}

impl Scheduler {
    pub fn new(orchestrator: Arc<SyncOrchestrator>, store: Arc<dyn Store>, config: SyncConfig) -> Self {
        Self {
            orchestrator,
            store,
            config,
        }
    }

    /// Run forever, ticking every `interval_hours`. Never returns under
    /// normal operation; intended to be spawned as its own task.
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.interval_hours * 3600));
        // The first tick fires immediately; a freshly started process should
        // sync right away rather than wait a full interval.
        loop {
            ticker.tick().await;
            self.sync_all_connections().await;
        }
    }

    /// One scheduling pass: fan a sync job out to every connection not
    /// already `in_progress`, bounded by `max_concurrent_connections`.
    pub async fn sync_all_connections(&self) {
        info!("starting scheduled sync pass");

        let connections = match self.store.list_connections().await {
            Ok(c) => c,
            Err(e) => {
                error!("failed to list connections for scheduled sync: {e}");
                return;
            }
        };
        info!("found {} connections to consider", connections.len());

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_connections));
        let mut handles = Vec::with_capacity(connections.len());

        for conn in connections {
            if conn.last_sync_status == SyncStatus::InProgress {
                info!("skipping connection {} ({}): sync already in progress", conn.id, conn.exchange);
                continue;
            }

            let orchestrator = Arc::clone(&self.orchestrator);
            let permit = Arc::clone(&semaphore);
            let connection_id = conn.id;

            handles.push(tokio::spawn(async move {
                let _permit = permit.acquire_owned().await.expect("semaphore never closed");
                match orchestrator.sync_connection(connection_id).await {
                    Ok(outcome) => info!(
                        "connection {connection_id} finished with status {:?}, {} new trades",
                        outcome.status, outcome.trades_inserted
                    ),
                    Err(e) => warn!("connection {connection_id} sync errored: {e}"),
                }
            }));
        }

        for handle in handles {
            if let Err(e) = handle.await {
                error!("sync task panicked: {e}");
            }
        }

        info!("scheduled sync pass complete");
    }
}
