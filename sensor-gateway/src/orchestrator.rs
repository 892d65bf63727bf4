//! Integrated Orchestrator (C9, §4.9).
//!
//! Composes the Module Manager (C4), Cache Writer (C5), and Document Writer
//! (C6), optionally the Realtime Sync pool (C8). Startup sequences C5/C6
//! first so a backend outage fails fast before any reader is started;
//! shutdown reverses the order.

use crate::cache::CacheWriter;
use crate::config::Config;
use crate::error::GatewayError;
use crate::manager::ModuleManager;
use crate::stats::ManagerStatistics;
use crate::store::DocumentStore;
use crate::sync::{self, SyncEngine};
use crate::types::{new_session_prefix, SensorReading};
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

/// Extension point for future alerting consumers (§1 Non-goals: alerting
/// itself is out of scope). Anything implementing this can be driven from
/// [`ModuleManager::subscribe`] without this crate building a dispatcher.
pub trait AlertSink: Send + Sync {
    fn on_reading(&self, reading: &SensorReading);
}

const STATUS_LOG_INTERVAL: Duration = Duration::from_secs(30);

pub struct Orchestrator {
    manager: ModuleManager,
    cache_cancel: watch::Sender<bool>,
    cache_join: tokio::task::JoinHandle<()>,
    store_join: tokio::task::JoinHandle<()>,
    sync_engine: Option<SyncEngine>,
}

impl Orchestrator {
    /// `start()` — connect to the cache and document tiers (fail fast),
    /// then bring up every configured module reader, then optionally the
    /// sync workers (§4.9).
    pub async fn start(config: &Config, run_sync: bool) -> Result<Self, GatewayError> {
        let session_prefix = config
            .session_prefix
            .clone()
            .unwrap_or_else(|| new_session_prefix(chrono::Utc::now()));
        info!(session_prefix = %session_prefix, "starting orchestrator");

        let cache_writer = CacheWriter::connect(&config.cache).await?;
        let store = DocumentStore::connect(&config.document_store, session_prefix.clone()).await?;

        let mut manager = ModuleManager::new(config.acquisition.clone(), session_prefix.clone());
        for module in &config.modules {
            manager.add(module.clone());
        }
        manager.start_all().await;

        let (cache_cancel_tx, cache_cancel_rx) = watch::channel(false);
        let cache_rx = manager.subscribe();
        let store_rx = manager.subscribe();
        let manager_counters = manager.counters();
        let cache_join = tokio::spawn(cache_writer.run(
            cache_rx,
            cache_cancel_rx.clone(),
            manager_counters.clone(),
        ));
        let store_join = tokio::spawn(store.run(store_rx, cache_cancel_rx.clone(), manager_counters));

        let sync_engine = if run_sync {
            Some(
                sync::spawn_all(
                    &config.cache,
                    &config.document_store,
                    &config.sync,
                    session_prefix.clone(),
                    cache_cancel_rx.clone(),
                )
                .await?,
            )
        } else {
            None
        };

        Ok(Self {
            manager,
            cache_cancel: cache_cancel_tx,
            cache_join,
            store_join,
            sync_engine,
        })
    }

    pub fn statistics(&self) -> ManagerStatistics {
        self.manager.statistics()
    }

    /// Run until `external_cancel` fires, logging the Module Manager's
    /// aggregate status once every 30s (§7 supplemented periodic status log).
    pub async fn run_until_cancelled(&self, mut external_cancel: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(STATUS_LOG_INTERVAL);
        loop {
            tokio::select! {
                biased;
                _ = external_cancel.changed() => break,
                _ = ticker.tick() => {
                    let stats = self.manager.statistics();
                    for (module_id, status) in &stats.modules {
                        info!(
                            module_id = %module_id,
                            state = ?status.state,
                            total_reads = status.total_reads,
                            total_errors = status.total_errors,
                            consecutive_failures = status.consecutive_failures,
                            "module status"
                        );
                    }
                    info!(dropped_oldest = stats.dropped_oldest, "manager status");
                }
            }
            if *external_cancel.borrow() {
                break;
            }
        }
    }

    /// `stop()` — reverse of `start()`: stop readers, then let writers
    /// drain their current batch and exit, bounded by a 5s hard deadline
    /// (§5 cancellation).
    pub async fn stop(mut self) {
        self.manager.stop_all().await;
        let _ = self.cache_cancel.send(true);

        let shutdown_deadline = Duration::from_secs(5);
        let _ = tokio::time::timeout(shutdown_deadline, self.cache_join).await;
        let _ = tokio::time::timeout(shutdown_deadline, self.store_join).await;
        if let Some(sync_engine) = self.sync_engine.take() {
            let _ = tokio::time::timeout(shutdown_deadline, sync_engine.join()).await;
        }
        info!("orchestrator stopped");
    }
}
