//! Realtime Sync (C8, §4.8).
//!
//! A small pool of workers, one per data_type (realtime, historical,
//! timeseries, statistics), each on its own self-clocked tick. `sync_status`
//! is the idempotency ledger for realtime/historical; `sync_progress.
//! last_score` is the ledger for timeseries (shared with the migrator,
//! §4.7). All comparisons are against values in the sample itself, never
//! wall-clock, so clock skew between hosts cannot break correctness.

use crate::config::{CacheConfig, DocumentStoreConfig, SyncConfig};
use crate::error::GatewayError;
use crate::migrate::{
    channel_from_timeseries_key, reading_from_hash, sensor_type_from_key, save_progress,
    MigrationTarget,
};
use crate::stats::{SyncCounters, SyncStatistics};
use crate::store::DocumentStore;
use crate::types::SensorReading;
use bson::doc;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};

const DATA_TYPES: [&str; 4] = ["realtime", "historical", "timeseries", "statistics"];

/// Handles and shared counters for the four worker tasks, returned by
/// [`spawn_all`].
pub struct SyncEngine {
    counters: HashMap<&'static str, Arc<SyncCounters>>,
    joins: Vec<tokio::task::JoinHandle<()>>,
}

impl SyncEngine {
    pub fn statistics(&self) -> HashMap<String, SyncStatistics> {
        self.counters
            .iter()
            .map(|(k, v)| (k.to_string(), v.snapshot()))
            .collect()
    }

    pub async fn join(self) {
        for handle in self.joins {
            let _ = handle.await;
        }
    }
}

pub async fn spawn_all(
    cache_cfg: &CacheConfig,
    store_cfg: &DocumentStoreConfig,
    sync_cfg: &SyncConfig,
    session_prefix: String,
    cancel: watch::Receiver<bool>,
) -> Result<SyncEngine, GatewayError> {
    let mut counters = HashMap::new();
    let mut joins = Vec::new();

    for data_type in DATA_TYPES {
        let counter = Arc::new(SyncCounters::default());
        counters.insert(data_type, counter.clone());

        let client = redis::Client::open(cache_cfg.redis_url())
            .map_err(|e| GatewayError::CacheError(format!("invalid redis url: {e}")))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| GatewayError::CacheError(format!("connecting to redis: {e}")))?;
        let store = DocumentStore::connect(store_cfg, session_prefix.clone()).await?;
        let period = period_for(sync_cfg, data_type);
        let page_size = sync_cfg.page_size;
        let mut worker_cancel = cancel.clone();

        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            let mut conn = conn;
            loop {
                tokio::select! {
                    biased;
                    _ = worker_cancel.changed() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = run_cycle(data_type, &mut conn, &store, page_size).await {
                            counter.record_error();
                            warn!(data_type, error = %e, "sync cycle failed");
                        } else {
                            counter.record_cycle(1);
                        }
                    }
                }
                if *worker_cancel.borrow() {
                    break;
                }
            }
        });
        joins.push(join);
    }

    Ok(SyncEngine { counters, joins })
}

fn period_for(cfg: &SyncConfig, data_type: &str) -> std::time::Duration {
    let ms = match data_type {
        "realtime" => cfg.realtime_period_ms,
        "historical" => cfg.historical_period_ms,
        "timeseries" => cfg.timeseries_period_ms,
        _ => cfg.statistics_period_ms,
    };
    std::time::Duration::from_millis(ms)
}

async fn run_cycle(
    data_type: &str,
    conn: &mut ConnectionManager,
    store: &DocumentStore,
    page_size: usize,
) -> Result<(), GatewayError> {
    let targets = discover_realtime_targets(conn).await?;
    match data_type {
        "realtime" => sync_realtime(conn, store, &targets).await,
        "historical" => sync_historical(conn, store, &targets, page_size).await,
        "timeseries" => sync_timeseries(conn, store, &targets, page_size).await,
        _ => sync_statistics(conn, store, &targets).await,
    }
}

async fn discover_realtime_targets(
    conn: &mut ConnectionManager,
) -> Result<Vec<MigrationTarget>, GatewayError> {
    let mut targets = Vec::new();
    let mut iter: redis::AsyncIter<'_, String> = conn
        .scan_match("sensor:*:*:realtime")
        .await
        .map_err(|e| GatewayError::CacheError(format!("scanning realtime keys: {e}")))?;
    let mut keys = Vec::new();
    while let Some(key) = iter.next_item().await {
        keys.push(key);
    }
    drop(iter);
    for key in keys {
        let parts: Vec<&str> = key.split(':').collect();
        if let [_, type_key, sensor_id, _] = parts[..] {
            targets.push(MigrationTarget {
                type_key: type_key.to_string(),
                sensor_id: Some(sensor_id.to_string()),
            });
        }
    }
    Ok(targets)
}

async fn sync_realtime(
    conn: &mut ConnectionManager,
    store: &DocumentStore,
    targets: &[MigrationTarget],
) -> Result<(), GatewayError> {
    let status: mongodb::Collection<bson::Document> = store.db().collection("sync_status");
    for target in targets {
        let key = target.realtime_key();
        let hash: HashMap<String, String> = conn
            .hgetall(&key)
            .await
            .map_err(|e| GatewayError::CacheError(format!("reading {key}: {e}")))?;
        if hash.is_empty() {
            continue;
        }
        let Some(incoming_ts) = hash.get("timestamp").cloned() else {
            continue;
        };
        let recorded = status
            .find_one(doc! { "data_type": "realtime", "key": &key })
            .await
            .map_err(|e| GatewayError::StoreError(format!("reading sync_status: {e}")))?;
        let recorded_ts = recorded.as_ref().and_then(|d| d.get_str("timestamp").ok());
        if recorded_ts == Some(incoming_ts.as_str()) {
            continue; // already synced, no newer sample
        }
        if let Some(reading) = reading_from_hash(target, &store_session_prefix(store), &hash) {
            store.upsert_one(&reading).await?;
            status
                .update_one(
                    doc! { "data_type": "realtime", "key": &key },
                    doc! { "$set": { "timestamp": &incoming_ts } },
                )
                .with_options(mongodb::options::UpdateOptions::builder().upsert(true).build())
                .await
                .map_err(|e| GatewayError::StoreError(format!("writing sync_status: {e}")))?;
        }
    }
    Ok(())
}

async fn sync_historical(
    conn: &mut ConnectionManager,
    store: &DocumentStore,
    targets: &[MigrationTarget],
    page_size: usize,
) -> Result<(), GatewayError> {
    let status: mongodb::Collection<bson::Document> = store.db().collection("sync_status");
    for target in targets {
        let key = target.history_key();
        let new_count: i64 = conn
            .llen(&key)
            .await
            .map_err(|e| GatewayError::CacheError(format!("reading {key} length: {e}")))?;
        // The head entry's identity, not just the list length, proves
        // whether anything new was pushed: once the list hits its capped
        // length (§4.5 `HISTORY_BOUND`), every push is matched by an
        // `ltrim`-evicted tail entry and `new_count` stops moving entirely
        // (§8 sync eventual-completeness law).
        let new_head: Option<String> = conn
            .lindex(&key, 0)
            .await
            .map_err(|e| GatewayError::CacheError(format!("reading {key} head: {e}")))?;
        let recorded = status
            .find_one(doc! { "data_type": "historical", "key": &key })
            .await
            .map_err(|e| GatewayError::StoreError(format!("reading sync_status: {e}")))?;
        let prev_count = recorded.as_ref().and_then(|d| d.get_i64("count").ok()).unwrap_or(0);
        let prev_head = recorded.as_ref().and_then(|d| d.get_str("head_marker").ok());
        let head_changed = new_head.is_some() && new_head.as_deref() != prev_head;
        let saturated = new_count == prev_count && head_changed;

        if new_count < prev_count {
            // List was trimmed past max length: resync everything currently
            // present once instead of trying to reconstruct a gap (§4.8).
            debug!(key = %key, "history list trimmed, resynchronizing fully");
        } else if saturated {
            debug!(key = %key, "history list saturated at capacity, resynchronizing fully");
        }
        let to_read = if new_count < prev_count || saturated {
            new_count
        } else {
            new_count - prev_count
        };
        if to_read <= 0 {
            continue;
        }
        // New entries are appended at the head, so the freshest `to_read`
        // entries sit at `[0, to_read)`; cap the per-cycle deadline at a
        // bounded number of pages (§4.8 backpressure note).
        let mut start = 0i64;
        let mut remaining = to_read.min(page_size as i64 * 10);
        while remaining > 0 {
            let take = remaining.min(page_size as i64);
            let page: Vec<String> = conn
                .lrange(&key, start, start + take - 1)
                .await
                .map_err(|e| GatewayError::CacheError(format!("reading {key}: {e}")))?;
            if page.is_empty() {
                break;
            }
            for raw in &page {
                if let Ok(mut reading) = serde_json::from_str::<SensorReading>(raw) {
                    reading.session_prefix = store_session_prefix(store);
                    store.upsert_one(&reading).await?;
                }
            }
            let advanced = page.len() as i64;
            start += advanced;
            remaining -= advanced;
        }
        let mut update = doc! { "count": new_count };
        if let Some(head) = &new_head {
            update.insert("head_marker", head);
        }
        status
            .update_one(
                doc! { "data_type": "historical", "key": &key },
                doc! { "$set": update },
            )
            .with_options(mongodb::options::UpdateOptions::builder().upsert(true).build())
            .await
            .map_err(|e| GatewayError::StoreError(format!("writing sync_status: {e}")))?;
    }
    Ok(())
}

async fn sync_timeseries(
    conn: &mut ConnectionManager,
    store: &DocumentStore,
    targets: &[MigrationTarget],
    page_size: usize,
) -> Result<(), GatewayError> {
    for target in targets {
        let key = format!("sensor:{}:{}:timeseries", target.type_key, target.sensor_id.clone().unwrap_or_default());
        let progress_key = format!("timeseries:{key}");
        let progress: mongodb::Collection<bson::Document> = store.db().collection("sync_progress");
        let last_score = progress
            .find_one(doc! { "key": &progress_key })
            .await
            .map_err(|e| GatewayError::StoreError(format!("reading sync_progress: {e}")))?
            .and_then(|d| d.get_f64("last_score").ok())
            .unwrap_or(0.0);

        let members: Vec<(String, f64)> = conn
            .zrangebyscore_withscores(&key, format!("({last_score}"), "+inf")
            .await
            .map_err(|e| GatewayError::CacheError(format!("reading {key}: {e}")))?;
        let page: Vec<_> = members.into_iter().take(page_size).collect();
        if page.is_empty() {
            continue;
        }
        let mut max_score = last_score;
        let session_prefix = store_session_prefix(store);
        for (member, score) in &page {
            let value: f64 = member.split(':').next().and_then(|s| s.parse().ok()).unwrap_or(0.0);
            let reading = SensorReading {
                module_id: String::new(),
                sensor_type: sensor_type_from_key(&target.type_key),
                sensor_id: target.sensor_id.clone().unwrap_or_default(),
                channel: channel_from_timeseries_key(target, &key),
                timestamp: chrono::DateTime::from_timestamp(*score as i64, 0)
                    .unwrap_or_else(chrono::Utc::now),
                raw: 0,
                value,
                unit: sensor_type_from_key(&target.type_key).unit().to_string(),
                session_prefix: session_prefix.clone(),
            };
            store.upsert_one(&reading).await?;
            max_score = max_score.max(*score);
        }
        save_progress(store, "timeseries", &progress_key, page.len() as u64, Some(max_score)).await?;
    }
    Ok(())
}

async fn sync_statistics(
    conn: &mut ConnectionManager,
    store: &DocumentStore,
    targets: &[MigrationTarget],
) -> Result<(), GatewayError> {
    let mut seen_types = std::collections::HashSet::new();
    for target in targets {
        if !seen_types.insert(target.type_key.clone()) {
            continue;
        }
        let key = format!("sensor:{}:statistics", target.type_key);
        let hash: HashMap<String, String> = conn
            .hgetall(&key)
            .await
            .map_err(|e| GatewayError::CacheError(format!("reading {key}: {e}")))?;
        if hash.is_empty() {
            continue;
        }
        let mut fields = bson::Document::new();
        for (k, v) in &hash {
            if let Ok(num) = v.parse::<f64>() {
                fields.insert(format!("statistics.{k}"), num);
            } else {
                fields.insert(format!("statistics.{k}"), v.clone());
            }
        }
        fields.insert("synced_at", bson::DateTime::now());
        store
            .upsert_statistics_raw(
                sensor_type_from_key(&target.type_key),
                &store_session_prefix(store),
                fields,
            )
            .await?;
    }
    Ok(())
}

fn store_session_prefix(store: &DocumentStore) -> String {
    store.session_prefix().to_string()
}

#[cfg(test)]
mod tests {
    use super::period_for;
    use crate::config::SyncConfig;

    #[test]
    fn period_selects_correct_field() {
        let cfg = SyncConfig {
            realtime_period_ms: 1,
            historical_period_ms: 2,
            timeseries_period_ms: 3,
            statistics_period_ms: 4,
            page_size: 10,
        };
        assert_eq!(period_for(&cfg, "realtime").as_millis(), 1);
        assert_eq!(period_for(&cfg, "historical").as_millis(), 2);
        assert_eq!(period_for(&cfg, "timeseries").as_millis(), 3);
        assert_eq!(period_for(&cfg, "statistics").as_millis(), 4);
    }
}
