//! Bulk Migrator (C7, §4.7).
//!
//! One-shot copy of everything currently in the cache tier into the
//! document store. Resumable via the `sync_progress` ledger and idempotent
//! because every write is a natural-key upsert (§4.7, §4.8). A failure on
//! one key is logged and migration continues with the next key.
//!
//! Session discovery: unlike §4.7's prose, this crate's key schema (§6)
//! does not embed `session_prefix` in any cache key or hash field, so there
//! is nothing to scan it out of. The migrator instead migrates under a
//! single `session_prefix` supplied by the caller (the configured one, or
//! one passed on the CLI) — see DESIGN.md's Open Question decision.

use crate::config::{CacheConfig, DocumentStoreConfig};
use crate::error::GatewayError;
use crate::store::DocumentStore;
use crate::types::{SensorReading, SensorType};
use bson::doc;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::Serialize;
use std::collections::HashMap;
use tracing::{info, warn};

const HISTORY_PAGE_SIZE: isize = 200;
const TIMESERIES_PAGE_SIZE: isize = 500;

#[derive(Debug, Default, Serialize)]
pub struct MigrationSummary {
    pub attempted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub per_key_errors: HashMap<String, String>,
}

impl MigrationSummary {
    fn record(&mut self, key: &str, result: Result<(), GatewayError>) {
        self.attempted += 1;
        match result {
            Ok(()) => self.succeeded += 1,
            Err(e) => {
                self.failed += 1;
                self.per_key_errors.insert(key.to_string(), e.to_string());
            }
        }
    }
}

pub(crate) struct MigrationTarget {
    pub(crate) type_key: String,
    /// `None` for the flat legacy schema (temperature only); `Some(id)` for
    /// the prefixed `sensor:{type}:{id}:*` schema.
    pub(crate) sensor_id: Option<String>,
}

impl MigrationTarget {
    pub(crate) fn realtime_key(&self) -> String {
        match &self.sensor_id {
            Some(id) => format!("sensor:{}:{}:realtime", self.type_key, id),
            None => format!("{}:realtime", self.type_key),
        }
    }

    pub(crate) fn history_key(&self) -> String {
        match &self.sensor_id {
            Some(id) => format!("sensor:{}:{}:history", self.type_key, id),
            None => format!("{}:history", self.type_key),
        }
    }

    pub(crate) fn statistics_key(&self) -> String {
        match &self.sensor_id {
            Some(_) => format!("sensor:{}:statistics", self.type_key),
            None => format!("{}:statistics", self.type_key),
        }
    }
}

pub async fn run(
    cache_cfg: &CacheConfig,
    store_cfg: &DocumentStoreConfig,
    session_prefix: String,
) -> Result<MigrationSummary, GatewayError> {
    let client = redis::Client::open(cache_cfg.redis_url())
        .map_err(|e| GatewayError::CacheError(format!("invalid redis url: {e}")))?;
    let mut conn = client
        .get_connection_manager()
        .await
        .map_err(|e| GatewayError::CacheError(format!("connecting to redis: {e}")))?;
    let store = DocumentStore::connect(store_cfg, session_prefix.clone()).await?;

    let targets = discover_targets(&mut conn).await?;
    info!(count = targets.len(), "migration targets discovered");

    let mut summary = MigrationSummary::default();
    for target in targets {
        let realtime_key = target.realtime_key();
        let result = migrate_realtime(&mut conn, &store, &target, &session_prefix).await;
        summary.record(&realtime_key, result);

        let history_key = target.history_key();
        let result = migrate_history(&mut conn, &store, &target, &session_prefix).await;
        summary.record(&history_key, result);

        let timeseries_keys = timeseries_keys_for(&mut conn, &target).await?;
        for ts_key in timeseries_keys {
            let result =
                migrate_timeseries(&mut conn, &store, &target, &ts_key, &session_prefix).await;
            summary.record(&ts_key, result);
        }

        let stats_key = target.statistics_key();
        let result = migrate_statistics(&mut conn, &store, &target, &session_prefix).await;
        summary.record(&stats_key, result);
    }

    info!(
        attempted = summary.attempted,
        succeeded = summary.succeeded,
        failed = summary.failed,
        "migration complete"
    );
    Ok(summary)
}

async fn discover_targets(
    conn: &mut ConnectionManager,
) -> Result<Vec<MigrationTarget>, GatewayError> {
    let mut targets = Vec::new();

    let mut iter: redis::AsyncIter<'_, String> = conn
        .scan_match("sensor:*:*:realtime")
        .await
        .map_err(|e| GatewayError::CacheError(format!("scanning realtime keys: {e}")))?;
    let mut prefixed_keys = Vec::new();
    while let Some(key) = iter.next_item().await {
        prefixed_keys.push(key);
    }
    drop(iter);
    for key in prefixed_keys {
        let parts: Vec<&str> = key.split(':').collect();
        if let [_, type_key, sensor_id, _] = parts[..] {
            targets.push(MigrationTarget {
                type_key: type_key.to_string(),
                sensor_id: Some(sensor_id.to_string()),
            });
        }
    }

    // Legacy flat schema only ever covers temperature (§6).
    let legacy_key = "temperature:realtime".to_string();
    let exists: bool = conn
        .exists(&legacy_key)
        .await
        .map_err(|e| GatewayError::CacheError(format!("checking legacy key: {e}")))?;
    if exists {
        targets.push(MigrationTarget {
            type_key: "temperature".to_string(),
            sensor_id: None,
        });
    }

    Ok(targets)
}

async fn migrate_realtime(
    conn: &mut ConnectionManager,
    store: &DocumentStore,
    target: &MigrationTarget,
    session_prefix: &str,
) -> Result<(), GatewayError> {
    let key = target.realtime_key();
    let hash: HashMap<String, String> = conn
        .hgetall(&key)
        .await
        .map_err(|e| GatewayError::CacheError(format!("reading {key}: {e}")))?;
    if hash.is_empty() {
        return Ok(());
    }
    let Some(reading) = reading_from_hash(target, session_prefix, &hash) else {
        return Ok(());
    };
    store.upsert_one(&reading).await
}

async fn migrate_history(
    conn: &mut ConnectionManager,
    store: &DocumentStore,
    target: &MigrationTarget,
    session_prefix: &str,
) -> Result<(), GatewayError> {
    let key = target.history_key();
    let progress_key = format!("history:{key}");
    let mut offset = load_progress_count(store, &progress_key).await?;

    loop {
        let stop = offset + HISTORY_PAGE_SIZE - 1;
        let page: Vec<String> = conn
            .lrange(&key, offset, stop)
            .await
            .map_err(|e| GatewayError::CacheError(format!("reading {key}: {e}")))?;
        if page.is_empty() {
            break;
        }
        for raw in &page {
            if let Ok(mut reading) = serde_json::from_str::<SensorReading>(raw) {
                reading.session_prefix = session_prefix.to_string();
                store.upsert_one(&reading).await?;
            } else {
                warn!(key = %key, "skipping unparseable history entry during migration");
            }
        }
        offset += page.len() as isize;
        save_progress(store, "historical", &progress_key, offset as u64, None).await?;
        if page.len() < HISTORY_PAGE_SIZE as usize {
            break;
        }
    }
    Ok(())
}

async fn timeseries_keys_for(
    conn: &mut ConnectionManager,
    target: &MigrationTarget,
) -> Result<Vec<String>, GatewayError> {
    match &target.sensor_id {
        Some(id) => Ok(vec![format!("sensor:{}:{}:timeseries", target.type_key, id)]),
        None => {
            let pattern = format!("{}:timeseries:channel_*", target.type_key);
            let mut iter: redis::AsyncIter<'_, String> = conn
                .scan_match(&pattern)
                .await
                .map_err(|e| GatewayError::CacheError(format!("scanning {pattern}: {e}")))?;
            let mut keys = Vec::new();
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
            Ok(keys)
        }
    }
}

async fn migrate_timeseries(
    conn: &mut ConnectionManager,
    store: &DocumentStore,
    target: &MigrationTarget,
    ts_key: &str,
    session_prefix: &str,
) -> Result<(), GatewayError> {
    let progress_key = format!("timeseries:{ts_key}");
    let mut last_score = load_progress_score(store, &progress_key).await?;
    let channel = channel_from_timeseries_key(target, ts_key);

    loop {
        let members: Vec<(String, f64)> = conn
            .zrangebyscore_withscores(ts_key, format!("({last_score}"), "+inf")
            .await
            .map_err(|e| GatewayError::CacheError(format!("reading {ts_key}: {e}")))?;
        let page: Vec<_> = members.into_iter().take(TIMESERIES_PAGE_SIZE as usize).collect();
        if page.is_empty() {
            break;
        }
        let page_len = page.len();
        let mut max_score = last_score;
        for (member, score) in &page {
            let value: f64 = member
                .split(':')
                .next()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0.0);
            let reading = SensorReading {
                module_id: String::new(),
                sensor_type: sensor_type_from_key(&target.type_key),
                sensor_id: target.sensor_id.clone().unwrap_or_default(),
                channel,
                timestamp: chrono::DateTime::from_timestamp(*score as i64, 0)
                    .unwrap_or_else(chrono::Utc::now),
                raw: 0,
                value,
                unit: sensor_type_from_key(&target.type_key).unit().to_string(),
                session_prefix: session_prefix.to_string(),
            };
            store.upsert_one(&reading).await?;
            max_score = max_score.max(*score);
        }
        last_score = max_score;
        save_progress(store, "timeseries", &progress_key, page_len as u64, Some(last_score))
            .await?;
        if page_len < TIMESERIES_PAGE_SIZE as usize {
            break;
        }
    }
    Ok(())
}

async fn migrate_statistics(
    conn: &mut ConnectionManager,
    store: &DocumentStore,
    target: &MigrationTarget,
    session_prefix: &str,
) -> Result<(), GatewayError> {
    let key = target.statistics_key();
    let hash: HashMap<String, String> = conn
        .hgetall(&key)
        .await
        .map_err(|e| GatewayError::CacheError(format!("reading {key}: {e}")))?;
    if hash.is_empty() {
        return Ok(());
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
    let sensor_type = sensor_type_from_key(&target.type_key);
    store
        .upsert_statistics_raw(sensor_type, session_prefix, fields)
        .await
}

pub(crate) fn reading_from_hash(
    target: &MigrationTarget,
    session_prefix: &str,
    hash: &HashMap<String, String>,
) -> Option<SensorReading> {
    let value: f64 = hash.get("value")?.parse().ok()?;
    let raw: u16 = hash.get("raw").and_then(|s| s.parse().ok()).unwrap_or(0);
    let channel: u32 = hash.get("channel").and_then(|s| s.parse().ok()).unwrap_or(0);
    let module_id = hash.get("module_id").cloned().unwrap_or_default();
    let timestamp = hash
        .get("timestamp")
        .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .unwrap_or_else(chrono::Utc::now);
    let sensor_type = sensor_type_from_key(&target.type_key);
    let sensor_id = target
        .sensor_id
        .clone()
        .unwrap_or_else(|| SensorReading::make_sensor_id(sensor_type, &module_id, channel));
    Some(SensorReading {
        module_id,
        sensor_type,
        sensor_id,
        channel,
        timestamp,
        raw,
        value,
        unit: hash.get("unit").cloned().unwrap_or_default(),
        session_prefix: session_prefix.to_string(),
    })
}

pub(crate) fn sensor_type_from_key(type_key: &str) -> SensorType {
    match type_key {
        "wind_speed" => SensorType::WindSpeed,
        "pressure" => SensorType::Pressure,
        "humidity" => SensorType::Humidity,
        _ => SensorType::Temperature,
    }
}

pub(crate) fn channel_from_timeseries_key(target: &MigrationTarget, ts_key: &str) -> u32 {
    if target.sensor_id.is_some() {
        return 0;
    }
    ts_key
        .rsplit("channel_")
        .next()
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

async fn load_progress_count(store: &DocumentStore, key: &str) -> Result<isize, GatewayError> {
    let progress: mongodb::Collection<bson::Document> = store.db().collection("sync_progress");
    let doc = progress
        .find_one(doc! { "key": key })
        .await
        .map_err(|e| GatewayError::StoreError(format!("reading sync_progress: {e}")))?;
    Ok(doc
        .and_then(|d| d.get_i64("count").ok())
        .unwrap_or(0) as isize)
}

async fn load_progress_score(store: &DocumentStore, key: &str) -> Result<f64, GatewayError> {
    let progress: mongodb::Collection<bson::Document> = store.db().collection("sync_progress");
    let doc = progress
        .find_one(doc! { "key": key })
        .await
        .map_err(|e| GatewayError::StoreError(format!("reading sync_progress: {e}")))?;
    Ok(doc.and_then(|d| d.get_f64("last_score").ok()).unwrap_or(0.0))
}

pub(crate) async fn save_progress(
    store: &DocumentStore,
    data_type: &str,
    key: &str,
    count: u64,
    last_score: Option<f64>,
) -> Result<(), GatewayError> {
    let progress: mongodb::Collection<bson::Document> = store.db().collection("sync_progress");
    let mut set = doc! {
        "data_type": data_type,
        "count": count as i64,
        "updated_at": bson::DateTime::now(),
    };
    if let Some(score) = last_score {
        set.insert("last_score", score);
    }
    progress
        .update_one(doc! { "key": key }, doc! { "$set": set, "$setOnInsert": { "key": key } })
        .with_options(mongodb::options::UpdateOptions::builder().upsert(true).build())
        .await
        .map_err(|e| GatewayError::StoreError(format!("writing sync_progress: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_prefixed_key() {
        let target = MigrationTarget {
            type_key: "temperature".to_string(),
            sensor_id: Some("temperature_mod1_00".to_string()),
        };
        assert_eq!(target.realtime_key(), "sensor:temperature:temperature_mod1_00:realtime");
    }

    #[test]
    fn legacy_key_has_no_sensor_id() {
        let target = MigrationTarget {
            type_key: "temperature".to_string(),
            sensor_id: None,
        };
        assert_eq!(target.realtime_key(), "temperature:realtime");
    }

    #[test]
    fn channel_parsed_from_legacy_timeseries_key() {
        let target = MigrationTarget {
            type_key: "temperature".to_string(),
            sensor_id: None,
        };
        let channel = channel_from_timeseries_key(&target, "temperature:timeseries:channel_03");
        assert_eq!(channel, 3);
    }

    #[test]
    fn reading_from_hash_defaults_missing_fields() {
        let mut hash = HashMap::new();
        hash.insert("value".to_string(), "12.5".to_string());
        let target = MigrationTarget {
            type_key: "humidity".to_string(),
            sensor_id: Some("humidity_m1_00".to_string()),
        };
        let reading = reading_from_hash(&target, "20260101_000000", &hash).unwrap();
        assert_eq!(reading.value, 12.5);
        assert_eq!(reading.sensor_type, SensorType::Humidity);
    }
}
