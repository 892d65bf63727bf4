//! Document Writer (C6, §4.6).
//!
//! Batches readings (500 items or 1s, whichever first, via
//! [`crate::batch::BatchBuffer`]) and applies them to MongoDB as concurrent,
//! per-document upserts keyed by each collection's natural key (§6). A
//! rolling per-`(sensor_type, channel)` accumulator feeds the per-session
//! statistics document, which is upserted once per batch.

use crate::config::DocumentStoreConfig;
use crate::error::GatewayError;
use crate::stats::{ManagerCounters, StoreCounters, StoreStatistics};
use crate::types::{SensorReading, SensorType};
use bson::doc;
use futures::future::join_all;
use mongodb::options::UpdateOptions;
use mongodb::{Client, Database};
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

use crate::batch::BatchBuffer;

const BATCH_MAX_SAMPLES: usize = 500;
const BATCH_MAX_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Default, Clone, Copy)]
struct ChannelRollup {
    min: f64,
    max: f64,
    sum: f64,
    count: u64,
}

impl ChannelRollup {
    fn observe(&mut self, value: f64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.sum += value;
        self.count += 1;
    }

    fn avg(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

pub struct DocumentStore {
    db: Database,
    session_prefix: String,
    counters: Arc<StoreCounters>,
    rollups: Mutex<HashMap<(SensorType, u32), ChannelRollup>>,
}

impl DocumentStore {
    pub async fn connect(
        cfg: &DocumentStoreConfig,
        session_prefix: String,
    ) -> Result<Self, GatewayError> {
        let client = Client::with_uri_str(&cfg.uri)
            .await
            .map_err(|e| GatewayError::StoreError(format!("connecting to mongodb: {e}")))?;
        let db = client.database(&cfg.database);
        Ok(Self {
            db,
            session_prefix,
            counters: Arc::new(StoreCounters::default()),
            rollups: Mutex::new(HashMap::new()),
        })
    }

    pub fn counters(&self) -> Arc<StoreCounters> {
        self.counters.clone()
    }

    pub fn statistics(&self) -> StoreStatistics {
        self.counters.snapshot()
    }

    /// Drive the batcher task: one per Document Writer (§5).
    /// `manager_counters` is the Module Manager's shared counter set: every
    /// `Lagged(n)` on this subscriber is real drop-oldest overflow (§4.4),
    /// folded into the same `dropped_oldest` the manager's `statistics()`
    /// reports.
    pub async fn run(
        mut self,
        mut rx: broadcast::Receiver<SensorReading>,
        mut cancel: watch::Receiver<bool>,
        manager_counters: Arc<ManagerCounters>,
    ) {
        let mut buffer: BatchBuffer<SensorReading> =
            BatchBuffer::new(BATCH_MAX_SAMPLES, BATCH_MAX_DELAY);
        let mut ticker = tokio::time::interval(Duration::from_millis(100));

        loop {
            tokio::select! {
                biased;
                _ = cancel.changed() => {
                    if !buffer.is_empty() {
                        self.flush(buffer.flush()).await;
                    }
                    break;
                }
                reading = rx.recv() => {
                    match reading {
                        Ok(r) => {
                            if let Some(batch) = buffer.add(r) {
                                self.flush(batch).await;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(skipped = n, "document writer lagged behind fan-out");
                            manager_counters.record_drop(n);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
                _ = ticker.tick() => {
                    if buffer.should_flush() {
                        self.flush(buffer.flush()).await;
                    }
                }
            }
        }
    }

    async fn flush(&mut self, batch: Vec<SensorReading>) {
        if batch.is_empty() {
            return;
        }
        for reading in &batch {
            let mut rollups = self.rollups.lock().expect("rollups mutex poisoned");
            rollups
                .entry((reading.sensor_type, reading.channel))
                .or_default()
                .observe(reading.value);
        }

        let results = join_all(batch.iter().map(|r| self.upsert_one(r))).await;
        let failed = results.iter().filter(|r| r.is_err()).count() as u64;
        let ok = results.len() as u64 - failed;
        if ok > 0 {
            self.counters.batches_ok.fetch_add(ok, Ordering::Relaxed);
        }
        if failed > 0 {
            self.counters
                .batches_failed
                .fetch_add(failed, Ordering::Relaxed);
            for err in results.into_iter().filter_map(|r| r.err()) {
                warn!(error = %err, "document upsert failed");
            }
        }

        if let Err(e) = self.upsert_statistics(&batch).await {
            self.counters.batches_failed.fetch_add(1, Ordering::Relaxed);
            warn!(error = %e, "statistics document upsert failed");
        }
        debug!(batch_size = batch.len(), "document batch flushed");
    }

    /// Apply one reading's three-collection upsert. Shared with the bulk
    /// migrator (§4.7), which reconstructs readings from cache entries
    /// instead of receiving them over the fan-out channel.
    pub(crate) async fn upsert_one(&self, reading: &SensorReading) -> Result<(), GatewayError> {
        let type_key = reading.sensor_type.as_key_str();
        let opts = UpdateOptions::builder().upsert(true).build();

        let realtime: mongodb::Collection<bson::Document> =
            self.db.collection(&format!("realtime_{type_key}"));
        let channel_field = format!("channels.channel_{:02}", reading.channel);
        realtime
            .update_one(
                doc! { "session_prefix": &reading.session_prefix },
                doc! {
                    "$set": {
                        channel_field: { "value": reading.value, "raw": reading.raw as i64 },
                        "timestamp": reading.timestamp,
                        "synced_at": bson::DateTime::now(),
                    },
                    "$max": { "channel_count": (reading.channel as i64) + 1 },
                    "$setOnInsert": { "session_prefix": &reading.session_prefix },
                },
            )
            .with_options(opts.clone())
            .await
            .map_err(|e| GatewayError::StoreError(format!("realtime_{type_key} upsert: {e}")))?;

        let historical: mongodb::Collection<bson::Document> =
            self.db.collection(&format!("historical_{type_key}"));
        let historical_channel_field = format!("values.channel_{:02}", reading.channel);
        historical
            .update_one(
                doc! {
                    "session_prefix": &reading.session_prefix,
                    "timestamp": reading.timestamp,
                },
                doc! {
                    // Keyed by channel rather than `$push`-ed, so replaying
                    // the same reading twice sets the same field to the
                    // same value instead of duplicating an array entry
                    // (§8 document-idempotency law).
                    "$set": {
                        historical_channel_field: reading.value,
                        "synced_at": bson::DateTime::now(),
                    },
                    "$max": { "channel_count": (reading.channel as i64) + 1 },
                    "$setOnInsert": {
                        "session_prefix": &reading.session_prefix,
                        "timestamp": reading.timestamp,
                    },
                },
            )
            .with_options(opts.clone())
            .await
            .map_err(|e| GatewayError::StoreError(format!("historical_{type_key} upsert: {e}")))?;

        let timeseries: mongodb::Collection<bson::Document> =
            self.db.collection(&format!("timeseries_{type_key}"));
        let timestamp_unix = reading.timestamp.timestamp();
        timeseries
            .replace_one(
                doc! {
                    "session_prefix": &reading.session_prefix,
                    "channel": reading.channel as i64,
                    "timestamp_unix": timestamp_unix,
                },
                doc! {
                    "session_prefix": &reading.session_prefix,
                    "channel": reading.channel as i64,
                    "timestamp": reading.timestamp,
                    "timestamp_unix": timestamp_unix,
                    "value": reading.value,
                    "synced_at": bson::DateTime::now(),
                },
            )
            .with_options(
                mongodb::options::ReplaceOptions::builder()
                    .upsert(true)
                    .build(),
            )
            .await
            .map_err(|e| GatewayError::StoreError(format!("timeseries_{type_key} upsert: {e}")))?;

        Ok(())
    }

    async fn upsert_statistics(&self, batch: &[SensorReading]) -> Result<(), GatewayError> {
        let mut types_in_batch: Vec<SensorType> = batch.iter().map(|r| r.sensor_type).collect();
        types_in_batch.sort_by_key(|t| t.as_key_str());
        types_in_batch.dedup();

        for sensor_type in types_in_batch {
            let rollups = self.rollups.lock().expect("rollups mutex poisoned");
            let entries: Vec<_> = rollups
                .iter()
                .filter(|((t, _), _)| *t == sensor_type)
                .collect();
            if entries.is_empty() {
                continue;
            }
            let overall_min = entries.iter().map(|(_, r)| r.min).fold(f64::INFINITY, f64::min);
            let overall_max = entries
                .iter()
                .map(|(_, r)| r.max)
                .fold(f64::NEG_INFINITY, f64::max);
            let overall_avg = {
                let total: f64 = entries.iter().map(|(_, r)| r.sum).sum();
                let count: u64 = entries.iter().map(|(_, r)| r.count).sum();
                if count == 0 {
                    0.0
                } else {
                    total / count as f64
                }
            };
            let mut channel_min = bson::Document::new();
            let mut channel_max = bson::Document::new();
            for ((_, channel), rollup) in &entries {
                let key = format!("channel_{channel:02}");
                channel_min.insert(key.clone(), rollup.min);
                channel_max.insert(key, rollup.max);
            }
            drop(rollups);

            let type_key = sensor_type.as_key_str();
            let statistics: mongodb::Collection<bson::Document> =
                self.db.collection(&format!("statistics_{type_key}"));
            statistics
                .update_one(
                    doc! { "session_prefix": &self.session_prefix },
                    doc! {
                        "$set": {
                            "last_update": bson::DateTime::now(),
                            "channel_count": entries.len() as i64,
                            "statistics.min": overall_min,
                            "statistics.max": overall_max,
                            "statistics.avg": overall_avg,
                            "statistics.channel_min": channel_min,
                            "statistics.channel_max": channel_max,
                            "synced_at": bson::DateTime::now(),
                        },
                        "$setOnInsert": { "session_prefix": &self.session_prefix },
                    },
                )
                .with_options(UpdateOptions::builder().upsert(true).build())
                .await
                .map_err(|e| {
                    GatewayError::StoreError(format!("statistics_{type_key} upsert: {e}"))
                })?;
        }
        Ok(())
    }

    /// Upsert a statistics document built directly from a cache
    /// `sensor:{type}:statistics` hash, bypassing the in-process rollup.
    /// Used by the bulk migrator (§4.7), which copies whatever the cache
    /// already holds rather than recomputing it.
    pub(crate) async fn upsert_statistics_raw(
        &self,
        sensor_type: SensorType,
        session_prefix: &str,
        fields: bson::Document,
    ) -> Result<(), GatewayError> {
        let type_key = sensor_type.as_key_str();
        let statistics: mongodb::Collection<bson::Document> =
            self.db.collection(&format!("statistics_{type_key}"));
        statistics
            .update_one(
                doc! { "session_prefix": session_prefix },
                doc! {
                    "$set": fields,
                    "$setOnInsert": { "session_prefix": session_prefix },
                },
            )
            .with_options(UpdateOptions::builder().upsert(true).build())
            .await
            .map_err(|e| GatewayError::StoreError(format!("statistics_{type_key} upsert: {e}")))?;
        Ok(())
    }

    pub(crate) fn db(&self) -> &Database {
        &self.db
    }

    pub(crate) fn session_prefix(&self) -> &str {
        &self.session_prefix
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rollup_tracks_min_max_avg() {
        let mut r = ChannelRollup::default();
        r.observe(10.0);
        r.observe(-5.0);
        r.observe(20.0);
        assert_eq!(r.min, -5.0);
        assert_eq!(r.max, 20.0);
        assert!((r.avg() - (25.0 / 3.0)).abs() < 1e-9);
    }

    #[test]
    fn rollup_of_one_sample_has_equal_min_max() {
        let mut r = ChannelRollup::default();
        r.observe(42.0);
        assert_eq!(r.min, 42.0);
        assert_eq!(r.max, 42.0);
        assert_eq!(r.avg(), 42.0);
    }
}
