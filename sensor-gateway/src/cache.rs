//! Cache Writer (C5, §4.5, §6 key schema).
//!
//! Batches incoming readings into Redis pipelines (up to 64 commands or
//! 50ms, whichever first) using the generalized [`crate::batch::BatchBuffer`].
//! A write failure increments a counter and is surfaced via `statistics()`;
//! it never blocks or drops the input stream (§4.5).

use crate::batch::BatchBuffer;
use crate::config::CacheConfig;
use crate::error::GatewayError;
use crate::stats::{CacheCounters, CacheStatistics, ManagerCounters};
use crate::types::SensorReading;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

const PIPELINE_MAX_COMMANDS: usize = 64;
const PIPELINE_MAX_DELAY: Duration = Duration::from_millis(50);
const HISTORY_BOUND: isize = 1000;
const TIMESERIES_BOUND: isize = 10_000;
const REALTIME_TTL_SECS: i64 = 3600;

pub struct CacheWriter {
    conn: ConnectionManager,
    counters: Arc<CacheCounters>,
    /// Per-`sensor_id` monotonic counter appended to the timeseries member so
    /// two samples landing on the same score never collide (§9 open
    /// question, resolved in DESIGN.md).
    tie_breakers: Mutex<HashMap<String, u32>>,
}

impl CacheWriter {
    pub async fn connect(cfg: &CacheConfig) -> Result<Self, GatewayError> {
        let client = redis::Client::open(cfg.redis_url())
            .map_err(|e| GatewayError::CacheError(format!("invalid redis url: {e}")))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| GatewayError::CacheError(format!("connecting to redis: {e}")))?;
        Ok(Self {
            conn,
            counters: Arc::new(CacheCounters::default()),
            tie_breakers: Mutex::new(HashMap::new()),
        })
    }

    pub fn counters(&self) -> Arc<CacheCounters> {
        self.counters.clone()
    }

    pub fn statistics(&self) -> CacheStatistics {
        self.counters.snapshot()
    }

    /// Drive the batcher task: one per Cache Writer (§5). Consumes from the
    /// Module Manager's broadcast fan-out until cancelled, flushing its
    /// current batch before exiting. `manager_counters` is the Module
    /// Manager's shared counter set: every `Lagged(n)` reported on this
    /// subscriber is real drop-oldest overflow (§4.4), so it is folded into
    /// the same `dropped_oldest` the manager's `statistics()` reports.
    pub async fn run(
        mut self,
        mut rx: broadcast::Receiver<SensorReading>,
        mut cancel: watch::Receiver<bool>,
        manager_counters: Arc<ManagerCounters>,
    ) {
        let mut buffer: BatchBuffer<SensorReading> =
            BatchBuffer::new(PIPELINE_MAX_COMMANDS, PIPELINE_MAX_DELAY);
        let mut ticker = tokio::time::interval(Duration::from_millis(10));

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
                            warn!(skipped = n, "cache writer lagged behind fan-out");
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
        let n = batch.len();
        match self.write_pipeline(&batch).await {
            Ok(()) => {
                self.counters.writes_ok.fetch_add(n as u64, Ordering::Relaxed);
            }
            Err(e) => {
                self.counters
                    .writes_failed
                    .fetch_add(n as u64, Ordering::Relaxed);
                warn!(error = %e, batch_size = n, "cache pipeline write failed");
            }
        }
    }

    async fn write_pipeline(&mut self, batch: &[SensorReading]) -> Result<(), GatewayError> {
        let mut pipe = redis::pipe();
        for reading in batch {
            let type_key = reading.sensor_type.as_key_str();
            let sensor_id = &reading.sensor_id;

            let realtime_key = format!("sensor:{type_key}:{sensor_id}:realtime");
            pipe.hset_multiple(
                &realtime_key,
                &[
                    ("timestamp", reading.timestamp.to_rfc3339()),
                    ("value", reading.value.to_string()),
                    ("raw", reading.raw.to_string()),
                    ("unit", reading.unit.clone()),
                    ("channel", reading.channel.to_string()),
                    ("module_id", reading.module_id.clone()),
                ],
            )
            .ignore();
            pipe.expire(&realtime_key, REALTIME_TTL_SECS).ignore();

            let history_key = format!("sensor:{type_key}:{sensor_id}:history");
            let sample_json = serde_json::to_string(reading).map_err(|e| {
                GatewayError::CacheError(format!("serializing sample for history: {e}"))
            })?;
            pipe.lpush(&history_key, sample_json).ignore();
            pipe.ltrim(&history_key, 0, HISTORY_BOUND - 1).ignore();

            let timeseries_key = format!("sensor:{type_key}:{sensor_id}:timeseries");
            let counter = self.next_tie_breaker(sensor_id);
            let member = format!("{}:{}", reading.value, counter);
            let score = reading.timestamp.timestamp() as f64
                + reading.timestamp.timestamp_subsec_millis() as f64 / 1000.0;
            pipe.zadd(&timeseries_key, member, score).ignore();
            pipe.zremrangebyrank(&timeseries_key, 0, -(TIMESERIES_BOUND + 1))
                .ignore();
        }

        pipe.query_async::<()>(&mut self.conn)
            .await
            .map_err(|e| GatewayError::CacheError(format!("pipeline exec: {e}")))?;
        debug!(batch_size = batch.len(), "cache pipeline flushed");
        Ok(())
    }

    fn next_tie_breaker(&self, sensor_id: &str) -> u32 {
        let mut guard = self.tie_breakers.lock().expect("tie_breakers mutex poisoned");
        let counter = guard.entry(sensor_id.to_string()).or_insert(0);
        *counter = counter.wrapping_add(1);
        *counter
    }
}

/// Read the realtime hash for `sensor_id`, tolerating both the prefixed and
/// legacy per-channel key schema (§6, used by C7/C8).
pub async fn read_realtime_hash(
    conn: &mut ConnectionManager,
    sensor_type: &str,
    sensor_id: &str,
    legacy_key: Option<&str>,
) -> Result<Option<HashMap<String, String>>, GatewayError> {
    let key = format!("sensor:{sensor_type}:{sensor_id}:realtime");
    let hash: HashMap<String, String> = conn
        .hgetall(&key)
        .await
        .map_err(|e| GatewayError::CacheError(format!("reading {key}: {e}")))?;
    if !hash.is_empty() {
        return Ok(Some(hash));
    }
    if let Some(legacy) = legacy_key {
        let hash: HashMap<String, String> = conn
            .hgetall(legacy)
            .await
            .map_err(|e| GatewayError::CacheError(format!("reading {legacy}: {e}")))?;
        if !hash.is_empty() {
            return Ok(Some(hash));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tie_breaker_counter_is_monotonic_per_sensor() {
        let writer_tie_breakers: Mutex<HashMap<String, u32>> = Mutex::new(HashMap::new());
        let helper = |sensor_id: &str| {
            let mut guard = writer_tie_breakers.lock().unwrap();
            let counter = guard.entry(sensor_id.to_string()).or_insert(0);
            *counter = counter.wrapping_add(1);
            *counter
        };
        assert_eq!(helper("a"), 1);
        assert_eq!(helper("a"), 2);
        assert_eq!(helper("b"), 1);
        assert_eq!(helper("a"), 3);
    }

    #[test]
    fn timeseries_member_breaks_ties_with_counter_suffix() {
        let member_a = format!("{}:{}", 12.5, 1u32);
        let member_b = format!("{}:{}", 12.5, 2u32);
        assert_ne!(member_a, member_b);
    }
}
