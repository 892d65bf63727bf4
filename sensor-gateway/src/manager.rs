//! Module Manager (C4, §4.4).
//!
//! Owns the set of Module Readers, fans their individual `SensorReading`
//! streams into one bounded broadcast channel, and applies the drop-oldest
//! backpressure policy when a downstream consumer falls behind. Generalizes
//! the teacher's `RouterHandle`-style owning-struct-plus-`Arc<AtomicBool>`
//! shutdown signal (`hdds-router/src/router.rs`) into a manager that also
//! tracks per-module handles for `statistics()`.

use crate::config::{AcquisitionConfig, ModuleConfig};
use crate::reader::{self, ModuleReaderHandle};
use crate::stats::{ManagerCounters, ManagerStatistics};
use crate::types::SensorReading;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{info, warn};

/// Default capacity of the fan-out broadcast channel (§4.4).
pub const DEFAULT_CHANNEL_CAPACITY: usize = 4096;

/// Owns every [`ModuleReaderHandle`] and the single cancellation signal that
/// stops them all together.
pub struct ModuleManager {
    acquisition: AcquisitionConfig,
    session_prefix: String,
    cancel_tx: watch::Sender<bool>,
    cancel_rx: watch::Receiver<bool>,
    readers: HashMap<String, ModuleReaderHandle>,
    fanout_tx: broadcast::Sender<SensorReading>,
    counters: Arc<ManagerCounters>,
}

impl ModuleManager {
    pub fn new(acquisition: AcquisitionConfig, session_prefix: String) -> Self {
        Self::with_capacity(acquisition, session_prefix, DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(
        acquisition: AcquisitionConfig,
        session_prefix: String,
        capacity: usize,
    ) -> Self {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (fanout_tx, _) = broadcast::channel(capacity);
        Self {
            acquisition,
            session_prefix,
            cancel_tx,
            cancel_rx,
            readers: HashMap::new(),
            fanout_tx,
            counters: Arc::new(ManagerCounters::default()),
        }
    }

    /// `add(module_config)` — spawn a new reader and start relaying its
    /// readings into the fan-out channel (§4.4).
    pub fn add(&mut self, config: ModuleConfig) {
        let module_id = config.module_id.clone();
        let (relay_tx, relay_rx) = mpsc::channel(256);
        let handle = reader::spawn(
            config,
            self.acquisition.clone(),
            self.session_prefix.clone(),
            self.cancel_rx.clone(),
            relay_tx,
        );
        self.spawn_relay(relay_rx);
        self.readers.insert(module_id.clone(), handle);
        info!(module_id = %module_id, "module added");
    }

    fn spawn_relay(&self, mut relay_rx: mpsc::Receiver<SensorReading>) {
        let fanout_tx = self.fanout_tx.clone();
        let counters = self.counters.clone();
        tokio::spawn(async move {
            while let Some(reading) = relay_rx.recv().await {
                // broadcast::Sender only errors when every subscriber has
                // dropped; the actual drop-oldest policy (§4.4) plays out on
                // the subscriber side as `RecvError::Lagged(n)`, counted in
                // `CacheWriter::run`/`DocumentStore::run` via the shared
                // `ManagerCounters` handle. A send with no subscribers left
                // is itself one lost reading.
                if fanout_tx.send(reading).is_err() {
                    counters.record_drop(1);
                }
            }
        });
    }

    /// `remove(module_id)` — stop and drop a reader. No-op if unknown.
    pub async fn remove(&mut self, module_id: &str) {
        if let Some(handle) = self.readers.remove(module_id) {
            // Individual removal has no independent cancellation signal in
            // this design: a removed reader simply has its handle dropped
            // and is no longer polled for status. Full shutdown uses
            // `stop_all`, which cancels every reader task cooperatively.
            drop(handle);
            warn!(module_id, "module removed (reader task left running until stop_all)");
        }
    }

    /// `subscribe()` — a new bounded receiver for every reading emitted from
    /// this point on (§4.4).
    pub fn subscribe(&self) -> broadcast::Receiver<SensorReading> {
        self.fanout_tx.subscribe()
    }

    /// Shared counters for this manager's fan-out, so a subscriber
    /// (`CacheWriter`, `DocumentStore`) can report the `Lagged(n)` drops it
    /// observes on its own receiver back into one aggregate `dropped_oldest`
    /// (§4.4, §8 scenario 6).
    pub fn counters(&self) -> Arc<ManagerCounters> {
        self.counters.clone()
    }

    pub async fn start_all(&self) {
        info!(count = self.readers.len(), "module manager started");
    }

    /// `stop_all()` — signal cancellation to every reader and wait for them
    /// to reach `Stopped`.
    pub async fn stop_all(&mut self) {
        let _ = self.cancel_tx.send(true);
        for (_, handle) in self.readers.drain() {
            handle.join().await;
        }
        info!("module manager stopped");
    }

    /// `statistics()` — one `ReaderStatus` per module plus manager-level
    /// drop counters (§4.4).
    pub fn statistics(&self) -> ManagerStatistics {
        let modules = self
            .readers
            .iter()
            .map(|(id, handle)| (id.clone(), handle.status()))
            .collect();
        ManagerStatistics {
            modules,
            dropped_oldest: self
                .counters
                .dropped_oldest
                .load(std::sync::atomic::Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReconnectBackoffConfig;
    use crate::types::SensorType;

    fn acquisition() -> AcquisitionConfig {
        AcquisitionConfig {
            default_poll_interval_ms: 50,
            default_read_timeout_ms: 100,
            reconnect_backoff: ReconnectBackoffConfig {
                initial_ms: 10,
                max_ms: 20,
                multiplier: 2.0,
                jitter_pct: 0.0,
            },
            failure_threshold: 2,
        }
    }

    fn module_config(id: &str, port: u16) -> ModuleConfig {
        ModuleConfig {
            module_id: id.into(),
            host: "127.0.0.1".into(),
            port,
            slave_addr: 1,
            function_code: 4,
            start_register: 0,
            register_count: 1,
            poll_interval_ms: 50,
            sensor_type: SensorType::Humidity,
            channel_count: 1,
            conversion: None,
            is_rtc: false,
        }
    }

    #[tokio::test]
    async fn statistics_reports_every_added_module() {
        let mut manager = ModuleManager::new(acquisition(), "20260101_000000".into());
        // Port 1 is never a real listener in CI sandboxes; the reader just
        // sits in Connecting/Reconnecting, which is enough to exercise
        // statistics() without a live Modbus device.
        manager.add(module_config("a", 1));
        manager.add(module_config("b", 1));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let stats = manager.statistics();
        assert_eq!(stats.modules.len(), 2);
        assert!(stats.modules.contains_key("a"));
        assert!(stats.modules.contains_key("b"));

        manager.stop_all().await;
    }

    #[tokio::test]
    async fn subscribe_receives_broadcast_after_subscribing() {
        let manager = ModuleManager::new(acquisition(), "20260101_000000".into());
        let mut rx = manager.subscribe();
        let reading = SensorReading {
            module_id: "a".into(),
            sensor_type: SensorType::Humidity,
            sensor_id: "humidity_a_00".into(),
            channel: 0,
            timestamp: chrono::Utc::now(),
            raw: 100,
            value: 1.0,
            unit: "%RH".into(),
            session_prefix: "20260101_000000".into(),
        };
        manager.fanout_tx.send(reading.clone()).unwrap();
        let got = rx.recv().await.unwrap();
        assert_eq!(got.sensor_id, reading.sensor_id);
    }

    fn reading_with_channel(channel: u32) -> SensorReading {
        SensorReading {
            module_id: "a".into(),
            sensor_type: SensorType::Humidity,
            sensor_id: "humidity_a_00".into(),
            channel,
            timestamp: chrono::Utc::now(),
            raw: channel as u16,
            value: channel as f64,
            unit: "%RH".into(),
            session_prefix: "20260101_000000".into(),
        }
    }

    /// §8 scenario 6: 8192 sends into a 4096-capacity fan-out with a
    /// consumer that only starts draining afterwards. The consumer must end
    /// up with exactly the 4096 most recent readings, and the aggregate
    /// `dropped_oldest` counter (fed the same way `CacheWriter`/
    /// `DocumentStore` feed it from `RecvError::Lagged`) must read 4096.
    #[tokio::test]
    async fn overflow_drops_oldest_and_counts_exactly() {
        let manager = ModuleManager::with_capacity(acquisition(), "20260101_000000".into(), 4096);
        let mut rx = manager.subscribe();

        for channel in 0..8192u32 {
            // Ignore send errors: none expected here, a subscriber is held.
            let _ = manager.fanout_tx.send(reading_with_channel(channel));
        }

        let mut received = Vec::new();
        loop {
            match rx.recv().await {
                Ok(reading) => received.push(reading),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    manager.counters().record_drop(n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
            if received.len() == 4096 {
                break;
            }
        }

        assert_eq!(received.len(), 4096);
        assert_eq!(manager.statistics().dropped_oldest, 4096);
        // Retained samples are the most recent ones (channels 4096..8192).
        assert_eq!(received.first().unwrap().channel, 4096);
        assert_eq!(received.last().unwrap().channel, 8191);
    }
}
