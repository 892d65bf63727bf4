//! Shared in-process counters and their periodic, consistent snapshot (§5,
//! §4.2, §4.4, §4.5, §4.6, §4.8).
//!
//! Every counter here is an atomic updated from whichever task owns the
//! event; `statistics()`-style snapshot methods on the owning component read
//! them back into a plain, cloneable struct instead of exposing the atomics
//! themselves.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};

/// Module Reader lifecycle state (§3, §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReaderState {
    Created,
    Connecting,
    Connected,
    Polling,
    Reconnecting,
    Stopped,
}

/// Atomic counters owned by one [`crate::reader::ModuleReader`].
#[derive(Debug, Default)]
pub struct ReaderCounters {
    consecutive_failures: AtomicU32,
    total_reads: AtomicU64,
    total_errors: AtomicU64,
    last_success_ts_millis: AtomicI64,
}

impl ReaderCounters {
    pub fn record_success(&self) {
        self.total_reads.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.last_success_ts_millis
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn record_failure(&self) -> u32 {
        self.total_errors.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn snapshot(&self, state: ReaderState) -> ReaderStatus {
        let millis = self.last_success_ts_millis.load(Ordering::Relaxed);
        let last_success_ts = if millis == 0 {
            None
        } else {
            DateTime::<Utc>::from_timestamp_millis(millis)
        };
        ReaderStatus {
            state,
            last_success_ts,
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
            total_reads: self.total_reads.load(Ordering::Relaxed),
            total_errors: self.total_errors.load(Ordering::Relaxed),
        }
    }
}

/// Consistent point-in-time read of one reader's counters (§4.2 `status()`).
#[derive(Debug, Clone, Serialize)]
pub struct ReaderStatus {
    pub state: ReaderState,
    pub last_success_ts: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub total_reads: u64,
    pub total_errors: u64,
}

/// Aggregate counters owned by the [`crate::manager::ModuleManager`] fan-out
/// (§4.4 backpressure policy).
#[derive(Debug, Default)]
pub struct ManagerCounters {
    pub dropped_oldest: AtomicU64,
}

impl ManagerCounters {
    /// Accumulate `n` drop-oldest events (§4.4 backpressure policy). `n` is
    /// usually the `Lagged(n)` count a broadcast subscriber reports when it
    /// falls behind the fan-out's bounded buffer.
    pub fn record_drop(&self, n: u64) {
        self.dropped_oldest.fetch_add(n, Ordering::Relaxed);
    }
}

/// Cache Writer counters (§4.5).
#[derive(Debug, Default)]
pub struct CacheCounters {
    pub writes_ok: AtomicU64,
    pub writes_failed: AtomicU64,
}

impl CacheCounters {
    pub fn snapshot(&self) -> CacheStatistics {
        CacheStatistics {
            writes_ok: self.writes_ok.load(Ordering::Relaxed),
            writes_failed: self.writes_failed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStatistics {
    pub writes_ok: u64,
    pub writes_failed: u64,
}

/// Document Writer counters (§4.6).
#[derive(Debug, Default)]
pub struct StoreCounters {
    pub batches_ok: AtomicU64,
    pub batches_failed: AtomicU64,
    pub batches_retried: AtomicU64,
}

impl StoreCounters {
    pub fn snapshot(&self) -> StoreStatistics {
        StoreStatistics {
            batches_ok: self.batches_ok.load(Ordering::Relaxed),
            batches_failed: self.batches_failed.load(Ordering::Relaxed),
            batches_retried: self.batches_retried.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreStatistics {
    pub batches_ok: u64,
    pub batches_failed: u64,
    pub batches_retried: u64,
}

/// Realtime Sync worker counters (§4.8), one instance per data_type worker.
#[derive(Debug, Default)]
pub struct SyncCounters {
    pub cycles: AtomicU64,
    pub documents_written: AtomicU64,
    pub errors: AtomicU64,
    last_cycle_millis: AtomicI64,
}

impl SyncCounters {
    pub fn record_cycle(&self, documents_written: u64) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        self.documents_written
            .fetch_add(documents_written, Ordering::Relaxed);
        self.last_cycle_millis
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SyncStatistics {
        let millis = self.last_cycle_millis.load(Ordering::Relaxed);
        SyncStatistics {
            cycles: self.cycles.load(Ordering::Relaxed),
            documents_written: self.documents_written.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            last_cycle_ts: if millis == 0 {
                None
            } else {
                DateTime::<Utc>::from_timestamp_millis(millis)
            },
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncStatistics {
    pub cycles: u64,
    pub documents_written: u64,
    pub errors: u64,
    pub last_cycle_ts: Option<DateTime<Utc>>,
}

/// Aggregate statistics exposed by the Module Manager's `statistics()`
/// (§4.4).
#[derive(Debug, Clone, Serialize)]
pub struct ManagerStatistics {
    pub modules: std::collections::HashMap<String, ReaderStatus>,
    pub dropped_oldest: u64,
}
