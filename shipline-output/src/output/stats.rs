/// Output statistics
///
/// Counters are plain atomics so a monitoring task can read them through a
/// shared `Arc<OutputStats>` while the owning client publishes.
///
/// # Example
///
/// ```no_run
/// use shipline_output::output::stats::OutputStats;
///
/// let stats = OutputStats::default();
/// stats.batch_acked(3, 128);
///
/// let snapshot = stats.snapshot();
/// println!("{}", serde_json::to_string(&snapshot).unwrap());
/// ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters of one output client
#[derive(Debug, Default)]
pub struct OutputStats {
    batches_acked: AtomicU64,
    batches_failed: AtomicU64,
    events_acked: AtomicU64,
    events_failed: AtomicU64,
    encoding_failures: AtomicU64,
    bytes_written: AtomicU64,
    connects: AtomicU64,
    connect_failures: AtomicU64,
}

impl OutputStats {
    /// Records a delivered batch of `events` events and `bytes` payload bytes
    pub fn batch_acked(&self, events: usize, bytes: usize) {
        self.batches_acked.fetch_add(1, Ordering::Relaxed);
        self.events_acked.fetch_add(events as u64, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Records a batch that was not delivered
    pub fn batch_failed(&self, events: usize) {
        self.batches_failed.fetch_add(1, Ordering::Relaxed);
        self.events_failed.fetch_add(events as u64, Ordering::Relaxed);
    }

    /// Records a batch rejected by the codec
    pub fn encoding_failed(&self) {
        self.encoding_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a successful connect
    pub fn connected(&self) {
        self.connects.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a failed connect
    pub fn connect_failed(&self) {
        self.connect_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            batches_acked: self.batches_acked.load(Ordering::Relaxed),
            batches_failed: self.batches_failed.load(Ordering::Relaxed),
            events_acked: self.events_acked.load(Ordering::Relaxed),
            events_failed: self.events_failed.load(Ordering::Relaxed),
            encoding_failures: self.encoding_failures.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            connects: self.connects.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
            collected_at: Utc::now(),
        }
    }
}

/// Serializable copy of [`OutputStats`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub batches_acked: u64,
    pub batches_failed: u64,
    pub events_acked: u64,
    pub events_failed: u64,
    pub encoding_failures: u64,
    pub bytes_written: u64,
    pub connects: u64,
    pub connect_failures: u64,

    /// Time the snapshot was taken
    pub collected_at: DateTime<Utc>,
}
