//! Read-only counters exposed by the accumulator.

use crate::metrics::now_millis;
use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::time::Duration;

/// Shard worker state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Submitting,
    Flushing,
    Stopped,
}

impl WorkerState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => WorkerState::Submitting,
            1 => WorkerState::Flushing,
            _ => WorkerState::Stopped,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            WorkerState::Submitting => 0,
            WorkerState::Flushing => 1,
            WorkerState::Stopped => 2,
        }
    }
}

/// Counters a shard's worker publishes for other threads to read.
///
/// The worker is the only writer of the aggregation counters; the
/// writer probe records how many threads were ever inside the shard at once.
#[derive(Debug)]
pub struct ShardMetrics {
    state: AtomicU8,
    applied_interval: AtomicU64,
    applied_total: AtomicU64,
    mismatches: AtomicU64,
    aggregates: AtomicUsize,
    snapshots_total: AtomicU64,
    writers: AtomicUsize,
    max_writers: AtomicUsize,
}

impl Default for ShardMetrics {
    fn default() -> Self {
        Self {
            state: AtomicU8::new(WorkerState::Stopped.as_u8()),
            applied_interval: AtomicU64::new(0),
            applied_total: AtomicU64::new(0),
            mismatches: AtomicU64::new(0),
            aggregates: AtomicUsize::new(0),
            snapshots_total: AtomicU64::new(0),
            writers: AtomicUsize::new(0),
            max_writers: AtomicUsize::new(0),
        }
    }
}

impl ShardMetrics {
    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: WorkerState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    pub(crate) fn record_applied(&self, applied: u64, mismatched: u64) {
        self.applied_interval.fetch_add(applied, Ordering::Relaxed);
        self.applied_total.fetch_add(applied, Ordering::Relaxed);
        if mismatched > 0 {
            self.mismatches.fetch_add(mismatched, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_flushed(&self, snapshots: usize) {
        self.applied_interval.store(0, Ordering::Relaxed);
        self.snapshots_total
            .fetch_add(snapshots as u64, Ordering::Relaxed);
    }

    pub(crate) fn set_aggregates(&self, live: usize) {
        self.aggregates.store(live, Ordering::Relaxed);
    }

    /// Traces applied since the shard last flushed
    pub fn applied_interval(&self) -> u64 {
        self.applied_interval.load(Ordering::Relaxed)
    }

    pub fn applied_total(&self) -> u64 {
        self.applied_total.load(Ordering::Relaxed)
    }

    /// Traces whose value the metric's aggregation kind could not accept
    pub fn mismatches(&self) -> u64 {
        self.mismatches.load(Ordering::Relaxed)
    }

    /// Live aggregates in the shard map
    pub fn aggregates(&self) -> usize {
        self.aggregates.load(Ordering::Relaxed)
    }

    pub fn snapshots_total(&self) -> u64 {
        self.snapshots_total.load(Ordering::Relaxed)
    }

    /// Highest number of threads ever observed inside the shard at once
    pub fn max_concurrent_writers(&self) -> usize {
        self.max_writers.load(Ordering::Acquire)
    }

    /// Mark entry into the shard's aggregates for the lifetime of the guard
    pub(crate) fn enter(&self) -> WriterGuard<'_> {
        let now = self.writers.fetch_add(1, Ordering::AcqRel) + 1;
        self.max_writers.fetch_max(now, Ordering::AcqRel);
        debug_assert_eq!(now, 1, "shard aggregates entered by two threads");
        WriterGuard { metrics: self }
    }

    pub(crate) fn reset_counters(&self) {
        self.applied_total.store(0, Ordering::Relaxed);
        self.mismatches.store(0, Ordering::Relaxed);
        self.snapshots_total.store(0, Ordering::Relaxed);
    }
}

pub(crate) struct WriterGuard<'a> {
    metrics: &'a ShardMetrics,
}

impl Drop for WriterGuard<'_> {
    fn drop(&mut self) {
        self.metrics.writers.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Facade-level counters
#[derive(Debug)]
pub struct Counters {
    offline: AtomicU64,
    misrouted: AtomicU64,
    flush_cycles: AtomicU64,
    flush_timeouts: AtomicU64,
    listener_failures: AtomicU64,
    sink_failures: AtomicU64,
    last_reset: AtomicI64,
}

impl Default for Counters {
    fn default() -> Self {
        Self {
            offline: AtomicU64::new(0),
            misrouted: AtomicU64::new(0),
            flush_cycles: AtomicU64::new(0),
            flush_timeouts: AtomicU64::new(0),
            listener_failures: AtomicU64::new(0),
            sink_failures: AtomicU64::new(0),
            last_reset: AtomicI64::new(now_millis()),
        }
    }
}

impl Counters {
    pub(crate) fn record_offline(&self) {
        self.offline.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_misrouted(&self) {
        self.misrouted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_flush_cycle(&self) {
        self.flush_cycles.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_flush_timeout(&self) {
        self.flush_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_listener_failure(&self) {
        self.listener_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_sink_failure(&self) {
        self.sink_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn offline(&self) -> u64 {
        self.offline.load(Ordering::Relaxed)
    }

    /// Traces whose shard index is outside this accumulator's range
    pub fn misrouted(&self) -> u64 {
        self.misrouted.load(Ordering::Relaxed)
    }

    pub fn flush_cycles(&self) -> u64 {
        self.flush_cycles.load(Ordering::Relaxed)
    }

    pub fn flush_timeouts(&self) -> u64 {
        self.flush_timeouts.load(Ordering::Relaxed)
    }

    pub fn listener_failures(&self) -> u64 {
        self.listener_failures.load(Ordering::Relaxed)
    }

    pub fn sink_failures(&self) -> u64 {
        self.sink_failures.load(Ordering::Relaxed)
    }

    pub fn last_reset(&self) -> i64 {
        self.last_reset.load(Ordering::Relaxed)
    }

    pub(crate) fn reset(&self) {
        self.offline.store(0, Ordering::Relaxed);
        self.misrouted.store(0, Ordering::Relaxed);
        self.flush_cycles.store(0, Ordering::Relaxed);
        self.flush_timeouts.store(0, Ordering::Relaxed);
        self.listener_failures.store(0, Ordering::Relaxed);
        self.sink_failures.store(0, Ordering::Relaxed);
        self.last_reset.store(now_millis(), Ordering::Relaxed);
    }
}

/// Point-in-time view of one shard
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShardStats {
    pub index: usize,
    pub state: WorkerState,
    pub queue_depth: usize,
    pub queue_capacity: usize,
    pub offered_interval: u64,
    pub dropped_interval: u64,
    pub applied_interval: u64,
    pub dropped_total: u64,
    pub applied_total: u64,
    pub mismatches: u64,
    pub aggregates: usize,
    pub max_concurrent_writers: usize,
}

/// Point-in-time view of the whole accumulator
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccumulatorStats {
    pub started: bool,
    pub shard_count: usize,
    pub queue_size: usize,
    pub batch_size: usize,
    #[serde(with = "humantime_serde")]
    pub flush_period: Duration,
    pub total_queue_depth: usize,
    pub interval_drops: u64,
    pub cumulative_drops: u64,
    pub offline_submissions: u64,
    pub misrouted: u64,
    pub flush_cycles: u64,
    pub flush_timeouts: u64,
    pub listener_failures: u64,
    pub sink_failures: u64,
    /// UTC millis of the last counter reset (or creation)
    pub last_reset: i64,
    pub flush_listeners: usize,
    pub subscriptions: usize,
    pub shards: Vec<ShardStats>,
}

impl AccumulatorStats {
    /// Traces applied across all shards since each last flushed
    pub fn applied_interval(&self) -> u64 {
        self.shards.iter().map(|s| s.applied_interval).sum()
    }

    pub fn applied_total(&self) -> u64 {
        self.shards.iter().map(|s| s.applied_total).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writer_probe_tracks_concurrency() {
        let metrics = ShardMetrics::default();
        {
            let _guard = metrics.enter();
        }
        {
            let _guard = metrics.enter();
        }
        assert_eq!(metrics.max_concurrent_writers(), 1);
    }

    #[test]
    fn test_worker_state_roundtrip() {
        let metrics = ShardMetrics::default();
        assert_eq!(metrics.state(), WorkerState::Stopped);
        metrics.set_state(WorkerState::Flushing);
        assert_eq!(metrics.state(), WorkerState::Flushing);
    }

    #[test]
    fn test_counter_reset() {
        let counters = Counters::default();
        counters.record_offline();
        counters.record_flush_timeout();
        let before = counters.last_reset();

        counters.reset();
        assert_eq!(counters.offline(), 0);
        assert_eq!(counters.flush_timeouts(), 0);
        assert!(counters.last_reset() >= before);
    }

    #[test]
    fn test_applied_totals() {
        let metrics = ShardMetrics::default();
        metrics.record_applied(4, 1);
        assert_eq!(metrics.applied_interval(), 4);
        assert_eq!(metrics.mismatches(), 1);

        metrics.record_flushed(2);
        assert_eq!(metrics.applied_interval(), 0);
        assert_eq!(metrics.applied_total(), 4);
        assert_eq!(metrics.snapshots_total(), 2);
    }
}
