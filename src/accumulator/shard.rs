//! Single-writer aggregate map for one shard.
//!
//! A `ShardAccumulator` is moved into its worker thread and handed back when
//! the worker exits, so `&mut self` is the only access path. The writer
//! probe in [`ShardMetrics`] records any concurrent entry anyway so tests can
//! assert the invariant instead of trusting it.

use crate::accumulator::stats::ShardMetrics;
use crate::metrics::{ClosedSnapshot, DeltaPolicy, IntervalAggregate, RawTrace};
use ahash::AHashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Outcome of applying one batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    /// Traces taken off the queue and processed
    pub applied: u64,
    /// Of those, traces rejected by the aggregate's kind
    pub mismatched: u64,
}

pub struct ShardAccumulator {
    index: usize,
    aggregates: AHashMap<Arc<str>, IntervalAggregate>,
    delta_policy: DeltaPolicy,
    interval_start: i64,
    metrics: Arc<ShardMetrics>,
}

impl ShardAccumulator {
    pub fn new(
        index: usize,
        capacity: usize,
        delta_policy: DeltaPolicy,
        interval_start: i64,
        metrics: Arc<ShardMetrics>,
    ) -> Self {
        Self {
            index,
            aggregates: AHashMap::with_capacity(capacity),
            delta_policy,
            interval_start,
            metrics,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn len(&self) -> usize {
        self.aggregates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.aggregates.is_empty()
    }

    pub fn metrics(&self) -> &Arc<ShardMetrics> {
        &self.metrics
    }

    /// Live aggregate for a metric, if one exists
    pub fn get(&self, fqn: &str) -> Option<&IntervalAggregate> {
        self.aggregates.get(fqn)
    }

    /// Fold a batch of traces in FIFO order.
    ///
    /// A trace rejected by its aggregate is counted and skipped; the rest of
    /// the batch still applies.
    pub fn apply<I>(&mut self, batch: I) -> ApplyOutcome
    where
        I: IntoIterator<Item = RawTrace>,
    {
        let _writer = self.metrics.enter();
        let mut outcome = ApplyOutcome::default();

        for trace in batch {
            outcome.applied += 1;
            if trace.shard() != self.index {
                warn!(
                    shard = self.index,
                    routed = trace.shard(),
                    fqn = trace.fqn(),
                    "Trace routed to the wrong shard, skipping"
                );
                outcome.mismatched += 1;
                continue;
            }

            let start = self.interval_start;
            let aggregate = self
                .aggregates
                .entry(Arc::clone(trace.id().fqn_arc()))
                .or_insert_with(|| IntervalAggregate::new(Arc::clone(trace.id()), start));

            if let Err(e) = aggregate.apply(&trace, self.delta_policy) {
                debug!(shard = self.index, error = %e, "Observation skipped");
                outcome.mismatched += 1;
            }
        }

        self.metrics
            .record_applied(outcome.applied, outcome.mismatched);
        self.metrics.set_aggregates(self.aggregates.len());
        outcome
    }

    /// Close the interval for every live aggregate at `end`.
    ///
    /// Each aggregate is copied into an immutable snapshot and then reset in
    /// place; map entries survive into the next interval.
    pub fn snapshot_and_reset(&mut self, end: i64) -> Vec<ClosedSnapshot> {
        let _writer = self.metrics.enter();
        let snapshots: Vec<ClosedSnapshot> = self
            .aggregates
            .values_mut()
            .map(|aggregate| aggregate.snapshot_and_reset(end))
            .collect();
        self.interval_start = end;
        self.metrics.record_flushed(snapshots.len());
        snapshots
    }

    /// Drop every aggregate, including delta baselines
    pub fn clear(&mut self, now: i64) {
        let _writer = self.metrics.enter();
        self.aggregates.clear();
        self.interval_start = now;
        self.metrics.record_flushed(0);
        self.metrics.set_aggregates(0);
    }
}
