//! Sharded interval accumulator.
//!
//! Producers call [`Accumulator::submit`] from any thread. Each trace is
//! routed by its metric's shard index to a bounded queue drained by that
//! shard's dedicated worker, which is the only thread that ever touches the
//! shard's aggregates. Flush cycles close every shard's interval at one
//! shared timestamp through the two-latch barrier in [`coordinator`].

pub mod coordinator;
pub mod listener;
pub mod queue;
pub mod shard;
pub mod sink;
pub mod stats;
pub mod trigger;
pub mod worker;

pub use coordinator::{CycleAction, CycleOutcome, FlushCoordinator, Latch};
pub use listener::{FlushListener, ListenerRegistry, SnapshotListener};
pub use queue::SubmissionQueue;
pub use shard::{ApplyOutcome, ShardAccumulator};
pub use sink::{ChannelSink, LoggingSink, MemorySink, SinkBatch, SnapshotSink};
pub use stats::{AccumulatorStats, Counters, ShardMetrics, ShardStats, WorkerState};
pub use trigger::{FlushTrigger, ManualTicker, ThreadTicker, Ticker};

use crate::core::{AccumulatorConfig, Result, TallyError};
use crate::metrics::{now_millis, AggregationKind, MetricId, MetricRegistry, RawTrace};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{error, info, warn};
use worker::{ShardWorker, WorkerContext};

struct Lifecycle {
    workers: Vec<JoinHandle<ShardAccumulator>>,
    parked: Vec<ShardAccumulator>,
    ticker: Box<dyn Ticker>,
}

/// Owned accumulator instance; construct one per process and share it by
/// reference or `Arc`.
pub struct Accumulator {
    config: AccumulatorConfig,
    registry: MetricRegistry,
    queues: Arc<[SubmissionQueue]>,
    shard_metrics: Vec<Arc<ShardMetrics>>,
    coordinator: Arc<FlushCoordinator>,
    trigger: Arc<FlushTrigger>,
    listeners: Arc<ListenerRegistry>,
    counters: Arc<Counters>,
    ctx: Arc<WorkerContext>,
    started: AtomicBool,
    lifecycle: Mutex<Lifecycle>,
}

impl Accumulator {
    /// Create a stopped accumulator flushing periodically on its own ticker
    /// thread (when `flush_period` is non-zero).
    pub fn new(config: AccumulatorConfig, sink: Arc<dyn SnapshotSink>) -> Result<Self> {
        Self::with_ticker(config, sink, Box::new(ThreadTicker::new()))
    }

    /// Create a stopped accumulator driven by the given tick source
    pub fn with_ticker(
        config: AccumulatorConfig,
        sink: Arc<dyn SnapshotSink>,
        ticker: Box<dyn Ticker>,
    ) -> Result<Self> {
        config.validate()?;
        let shards = config.shard_count;

        let queues: Arc<[SubmissionQueue]> = (0..shards)
            .map(|_| SubmissionQueue::new(config.queue_size, config.rejection_policy))
            .collect();
        let shard_metrics: Vec<Arc<ShardMetrics>> =
            (0..shards).map(|_| Arc::new(ShardMetrics::default())).collect();
        let coordinator = Arc::new(FlushCoordinator::new(shards, config.flush_timeout));
        let listeners = Arc::new(ListenerRegistry::new());
        let counters = Arc::new(Counters::default());
        let trigger = Arc::new(FlushTrigger::new(
            Arc::clone(&coordinator),
            Arc::clone(&queues),
            Arc::clone(&listeners),
            Arc::clone(&counters),
        ));
        let ctx = Arc::new(WorkerContext {
            coordinator: Arc::clone(&coordinator),
            queues: Arc::clone(&queues),
            sink,
            listeners: Arc::clone(&listeners),
            counters: Arc::clone(&counters),
            stop: Arc::new(AtomicBool::new(false)),
            batch_size: config.batch_size,
        });

        let accumulator = Self {
            registry: MetricRegistry::new(shards),
            queues,
            shard_metrics,
            coordinator,
            trigger,
            listeners,
            counters,
            ctx,
            started: AtomicBool::new(false),
            lifecycle: Mutex::new(Lifecycle {
                workers: Vec::with_capacity(shards),
                parked: Vec::with_capacity(shards),
                ticker,
            }),
            config,
        };
        {
            let mut lifecycle = accumulator.lifecycle.lock();
            lifecycle.parked = (0..shards).map(|i| accumulator.fresh_shard(i)).collect();
        }
        Ok(accumulator)
    }

    fn fresh_shard(&self, index: usize) -> ShardAccumulator {
        ShardAccumulator::new(
            index,
            self.config.map_capacity,
            self.config.delta_policy,
            now_millis(),
            Arc::clone(&self.shard_metrics[index]),
        )
    }

    /// Spawn the shard workers and, if configured, the periodic flush ticker
    pub fn start(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock();
        if self.started.load(Ordering::Acquire) {
            return Err(TallyError::config("accumulator is already started"));
        }

        self.ctx.stop.store(false, Ordering::Release);
        let parked = std::mem::take(&mut lifecycle.parked);
        for shard in parked {
            let index = shard.index();
            let worker = ShardWorker::new(shard, self.queues[index].receiver(), Arc::clone(&self.ctx));
            match worker.spawn(self.trigger.last_serial()) {
                Ok(handle) => lifecycle.workers.push(handle),
                Err(e) => {
                    error!(shard = index, error = %e, "Failed to start shard worker");
                    self.halt_workers(&mut lifecycle);
                    return Err(e);
                },
            }
        }

        if self.config.is_periodic() {
            let trigger = Arc::clone(&self.trigger);
            if let Err(e) = lifecycle
                .ticker
                .start(self.config.flush_period, Arc::new(move || trigger.on_tick()))
            {
                self.halt_workers(&mut lifecycle);
                return Err(e);
            }
        }

        self.started.store(true, Ordering::Release);
        self.listeners.notify_start(&self.counters);
        info!(
            shards = self.config.shard_count,
            queue_size = self.config.queue_size,
            batch_size = self.config.batch_size,
            flush_period = ?self.config.flush_period,
            policy = self.config.rejection_policy.as_str(),
            "Accumulator started"
        );
        Ok(())
    }

    /// Stop the ticker and the workers, draining queued traces best-effort.
    /// Waits for an in-flight flush cycle to finish. Idempotent.
    pub fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock();
        if !self.started.swap(false, Ordering::AcqRel) {
            return;
        }

        let _slot = self.coordinator.slot();
        lifecycle.ticker.stop();
        self.halt_workers(&mut lifecycle);

        self.listeners.notify_stop(&self.counters);
        info!(
            drops = self.cumulative_drops(),
            offline = self.counters.offline(),
            "Accumulator stopped"
        );
    }

    /// Signal stop, join every worker and park the shards for a restart
    fn halt_workers(&self, lifecycle: &mut Lifecycle) {
        self.ctx.stop.store(true, Ordering::Release);
        self.coordinator.wake_all();

        let mut parked: Vec<Option<ShardAccumulator>> =
            (0..self.config.shard_count).map(|_| None).collect();
        for shard in lifecycle.parked.drain(..) {
            let index = shard.index();
            parked[index] = Some(shard);
        }
        for handle in lifecycle.workers.drain(..) {
            match handle.join() {
                Ok(shard) => {
                    let index = shard.index();
                    parked[index] = Some(shard);
                },
                Err(_) => error!("Shard worker panicked; its aggregates are lost"),
            }
        }

        lifecycle.parked = parked
            .into_iter()
            .enumerate()
            .map(|(index, shard)| shard.unwrap_or_else(|| self.fresh_shard(index)))
            .collect();
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Route a trace to its shard queue. Never blocks under the discard
    /// policy; returns false if the trace was dropped or the accumulator is
    /// not started.
    #[inline]
    pub fn submit(&self, trace: RawTrace) -> bool {
        if !self.started.load(Ordering::Acquire) {
            self.counters.record_offline();
            return false;
        }
        match self.queues.get(trace.shard()) {
            Some(queue) => queue.offer(trace),
            None => {
                self.counters.record_misrouted();
                warn!(
                    fqn = trace.fqn(),
                    shard = trace.shard(),
                    shards = self.queues.len(),
                    "Trace resolved against a registry with a different shard count"
                );
                false
            },
        }
    }

    /// Run one flush cycle now.
    ///
    /// Rejected with a configuration error when periodic flushing is
    /// configured, since two triggers would race.
    pub fn flush(&self) -> Result<CycleOutcome> {
        if self.config.is_periodic() {
            warn!(period = ?self.config.flush_period, "Manual flush rejected");
            return Err(TallyError::config(format!(
                "manual flush is not allowed while flushing every {:?}",
                self.config.flush_period
            )));
        }
        if !self.is_started() {
            return Err(TallyError::NotStarted);
        }
        self.trigger.fire()
    }

    /// Drop every live aggregate in a coordinated cycle without emitting
    pub fn clear_aggregates(&self) -> Result<CycleOutcome> {
        if !self.is_started() {
            return Err(TallyError::NotStarted);
        }
        self.trigger.clear()
    }

    /// Identity registry whose shard assignment matches this accumulator
    pub fn registry(&self) -> &MetricRegistry {
        &self.registry
    }

    /// Shortcut for [`MetricRegistry::resolve`]
    pub fn resolve<S: AsRef<str>>(
        &self,
        host: &str,
        agent: &str,
        namespace: &[S],
        name: &str,
        kind: AggregationKind,
    ) -> Result<Arc<MetricId>> {
        self.registry.resolve(host, agent, namespace, name, kind)
    }

    pub fn register_flush_listener(&self, listener: Arc<dyn FlushListener>) -> bool {
        self.listeners.register(listener)
    }

    pub fn unregister_flush_listener(&self, listener: &Arc<dyn FlushListener>) -> bool {
        self.listeners.unregister(listener)
    }

    /// Deliver every closed snapshot of `fqn` to `listener`
    pub fn subscribe(&self, fqn: &str, listener: Arc<dyn SnapshotListener>) {
        self.listeners.subscribe(fqn, listener);
    }

    pub fn unsubscribe(&self, fqn: &str, listener: &Arc<dyn SnapshotListener>) -> bool {
        self.listeners.unsubscribe(fqn, listener)
    }

    /// Zero every counter and stamp the reset time
    pub fn reset_counters(&self) {
        self.counters.reset();
        for queue in self.queues.iter() {
            queue.reset_counters();
        }
        for metrics in &self.shard_metrics {
            metrics.reset_counters();
        }
        info!("Counters reset");
    }

    pub fn config(&self) -> &AccumulatorConfig {
        &self.config
    }

    pub fn shard_count(&self) -> usize {
        self.queues.len()
    }

    pub fn queue_depth(&self, shard: usize) -> Option<usize> {
        self.queues.get(shard).map(SubmissionQueue::depth)
    }

    pub fn total_queue_depth(&self) -> usize {
        self.queues.iter().map(SubmissionQueue::depth).sum()
    }

    pub fn interval_drops(&self) -> u64 {
        self.queues.iter().map(SubmissionQueue::dropped_interval).sum()
    }

    pub fn cumulative_drops(&self) -> u64 {
        self.queues.iter().map(SubmissionQueue::dropped_total).sum()
    }

    pub fn offline_submissions(&self) -> u64 {
        self.counters.offline()
    }

    /// Serial of the most recent flush cycle, 0 before the first
    pub fn last_flush_serial(&self) -> u64 {
        self.trigger.last_serial()
    }

    /// Counters of one shard's worker
    pub fn shard_metrics(&self, shard: usize) -> Option<&Arc<ShardMetrics>> {
        self.shard_metrics.get(shard)
    }

    pub fn stats(&self) -> AccumulatorStats {
        let shards: Vec<ShardStats> = self
            .queues
            .iter()
            .zip(&self.shard_metrics)
            .enumerate()
            .map(|(index, (queue, metrics))| ShardStats {
                index,
                state: metrics.state(),
                queue_depth: queue.depth(),
                queue_capacity: queue.capacity(),
                offered_interval: queue.offered_interval(),
                dropped_interval: queue.dropped_interval(),
                applied_interval: metrics.applied_interval(),
                dropped_total: queue.dropped_total(),
                applied_total: metrics.applied_total(),
                mismatches: metrics.mismatches(),
                aggregates: metrics.aggregates(),
                max_concurrent_writers: metrics.max_concurrent_writers(),
            })
            .collect();

        AccumulatorStats {
            started: self.is_started(),
            shard_count: self.config.shard_count,
            queue_size: self.config.queue_size,
            batch_size: self.config.batch_size,
            flush_period: self.config.flush_period,
            total_queue_depth: shards.iter().map(|s| s.queue_depth).sum(),
            interval_drops: shards.iter().map(|s| s.dropped_interval).sum(),
            cumulative_drops: shards.iter().map(|s| s.dropped_total).sum(),
            offline_submissions: self.counters.offline(),
            misrouted: self.counters.misrouted(),
            flush_cycles: self.counters.flush_cycles(),
            flush_timeouts: self.counters.flush_timeouts(),
            listener_failures: self.counters.listener_failures(),
            sink_failures: self.counters.sink_failures(),
            last_reset: self.counters.last_reset(),
            flush_listeners: self.listeners.flush_listener_count(),
            subscriptions: self.listeners.subscription_count(),
            shards,
        }
    }
}

impl Drop for Accumulator {
    fn drop(&mut self) {
        self.stop();
    }
}
