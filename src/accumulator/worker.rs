//! Shard worker thread.
//!
//! The worker owns its [`ShardAccumulator`] outright. In `Submitting` it
//! blocks for a trace (or a wake token), drains up to a batch more and
//! applies the batch; after every batch it checks for a pending flush cycle.
//! In `Flushing` it closes the shard's interval, emits the snapshots, counts
//! down the cycle and waits to be resumed.

use crate::accumulator::coordinator::{CycleAction, FlushCoordinator, FlushCycle};
use crate::accumulator::listener::ListenerRegistry;
use crate::accumulator::queue::SubmissionQueue;
use crate::accumulator::shard::ShardAccumulator;
use crate::accumulator::sink::SnapshotSink;
use crate::accumulator::stats::{Counters, WorkerState};
use crate::core::{Result, TallyError};
use crate::metrics::RawTrace;
use crossbeam_channel::{select, Receiver};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, trace, warn};

/// Everything a worker shares with the facade
pub struct WorkerContext {
    pub coordinator: Arc<FlushCoordinator>,
    pub queues: Arc<[SubmissionQueue]>,
    pub sink: Arc<dyn SnapshotSink>,
    pub listeners: Arc<ListenerRegistry>,
    pub counters: Arc<Counters>,
    pub stop: Arc<AtomicBool>,
    pub batch_size: usize,
}

pub struct ShardWorker {
    shard: ShardAccumulator,
    queue: Receiver<RawTrace>,
    wake: Receiver<()>,
    ctx: Arc<WorkerContext>,
    last_serial: u64,
    batch: Vec<RawTrace>,
}

impl ShardWorker {
    pub fn new(shard: ShardAccumulator, queue: Receiver<RawTrace>, ctx: Arc<WorkerContext>) -> Self {
        let wake = ctx.coordinator.wake_receiver(shard.index());
        let batch = Vec::with_capacity(ctx.batch_size + 1);
        Self {
            shard,
            queue,
            wake,
            ctx,
            last_serial: 0,
            batch,
        }
    }

    /// Start the worker on its own named thread. Joining returns the shard.
    pub fn spawn(self, last_serial: u64) -> Result<JoinHandle<ShardAccumulator>> {
        let name = format!("tally-shard-{}", self.shard.index());
        let mut worker = self;
        worker.last_serial = last_serial;
        thread::Builder::new()
            .name(name)
            .spawn(move || worker.run())
            .map_err(TallyError::WorkerSpawn)
    }

    fn run(mut self) -> ShardAccumulator {
        let index = self.shard.index();
        self.shard.metrics().set_state(WorkerState::Submitting);
        debug!(shard = index, "Shard worker started");

        loop {
            if self.ctx.stop.load(Ordering::Acquire) {
                break;
            }
            if let Some(cycle) = self.ctx.coordinator.pending_cycle(self.last_serial) {
                self.handle_cycle(&cycle);
                continue;
            }
            self.next_batch();
        }

        // Best-effort drain of whatever producers managed to enqueue
        let mut drained = 0u64;
        loop {
            self.batch
                .extend(self.queue.try_iter().take(self.ctx.batch_size));
            if self.batch.is_empty() {
                break;
            }
            drained += self.batch.len() as u64;
            self.shard.apply(self.batch.drain(..));
        }

        self.shard.metrics().set_state(WorkerState::Stopped);
        debug!(shard = index, drained, "Shard worker stopped");
        self.shard
    }

    /// Block for one trace or a wake token, then apply a batch
    fn next_batch(&mut self) {
        select! {
            recv(self.queue) -> msg => {
                if let Ok(first) = msg {
                    self.batch.push(first);
                    self.batch
                        .extend(self.queue.try_iter().take(self.ctx.batch_size));
                    let outcome = self.shard.apply(self.batch.drain(..));
                    trace!(
                        shard = self.shard.index(),
                        applied = outcome.applied,
                        mismatched = outcome.mismatched,
                        "Batch applied"
                    );
                }
            },
            recv(self.wake) -> _ => {},
        }
    }

    fn handle_cycle(&mut self, cycle: &FlushCycle) {
        let index = self.shard.index();
        self.last_serial = cycle.serial();
        self.shard.metrics().set_state(WorkerState::Flushing);

        // Queue counters close at the same instant as the aggregates
        if let Some(queue) = self.ctx.queues.get(index) {
            queue.roll_interval(self.shard.metrics().applied_total());
        }

        let emitted = match cycle.action() {
            CycleAction::Flush => self.flush(cycle),
            CycleAction::Clear => {
                self.shard.clear(cycle.end());
                0
            },
        };

        debug!(shard = index, serial = cycle.serial(), emitted, "Shard flushed");
        cycle.shard_done(emitted);
        cycle.wait_resume();
        self.shard.metrics().set_state(WorkerState::Submitting);
    }

    fn flush(&mut self, cycle: &FlushCycle) -> usize {
        let index = self.shard.index();
        let serial = cycle.serial();
        let snapshots = self.shard.snapshot_and_reset(cycle.end());
        let emitted = snapshots.len();

        self.ctx
            .listeners
            .deliver(serial, &snapshots, &self.ctx.counters);

        let sink = &self.ctx.sink;
        match panic::catch_unwind(AssertUnwindSafe(|| sink.accept(serial, index, snapshots))) {
            Ok(Ok(())) => {},
            Ok(Err(e)) => {
                self.ctx.counters.record_sink_failure();
                warn!(shard = index, serial, error = %e, "Snapshot sink failed");
            },
            Err(_) => {
                self.ctx.counters.record_sink_failure();
                warn!(shard = index, serial, "Snapshot sink panicked");
            },
        }
        emitted
    }
}
