//! Two-phase flush barrier.
//!
//! A flush cycle flips the global mode to flushing, wakes every shard
//! worker, waits for all of them to count down the workers-done latch, flips
//! the mode back and releases the resume latch. Only the holder of a
//! [`CycleSlot`] can run a cycle, so two cycles never overlap.

use crate::core::{Result, TallyError};
use arc_swap::ArcSwapOption;
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error};

/// Count-down latch
#[derive(Debug)]
pub struct Latch {
    count: Mutex<usize>,
    zero: Condvar,
}

impl Latch {
    pub fn new(count: usize) -> Self {
        Self {
            count: Mutex::new(count),
            zero: Condvar::new(),
        }
    }

    pub fn count_down(&self) {
        let mut count = self.count.lock();
        if *count > 0 {
            *count -= 1;
            if *count == 0 {
                self.zero.notify_all();
            }
        }
    }

    /// Release every waiter regardless of the remaining count
    pub fn release(&self) {
        let mut count = self.count.lock();
        *count = 0;
        self.zero.notify_all();
    }

    pub fn count(&self) -> usize {
        *self.count.lock()
    }

    pub fn wait(&self) {
        let mut count = self.count.lock();
        while *count > 0 {
            self.zero.wait(&mut count);
        }
    }

    /// Wait for zero. Returns false if `timeout` expired first.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.count.lock();
        while *count > 0 {
            if self.zero.wait_until(&mut count, deadline).timed_out() {
                return *count == 0;
            }
        }
        true
    }
}

/// What the workers do with their shard during a cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleAction {
    /// Snapshot and reset every aggregate, emitting the snapshots
    Flush,
    /// Drop every aggregate without emitting
    Clear,
}

/// One in-flight flush cycle, shared with every worker
#[derive(Debug)]
pub struct FlushCycle {
    serial: u64,
    end: i64,
    action: CycleAction,
    workers_done: Latch,
    resume: Latch,
    snapshots: AtomicU64,
}

impl FlushCycle {
    fn new(serial: u64, end: i64, action: CycleAction, shards: usize) -> Self {
        Self {
            serial,
            end,
            action,
            workers_done: Latch::new(shards),
            resume: Latch::new(1),
            snapshots: AtomicU64::new(0),
        }
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }

    /// Interval end shared by every shard in this cycle
    pub fn end(&self) -> i64 {
        self.end
    }

    pub fn action(&self) -> CycleAction {
        self.action
    }

    /// Called by a worker once its shard is flushed
    pub fn shard_done(&self, snapshots: usize) {
        self.snapshots
            .fetch_add(snapshots as u64, Ordering::Relaxed);
        self.workers_done.count_down();
    }

    /// Block until the coordinator resumes submission
    pub fn wait_resume(&self) {
        self.resume.wait();
    }
}

/// Result of a completed cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleOutcome {
    pub serial: u64,
    pub end: i64,
    pub snapshots: u64,
    pub elapsed: Duration,
}

pub struct FlushCoordinator {
    shards: usize,
    timeout: Duration,
    flushing: AtomicBool,
    current: ArcSwapOption<FlushCycle>,
    cycle_lock: Mutex<()>,
    wakers: Vec<(Sender<()>, Receiver<()>)>,
}

impl FlushCoordinator {
    pub fn new(shards: usize, timeout: Duration) -> Self {
        Self {
            shards,
            timeout,
            flushing: AtomicBool::new(false),
            current: ArcSwapOption::empty(),
            cycle_lock: Mutex::new(()),
            wakers: (0..shards).map(|_| bounded(1)).collect(),
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shards
    }

    /// Wake channel for one shard's worker
    pub fn wake_receiver(&self, shard: usize) -> Receiver<()> {
        self.wakers[shard].1.clone()
    }

    /// Interrupt every worker blocked on its queue
    pub fn wake_all(&self) {
        for (waker, _) in &self.wakers {
            // A pending token already guarantees a wake-up
            let _ = waker.try_send(());
        }
    }

    #[inline]
    pub fn is_flushing(&self) -> bool {
        self.flushing.load(Ordering::Acquire)
    }

    /// The active cycle, if one is in flight and newer than `last_serial`
    pub fn pending_cycle(&self, last_serial: u64) -> Option<Arc<FlushCycle>> {
        if !self.is_flushing() {
            return None;
        }
        self.current
            .load_full()
            .filter(|cycle| cycle.serial > last_serial)
    }

    /// Claim the right to run a cycle, failing if one is in flight
    pub fn try_slot(&self) -> Result<CycleSlot<'_>> {
        let guard = self
            .cycle_lock
            .try_lock()
            .ok_or(TallyError::FlushInProgress)?;
        Ok(CycleSlot {
            coordinator: self,
            _guard: guard,
        })
    }

    /// Claim the right to run a cycle, waiting for any in-flight one
    pub fn slot(&self) -> CycleSlot<'_> {
        CycleSlot {
            coordinator: self,
            _guard: self.cycle_lock.lock(),
        }
    }
}

/// Exclusive right to run flush cycles
pub struct CycleSlot<'a> {
    coordinator: &'a FlushCoordinator,
    _guard: MutexGuard<'a, ()>,
}

impl CycleSlot<'_> {
    /// Run one cycle closing every shard's interval at `end`.
    ///
    /// If the workers-done latch does not reach zero within the configured
    /// timeout the cycle is abandoned: the mode flips back, the resume latch
    /// is released and [`TallyError::FlushTimeout`] is returned.
    pub fn switch_channel(&self, serial: u64, end: i64, action: CycleAction) -> Result<CycleOutcome> {
        let coordinator = self.coordinator;
        let started = Instant::now();
        let cycle = Arc::new(FlushCycle::new(serial, end, action, coordinator.shards));

        coordinator.current.store(Some(Arc::clone(&cycle)));
        coordinator.flushing.store(true, Ordering::Release);
        coordinator.wake_all();

        let completed = cycle.workers_done.wait_timeout(coordinator.timeout);

        coordinator.flushing.store(false, Ordering::Release);
        cycle.resume.release();
        coordinator.current.store(None);

        if !completed {
            let pending = cycle.workers_done.count();
            error!(
                serial,
                pending,
                timeout_ms = coordinator.timeout.as_millis() as u64,
                "Flush cycle abandoned: shard workers did not finish in time"
            );
            return Err(TallyError::FlushTimeout {
                serial,
                pending,
                timeout_ms: coordinator.timeout.as_millis() as u64,
            });
        }

        let outcome = CycleOutcome {
            serial,
            end,
            snapshots: cycle.snapshots.load(Ordering::Relaxed),
            elapsed: started.elapsed(),
        };
        debug!(serial, ?action, elapsed = ?outcome.elapsed, "Flush cycle complete");
        Ok(outcome)
    }
}
