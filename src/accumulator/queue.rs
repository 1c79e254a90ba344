//! Bounded per-shard submission queue.
//!
//! Producers offer traces from any thread; the shard's worker is the only
//! consumer. A full queue never blocks under the default discard policy: the
//! trace is dropped and counted.

use crate::core::RejectionPolicy;
use crate::metrics::RawTrace;
use crossbeam_channel::{bounded, Receiver, SendTimeoutError, Sender, TrySendError};
use std::sync::atomic::{AtomicU64, Ordering};

/// Bounded FIFO of raw traces for one shard
pub struct SubmissionQueue {
    sender: Sender<RawTrace>,
    receiver: Receiver<RawTrace>,
    capacity: usize,
    policy: RejectionPolicy,
    offered_total: AtomicU64,
    dropped_total: AtomicU64,
    // Interval counters are the totals minus these marks
    offered_mark: AtomicU64,
    dropped_mark: AtomicU64,
    closed_drops: AtomicU64,
}

impl SubmissionQueue {
    pub fn new(capacity: usize, policy: RejectionPolicy) -> Self {
        let (sender, receiver) = bounded(capacity);
        Self {
            sender,
            receiver,
            capacity,
            policy,
            offered_total: AtomicU64::new(0),
            dropped_total: AtomicU64::new(0),
            offered_mark: AtomicU64::new(0),
            dropped_mark: AtomicU64::new(0),
            closed_drops: AtomicU64::new(0),
        }
    }

    /// Enqueue a trace. Returns false if it was rejected and counted as dropped.
    #[inline]
    pub fn offer(&self, trace: RawTrace) -> bool {
        self.offered_total.fetch_add(1, Ordering::Relaxed);

        let accepted = match self.policy {
            RejectionPolicy::Discard => match self.sender.try_send(trace) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => false,
            },
            RejectionPolicy::Block { timeout } => match self.sender.send_timeout(trace, timeout) {
                Ok(()) => true,
                Err(SendTimeoutError::Timeout(_)) | Err(SendTimeoutError::Disconnected(_)) => {
                    false
                },
            },
        };

        if !accepted {
            self.dropped_total.fetch_add(1, Ordering::Relaxed);
        }
        accepted
    }

    /// Consumer half, handed to the shard worker
    pub fn receiver(&self) -> Receiver<RawTrace> {
        self.receiver.clone()
    }

    /// Traces currently waiting (approximate under concurrency)
    #[inline]
    pub fn depth(&self) -> usize {
        self.receiver.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> RejectionPolicy {
        self.policy
    }

    /// Traces offered since the current interval opened, including traces
    /// carried over still queued from the previous one
    pub fn offered_interval(&self) -> u64 {
        self.offered_total
            .load(Ordering::Relaxed)
            .saturating_sub(self.offered_mark.load(Ordering::Relaxed))
    }

    /// Traces dropped since the current interval opened
    pub fn dropped_interval(&self) -> u64 {
        self.dropped_total
            .load(Ordering::Relaxed)
            .saturating_sub(self.dropped_mark.load(Ordering::Relaxed))
    }

    pub fn offered_total(&self) -> u64 {
        self.offered_total.load(Ordering::Relaxed)
    }

    /// Traces dropped since creation or the last counter reset
    pub fn dropped_total(&self) -> u64 {
        self.dropped_total.load(Ordering::Relaxed)
    }

    /// Close the interval's counters at the consumer's cycle boundary.
    ///
    /// `applied_total` is the consumer's count of traces taken off this queue
    /// since the last reset. Accepted traces not yet applied are carried into
    /// the next interval's offered count, so that once the queue drains
    /// `offered - dropped == applied` holds for every interval. Returns the
    /// drops of the closed interval.
    pub fn roll_interval(&self, applied_total: u64) -> u64 {
        let dropped = self.dropped_total.load(Ordering::Acquire);
        let closed = dropped.saturating_sub(self.dropped_mark.swap(dropped, Ordering::AcqRel));
        self.offered_mark
            .store(dropped.saturating_add(applied_total), Ordering::Release);
        self.closed_drops.fetch_add(closed, Ordering::AcqRel);
        closed
    }

    /// Drops of intervals closed since the last call
    pub fn take_closed_drops(&self) -> u64 {
        self.closed_drops.swap(0, Ordering::AcqRel)
    }

    pub fn reset_counters(&self) {
        self.offered_total.store(0, Ordering::Relaxed);
        self.dropped_total.store(0, Ordering::Relaxed);
        self.offered_mark.store(0, Ordering::Relaxed);
        self.dropped_mark.store(0, Ordering::Relaxed);
        self.closed_drops.store(0, Ordering::Relaxed);
    }
}
