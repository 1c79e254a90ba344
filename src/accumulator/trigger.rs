//! Flush triggering: the cycle runner and the periodic tick sources.

use crate::accumulator::coordinator::{CycleAction, CycleOutcome, FlushCoordinator};
use crate::accumulator::listener::ListenerRegistry;
use crate::accumulator::queue::SubmissionQueue;
use crate::accumulator::stats::Counters;
use crate::core::{Result, TallyError};
use crate::metrics::now_millis;
use crossbeam_channel::{bounded, select, tick, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info};

/// Callback fired on every tick
pub type TickFn = Arc<dyn Fn() + Send + Sync>;

/// Periodic callback source driving flush cycles
pub trait Ticker: Send {
    fn start(&mut self, period: Duration, on_tick: TickFn) -> Result<()>;

    /// Stop ticking. Returns once no further tick will fire.
    fn stop(&mut self);
}

/// Ticks on a dedicated thread
#[derive(Default)]
pub struct ThreadTicker {
    running: Option<(Sender<()>, JoinHandle<()>)>,
}

impl ThreadTicker {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Ticker for ThreadTicker {
    fn start(&mut self, period: Duration, on_tick: TickFn) -> Result<()> {
        if self.running.is_some() {
            return Err(TallyError::config("ticker already running"));
        }
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);
        let ticks = tick(period);
        let handle = thread::Builder::new()
            .name("tally-flush-ticker".into())
            .spawn(move || loop {
                select! {
                    recv(ticks) -> _ => on_tick(),
                    recv(shutdown_rx) -> _ => break,
                }
            })
            .map_err(TallyError::WorkerSpawn)?;
        self.running = Some((shutdown_tx, handle));
        Ok(())
    }

    fn stop(&mut self) {
        if let Some((shutdown, handle)) = self.running.take() {
            drop(shutdown);
            if handle.join().is_err() {
                error!("Flush ticker thread panicked");
            }
        }
    }
}

/// Ticks only when told to; cloneable handle for tests and embedders
#[derive(Clone, Default)]
pub struct ManualTicker {
    on_tick: Arc<Mutex<Option<TickFn>>>,
}

impl ManualTicker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire one tick. Returns false when the ticker is not started.
    pub fn tick(&self) -> bool {
        let callback = self.on_tick.lock().clone();
        match callback {
            Some(on_tick) => {
                on_tick();
                true
            },
            None => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.on_tick.lock().is_some()
    }
}

impl Ticker for ManualTicker {
    fn start(&mut self, _period: Duration, on_tick: TickFn) -> Result<()> {
        *self.on_tick.lock() = Some(on_tick);
        Ok(())
    }

    fn stop(&mut self) {
        self.on_tick.lock().take();
    }
}

/// Runs flush cycles: serial numbering, listener notification and the
/// coordinator switch.
pub struct FlushTrigger {
    serial: AtomicU64,
    coordinator: Arc<FlushCoordinator>,
    queues: Arc<[SubmissionQueue]>,
    listeners: Arc<ListenerRegistry>,
    counters: Arc<Counters>,
}

impl FlushTrigger {
    pub fn new(
        coordinator: Arc<FlushCoordinator>,
        queues: Arc<[SubmissionQueue]>,
        listeners: Arc<ListenerRegistry>,
        counters: Arc<Counters>,
    ) -> Self {
        Self {
            serial: AtomicU64::new(0),
            coordinator,
            queues,
            listeners,
            counters,
        }
    }

    /// Serial of the most recently started cycle
    pub fn last_serial(&self) -> u64 {
        self.serial.load(Ordering::Acquire)
    }

    /// Run one flush cycle closing every shard's interval at "now"
    pub fn fire(&self) -> Result<CycleOutcome> {
        let slot = self.coordinator.try_slot()?;
        let serial = self.serial.fetch_add(1, Ordering::AcqRel) + 1;

        self.listeners.notify_flush_start(serial, &self.counters);
        let end = now_millis();
        let result = slot.switch_channel(serial, end, CycleAction::Flush);
        drop(slot);

        self.counters.record_flush_cycle();
        if result.is_err() {
            self.counters.record_flush_timeout();
        }

        let drops: u64 = self.queues.iter().map(SubmissionQueue::take_closed_drops).sum();
        if drops > 0 {
            self.listeners.notify_drops(serial, drops, &self.counters);
        }
        self.listeners.notify_flush_end(serial, &self.counters);

        if let Ok(outcome) = &result {
            info!(
                serial,
                snapshots = outcome.snapshots,
                drops,
                elapsed = ?outcome.elapsed,
                "Flush cycle"
            );
        }
        result
    }

    /// Run a cycle in which every worker drops its aggregates
    pub fn clear(&self) -> Result<CycleOutcome> {
        let slot = self.coordinator.try_slot()?;
        let serial = self.serial.fetch_add(1, Ordering::AcqRel) + 1;
        let result = slot.switch_channel(serial, now_millis(), CycleAction::Clear);
        if result.is_err() {
            self.counters.record_flush_timeout();
        } else {
            info!(serial, "Aggregates cleared");
        }
        result
    }

    /// Tick handler: a cycle still in flight makes this tick a no-op
    pub fn on_tick(&self) {
        match self.fire() {
            Ok(_) => {},
            Err(TallyError::FlushInProgress) => {
                debug!("Tick skipped, previous flush still in flight");
            },
            // Already reported by the coordinator
            Err(_) => {},
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_thread_ticker_fires_and_stops() {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let mut ticker = ThreadTicker::new();
        ticker
            .start(
                Duration::from_millis(5),
                Arc::new(move || {
                    seen.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while count.load(Ordering::SeqCst) < 2 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        ticker.stop();
        let after_stop = count.load(Ordering::SeqCst);
        assert!(after_stop >= 2);

        thread::sleep(Duration::from_millis(30));
        assert_eq!(count.load(Ordering::SeqCst), after_stop);
    }

    #[test]
    fn test_thread_ticker_rejects_double_start() {
        let mut ticker = ThreadTicker::new();
        ticker
            .start(Duration::from_secs(60), Arc::new(|| {}))
            .unwrap();
        assert!(ticker
            .start(Duration::from_secs(60), Arc::new(|| {}))
            .is_err());
        ticker.stop();
    }

    #[test]
    fn test_manual_ticker() {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let handle = ManualTicker::new();
        let mut ticker = handle.clone();

        assert!(!handle.tick());
        ticker
            .start(
                Duration::from_secs(1),
                Arc::new(move || {
                    seen.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();
        assert!(handle.tick());
        assert!(handle.tick());
        ticker.stop();
        assert!(!handle.tick());
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_trigger_without_workers_times_out_but_notifies() {
        let coordinator = Arc::new(FlushCoordinator::new(1, Duration::from_millis(10)));
        let queues: Arc<[SubmissionQueue]> =
            vec![SubmissionQueue::new(4, Default::default())].into();
        let trigger = FlushTrigger::new(
            coordinator,
            queues,
            Arc::new(ListenerRegistry::new()),
            Arc::new(Counters::default()),
        );

        assert!(matches!(
            trigger.fire(),
            Err(TallyError::FlushTimeout { serial: 1, .. })
        ));
        assert_eq!(trigger.last_serial(), 1);
        assert_eq!(trigger.counters.flush_timeouts(), 1);
    }
}
