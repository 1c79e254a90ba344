//! Flush observers and per-metric subscriptions.
//!
//! Listener callbacks run on the flush trigger's thread (flush events) or on
//! a shard worker (subscribed snapshots). A failing or panicking listener is
//! logged and counted; it never aborts the cycle or the other listeners.

use crate::accumulator::stats::Counters;
use crate::metrics::ClosedSnapshot;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::warn;

/// Observer of flush cycles and accumulator lifecycle
pub trait FlushListener: Send + Sync {
    fn on_flush_start(&self, serial: u64) -> anyhow::Result<()>;

    fn on_flush_end(&self, serial: u64) -> anyhow::Result<()>;

    /// Fired at flush end when traces were dropped during the interval
    fn on_submission_drops(&self, _serial: u64, _drops: u64) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_start(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_stop(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Receives the closed snapshot of a subscribed metric
pub trait SnapshotListener: Send + Sync {
    fn on_snapshot(&self, serial: u64, snapshot: &ClosedSnapshot) -> anyhow::Result<()>;
}

/// Run a listener callback, turning errors and panics into a logged failure
pub(crate) fn guarded<F>(what: &'static str, counters: &Counters, f: F)
where
    F: FnOnce() -> anyhow::Result<()>,
{
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => {},
        Ok(Err(e)) => {
            counters.record_listener_failure();
            warn!(callback = what, error = %e, "Listener failed");
        },
        Err(_) => {
            counters.record_listener_failure();
            warn!(callback = what, "Listener panicked");
        },
    }
}

#[derive(Default)]
pub struct ListenerRegistry {
    flush: RwLock<Vec<Arc<dyn FlushListener>>>,
    subscriptions: DashMap<Arc<str>, Vec<Arc<dyn SnapshotListener>>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if this exact listener is already registered
    pub fn register(&self, listener: Arc<dyn FlushListener>) -> bool {
        let mut flush = self.flush.write();
        if flush.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            return false;
        }
        flush.push(listener);
        true
    }

    pub fn unregister(&self, listener: &Arc<dyn FlushListener>) -> bool {
        let mut flush = self.flush.write();
        let before = flush.len();
        flush.retain(|l| !Arc::ptr_eq(l, listener));
        flush.len() != before
    }

    pub fn flush_listener_count(&self) -> usize {
        self.flush.read().len()
    }

    /// Copy of the listener set so callbacks run without the lock held
    fn flush_listeners(&self) -> Vec<Arc<dyn FlushListener>> {
        self.flush.read().clone()
    }

    pub(crate) fn notify_flush_start(&self, serial: u64, counters: &Counters) {
        for listener in self.flush_listeners() {
            guarded("on_flush_start", counters, || listener.on_flush_start(serial));
        }
    }

    pub(crate) fn notify_flush_end(&self, serial: u64, counters: &Counters) {
        for listener in self.flush_listeners() {
            guarded("on_flush_end", counters, || listener.on_flush_end(serial));
        }
    }

    pub(crate) fn notify_drops(&self, serial: u64, drops: u64, counters: &Counters) {
        for listener in self.flush_listeners() {
            guarded("on_submission_drops", counters, || {
                listener.on_submission_drops(serial, drops)
            });
        }
    }

    pub(crate) fn notify_start(&self, counters: &Counters) {
        for listener in self.flush_listeners() {
            guarded("on_start", counters, || listener.on_start());
        }
    }

    pub(crate) fn notify_stop(&self, counters: &Counters) {
        for listener in self.flush_listeners() {
            guarded("on_stop", counters, || listener.on_stop());
        }
    }

    /// Subscribe to one metric's closed snapshots by FQN
    pub fn subscribe(&self, fqn: &str, listener: Arc<dyn SnapshotListener>) {
        let mut entry = self.subscriptions.entry(Arc::from(fqn)).or_default();
        if !entry.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            entry.push(listener);
        }
    }

    pub fn unsubscribe(&self, fqn: &str, listener: &Arc<dyn SnapshotListener>) -> bool {
        let mut removed = false;
        if let Some(mut entry) = self.subscriptions.get_mut(fqn) {
            let before = entry.len();
            entry.retain(|l| !Arc::ptr_eq(l, listener));
            removed = entry.len() != before;
        }
        self.subscriptions.remove_if(fqn, |_, listeners| listeners.is_empty());
        removed
    }

    /// Number of subscribed metrics
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Hand each subscribed snapshot to its listeners
    pub(crate) fn deliver(&self, serial: u64, snapshots: &[ClosedSnapshot], counters: &Counters) {
        if self.subscriptions.is_empty() {
            return;
        }
        for snapshot in snapshots {
            let listeners = match self.subscriptions.get(snapshot.fqn()) {
                Some(entry) => entry.value().clone(),
                None => continue,
            };
            for listener in listeners {
                guarded("on_snapshot", counters, || {
                    listener.on_snapshot(serial, snapshot)
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{AggregationKind, IntervalAggregate, MetricRegistry};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl FlushListener for Recorder {
        fn on_flush_start(&self, serial: u64) -> anyhow::Result<()> {
            self.events.lock().push(format!("start:{}", serial));
            Ok(())
        }

        fn on_flush_end(&self, serial: u64) -> anyhow::Result<()> {
            self.events.lock().push(format!("end:{}", serial));
            Ok(())
        }
    }

    impl SnapshotListener for Recorder {
        fn on_snapshot(&self, serial: u64, snapshot: &ClosedSnapshot) -> anyhow::Result<()> {
            self.events
                .lock()
                .push(format!("{}:{}", serial, snapshot.fqn()));
            Ok(())
        }
    }

    struct Failing;

    impl FlushListener for Failing {
        fn on_flush_start(&self, _serial: u64) -> anyhow::Result<()> {
            anyhow::bail!("collector offline")
        }

        fn on_flush_end(&self, _serial: u64) -> anyhow::Result<()> {
            panic!("listener bug")
        }
    }

    #[test]
    fn test_register_is_idempotent() {
        let registry = ListenerRegistry::new();
        let listener: Arc<dyn FlushListener> = Arc::new(Recorder::default());

        assert!(registry.register(Arc::clone(&listener)));
        assert!(!registry.register(Arc::clone(&listener)));
        assert_eq!(registry.flush_listener_count(), 1);

        assert!(registry.unregister(&listener));
        assert!(!registry.unregister(&listener));
        assert_eq!(registry.flush_listener_count(), 0);
    }

    #[test]
    fn test_failing_listener_does_not_stop_others() {
        let registry = ListenerRegistry::new();
        let counters = Counters::default();
        let recorder = Arc::new(Recorder::default());

        registry.register(Arc::new(Failing));
        registry.register(Arc::clone(&recorder) as Arc<dyn FlushListener>);

        registry.notify_flush_start(1, &counters);
        registry.notify_flush_end(1, &counters);

        assert_eq!(*recorder.events.lock(), vec!["start:1", "end:1"]);
        assert_eq!(counters.listener_failures(), 2);
    }

    #[test]
    fn test_subscriptions_by_fqn() {
        let registry = ListenerRegistry::new();
        let counters = Counters::default();
        let recorder = Arc::new(Recorder::default());
        let as_listener: Arc<dyn SnapshotListener> = Arc::clone(&recorder) as _;
        registry.subscribe("h/a/cpu", Arc::clone(&as_listener));

        let metrics = MetricRegistry::new(1);
        let snapshots: Vec<ClosedSnapshot> = ["h/a/cpu", "h/a/mem"]
            .iter()
            .map(|fqn| {
                let id = metrics.resolve_fqn(fqn, AggregationKind::MinMaxAvg).unwrap();
                IntervalAggregate::new(id, 0).snapshot(10)
            })
            .collect();

        registry.deliver(3, &snapshots, &counters);
        assert_eq!(*recorder.events.lock(), vec!["3:h/a/cpu"]);

        assert!(registry.unsubscribe("h/a/cpu", &as_listener));
        assert_eq!(registry.subscription_count(), 0);
    }
}
