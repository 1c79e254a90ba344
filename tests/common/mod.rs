//! Common test utilities and fixtures.

#![allow(dead_code)]

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tally_lib::accumulator::{
    Accumulator, FlushListener, MemorySink, SnapshotListener, SnapshotSink, Ticker,
};
use tally_lib::core::ConfigBuilder;
use tally_lib::metrics::{AggregationKind, ClosedSnapshot, MetricId, RawTrace};

/// Build a manually flushed accumulator with a memory sink.
pub fn manual_accumulator(shards: usize, queue_size: usize) -> (Accumulator, Arc<MemorySink>) {
    let config = ConfigBuilder::new()
        .shard_count(shards)
        .queue_size(queue_size)
        .flush_period(Duration::ZERO)
        .flush_timeout(Duration::from_secs(5))
        .build()
        .unwrap();
    let sink = Arc::new(MemorySink::new());
    let acc = Accumulator::new(config, Arc::clone(&sink) as Arc<dyn SnapshotSink>).unwrap();
    (acc, sink)
}

/// Build an accumulator with an arbitrary sink and ticker.
pub fn accumulator_with(
    builder: ConfigBuilder,
    sink: Arc<dyn SnapshotSink>,
    ticker: Box<dyn Ticker>,
) -> Accumulator {
    Accumulator::with_ticker(builder.build().unwrap(), sink, ticker).unwrap()
}

/// Resolve `host/agent/.../name` against the accumulator's registry.
pub fn metric(acc: &Accumulator, fqn: &str, kind: AggregationKind) -> Arc<MetricId> {
    acc.registry().resolve_fqn(fqn, kind).unwrap()
}

/// Build a trace with the given value.
pub fn trace<V: Into<tally_lib::metrics::TraceValue>>(id: &Arc<MetricId>, value: V) -> RawTrace {
    RawTrace::builder(Arc::clone(id))
        .value(value)
        .build()
        .unwrap()
}

/// Find `count` FQNs with the given prefix that land on distinct shards.
pub fn fqns_on_distinct_shards(
    acc: &Accumulator,
    prefix: &str,
    kind: AggregationKind,
    count: usize,
) -> Vec<Arc<MetricId>> {
    let mut picked: Vec<Arc<MetricId>> = Vec::new();
    for i in 0..1000 {
        let id = metric(acc, &format!("{}/m{}", prefix, i), kind);
        if picked.iter().all(|p| p.shard() != id.shard()) {
            picked.push(id);
            if picked.len() == count {
                return picked;
            }
        }
    }
    panic!("Could not find {} FQNs on distinct shards", count);
}

/// Poll until `f` holds or five seconds pass.
pub fn wait_until(mut f: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if f() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    f()
}

/// Flush listener that records every event in order.
#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<String>>,
}

impl RecordingListener {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }
}

impl FlushListener for RecordingListener {
    fn on_flush_start(&self, serial: u64) -> anyhow::Result<()> {
        self.events.lock().push(format!("start:{}", serial));
        Ok(())
    }

    fn on_flush_end(&self, serial: u64) -> anyhow::Result<()> {
        self.events.lock().push(format!("end:{}", serial));
        Ok(())
    }

    fn on_submission_drops(&self, serial: u64, drops: u64) -> anyhow::Result<()> {
        self.events.lock().push(format!("drops:{}:{}", serial, drops));
        Ok(())
    }

    fn on_start(&self) -> anyhow::Result<()> {
        self.events.lock().push("started".to_string());
        Ok(())
    }

    fn on_stop(&self) -> anyhow::Result<()> {
        self.events.lock().push("stopped".to_string());
        Ok(())
    }
}

/// Snapshot listener that keeps what it receives.
#[derive(Default)]
pub struct CollectingSubscriber {
    received: Mutex<Vec<(u64, ClosedSnapshot)>>,
}

impl CollectingSubscriber {
    pub fn received(&self) -> Vec<(u64, ClosedSnapshot)> {
        self.received.lock().clone()
    }
}

impl SnapshotListener for CollectingSubscriber {
    fn on_snapshot(&self, serial: u64, snapshot: &ClosedSnapshot) -> anyhow::Result<()> {
        self.received.lock().push((serial, snapshot.clone()));
        Ok(())
    }
}

/// Sink that stalls a worker inside `accept` until opened, so its shard
/// queue stops draining.
pub struct GateSink {
    inner: MemorySink,
    open: Mutex<bool>,
    opened: Condvar,
    blocked: Mutex<usize>,
}

impl GateSink {
    pub fn closed() -> Self {
        Self {
            inner: MemorySink::new(),
            open: Mutex::new(false),
            opened: Condvar::new(),
            blocked: Mutex::new(0),
        }
    }

    pub fn open(&self) {
        *self.open.lock() = true;
        self.opened.notify_all();
    }

    pub fn close(&self) {
        *self.open.lock() = false;
    }

    /// Workers currently held inside `accept`
    pub fn blocked(&self) -> usize {
        *self.blocked.lock()
    }

    pub fn memory(&self) -> &MemorySink {
        &self.inner
    }
}

impl SnapshotSink for GateSink {
    fn accept(
        &self,
        serial: u64,
        shard: usize,
        snapshots: Vec<ClosedSnapshot>,
    ) -> anyhow::Result<()> {
        *self.blocked.lock() += 1;
        {
            let mut open = self.open.lock();
            while !*open {
                self.opened.wait(&mut open);
            }
        }
        *self.blocked.lock() -= 1;
        self.inner.accept(serial, shard, snapshots)
    }
}

/// Assert min/max/avg of a snapshot.
#[macro_export]
macro_rules! assert_summary {
    ($snapshot:expr, count: $count:expr, min: $min:expr, max: $max:expr, avg: $avg:expr) => {
        assert_eq!($snapshot.observation_count(), $count, "Incorrect observation count");
        assert_eq!($snapshot.min(), Some($min as f64), "Incorrect min");
        assert_eq!($snapshot.max(), Some($max as f64), "Incorrect max");
        assert_eq!($snapshot.avg(), Some($avg as f64), "Incorrect avg");
    };
}
