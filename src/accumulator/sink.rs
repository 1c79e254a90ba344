//! Downstream consumers of closed snapshots.

use crate::metrics::{ClosedSnapshot, SnapshotValue};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::info;

/// Receives every shard's snapshots once per flush cycle.
///
/// Called from the shard's worker thread while the cycle is in flight, so a
/// slow sink delays the cycle.
pub trait SnapshotSink: Send + Sync {
    fn accept(&self, serial: u64, shard: usize, snapshots: Vec<ClosedSnapshot>)
        -> anyhow::Result<()>;
}

/// One shard's output for one cycle
#[derive(Debug, Clone, PartialEq)]
pub struct SinkBatch {
    pub serial: u64,
    pub shard: usize,
    pub snapshots: Vec<ClosedSnapshot>,
}

/// Keeps every batch in memory
#[derive(Default)]
pub struct MemorySink {
    batches: Mutex<Vec<SinkBatch>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batches(&self) -> Vec<SinkBatch> {
        self.batches.lock().clone()
    }

    pub fn take(&self) -> Vec<SinkBatch> {
        std::mem::take(&mut *self.batches.lock())
    }

    /// All snapshots emitted by a flush cycle, across shards
    pub fn snapshots_for(&self, serial: u64) -> Vec<ClosedSnapshot> {
        self.batches
            .lock()
            .iter()
            .filter(|b| b.serial == serial)
            .flat_map(|b| b.snapshots.iter().cloned())
            .collect()
    }

    /// Latest snapshot emitted for a metric
    pub fn latest(&self, fqn: &str) -> Option<ClosedSnapshot> {
        self.batches
            .lock()
            .iter()
            .rev()
            .flat_map(|b| b.snapshots.iter())
            .find(|s| s.fqn() == fqn)
            .cloned()
    }
}

impl SnapshotSink for MemorySink {
    fn accept(
        &self,
        serial: u64,
        shard: usize,
        snapshots: Vec<ClosedSnapshot>,
    ) -> anyhow::Result<()> {
        self.batches.lock().push(SinkBatch {
            serial,
            shard,
            snapshots,
        });
        Ok(())
    }
}

/// Forwards batches to a channel
pub struct ChannelSink {
    tx: Sender<SinkBatch>,
}

impl ChannelSink {
    pub fn new() -> (Self, Receiver<SinkBatch>) {
        let (tx, rx) = unbounded();
        (Self { tx }, rx)
    }
}

impl SnapshotSink for ChannelSink {
    fn accept(
        &self,
        serial: u64,
        shard: usize,
        snapshots: Vec<ClosedSnapshot>,
    ) -> anyhow::Result<()> {
        self.tx.send(SinkBatch {
            serial,
            shard,
            snapshots,
        })?;
        Ok(())
    }
}

/// Logs each snapshot at info level
#[derive(Debug, Default)]
pub struct LoggingSink {
    include_empty: bool,
}

impl LoggingSink {
    pub fn new(include_empty: bool) -> Self {
        Self { include_empty }
    }
}

impl SnapshotSink for LoggingSink {
    fn accept(
        &self,
        serial: u64,
        shard: usize,
        snapshots: Vec<ClosedSnapshot>,
    ) -> anyhow::Result<()> {
        for snapshot in snapshots
            .iter()
            .filter(|s| self.include_empty || !s.is_empty())
        {
            let value = match snapshot.value() {
                SnapshotValue::Empty => "-".to_string(),
                SnapshotValue::Last(v) => v.to_string(),
                SnapshotValue::Messages(m) => format!("{} distinct", m.len()),
                SnapshotValue::Count(n) => n.to_string(),
                SnapshotValue::Summary(s) => {
                    format!("min={} max={} avg={:.2}", s.min, s.max, s.avg)
                },
                SnapshotValue::TimeRange { first, last, .. } => format!("{}..{}", first, last),
            };
            info!(
                serial,
                shard,
                fqn = snapshot.fqn(),
                kind = %snapshot.kind(),
                count = snapshot.observation_count(),
                urgent = snapshot.is_urgent(),
                %value,
                "Snapshot"
            );
        }
        Ok(())
    }
}
