//! Interval aggregation engine
//!
//! An [`IntervalAggregate`] lives in exactly one shard map and is only ever
//! touched by that shard's worker thread, so no field here is atomic.
//! `snapshot_and_reset` is an explicit pair: an immutable [`ClosedSnapshot`]
//! is cloned from the live state, then the live state is reset to the
//! identity element of its kind.

use crate::core::{Result, TallyError};
use crate::metrics::identity::MetricId;
use crate::metrics::types::{AggregationKind, DeltaPolicy, RawTrace, TraceValue};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Running min / max / sum over the interval's numeric values
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NumericStats {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
}

impl Default for NumericStats {
    fn default() -> Self {
        Self {
            count: 0,
            sum: 0.0,
            min: f64::MAX,
            max: f64::MIN,
        }
    }
}

impl NumericStats {
    #[inline]
    pub fn record(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn summary(&self) -> Option<Summary> {
        if self.count == 0 {
            return None;
        }
        Some(Summary {
            min: self.min,
            max: self.max,
            avg: self.sum / self.count as f64,
            sum: self.sum,
        })
    }
}

/// Min / max / average of a closed interval
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Summary {
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub sum: f64,
}

/// Kind-specific live aggregation state
#[derive(Debug, Clone, PartialEq)]
pub enum AggregationState {
    LastValue {
        last: Option<TraceValue>,
    },
    Messages {
        messages: BTreeMap<Arc<str>, u64>,
    },
    IntervalCount {
        total: i64,
    },
    MinMaxAvg {
        stats: NumericStats,
        /// Figures repeated by sticky kinds when the interval is empty
        carried: Option<Summary>,
    },
    Delta {
        stats: NumericStats,
        carried: Option<Summary>,
        /// Last raw value seen; survives resets
        baseline: Option<i64>,
    },
    Timestamp {
        first: Option<i64>,
        last: Option<i64>,
        stats: NumericStats,
    },
}

impl AggregationState {
    /// Identity element for the given kind
    pub fn new(kind: AggregationKind) -> Self {
        match kind {
            AggregationKind::LastValue => AggregationState::LastValue { last: None },
            AggregationKind::Messages => AggregationState::Messages {
                messages: BTreeMap::new(),
            },
            AggregationKind::IntervalCount => AggregationState::IntervalCount { total: 0 },
            AggregationKind::MinMaxAvg | AggregationKind::StickyMinMaxAvg => {
                AggregationState::MinMaxAvg {
                    stats: NumericStats::default(),
                    carried: None,
                }
            },
            AggregationKind::Delta | AggregationKind::StickyDelta => AggregationState::Delta {
                stats: NumericStats::default(),
                carried: None,
                baseline: None,
            },
            AggregationKind::Timestamp => AggregationState::Timestamp {
                first: None,
                last: None,
                stats: NumericStats::default(),
            },
        }
    }

    /// Fold one value in. The caller has already checked `kind.accepts(value)`.
    #[allow(clippy::cast_precision_loss)]
    fn fold(&mut self, value: &TraceValue, policy: DeltaPolicy) {
        match (self, value) {
            (AggregationState::LastValue { last }, v) => {
                *last = Some(v.clone());
            },
            (AggregationState::Messages { messages }, TraceValue::Text(text)) => {
                *messages.entry(Arc::clone(text)).or_insert(0) += 1;
            },
            (AggregationState::IntervalCount { total }, TraceValue::Int(n)) => {
                *total = total.saturating_add(*n);
            },
            (AggregationState::MinMaxAvg { stats, .. }, v) => {
                if let Some(n) = v.as_f64() {
                    stats.record(n);
                }
            },
            (
                AggregationState::Delta {
                    stats, baseline, ..
                },
                TraceValue::Int(n),
            ) => {
                // Widened so any pair of i64 readings has a representable difference
                let previous = baseline.replace(*n).map(i128::from);
                let n = i128::from(*n);
                let delta = match previous {
                    None => None,
                    Some(base) if n >= base => Some(n - base),
                    Some(base) => match policy {
                        DeltaPolicy::Rebase => None,
                        DeltaPolicy::Relative => Some(n - base),
                        DeltaPolicy::Absolute => Some((n - base).abs()),
                    },
                };
                if let Some(d) = delta {
                    stats.record(d as f64);
                }
            },
            (AggregationState::Timestamp { first, last, stats }, TraceValue::Int(n)) => {
                first.get_or_insert(*n);
                *last = Some(*n);
                stats.record(*n as f64);
            },
            _ => {},
        }
    }

    /// Immutable view of the current state
    #[allow(clippy::cast_possible_truncation)]
    pub fn value(&self) -> SnapshotValue {
        match self {
            AggregationState::LastValue { last } => match last {
                Some(v) => SnapshotValue::Last(v.clone()),
                None => SnapshotValue::Empty,
            },
            AggregationState::Messages { messages } => SnapshotValue::Messages(
                messages
                    .iter()
                    .map(|(m, n)| (Arc::clone(m), *n))
                    .collect(),
            ),
            AggregationState::IntervalCount { total } => SnapshotValue::Count(*total),
            AggregationState::MinMaxAvg { stats, carried }
            | AggregationState::Delta { stats, carried, .. } => stats
                .summary()
                .or(*carried)
                .map_or(SnapshotValue::Empty, SnapshotValue::Summary),
            AggregationState::Timestamp { first, last, stats } => match (first, last) {
                (Some(first), Some(last)) => {
                    let summary = stats.summary().unwrap_or(Summary {
                        min: 0.0,
                        max: 0.0,
                        avg: 0.0,
                        sum: 0.0,
                    });
                    SnapshotValue::TimeRange {
                        first: *first,
                        last: *last,
                        min: summary.min as i64,
                        max: summary.max as i64,
                        avg: summary.avg as i64,
                    }
                },
                _ => SnapshotValue::Empty,
            },
        }
    }

    /// Reset to the identity element, keeping what the kind carries over
    pub fn reset(&mut self, sticky: bool) {
        match self {
            AggregationState::LastValue { last } => *last = None,
            AggregationState::Messages { messages } => messages.clear(),
            AggregationState::IntervalCount { total } => *total = 0,
            AggregationState::MinMaxAvg { stats, carried }
            | AggregationState::Delta { stats, carried, .. } => {
                *carried = if sticky {
                    stats.summary().or(*carried).map(|s| Summary { sum: 0.0, ..s })
                } else {
                    None
                };
                *stats = NumericStats::default();
            },
            AggregationState::Timestamp { first, last, stats } => {
                *first = None;
                *last = None;
                *stats = NumericStats::default();
            },
        }
    }
}

/// Closed value of one metric for one interval
#[derive(Debug, Clone, PartialEq)]
pub enum SnapshotValue {
    /// No observations (and nothing carried over)
    Empty,
    Last(TraceValue),
    /// Distinct messages in lexical order with occurrence counts
    Messages(Vec<(Arc<str>, u64)>),
    Count(i64),
    Summary(Summary),
    TimeRange {
        first: i64,
        last: i64,
        min: i64,
        max: i64,
        avg: i64,
    },
}

/// Live, shard-resident accumulator for one metric
#[derive(Debug)]
pub struct IntervalAggregate {
    id: Arc<MetricId>,
    start: i64,
    state: AggregationState,
    observations: u64,
    urgent: bool,
    temporal: bool,
}

impl IntervalAggregate {
    /// Create an empty aggregate whose interval opens at `start`
    pub fn new(id: Arc<MetricId>, start: i64) -> Self {
        let state = AggregationState::new(id.kind());
        Self {
            id,
            start,
            state,
            observations: 0,
            urgent: false,
            temporal: false,
        }
    }

    pub fn id(&self) -> &Arc<MetricId> {
        &self.id
    }

    pub fn start(&self) -> i64 {
        self.start
    }

    /// Traces accepted this interval, baseline-only delta readings included
    pub fn observations(&self) -> u64 {
        self.observations
    }

    pub fn state(&self) -> &AggregationState {
        &self.state
    }

    /// Fold one trace into the aggregate.
    ///
    /// A value the metric's kind cannot accept leaves the aggregate untouched
    /// and returns [`TallyError::AggregationMismatch`].
    pub fn apply(&mut self, trace: &RawTrace, policy: DeltaPolicy) -> Result<()> {
        let kind = self.id.kind();
        let value = trace.value();
        if !kind.accepts(value) {
            return Err(TallyError::AggregationMismatch {
                fqn: self.id.fqn().to_string(),
                kind: kind.as_str(),
                value: value.type_name(),
            });
        }

        self.state.fold(value, policy);
        self.observations += 1;
        self.urgent |= trace.is_urgent();
        self.temporal = trace.is_temporal();
        Ok(())
    }

    /// Immutable copy of the current interval, closed at `end`
    pub fn snapshot(&self, end: i64) -> ClosedSnapshot {
        ClosedSnapshot {
            id: Arc::clone(&self.id),
            start: self.start,
            end,
            observations: self.observations,
            value: self.state.value(),
            urgent: self.urgent,
            temporal: self.temporal,
        }
    }

    /// Reset in place; the next interval opens at `next_start`
    pub fn reset(&mut self, next_start: i64) {
        self.state.reset(self.id.kind().is_sticky());
        self.start = next_start;
        self.observations = 0;
        self.urgent = false;
        self.temporal = false;
    }

    /// Snapshot the interval closed at `end`, then reset for the next one
    pub fn snapshot_and_reset(&mut self, end: i64) -> ClosedSnapshot {
        let closed = self.snapshot(end);
        self.reset(end);
        closed
    }
}

/// Immutable, point-in-time copy of an interval aggregate
#[derive(Debug, Clone, PartialEq)]
pub struct ClosedSnapshot {
    id: Arc<MetricId>,
    start: i64,
    end: i64,
    observations: u64,
    value: SnapshotValue,
    urgent: bool,
    temporal: bool,
}

impl ClosedSnapshot {
    pub fn id(&self) -> &Arc<MetricId> {
        &self.id
    }

    pub fn fqn(&self) -> &str {
        self.id.fqn()
    }

    pub fn kind(&self) -> AggregationKind {
        self.id.kind()
    }

    /// Interval start in UTC milliseconds
    pub fn start(&self) -> i64 {
        self.start
    }

    /// Interval end in UTC milliseconds, shared by every shard in the cycle
    pub fn end(&self) -> i64 {
        self.end
    }

    /// Number of traces applied during the interval.
    ///
    /// For delta kinds this includes readings that only set the baseline
    /// (the first one, and any rebased drop), so it can exceed the number
    /// of deltas behind the summary.
    pub fn observation_count(&self) -> u64 {
        self.observations
    }

    pub fn value(&self) -> &SnapshotValue {
        &self.value
    }

    pub fn is_urgent(&self) -> bool {
        self.urgent
    }

    pub fn is_temporal(&self) -> bool {
        self.temporal
    }

    /// True when no trace was applied during the interval
    pub fn is_empty(&self) -> bool {
        self.observations == 0
    }

    pub fn summary(&self) -> Option<&Summary> {
        match &self.value {
            SnapshotValue::Summary(s) => Some(s),
            _ => None,
        }
    }

    pub fn min(&self) -> Option<f64> {
        self.summary().map(|s| s.min)
    }

    pub fn max(&self) -> Option<f64> {
        self.summary().map(|s| s.max)
    }

    pub fn avg(&self) -> Option<f64> {
        self.summary().map(|s| s.avg)
    }

    /// Counter total for interval-count metrics
    pub fn total(&self) -> Option<i64> {
        match self.value {
            SnapshotValue::Count(n) => Some(n),
            _ => None,
        }
    }
}
