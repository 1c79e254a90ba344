//! Metric value model.
//!
//! Identities are interned once and carry their shard index, raw traces are
//! immutable observations, and interval aggregates fold traces into one of a
//! closed set of aggregation kinds until a flush closes the interval.

pub mod aggregator;
pub mod identity;
pub mod types;

pub use aggregator::{
    AggregationState, ClosedSnapshot, IntervalAggregate, NumericStats, SnapshotValue, Summary,
};
pub use identity::{shard_for, MetricId, MetricRegistry, DELIM};
pub use types::{now_millis, AggregationKind, DeltaPolicy, RawTrace, RawTraceBuilder, TraceValue};
