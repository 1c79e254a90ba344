//! Raw observation types flowing into the accumulator.
//!
//! A [`RawTrace`] is immutable once built. It carries an interned
//! [`MetricId`] whose aggregation kind decides how the shard worker folds
//! the value into the interval aggregate.

use crate::core::{Result, TallyError};
use crate::metrics::identity::MetricId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Current wall-clock time in UTC milliseconds
#[inline]
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Closed set of interval aggregation semantics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationKind {
    /// Last value observed in the interval
    LastValue,
    /// Distinct messages observed in the interval with occurrence counts
    Messages,
    /// Incident counter: sum of increments over the interval
    IntervalCount,
    /// Min / max / average of the interval's values
    MinMaxAvg,
    /// Like `MinMaxAvg`, but an empty interval repeats the previous figures
    StickyMinMaxAvg,
    /// Min / max / average of deltas against a rolling baseline
    Delta,
    /// Like `Delta`, but an empty interval repeats the previous figures
    StickyDelta,
    /// Range of timestamp values (first, last, min, max, average)
    Timestamp,
}

impl AggregationKind {
    /// Every aggregation kind, in declaration order
    pub const ALL: [AggregationKind; 8] = [
        AggregationKind::LastValue,
        AggregationKind::Messages,
        AggregationKind::IntervalCount,
        AggregationKind::MinMaxAvg,
        AggregationKind::StickyMinMaxAvg,
        AggregationKind::Delta,
        AggregationKind::StickyDelta,
        AggregationKind::Timestamp,
    ];

    /// Stable name used in logs and configuration
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregationKind::LastValue => "last_value",
            AggregationKind::Messages => "messages",
            AggregationKind::IntervalCount => "interval_count",
            AggregationKind::MinMaxAvg => "min_max_avg",
            AggregationKind::StickyMinMaxAvg => "sticky_min_max_avg",
            AggregationKind::Delta => "delta",
            AggregationKind::StickyDelta => "sticky_delta",
            AggregationKind::Timestamp => "timestamp",
        }
    }

    /// Human readable description
    pub fn description(&self) -> &'static str {
        match self {
            AggregationKind::LastValue => "Last value of the interval",
            AggregationKind::Messages => "All messages in the interval",
            AggregationKind::IntervalCount => "Interval incident count",
            AggregationKind::MinMaxAvg => "Interval averaged number",
            AggregationKind::StickyMinMaxAvg => "Sticky averaged number",
            AggregationKind::Delta => "Delta number",
            AggregationKind::StickyDelta => "Sticky delta number",
            AggregationKind::Timestamp => "Interval timestamp range",
        }
    }

    /// Sticky kinds keep their last figures through an empty interval
    pub fn is_sticky(&self) -> bool {
        matches!(
            self,
            AggregationKind::StickyMinMaxAvg | AggregationKind::StickyDelta
        )
    }

    /// Delta kinds aggregate differences against a baseline
    pub fn is_delta(&self) -> bool {
        matches!(self, AggregationKind::Delta | AggregationKind::StickyDelta)
    }

    /// Whether a value of this shape can be folded into this kind
    pub fn accepts(&self, value: &TraceValue) -> bool {
        match self {
            AggregationKind::LastValue => true,
            AggregationKind::Messages => matches!(value, TraceValue::Text(_)),
            AggregationKind::MinMaxAvg | AggregationKind::StickyMinMaxAvg => value.is_numeric(),
            AggregationKind::IntervalCount
            | AggregationKind::Delta
            | AggregationKind::StickyDelta
            | AggregationKind::Timestamp => matches!(value, TraceValue::Int(_)),
        }
    }
}

impl fmt::Display for AggregationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a delta metric treats a value lower than its baseline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeltaPolicy {
    /// Skip the observation and adopt it as the new baseline
    #[default]
    Rebase,
    /// Record the (negative) difference
    Relative,
    /// Record the absolute difference
    Absolute,
}

/// A single observed value
#[derive(Debug, Clone, PartialEq)]
pub enum TraceValue {
    /// Integer measurement, counter increment or epoch-millis timestamp
    Int(i64),
    /// Floating point measurement
    Float(f64),
    /// Text message
    Text(Arc<str>),
}

impl TraceValue {
    /// Returns true for integer and floating point values
    pub fn is_numeric(&self) -> bool {
        matches!(self, TraceValue::Int(_) | TraceValue::Float(_))
    }

    /// Numeric view of the value
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            TraceValue::Int(v) => Some(*v as f64),
            TraceValue::Float(v) => Some(*v),
            TraceValue::Text(_) => None,
        }
    }

    /// Shape name used in mismatch diagnostics
    pub fn type_name(&self) -> &'static str {
        match self {
            TraceValue::Int(_) => "int",
            TraceValue::Float(_) => "float",
            TraceValue::Text(_) => "text",
        }
    }
}

impl fmt::Display for TraceValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraceValue::Int(v) => write!(f, "{}", v),
            TraceValue::Float(v) => write!(f, "{}", v),
            TraceValue::Text(v) => f.write_str(v),
        }
    }
}

impl From<i64> for TraceValue {
    fn from(v: i64) -> Self {
        TraceValue::Int(v)
    }
}

impl From<i32> for TraceValue {
    fn from(v: i32) -> Self {
        TraceValue::Int(i64::from(v))
    }
}

impl From<f64> for TraceValue {
    fn from(v: f64) -> Self {
        TraceValue::Float(v)
    }
}

impl From<&str> for TraceValue {
    fn from(v: &str) -> Self {
        TraceValue::Text(Arc::from(v))
    }
}

impl From<String> for TraceValue {
    fn from(v: String) -> Self {
        TraceValue::Text(Arc::from(v))
    }
}

/// One immutable observation of a metric
#[derive(Debug, Clone)]
pub struct RawTrace {
    id: Arc<MetricId>,
    timestamp: i64,
    value: TraceValue,
    temporal: bool,
    urgent: bool,
}

impl RawTrace {
    /// Creates a new builder for the given metric
    pub fn builder(id: Arc<MetricId>) -> RawTraceBuilder {
        RawTraceBuilder {
            id,
            timestamp: None,
            value: None,
            temporal: false,
            urgent: false,
        }
    }

    /// The metric this trace belongs to
    pub fn id(&self) -> &Arc<MetricId> {
        &self.id
    }

    /// Fully qualified metric name
    pub fn fqn(&self) -> &str {
        self.id.fqn()
    }

    /// Shard the trace is routed to
    pub fn shard(&self) -> usize {
        self.id.shard()
    }

    /// Observation time in UTC milliseconds
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Observed value
    pub fn value(&self) -> &TraceValue {
        &self.value
    }

    /// Temporal flag carried from the producer
    pub fn is_temporal(&self) -> bool {
        self.temporal
    }

    /// Urgent flag carried from the producer
    pub fn is_urgent(&self) -> bool {
        self.urgent
    }
}

/// Builder for creating RawTrace instances
pub struct RawTraceBuilder {
    id: Arc<MetricId>,
    timestamp: Option<i64>,
    value: Option<TraceValue>,
    temporal: bool,
    urgent: bool,
}

impl RawTraceBuilder {
    pub fn value<V: Into<TraceValue>>(mut self, value: V) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn timestamp(mut self, millis: i64) -> Self {
        self.timestamp = Some(millis);
        self
    }

    pub fn temporal(mut self, temporal: bool) -> Self {
        self.temporal = temporal;
        self
    }

    pub fn urgent(mut self, urgent: bool) -> Self {
        self.urgent = urgent;
        self
    }

    /// Builds the trace, stamping it with the current time if no timestamp was set
    pub fn build(self) -> Result<RawTrace> {
        let value = self
            .value
            .ok_or_else(|| TallyError::InvalidTrace(format!("{}: value is required", self.id)))?;
        if let TraceValue::Float(v) = value {
            if !v.is_finite() {
                return Err(TallyError::InvalidTrace(format!(
                    "{}: value must be finite, got {}",
                    self.id, v
                )));
            }
        }

        Ok(RawTrace {
            timestamp: self.timestamp.unwrap_or_else(now_millis),
            id: self.id,
            value,
            temporal: self.temporal,
            urgent: self.urgent,
        })
    }
}
