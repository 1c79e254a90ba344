//! Tally - sharded interval metrics accumulator.
//!
//! Tally ingests a high-rate stream of metric observations ("traces"),
//! aggregates them per metric into fixed-length intervals and hands closed,
//! immutable snapshots to downstream sinks on every flush cycle.
//!
//! # Architecture
//!
//! - `metrics`: identity interning, trace types and the aggregation algebra
//! - `accumulator`: bounded shard queues, single-writer shard workers, the
//!   two-phase flush barrier and the public [`Accumulator`] facade
//! - `core`: configuration and errors
//! - `cli`: command-line driver running a synthetic load
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tally_lib::accumulator::{Accumulator, MemorySink};
//! use tally_lib::core::ConfigBuilder;
//! use tally_lib::metrics::{AggregationKind, RawTrace};
//!
//! fn main() -> tally_lib::Result<()> {
//!     let config = ConfigBuilder::new().flush_period_millis(0).build()?;
//!     let sink = Arc::new(MemorySink::new());
//!     let acc = Accumulator::new(config, Arc::<MemorySink>::clone(&sink))?;
//!     acc.start()?;
//!
//!     let id = acc.resolve("host1", "agentA", &["cpu"], "usage", AggregationKind::MinMaxAvg)?;
//!     for v in [10, 20, 30] {
//!         acc.submit(RawTrace::builder(Arc::clone(&id)).value(v).build()?);
//!     }
//!     acc.flush()?;
//!     acc.stop();
//!     Ok(())
//! }
//! ```

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

pub mod accumulator;
pub mod cli;
pub mod core;
pub mod metrics;

// Re-export core types for convenience
pub use crate::accumulator::Accumulator;
pub use crate::core::{AccumulatorConfig, Result, TallyError};
