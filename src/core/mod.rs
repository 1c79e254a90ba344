//! Core configuration and error types shared by every layer of the
//! accumulator.

#![warn(missing_docs)]

pub mod config;
pub mod error;

// Re-export commonly used types
pub use config::{AccumulatorConfig, ConfigBuilder, RejectionPolicy};
pub use error::{Result, TallyError};
