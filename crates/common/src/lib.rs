//! EmberLM common library
//!
//! This crate contains shared code used across EmberLM components.

pub mod config;
pub mod error;
pub mod metrics;
pub mod telemetry;

// Re-export commonly used types
pub use config::{
    BudgetMode, EngineConfig, GenerationMode, GenerationOptions, OutputConstraint,
};
pub use error::{EmberError, Result};
pub use metrics::{MetricsRegistry, METRICS};
pub use telemetry::{NullTelemetry, TelemetryHooks, TelemetrySink};
