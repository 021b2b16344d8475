//! Live people-entry counter that captures frames, detects people, and keeps
//! hourly and daily entry counts.
//!
//! The module is split into focused submodules:
//! - `config`: CLI configuration parsing.
//! - `pipeline`: Supervises capture, detection, and counting with restarts.
//! - `processing`: Per-iteration detection and count engine hand-off.
//! - `dispatch`: Background delivery of hourly summaries.
//! - `watchdog`: Health monitoring for pipeline components.
//! - `telemetry`: Tracing subscribers and the Prometheus recorder.

/// Re-export pipeline settings so callers can configure runs without reaching
/// into submodules.
pub use config::{CounterCliArgs, CounterConfig};
/// Launch the counter or a one-shot diagnostic with a ready-made configuration.
pub use pipeline::{probe, run};

mod config;
mod dispatch;
mod pipeline;
mod processing;
mod telemetry;
mod watchdog;
