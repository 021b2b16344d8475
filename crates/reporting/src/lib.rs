//! Delivery of closed hourly windows to a remote HTTP collector.

mod client;

pub use client::{ReportError, ReportingClient, ReportingConfig};
