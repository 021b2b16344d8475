//! Window summaries and the collaborators that receive them.

use chrono::{NaiveDate, NaiveDateTime};
use serde::Serialize;

use crate::store::StoreError;

/// Counts handed to the reporter when an hourly window closes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HourlySummary {
    pub hourly_count: u64,
    pub daily_count: u64,
    pub total_count: u64,
    pub device_id: String,
    pub location: String,
}

/// Record written once per reset-date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DailySummary {
    pub date: NaiveDate,
    pub daily_count: u64,
    pub total_count: u64,
    pub device_id: String,
    pub location: String,
    pub timestamp: NaiveDateTime,
}

/// Result of a single delivery attempt. Failures are data, not errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportOutcome {
    pub ok: bool,
    pub info: String,
}

impl ReportOutcome {
    pub fn success(info: impl Into<String>) -> Self {
        Self {
            ok: true,
            info: info.into(),
        }
    }

    pub fn failure(info: impl Into<String>) -> Self {
        Self {
            ok: false,
            info: info.into(),
        }
    }
}

/// Receives hourly summaries. Implementations must not panic and should
/// return promptly; the engine only logs the outcome.
pub trait CountReporter: Send {
    fn report(&self, summary: &HourlySummary) -> ReportOutcome;
}

/// Durable sink for daily summaries, keyed by date.
pub trait DailyStore: Send {
    fn persist(&self, summary: &DailySummary) -> Result<(), StoreError>;
}

/// Reporter that drops every summary. Used when no collector is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopReporter;

impl CountReporter for NoopReporter {
    fn report(&self, _summary: &HourlySummary) -> ReportOutcome {
        ReportOutcome::success("reporting disabled")
    }
}
