//! Turns per-frame person detections into hourly, daily and lifetime entry
//! counts.
//!
//! [`CountEngine`] owns all mutable counting state. It resolves detections to
//! identities through an [`IdentityMatcher`], rolls the hourly and daily
//! windows over on wall-clock boundaries, hands closed hourly windows to a
//! [`CountReporter`] and writes closed days to a [`DailyStore`].

mod detection;
mod engine;
mod identity;
mod matcher;
mod store;
mod summary;

pub use detection::Detection;
pub use engine::{CountEngine, CountSnapshot, EngineConfig, FrameOutcome, ResolvedDetection};
pub use identity::{ActiveIdentities, IdentityId, TrackedIdentity};
pub use matcher::{GreedyMatcher, IdentityMatcher, MatcherConfig};
pub use store::{JsonDailyStore, StoreError};
pub use summary::{
    CountReporter, DailyStore, DailySummary, HourlySummary, NoopReporter, ReportOutcome,
};
