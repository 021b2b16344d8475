//! Count & reset state machine.
//!
//! The engine is single-writer: the processing loop feeds it one detection
//! batch per frame together with the wall-clock time of that frame. Reset
//! checks run unconditionally at the start of every call, so the hourly and
//! daily windows roll over on the first frame processed after a boundary.

use std::{collections::BTreeSet, time::Duration};

use chrono::{NaiveDate, NaiveDateTime, TimeDelta, Timelike};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::{
    detection::Detection,
    identity::{ActiveIdentities, IdentityId, TrackedIdentity},
    matcher::IdentityMatcher,
    summary::{CountReporter, DailyStore, DailySummary, HourlySummary},
};

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Identities unseen for longer than this leave the active set.
    pub person_timeout: Duration,
    /// Detections below this confidence are ignored entirely.
    pub min_confidence: f32,
    pub hourly_reset: bool,
    /// Hour of day (0-23) at which the daily window rolls over.
    pub daily_reset_hour: u32,
    pub device_id: String,
    pub location: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            person_timeout: Duration::from_secs(3),
            min_confidence: 0.3,
            hourly_reset: true,
            daily_reset_hour: 0,
            device_id: "default".into(),
            location: "unknown".into(),
        }
    }
}

impl EngineConfig {
    /// Calendar date of the daily window `now` belongs to.
    pub fn reset_date(&self, now: NaiveDateTime) -> NaiveDate {
        let shift = TimeDelta::hours(i64::from(self.daily_reset_hour.min(23)));
        (now - shift).date()
    }
}

#[derive(Debug, Clone, PartialEq)]
struct CounterState {
    hourly_count: u64,
    daily_count: u64,
    total_count: u64,
    counted_ids: BTreeSet<IdentityId>,
    active: ActiveIdentities,
    last_reset_hour: u32,
    last_reset_date: NaiveDate,
}

impl CounterState {
    fn clear_tracking(&mut self) {
        self.active.clear();
        self.counted_ids.clear();
    }
}

/// A detection from the current frame tagged with the identity it resolved to.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedDetection {
    pub detection: Detection,
    pub identity: IdentityId,
    /// True when this detection incremented the counters.
    pub newly_counted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrameOutcome {
    pub hourly_count: u64,
    pub daily_count: u64,
    pub total_count: u64,
    pub resolved: Vec<ResolvedDetection>,
    /// Malformed detections dropped from this batch.
    pub skipped: usize,
}

/// Point-in-time copy of the counters for reporting and display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CountSnapshot {
    pub hourly_count: u64,
    pub daily_count: u64,
    pub total_count: u64,
    pub active_identities: usize,
    pub last_reset_hour: u32,
    pub last_reset_date: NaiveDate,
    pub device_id: String,
    pub location: String,
}

pub struct CountEngine {
    config: EngineConfig,
    person_timeout: TimeDelta,
    matcher: Box<dyn IdentityMatcher>,
    reporter: Box<dyn CountReporter>,
    store: Box<dyn DailyStore>,
    state: CounterState,
}

impl CountEngine {
    pub fn new(
        config: EngineConfig,
        matcher: Box<dyn IdentityMatcher>,
        reporter: Box<dyn CountReporter>,
        store: Box<dyn DailyStore>,
        now: NaiveDateTime,
    ) -> Self {
        let person_timeout = TimeDelta::from_std(config.person_timeout).unwrap_or(TimeDelta::MAX);
        let state = CounterState {
            hourly_count: 0,
            daily_count: 0,
            total_count: 0,
            counted_ids: BTreeSet::new(),
            active: ActiveIdentities::new(),
            last_reset_hour: now.hour(),
            last_reset_date: config.reset_date(now),
        };
        Self {
            config,
            person_timeout,
            matcher,
            reporter,
            store,
            state,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn active_identities(&self) -> &ActiveIdentities {
        &self.state.active
    }

    pub fn is_counted(&self, id: &IdentityId) -> bool {
        self.state.counted_ids.contains(id)
    }

    /// Apply one frame's detections observed at `now`.
    pub fn process_frame(&mut self, detections: &[Detection], now: NaiveDateTime) -> FrameOutcome {
        self.check_resets(now);
        self.expire_stale(now);

        let mut resolved = Vec::with_capacity(detections.len());
        let mut skipped = 0;

        for detection in detections {
            if !detection.is_well_formed() {
                debug!(bbox = ?detection.bbox, confidence = detection.confidence, "skipping malformed detection");
                skipped += 1;
                continue;
            }
            if detection.confidence < self.config.min_confidence {
                continue;
            }

            let center = detection.center();
            let area = detection.area();

            let matched = self
                .matcher
                .find_match(detection, &self.state.active)
                .and_then(|id| self.state.active.get_mut(&id));
            if let Some(identity) = matched {
                identity.refresh(center, area, now);
                resolved.push(ResolvedDetection {
                    detection: *detection,
                    identity: identity.id,
                    newly_counted: false,
                });
                continue;
            }

            let id = self.matcher.signature(detection);
            let newly_counted = self.state.counted_ids.insert(id);
            if newly_counted {
                self.state.hourly_count += 1;
                self.state.daily_count += 1;
                self.state.total_count += 1;
                metrics::counter!("occupancy_entries_total").increment(1);
                info!(
                    identity = %id,
                    hourly = self.state.hourly_count,
                    daily = self.state.daily_count,
                    "new person entered view"
                );
            }
            self.state
                .active
                .entry(id)
                .and_modify(|identity| identity.refresh(center, area, now))
                .or_insert_with(|| TrackedIdentity::new(id, center, area, now));
            resolved.push(ResolvedDetection {
                detection: *detection,
                identity: id,
                newly_counted,
            });
        }

        FrameOutcome {
            hourly_count: self.state.hourly_count,
            daily_count: self.state.daily_count,
            total_count: self.state.total_count,
            resolved,
            skipped,
        }
    }

    fn check_resets(&mut self, now: NaiveDateTime) {
        if self.config.hourly_reset && now.hour() != self.state.last_reset_hour {
            self.hourly_reset(now);
        }
        if self.config.reset_date(now) != self.state.last_reset_date {
            self.daily_reset(now);
        }
    }

    fn expire_stale(&mut self, now: NaiveDateTime) {
        let timeout = self.person_timeout;
        self.state.active.retain(|id, identity| {
            let keep = now.signed_duration_since(identity.last_seen_at) <= timeout;
            if !keep {
                debug!(identity = %id, "identity timed out");
            }
            keep
        });
    }

    /// Close the hourly window: report a non-empty window, then zero the
    /// hourly counter and forget every tracked identity.
    pub fn hourly_reset(&mut self, now: NaiveDateTime) {
        if self.state.hourly_count > 0 {
            info!(
                hourly_count = self.state.hourly_count,
                "closing hourly window"
            );
            let summary = HourlySummary {
                hourly_count: self.state.hourly_count,
                daily_count: self.state.daily_count,
                total_count: self.state.total_count,
                device_id: self.config.device_id.clone(),
                location: self.config.location.clone(),
            };
            let outcome = self.reporter.report(&summary);
            if outcome.ok {
                info!(info = %outcome.info, "hourly summary handed to reporter");
            } else {
                error!(info = %outcome.info, "failed to report hourly summary");
            }
        }

        self.state.hourly_count = 0;
        self.state.last_reset_hour = now.hour();
        self.state.clear_tracking();
    }

    /// Close the daily window: persist the closing day's summary, then zero
    /// the daily counter and forget every tracked identity. A repeat call
    /// inside a window that is already closed and empty persists nothing.
    pub fn daily_reset(&mut self, now: NaiveDateTime) {
        let already_closed = self.state.daily_count == 0
            && self.state.last_reset_date == self.config.reset_date(now);
        if !already_closed {
            info!(daily_count = self.state.daily_count, "closing daily window");
            self.persist_daily(now);
        }

        self.state.daily_count = 0;
        self.state.last_reset_date = self.config.reset_date(now);
        self.state.clear_tracking();
    }

    /// Persist the current day's counts without resetting anything. Used on
    /// shutdown so in-memory counts survive a restart.
    pub fn flush(&self, now: NaiveDateTime) -> bool {
        self.persist_daily(now)
    }

    fn persist_daily(&self, now: NaiveDateTime) -> bool {
        let summary = DailySummary {
            date: self.state.last_reset_date,
            daily_count: self.state.daily_count,
            total_count: self.state.total_count,
            device_id: self.config.device_id.clone(),
            location: self.config.location.clone(),
            timestamp: now,
        };
        match self.store.persist(&summary) {
            Ok(()) => true,
            Err(err) => {
                warn!("failed to persist daily summary for {}: {err}", summary.date);
                metrics::counter!("occupancy_daily_persist_failures_total").increment(1);
                false
            }
        }
    }

    pub fn snapshot(&self) -> CountSnapshot {
        CountSnapshot {
            hourly_count: self.state.hourly_count,
            daily_count: self.state.daily_count,
            total_count: self.state.total_count,
            active_identities: self.state.active.len(),
            last_reset_hour: self.state.last_reset_hour,
            last_reset_date: self.state.last_reset_date,
            device_id: self.config.device_id.clone(),
            location: self.config.location.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::{
        matcher::GreedyMatcher,
        store::StoreError,
        summary::ReportOutcome,
    };

    #[derive(Clone, Default)]
    struct RecordingReporter {
        calls: Arc<Mutex<Vec<HourlySummary>>>,
        fail: bool,
    }

    impl CountReporter for RecordingReporter {
        fn report(&self, summary: &HourlySummary) -> ReportOutcome {
            self.calls.lock().unwrap().push(summary.clone());
            if self.fail {
                ReportOutcome::failure("request timeout")
            } else {
                ReportOutcome::success("ok")
            }
        }
    }

    #[derive(Clone, Default)]
    struct RecordingStore {
        saved: Arc<Mutex<Vec<DailySummary>>>,
    }

    impl DailyStore for RecordingStore {
        fn persist(&self, summary: &DailySummary) -> Result<(), StoreError> {
            self.saved.lock().unwrap().push(summary.clone());
            Ok(())
        }
    }

    fn at(day: u32, hour: u32, min: u32, sec: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 6, day)
            .and_then(|d| d.and_hms_opt(hour, min, sec))
            .unwrap()
    }

    fn engine_with(
        config: EngineConfig,
        reporter: RecordingReporter,
        store: RecordingStore,
        now: NaiveDateTime,
    ) -> CountEngine {
        CountEngine::new(
            config,
            Box::new(GreedyMatcher::default()),
            Box::new(reporter),
            Box::new(store),
            now,
        )
    }

    fn engine(now: NaiveDateTime) -> CountEngine {
        engine_with(
            EngineConfig::default(),
            RecordingReporter::default(),
            RecordingStore::default(),
            now,
        )
    }

    fn three_people() -> Vec<Detection> {
        vec![
            Detection::new([10.0, 10.0, 60.0, 110.0], 0.8),
            Detection::new([300.0, 50.0, 360.0, 200.0], 0.7),
            Detection::new([600.0, 100.0, 680.0, 300.0], 0.9),
        ]
    }

    #[test]
    fn separated_people_are_counted_once() {
        let mut engine = engine(at(3, 10, 0, 0));

        let first = engine.process_frame(&three_people(), at(3, 10, 0, 1));
        assert_eq!(first.hourly_count, 3);
        assert_eq!(first.resolved.iter().filter(|r| r.newly_counted).count(), 3);

        let second = engine.process_frame(&three_people(), at(3, 10, 0, 2));
        assert_eq!(second.hourly_count, 3);
        assert_eq!(second.daily_count, 3);
        assert_eq!(second.total_count, 3);
        assert!(second.resolved.iter().all(|r| !r.newly_counted));
    }

    #[test]
    fn low_confidence_and_malformed_detections_are_ignored() {
        let mut engine = engine(at(3, 10, 0, 0));
        let detections = [
            Detection::new([10.0, 10.0, 60.0, 110.0], 0.1),
            Detection::new([f32::NAN, 10.0, 60.0, 110.0], 0.9),
            Detection::new([60.0, 10.0, 10.0, 110.0], 0.9),
        ];
        let outcome = engine.process_frame(&detections, at(3, 10, 0, 1));
        assert_eq!(outcome.hourly_count, 0);
        assert_eq!(outcome.skipped, 2);
        assert!(outcome.resolved.is_empty());
        assert!(engine.active_identities().is_empty());
    }

    #[test]
    fn reappearing_within_window_is_not_recounted() {
        let mut engine = engine(at(3, 10, 0, 0));
        let person = [Detection::new([100.0, 100.0, 200.0, 300.0], 0.9)];

        engine.process_frame(&person, at(3, 10, 0, 1));
        // Gone long enough to expire from the active set.
        engine.process_frame(&[], at(3, 10, 0, 10));
        assert!(engine.active_identities().is_empty());

        let outcome = engine.process_frame(&person, at(3, 10, 0, 11));
        assert_eq!(outcome.hourly_count, 1);
        assert_eq!(engine.active_identities().len(), 1);
    }

    #[test]
    fn stale_identities_expire_after_timeout() {
        let mut engine = engine(at(3, 10, 0, 0));
        let person = [Detection::new([100.0, 100.0, 200.0, 300.0], 0.9)];
        engine.process_frame(&person, at(3, 10, 0, 0));

        engine.process_frame(&[], at(3, 10, 0, 3));
        assert_eq!(engine.active_identities().len(), 1);

        engine.process_frame(&[], at(3, 10, 0, 4));
        assert!(engine.active_identities().is_empty());

        // Moved far enough that the signature differs: a new entry.
        let moved = [Detection::new([400.0, 100.0, 500.0, 300.0], 0.9)];
        let outcome = engine.process_frame(&moved, at(3, 10, 0, 5));
        assert_eq!(outcome.hourly_count, 2);
    }

    #[test]
    fn hourly_reset_reports_and_clears_even_when_delivery_fails() {
        let reporter = RecordingReporter {
            fail: true,
            ..Default::default()
        };
        let mut engine = engine_with(
            EngineConfig::default(),
            reporter.clone(),
            RecordingStore::default(),
            at(3, 10, 0, 0),
        );

        for i in 0..12 {
            let x = i as f32 * 100.0;
            let person = [Detection::new([x, 0.0, x + 40.0, 80.0], 0.9)];
            engine.process_frame(&person, at(3, 10, 1, 0));
        }
        assert_eq!(engine.snapshot().hourly_count, 12);

        let outcome = engine.process_frame(&[], at(3, 11, 0, 0));
        assert_eq!(outcome.hourly_count, 0);
        assert_eq!(outcome.daily_count, 12);
        assert!(engine.active_identities().is_empty());

        let calls = reporter.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].hourly_count, 12);
        assert_eq!(calls[0].device_id, "default");
    }

    #[test]
    fn empty_hour_is_not_reported() {
        let reporter = RecordingReporter::default();
        let mut engine = engine_with(
            EngineConfig::default(),
            reporter.clone(),
            RecordingStore::default(),
            at(3, 10, 0, 0),
        );
        engine.process_frame(&[], at(3, 11, 0, 0));
        engine.process_frame(&[], at(3, 12, 0, 0));
        assert!(reporter.calls.lock().unwrap().is_empty());
        assert_eq!(engine.snapshot().last_reset_hour, 12);
    }

    #[test]
    fn reset_checks_are_idempotent_within_an_hour() {
        let reporter = RecordingReporter::default();
        let mut engine = engine_with(
            EngineConfig::default(),
            reporter.clone(),
            RecordingStore::default(),
            at(3, 10, 0, 0),
        );
        let person = [Detection::new([100.0, 100.0, 200.0, 300.0], 0.9)];
        engine.process_frame(&person, at(3, 10, 30, 0));
        engine.process_frame(&[], at(3, 11, 0, 0));
        engine.process_frame(&[], at(3, 11, 0, 1));
        engine.process_frame(&[], at(3, 11, 59, 59));
        assert_eq!(reporter.calls.lock().unwrap().len(), 1);
    }

    #[test]
    fn same_person_across_an_hour_boundary_counts_again() {
        let mut engine = engine(at(3, 10, 0, 0));
        let person = [Detection::new([100.0, 100.0, 200.0, 300.0], 0.9)];
        engine.process_frame(&person, at(3, 10, 59, 59));
        let outcome = engine.process_frame(&person, at(3, 11, 0, 0));
        assert_eq!(outcome.hourly_count, 1);
        assert_eq!(outcome.daily_count, 2);
        assert_eq!(outcome.total_count, 2);
    }

    #[test]
    fn disabled_hourly_reset_keeps_hourly_count() {
        let config = EngineConfig {
            hourly_reset: false,
            ..Default::default()
        };
        let reporter = RecordingReporter::default();
        let mut engine = engine_with(config, reporter.clone(), RecordingStore::default(), at(3, 10, 0, 0));
        let person = [Detection::new([100.0, 100.0, 200.0, 300.0], 0.9)];
        engine.process_frame(&person, at(3, 10, 0, 0));
        let outcome = engine.process_frame(&[], at(3, 11, 0, 0));
        assert_eq!(outcome.hourly_count, 1);
        assert!(reporter.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn daily_reset_persists_closing_day_before_zeroing() {
        let store = RecordingStore::default();
        let mut engine = engine_with(
            EngineConfig::default(),
            RecordingReporter::default(),
            store.clone(),
            at(3, 23, 0, 0),
        );
        let person = [Detection::new([100.0, 100.0, 200.0, 300.0], 0.9)];
        engine.process_frame(&person, at(3, 23, 30, 0));

        let outcome = engine.process_frame(&[], at(4, 0, 0, 5));
        assert_eq!(outcome.daily_count, 0);
        assert_eq!(outcome.total_count, 1);

        let saved = store.saved.lock().unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].date, NaiveDate::from_ymd_opt(2024, 6, 3).unwrap());
        assert_eq!(saved[0].daily_count, 1);
        assert_eq!(saved[0].timestamp, at(4, 0, 0, 5));
        assert_eq!(engine.snapshot().last_reset_date, NaiveDate::from_ymd_opt(2024, 6, 4).unwrap());
    }

    #[test]
    fn daily_window_follows_configured_reset_hour() {
        let config = EngineConfig {
            daily_reset_hour: 6,
            ..Default::default()
        };
        assert_eq!(config.reset_date(at(4, 5, 59, 59)), NaiveDate::from_ymd_opt(2024, 6, 3).unwrap());
        assert_eq!(config.reset_date(at(4, 6, 0, 0)), NaiveDate::from_ymd_opt(2024, 6, 4).unwrap());

        let store = RecordingStore::default();
        let mut engine = engine_with(config, RecordingReporter::default(), store.clone(), at(3, 22, 0, 0));
        engine.process_frame(&[], at(4, 0, 0, 0));
        assert!(store.saved.lock().unwrap().is_empty());
        engine.process_frame(&[], at(4, 6, 0, 0));
        assert_eq!(store.saved.lock().unwrap().len(), 1);
    }

    #[test]
    fn flush_persists_without_resetting() {
        let store = RecordingStore::default();
        let mut engine = engine_with(
            EngineConfig::default(),
            RecordingReporter::default(),
            store.clone(),
            at(3, 10, 0, 0),
        );
        engine.process_frame(&three_people(), at(3, 10, 0, 1));
        assert!(engine.flush(at(3, 10, 5, 0)));

        let snapshot = engine.snapshot();
        assert_eq!(snapshot.daily_count, 3);
        assert_eq!(snapshot.active_identities, 3);
        assert_eq!(store.saved.lock().unwrap()[0].daily_count, 3);
    }

    #[test]
    fn repeated_resets_at_the_same_instant_match_a_single_reset() {
        let boundary = at(4, 0, 0, 0);
        let build = |reporter: &RecordingReporter, store: &RecordingStore| {
            let mut engine = engine_with(
                EngineConfig::default(),
                reporter.clone(),
                store.clone(),
                at(3, 23, 0, 0),
            );
            engine.process_frame(&three_people(), at(3, 23, 59, 0));
            engine
        };

        let once_reporter = RecordingReporter::default();
        let once_store = RecordingStore::default();
        let mut once = build(&once_reporter, &once_store);
        once.hourly_reset(boundary);
        once.daily_reset(boundary);

        let twice_reporter = RecordingReporter::default();
        let twice_store = RecordingStore::default();
        let mut twice = build(&twice_reporter, &twice_store);
        twice.hourly_reset(boundary);
        twice.hourly_reset(boundary);
        twice.daily_reset(boundary);
        twice.daily_reset(boundary);

        assert_eq!(twice.snapshot(), once.snapshot());
        assert_eq!(twice.snapshot().daily_count, 0);
        assert_eq!(twice.snapshot().total_count, 3);

        assert_eq!(twice_reporter.calls.lock().unwrap().len(), 1);
        assert_eq!(
            *twice_reporter.calls.lock().unwrap(),
            *once_reporter.calls.lock().unwrap()
        );

        let saved = twice_store.saved.lock().unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].date, NaiveDate::from_ymd_opt(2024, 6, 3).unwrap());
        assert_eq!(saved[0].daily_count, 3);
        assert_eq!(*saved, *once_store.saved.lock().unwrap());
    }
}
