//! Per-iteration work of the processing loop.
//!
//! The processor pulls the latest captured frame, decides whether it needs
//! detection, runs the detector and feeds the result into the count engine.
//! The engine is ticked on every iteration, even without a new frame, so
//! window rollovers and identity expiry keep running while the camera is
//! reconnecting.

use std::time::Instant;

use chrono::NaiveDateTime;
use ml_core::{PersonDetector, timed_detect};
use occupancy::{CountEngine, FrameOutcome};
use tracing::{debug, warn};
use video_ingest::CapturedFrame;

pub(crate) enum Tick {
    /// No frame newer than the last one seen.
    Idle,
    /// New frame that fell between detection intervals.
    Skipped { sequence: u64 },
    Processed {
        sequence: u64,
        outcome: FrameOutcome,
    },
}

pub(crate) struct FrameProcessor {
    detector: Box<dyn PersonDetector>,
    frame_skip: u64,
    verbose: bool,
    last_sequence: Option<u64>,
    new_frames: u64,
    processed: u64,
    smoothed_fps: f32,
    last_processed_at: Option<Instant>,
}

impl FrameProcessor {
    pub(crate) fn new(detector: Box<dyn PersonDetector>, frame_skip: u32, verbose: bool) -> Self {
        Self {
            detector,
            frame_skip: u64::from(frame_skip.max(1)),
            verbose,
            last_sequence: None,
            new_frames: 0,
            processed: 0,
            smoothed_fps: 0.0,
            last_processed_at: None,
        }
    }

    pub(crate) fn processed(&self) -> u64 {
        self.processed
    }

    pub(crate) fn smoothed_fps(&self) -> f32 {
        self.smoothed_fps
    }

    pub(crate) fn detector_name(&self) -> &str {
        self.detector.name()
    }

    /// True when `latest` carries a frame this processor has not seen yet.
    pub(crate) fn is_fresh(&self, latest: Option<&CapturedFrame>) -> bool {
        latest.is_some_and(|captured| Some(captured.sequence) != self.last_sequence)
    }

    pub(crate) fn tick(
        &mut self,
        latest: Option<CapturedFrame>,
        engine: &mut CountEngine,
        now: NaiveDateTime,
    ) -> Tick {
        let captured = match latest {
            Some(captured) if self.is_fresh(Some(&captured)) => captured,
            _ => {
                engine.process_frame(&[], now);
                return Tick::Idle;
            }
        };
        self.last_sequence = Some(captured.sequence);
        self.new_frames = self.new_frames.wrapping_add(1);

        if (self.new_frames - 1) % self.frame_skip != 0 {
            engine.process_frame(&[], now);
            return Tick::Skipped {
                sequence: captured.sequence,
            };
        }

        let detections = match timed_detect(&mut *self.detector, &captured.frame) {
            Ok(detections) => detections,
            Err(err) => {
                warn!("detector failed on frame #{}: {err}", captured.sequence);
                Vec::new()
            }
        };
        if self.verbose {
            for (idx, det) in detections.iter().enumerate() {
                debug!(
                    "  #{idx}: conf={:.3} bbox={:?}",
                    det.confidence, det.bbox
                );
            }
        }

        let outcome = engine.process_frame(&detections, now);
        self.processed = self.processed.wrapping_add(1);
        self.update_fps();
        publish_counts(&outcome, engine.active_identities().len());

        if self.processed % 30 == 0 {
            debug!(
                "Processing heartbeat: frame #{}, {:.1} fps, hourly={} daily={}",
                captured.sequence, self.smoothed_fps, outcome.hourly_count, outcome.daily_count
            );
        }

        Tick::Processed {
            sequence: captured.sequence,
            outcome,
        }
    }

    fn update_fps(&mut self) {
        let now = Instant::now();
        if let Some(last) = self.last_processed_at.replace(now) {
            let elapsed = now.duration_since(last).as_secs_f32();
            if elapsed > 0.0 {
                let instant = 1.0 / elapsed;
                self.smoothed_fps = if self.smoothed_fps == 0.0 {
                    instant
                } else {
                    0.9 * self.smoothed_fps + 0.1 * instant
                };
                metrics::gauge!("counter_pipeline_fps").set(self.smoothed_fps as f64);
            }
        }
    }
}

fn publish_counts(outcome: &FrameOutcome, active: usize) {
    metrics::gauge!("occupancy_hourly_count").set(outcome.hourly_count as f64);
    metrics::gauge!("occupancy_daily_count").set(outcome.daily_count as f64);
    metrics::gauge!("occupancy_total_count").set(outcome.total_count as f64);
    metrics::gauge!("occupancy_active_identities").set(active as f64);
}
