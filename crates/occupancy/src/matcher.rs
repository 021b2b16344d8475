//! Resolution of detections against the currently active identities.
//!
//! The default [`GreedyMatcher`] scores every active identity independently
//! for each detection and keeps the best one above an acceptance threshold.
//! No assignment is made across the detections of a frame, so two nearby
//! detections may resolve to the same identity. A stricter strategy can be
//! plugged in through [`IdentityMatcher`] without touching the engine.

use crate::{
    detection::Detection,
    identity::{ActiveIdentities, IdentityId},
};

pub trait IdentityMatcher: Send {
    /// Existing identity this detection belongs to, if any.
    fn find_match(&self, detection: &Detection, active: &ActiveIdentities) -> Option<IdentityId>;

    /// Identity minted for a detection that matched nothing. Doubles as the
    /// de-duplication key for counting.
    fn signature(&self, detection: &Detection) -> IdentityId;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatcherConfig {
    /// Centre distance in pixels at which the position score reaches zero.
    pub position_threshold: f32,
    /// Minimum combined score (exclusive) for a match to be accepted.
    pub accept_threshold: f32,
    /// Optional hard gate on relative size change: candidates whose area
    /// ratio falls below `1 - tolerance` are never matched.
    pub size_tolerance: Option<f32>,
    /// Quantization step for centre coordinates in the signature.
    pub position_step: i64,
    /// Quantization step for box area in the signature.
    pub area_step: i64,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            position_threshold: 30.0,
            accept_threshold: 0.6,
            size_tolerance: None,
            position_step: 10,
            area_step: 500,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct GreedyMatcher {
    config: MatcherConfig,
}

impl GreedyMatcher {
    pub fn new(config: MatcherConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MatcherConfig {
        &self.config
    }

    /// Combined position/size similarity in `[0, 1]`.
    pub fn score(&self, center: (f32, f32), area: f32, last: (f32, f32), last_area: f32) -> f32 {
        let distance = (center.0 - last.0).hypot(center.1 - last.1);
        let position_score = if self.config.position_threshold > 0.0 {
            (1.0 - distance / self.config.position_threshold).max(0.0)
        } else {
            0.0
        };
        let size_score = size_similarity(area, last_area);
        (position_score + size_score) / 2.0
    }
}

impl IdentityMatcher for GreedyMatcher {
    fn find_match(&self, detection: &Detection, active: &ActiveIdentities) -> Option<IdentityId> {
        let center = detection.center();
        let area = detection.area();

        let mut best: Option<(IdentityId, f32)> = None;
        for (id, identity) in active {
            if let Some(tolerance) = self.config.size_tolerance
                && size_similarity(area, identity.last_area) < 1.0 - tolerance
            {
                continue;
            }
            let score = self.score(center, area, identity.last_position, identity.last_area);
            if score <= self.config.accept_threshold {
                continue;
            }
            if best.is_none_or(|(_, best_score)| score > best_score) {
                best = Some((*id, score));
            }
        }
        best.map(|(id, _)| id)
    }

    fn signature(&self, detection: &Detection) -> IdentityId {
        let (cx, cy) = detection.center();
        IdentityId {
            x: quantize(cx, self.config.position_step),
            y: quantize(cy, self.config.position_step),
            area: quantize(detection.area(), self.config.area_step),
        }
    }
}

fn size_similarity(a: f32, b: f32) -> f32 {
    if a <= 0.0 || b <= 0.0 {
        return 0.0;
    }
    a.min(b) / a.max(b)
}

fn quantize(value: f32, step: i64) -> i64 {
    let whole = value.floor() as i64;
    if step <= 1 {
        return whole;
    }
    whole.div_euclid(step) * step
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;
    use crate::identity::TrackedIdentity;

    fn seen_at() -> chrono::NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 6, 3)
            .and_then(|d| d.and_hms_opt(10, 0, 0))
            .unwrap()
    }

    fn active_with(entries: &[((f32, f32), f32)]) -> ActiveIdentities {
        entries
            .iter()
            .enumerate()
            .map(|(i, &(pos, area))| {
                let id = IdentityId {
                    x: i as i64,
                    y: 0,
                    area: 0,
                };
                (id, TrackedIdentity::new(id, pos, area, seen_at()))
            })
            .collect()
    }

    #[test]
    fn close_detection_matches_existing_identity() {
        let matcher = GreedyMatcher::default();
        let detection = Detection::new([150.0, 200.0, 250.0, 400.0], 0.9);
        let active = active_with(&[((205.0, 305.0), 19_500.0)]);

        let score = matcher.score(detection.center(), detection.area(), (205.0, 305.0), 19_500.0);
        assert!((score - 0.8696).abs() < 1e-3, "score was {score}");
        let only = *active.keys().next().unwrap();
        assert_eq!(matcher.find_match(&detection, &active), Some(only));
    }

    #[test]
    fn far_detection_mints_new_identity() {
        let matcher = GreedyMatcher::default();
        let detection = Detection::new([0.0, 0.0, 100.0, 200.0], 0.9);
        let active = active_with(&[((400.0, 400.0), 20_000.0)]);
        // Position score is zero and size score alone tops out at 0.5.
        assert_eq!(matcher.find_match(&detection, &active), None);
    }

    #[test]
    fn zero_area_scores_no_size_similarity() {
        let matcher = GreedyMatcher::default();
        let score = matcher.score((10.0, 10.0), 0.0, (10.0, 10.0), 500.0);
        assert_eq!(score, 0.5);
    }

    #[test]
    fn ties_go_to_first_identity() {
        let matcher = GreedyMatcher::default();
        let detection = Detection::new([90.0, 90.0, 110.0, 110.0], 0.9);
        let active = active_with(&[((100.0, 100.0), 400.0), ((100.0, 100.0), 400.0)]);
        let first = *active.keys().next().unwrap();
        assert_eq!(matcher.find_match(&detection, &active), Some(first));
    }

    #[test]
    fn best_score_wins() {
        let matcher = GreedyMatcher::default();
        let detection = Detection::new([90.0, 90.0, 110.0, 110.0], 0.9);
        let active = active_with(&[((110.0, 100.0), 400.0), ((101.0, 100.0), 400.0)]);
        let second = *active.keys().nth(1).unwrap();
        assert_eq!(matcher.find_match(&detection, &active), Some(second));
    }

    #[test]
    fn size_tolerance_rejects_large_area_change() {
        let detection = Detection::new([100.0, 100.0, 140.0, 200.0], 0.9);
        let active = active_with(&[((120.0, 150.0), 8_000.0)]);
        // Same centre, half the area: 0.75 overall, accepted without a gate.
        assert!(GreedyMatcher::default().find_match(&detection, &active).is_some());

        let gated = GreedyMatcher::new(MatcherConfig {
            size_tolerance: Some(0.4),
            ..Default::default()
        });
        assert_eq!(gated.find_match(&detection, &active), None);
    }

    #[test]
    fn signature_quantizes_centre_and_area() {
        let matcher = GreedyMatcher::default();
        let detection = Detection::new([150.0, 200.0, 250.0, 400.0], 0.9);
        let id = matcher.signature(&detection);
        assert_eq!(id, IdentityId { x: 200, y: 300, area: 20_000 });
        assert_eq!(id.to_string(), "200_300_20000");

        let nudged = Detection::new([153.0, 203.0, 253.0, 403.0], 0.9);
        assert_eq!(matcher.signature(&nudged), id);

        let moved = Detection::new([170.0, 200.0, 270.0, 400.0], 0.9);
        assert_ne!(matcher.signature(&moved), id);
    }
}
