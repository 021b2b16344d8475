use std::time::Instant;

use occupancy::Detection;
use thiserror::Error;
use video_ingest::Frame;

use crate::nms::non_max_suppression;

#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("unsupported frame: {0}")]
    InvalidFrame(String),
    #[error("detector request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("detector service returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed detector response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("unexpected model output: {0}")]
    Output(String),
    #[cfg(feature = "with-tch")]
    #[error("torch error: {0}")]
    Torch(#[from] tch::TchError),
}

/// Post-processing applied to raw model candidates before they reach the
/// counter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectorConfig {
    /// Candidates scoring below this are discarded before suppression.
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    pub max_detections: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.25,
            iou_threshold: 0.5,
            max_detections: 50,
        }
    }
}

impl DetectorConfig {
    pub fn finalize(&self, candidates: Vec<Detection>) -> Vec<Detection> {
        let confident = candidates
            .into_iter()
            .filter(|det| det.confidence >= self.confidence_threshold)
            .collect();
        non_max_suppression(confident, self.iou_threshold, self.max_detections)
    }
}

/// Finds people in a single frame. Boxes are returned in frame pixel
/// coordinates as `[x1, y1, x2, y2]`.
pub trait PersonDetector: Send {
    fn name(&self) -> &str;

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, DetectorError>;
}

/// Reject frames whose buffer does not match their declared geometry.
pub fn validate_frame(frame: &Frame) -> Result<(), DetectorError> {
    if frame.width <= 0 || frame.height <= 0 {
        return Err(DetectorError::InvalidFrame(format!(
            "non-positive size {}x{}",
            frame.width, frame.height
        )));
    }
    let expected = frame.expected_len();
    if frame.data.len() != expected {
        return Err(DetectorError::InvalidFrame(format!(
            "buffer holds {} bytes, expected {expected}",
            frame.data.len()
        )));
    }
    Ok(())
}

/// Run `detector` and record latency/error metrics around the call.
pub fn timed_detect(
    detector: &mut dyn PersonDetector,
    frame: &Frame,
) -> Result<Vec<Detection>, DetectorError> {
    let started = Instant::now();
    let result = detector.detect(frame);
    metrics::histogram!("detector_latency_seconds").record(started.elapsed().as_secs_f64());
    if result.is_err() {
        metrics::counter!("detector_errors_total").increment(1);
    }
    result
}

#[cfg(test)]
mod tests {
    use video_ingest::FrameFormat;

    use super::*;

    fn frame(width: i32, height: i32, len: usize) -> Frame {
        Frame {
            data: vec![0; len],
            width,
            height,
            timestamp_ms: 0,
            format: FrameFormat::Bgr8,
        }
    }

    #[test]
    fn validate_frame_checks_buffer_length() {
        assert!(validate_frame(&frame(4, 2, 24)).is_ok());
        assert!(matches!(
            validate_frame(&frame(4, 2, 23)),
            Err(DetectorError::InvalidFrame(_))
        ));
        assert!(validate_frame(&frame(0, 2, 0)).is_err());
    }

    #[test]
    fn finalize_drops_low_confidence_then_suppresses() {
        let config = DetectorConfig::default();
        let kept = config.finalize(vec![
            Detection::new([0.0, 0.0, 100.0, 100.0], 0.9),
            Detection::new([2.0, 2.0, 102.0, 102.0], 0.8),
            Detection::new([300.0, 300.0, 400.0, 400.0], 0.1),
        ]);
        assert_eq!(kept, vec![Detection::new([0.0, 0.0, 100.0, 100.0], 0.9)]);
    }
}
