//! Detector backed by an HTTP inference service.
//!
//! Each frame is POSTed as raw BGR bytes with its geometry in headers. The
//! service answers with JSON, either a bare array of detections or an object
//! with a `detections` field. Entries carrying a `class_id` other than the
//! person class are ignored, and so are entries missing a field; the rest of
//! the frame still counts.

use std::time::Duration;

use occupancy::Detection;
use reqwest::{StatusCode, blocking::Client};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;
use video_ingest::Frame;

use crate::detector::{DetectorConfig, DetectorError, PersonDetector, validate_frame};

/// COCO class index for "person".
pub const PERSON_CLASS: i64 = 0;

#[derive(Debug, Deserialize)]
struct RemoteDetection {
    bbox: [f32; 4],
    #[serde(alias = "score", alias = "conf")]
    confidence: f32,
    #[serde(default, alias = "class")]
    class_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RemoteResponse {
    Bare(Vec<Value>),
    Wrapped { detections: Vec<Value> },
}

impl RemoteResponse {
    fn into_people(self) -> Vec<Detection> {
        let raw = match self {
            RemoteResponse::Bare(list) | RemoteResponse::Wrapped { detections: list } => list,
        };
        raw.into_iter()
            .enumerate()
            .filter_map(|(idx, entry)| match serde_json::from_value::<RemoteDetection>(entry) {
                Ok(det) => Some(det),
                Err(err) => {
                    debug!("skipping malformed detection #{idx}: {err}");
                    None
                }
            })
            .filter(|det| det.class_id.is_none_or(|class| class == PERSON_CLASS))
            .map(|det| Detection::new(det.bbox, det.confidence))
            .collect()
    }
}

pub struct RemoteDetector {
    url: String,
    client: Client,
    config: DetectorConfig,
}

impl RemoteDetector {
    pub fn new(
        url: impl Into<String>,
        timeout: Duration,
        config: DetectorConfig,
    ) -> Result<Self, DetectorError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            url: url.into(),
            client,
            config,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl PersonDetector for RemoteDetector {
    fn name(&self) -> &str {
        "remote"
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, DetectorError> {
        validate_frame(frame)?;

        let response = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/octet-stream")
            .header("X-Frame-Width", frame.width)
            .header("X-Frame-Height", frame.height)
            .header("X-Frame-Format", frame.format.label())
            .body(frame.data.clone())
            .send()?;

        let status = response.status();
        let body = response.text()?;
        if status != StatusCode::OK {
            return Err(DetectorError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: RemoteResponse = serde_json::from_str(&body)?;
        let people = self.config.finalize(parsed.into_people());
        debug!(count = people.len(), "remote detector returned people");
        Ok(people)
    }
}
