//! OpenCV-backed camera capture.

use anyhow::Error;
use chrono::Utc;
use opencv::{
    core::{self, MatTraitConstManual},
    prelude::*,
    videoio::{self, VideoCapture, VideoCaptureTrait},
};
use tracing::warn;

use crate::{
    ffmpeg::redact,
    types::{CaptureDevice, CaptureError, DeviceConnector, Frame, FrameFormat},
    uri::parse_device_index,
};

#[derive(Clone, Debug)]
pub struct OpenCvConnector {
    uri: String,
    target_size: (i32, i32),
    fps: f64,
}

impl OpenCvConnector {
    pub fn new(uri: impl Into<String>, target_size: (i32, i32)) -> Self {
        Self {
            uri: uri.into(),
            target_size,
            fps: 30.0,
        }
    }
}

impl DeviceConnector for OpenCvConnector {
    fn describe(&self) -> String {
        format!("opencv:{}", redact(&self.uri))
    }

    fn open(&self) -> Result<Box<dyn CaptureDevice>, CaptureError> {
        let mut cap = open_video_capture(&self.uri)?;
        configure_camera(&mut cap, self.target_size, self.fps);
        Ok(Box::new(OpenCvDevice {
            cap,
            frame: Mat::default(),
            scratch: Mat::default(),
            target_size: self.target_size,
        }))
    }
}

struct OpenCvDevice {
    cap: VideoCapture,
    frame: Mat,
    scratch: Mat,
    target_size: (i32, i32),
}

impl CaptureDevice for OpenCvDevice {
    fn read_frame(&mut self) -> Result<Frame, CaptureError> {
        let grabbed = self.cap.read(&mut self.frame).map_err(other)?;
        let size = self.frame.size().map_err(other)?;
        if !grabbed || size.width <= 0 || size.height <= 0 {
            return Err(CaptureError::EmptyFrame);
        }

        let (target_w, target_h) = self.target_size;
        let working = if size.width != target_w || size.height != target_h {
            opencv::imgproc::resize(
                &self.frame,
                &mut self.scratch,
                core::Size {
                    width: target_w,
                    height: target_h,
                },
                0.0,
                0.0,
                opencv::imgproc::INTER_LINEAR,
            )
            .map_err(other)?;
            &self.scratch
        } else {
            &self.frame
        };

        let data = working.data_bytes().map_err(other)?.to_vec();
        Ok(Frame {
            data,
            width: target_w,
            height: target_h,
            timestamp_ms: Utc::now().timestamp_millis(),
            format: FrameFormat::Bgr8,
        })
    }
}

impl Drop for OpenCvDevice {
    fn drop(&mut self) {
        let _ = self.cap.release();
    }
}

fn other(err: opencv::Error) -> CaptureError {
    CaptureError::Other(Error::from(err))
}

/// Attempt to open a camera input either by index or URI.
fn open_video_capture(uri: &str) -> Result<VideoCapture, CaptureError> {
    if let Some(index) = parse_device_index(uri) {
        for backend in [videoio::CAP_V4L, videoio::CAP_ANY] {
            match VideoCapture::new(index, backend) {
                Ok(cap) => {
                    if cap.is_opened().map_err(other)? {
                        return Ok(cap);
                    }
                }
                Err(err) => {
                    warn!("failed to open device #{index} with backend {backend}: {err}");
                }
            }
        }
    }

    for backend in [videoio::CAP_FFMPEG, videoio::CAP_ANY] {
        match VideoCapture::from_file(uri, backend) {
            Ok(cap) => {
                if cap.is_opened().map_err(other)? {
                    return Ok(cap);
                }
            }
            Err(err) => {
                warn!("failed to open {} with backend {backend}: {err}", redact(uri));
            }
        }
    }

    Err(CaptureError::Open {
        uri: redact(uri),
    })
}

/// Apply common capture settings and keep the driver queue at a single frame
/// so reads always return the freshest image.
fn configure_camera(cap: &mut VideoCapture, target_size: (i32, i32), fps: f64) {
    if let Ok(mjpg) = videoio::VideoWriter::fourcc('M', 'J', 'P', 'G') {
        let _ = cap.set(videoio::CAP_PROP_FOURCC, mjpg as f64);
    }
    let _ = cap.set(videoio::CAP_PROP_FRAME_WIDTH, target_size.0 as f64);
    let _ = cap.set(videoio::CAP_PROP_FRAME_HEIGHT, target_size.1 as f64);
    let _ = cap.set(videoio::CAP_PROP_FPS, fps);
    let _ = cap.set(videoio::CAP_PROP_BUFFERSIZE, 1.0);
}
