use anyhow::Error;
use thiserror::Error;

/// Raw frame captured from a video source.
#[derive(Clone, Debug)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: i32,
    pub height: i32,
    pub timestamp_ms: i64,
    pub format: FrameFormat,
}

impl Frame {
    /// Number of bytes a well-formed frame of this size and format carries.
    pub fn expected_len(&self) -> usize {
        (self.width.max(0) as usize) * (self.height.max(0) as usize) * self.format.channels()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameFormat {
    Bgr8,
}

impl FrameFormat {
    pub fn channels(self) -> usize {
        match self {
            FrameFormat::Bgr8 => 3,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            FrameFormat::Bgr8 => "bgr8",
        }
    }
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to open video source {uri:?}")]
    Open { uri: String },
    #[error("video source returned an empty frame")]
    EmptyFrame,
    #[error("video stream ended")]
    EndOfStream,
    #[error("no frame within {0:?}")]
    Timeout(std::time::Duration),
    #[error(transparent)]
    Other(#[from] Error),
}

/// An opened camera or stream handle. Dropping it releases the device.
pub trait CaptureDevice: Send {
    /// Block until the next frame is decoded or the read fails.
    fn read_frame(&mut self) -> Result<Frame, CaptureError>;
}

/// Knows how to (re)open one particular video source.
pub trait DeviceConnector: Send + Sync {
    /// Human readable description used in log lines.
    fn describe(&self) -> String;

    fn open(&self) -> Result<Box<dyn CaptureDevice>, CaptureError>;
}
