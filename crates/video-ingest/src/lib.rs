//! Live frame acquisition for cameras and network streams.
//!
//! [`LatestFrameSource`] owns a single device connection on a background
//! thread and always offers the most recent decoded frame. Backends implement
//! [`DeviceConnector`]; the FFmpeg subprocess backend is always available and
//! also grabs the X11 desktop for `screen` sources. The OpenCV backend is
//! enabled with the `opencv` feature.

#[cfg(feature = "opencv")]
mod camera;
mod ffmpeg;
mod source;
mod types;
mod uri;

#[cfg(feature = "opencv")]
pub use camera::OpenCvConnector;
pub use ffmpeg::{FfmpegConnector, ScreenOptions};
pub use source::{
    CapturedFrame, FrameSourceOptions, LatestFrameSource, ReconnectPolicy, SourceStats,
};
pub use types::{CaptureDevice, CaptureError, DeviceConnector, Frame, FrameFormat};
pub use uri::{
    ScreenRegion, SourceKind, parse_device_index, parse_screen_monitor, resolve_source_uri,
};
