//! Configuration parsing for the counter pipeline.
//!
//! This module owns translation of CLI arguments into a `CounterConfig`
//! struct which downstream stages use without re-parsing flags.

use std::{path::PathBuf, time::Duration};

use anyhow::{Result, anyhow, bail};
use clap::{Args, ValueEnum};
use ml_core::DetectorConfig;
use occupancy::{EngineConfig, MatcherConfig};
use reporting::ReportingConfig;
use video_ingest::{ReconnectPolicy, ScreenOptions, ScreenRegion, SourceKind, resolve_source_uri};

/// Capture implementation used to open the source.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum CaptureBackend {
    /// FFmpeg subprocess decoding to raw BGR.
    Ffmpeg,
    /// OpenCV `VideoCapture` (requires the `opencv` feature).
    Opencv,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum DetectorKind {
    /// HTTP inference service.
    Remote,
    /// Local TorchScript model (requires the `with-tch` feature).
    Torchscript,
}

#[derive(Clone, Debug, PartialEq)]
pub enum DetectorSettings {
    Remote {
        url: String,
        timeout: Duration,
    },
    TorchScript {
        model_path: PathBuf,
        input_size: (i64, i64),
        use_cpu: bool,
    },
}

#[derive(Clone, Debug, Default, PartialEq)]
/// Optional telemetry knobs for tracing.
pub struct TelemetryOptions {
    /// Write a Chrome trace JSON file capturing pipeline spans.
    pub chrome_trace_path: Option<PathBuf>,
}

#[derive(Clone, Debug)]
/// Canonical configuration shared by every stage in the pipeline.
pub struct CounterConfig {
    /// Resolved source URI, credentials included.
    pub source_uri: String,
    pub source_kind: SourceKind,
    pub backend: CaptureBackend,
    /// Capture width and height in pixels.
    pub capture_size: (i32, i32),
    /// Desktop grab settings, used when `source_kind` is `Screen`.
    pub screen: ScreenOptions,
    pub reconnect: ReconnectPolicy,
    /// Pause between device reads on the acquisition thread.
    pub capture_interval: Duration,
    /// Pause between iterations of the processing loop.
    pub process_interval: Duration,
    /// Run detection on every Nth new frame.
    pub frame_skip: u32,
    pub detector: DetectorSettings,
    pub detection: DetectorConfig,
    pub matcher: MatcherConfig,
    pub engine: EngineConfig,
    pub data_dir: PathBuf,
    /// `None` when no collector endpoint is configured.
    pub reporting: Option<ReportingConfig>,
    pub report_queue: usize,
    /// Processing heartbeat age after which the watchdog restarts the pipeline.
    pub stall_timeout: Duration,
    pub telemetry: TelemetryOptions,
    pub verbose: bool,
}

/// CLI arguments accepted by the `run` and `probe` subcommands.
#[derive(Debug, Args)]
pub struct CounterCliArgs {
    /// Camera index, /dev/videoN, rtsp:// or http(s):// URI, a bare camera IP,
    /// or `screen[:monitor]` for desktop capture.
    #[arg(value_name = "SOURCE")]
    pub source: Option<String>,
    /// Source flag (overrides positional).
    #[arg(long = "source", value_name = "URI")]
    pub source_flag: Option<String>,
    /// Camera user name injected into network URIs.
    #[arg(long, env = "CAMERA_USERNAME")]
    pub username: Option<String>,
    /// Camera password injected into network URIs.
    #[arg(long, env = "CAMERA_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,
    #[arg(long, value_name = "PX", default_value_t = 640)]
    pub width: i32,
    #[arg(long, value_name = "PX", default_value_t = 480)]
    pub height: i32,
    #[arg(long, value_enum, default_value_t = CaptureBackend::Ffmpeg)]
    pub backend: CaptureBackend,
    /// Desktop rectangle `x,y,width,height` grabbed by `screen` sources.
    #[arg(long = "screen-region", value_name = "X,Y,W,H")]
    pub screen_region: Option<ScreenRegion>,
    #[arg(long = "screen-fps", value_name = "FPS", default_value_t = 10)]
    pub screen_fps: u32,
    /// X11 display grabbed by `screen` sources.
    #[arg(long = "display", env = "DISPLAY", default_value = ":0")]
    pub display: String,

    #[arg(long, value_enum, default_value_t = DetectorKind::Remote)]
    pub detector: DetectorKind,
    /// Inference service URL for the remote detector.
    #[arg(long = "detector-url", env = "DETECTOR_URL", value_name = "URL")]
    pub detector_url: Option<String>,
    #[arg(long = "detector-timeout", value_name = "SECS", default_value_t = 5.0)]
    pub detector_timeout: f64,
    /// TorchScript model path for the local detector.
    #[arg(long = "model", value_name = "PATH")]
    pub model_path: Option<PathBuf>,
    /// Force CPU inference.
    #[arg(long = "cpu", action = clap::ArgAction::SetTrue)]
    pub use_cpu: bool,
    #[arg(long = "detector-width", value_name = "PX")]
    pub detector_width: Option<i32>,
    #[arg(long = "detector-height", value_name = "PX")]
    pub detector_height: Option<i32>,
    /// Candidate score floor applied by the detector before suppression.
    #[arg(long = "detector-confidence", default_value_t = 0.4)]
    pub detector_confidence: f32,
    #[arg(long = "iou-threshold", default_value_t = 0.5)]
    pub iou_threshold: f32,
    #[arg(long = "max-detections", default_value_t = 50)]
    pub max_detections: usize,

    /// Seconds an identity may go unseen before it leaves the active set.
    #[arg(long = "person-timeout", value_name = "SECS", default_value_t = 3.0)]
    pub person_timeout: f64,
    /// Centre distance in pixels at which the position score reaches zero.
    #[arg(long = "position-threshold", value_name = "PX", default_value_t = 30.0)]
    pub position_threshold: f32,
    /// Reject matches whose area changed by more than this fraction.
    #[arg(long = "size-threshold", value_name = "FRACTION")]
    pub size_threshold: Option<f32>,
    /// Combined score a match must exceed.
    #[arg(long = "match-threshold", default_value_t = 0.6)]
    pub match_threshold: f32,
    /// Detections below this confidence are not counted.
    #[arg(long = "min-confidence", default_value_t = 0.3)]
    pub min_confidence: f32,
    #[arg(long = "frame-skip", value_name = "N", default_value_t = 1)]
    pub frame_skip: u32,

    #[arg(long = "reconnect-interval", value_name = "SECS", default_value_t = 2.0)]
    pub reconnect_interval: f64,
    #[arg(long = "reconnect-multiplier", default_value_t = 2.0)]
    pub reconnect_multiplier: f64,
    #[arg(long = "reconnect-max", value_name = "SECS", default_value_t = 30.0)]
    pub reconnect_max: f64,
    #[arg(long = "capture-interval-ms", value_name = "MS", default_value_t = 33)]
    pub capture_interval_ms: u64,
    #[arg(long = "process-interval-ms", value_name = "MS", default_value_t = 10)]
    pub process_interval_ms: u64,
    #[arg(long = "stall-timeout", value_name = "SECS", default_value_t = 60.0)]
    pub stall_timeout: f64,

    /// Keep the hourly counter running across hour boundaries.
    #[arg(long = "no-hourly-reset", action = clap::ArgAction::SetTrue)]
    pub no_hourly_reset: bool,
    /// Hour of day (0-23) at which the daily window rolls over.
    #[arg(long = "daily-reset-hour", default_value_t = 0)]
    pub daily_reset_hour: u32,
    #[arg(long = "device-id", env = "DEVICE_ID", default_value = "default")]
    pub device_id: String,
    #[arg(long, env = "LOCATION", default_value = "unknown")]
    pub location: String,
    /// Directory receiving one JSON summary per day.
    #[arg(long = "data-dir", value_name = "DIR", default_value = "data/daily_counts")]
    pub data_dir: PathBuf,

    /// Collector URL receiving hourly summaries.
    #[arg(long = "endpoint-url", env = "ENDPOINT_URL", value_name = "URL")]
    pub endpoint_url: Option<String>,
    #[arg(long = "endpoint-api-key", env = "ENDPOINT_API_KEY", hide_env_values = true)]
    pub endpoint_api_key: Option<String>,
    #[arg(long = "endpoint-timeout", value_name = "SECS", default_value_t = 30.0)]
    pub endpoint_timeout: f64,
    /// Collector liveness URL (defaults to the endpoint with /api/count replaced by /health).
    #[arg(long = "health-url", value_name = "URL")]
    pub health_url: Option<String>,
    #[arg(long = "report-queue", value_name = "N", default_value_t = 16)]
    pub report_queue: usize,

    /// Emit Chrome trace JSON for post-mortem analysis.
    #[arg(long = "chrome-trace", value_name = "PATH")]
    pub chrome_trace: Option<PathBuf>,
    /// Enable verbose logging (per-frame detections).
    #[arg(long = "verbose", action = clap::ArgAction::SetTrue)]
    pub verbose: bool,
}

fn positive_secs(value: f64, flag: &str) -> Result<Duration> {
    if !value.is_finite() || value <= 0.0 {
        bail!("{flag} must be a positive number of seconds");
    }
    Ok(Duration::from_secs_f64(value))
}

fn unit_interval(value: f32, flag: &str) -> Result<f32> {
    if !(0.0..=1.0).contains(&value) {
        bail!("{flag} must be between 0 and 1");
    }
    Ok(value)
}

impl TryFrom<CounterCliArgs> for CounterConfig {
    type Error = anyhow::Error;

    fn try_from(args: CounterCliArgs) -> Result<Self> {
        let raw_source = args
            .source_flag
            .or(args.source)
            .unwrap_or_else(|| "0".to_string());
        let credentials = match (args.username.as_deref(), args.password.as_deref()) {
            (Some(user), Some(pass)) => Some((user, pass)),
            (Some(user), None) => Some((user, "")),
            (None, Some(_)) => bail!("--password requires --username"),
            (None, None) => None,
        };
        let source_uri = resolve_source_uri(&raw_source, credentials);
        let source_kind = SourceKind::from_uri(&source_uri);

        if args.width <= 0 || args.height <= 0 {
            bail!("Capture width and height must be positive integers");
        }
        if args.backend == CaptureBackend::Opencv && !cfg!(feature = "opencv") {
            bail!("--backend opencv requires building with the `opencv` feature");
        }
        if source_kind == SourceKind::Screen && args.backend != CaptureBackend::Ffmpeg {
            bail!("Screen capture requires --backend ffmpeg");
        }
        if args.screen_fps == 0 {
            bail!("--screen-fps must be at least 1");
        }
        let screen = ScreenOptions {
            display: args.display,
            region: args.screen_region,
            fps: args.screen_fps,
        };

        let detector = match args.detector {
            DetectorKind::Remote => DetectorSettings::Remote {
                url: args.detector_url.ok_or_else(|| {
                    anyhow!("Missing detector URL. Provide --detector-url <url> or DETECTOR_URL.")
                })?,
                timeout: positive_secs(args.detector_timeout, "--detector-timeout")?,
            },
            DetectorKind::Torchscript => {
                if !cfg!(feature = "with-tch") {
                    bail!("--detector torchscript requires building with the `with-tch` feature");
                }
                let model_path = args
                    .model_path
                    .ok_or_else(|| anyhow!("Missing model path. Provide --model <path>."))?;
                let input_size = match (args.detector_width, args.detector_height) {
                    (Some(w), Some(h)) if w > 0 && h > 0 => (w, h),
                    (None, None) => default_detector_size(args.width, args.height),
                    _ => bail!("Detector dimensions must both be given as positive integers"),
                };
                DetectorSettings::TorchScript {
                    model_path,
                    input_size: (i64::from(input_size.0), i64::from(input_size.1)),
                    use_cpu: args.use_cpu,
                }
            }
        };

        let detection = DetectorConfig {
            confidence_threshold: unit_interval(args.detector_confidence, "--detector-confidence")?,
            iou_threshold: unit_interval(args.iou_threshold, "--iou-threshold")?,
            max_detections: args.max_detections.max(1),
        };

        if !args.position_threshold.is_finite() || args.position_threshold <= 0.0 {
            bail!("--position-threshold must be a positive number of pixels");
        }
        if let Some(size) = args.size_threshold
            && !(size > 0.0 && size <= 1.0)
        {
            bail!("--size-threshold must be in (0, 1]");
        }
        let matcher = MatcherConfig {
            position_threshold: args.position_threshold,
            accept_threshold: unit_interval(args.match_threshold, "--match-threshold")?,
            size_tolerance: args.size_threshold,
            ..MatcherConfig::default()
        };

        if args.daily_reset_hour > 23 {
            bail!("--daily-reset-hour must be between 0 and 23");
        }
        let engine = EngineConfig {
            person_timeout: positive_secs(args.person_timeout, "--person-timeout")?,
            min_confidence: unit_interval(args.min_confidence, "--min-confidence")?,
            hourly_reset: !args.no_hourly_reset,
            daily_reset_hour: args.daily_reset_hour,
            device_id: args.device_id,
            location: args.location,
        };

        if args.frame_skip == 0 {
            bail!("--frame-skip must be at least 1");
        }

        let initial = positive_secs(args.reconnect_interval, "--reconnect-interval")?;
        let max = positive_secs(args.reconnect_max, "--reconnect-max")?;
        if !args.reconnect_multiplier.is_finite() || args.reconnect_multiplier < 1.0 {
            bail!("--reconnect-multiplier must be at least 1.0");
        }
        if max < initial {
            bail!("--reconnect-max must not be shorter than --reconnect-interval");
        }
        let reconnect = ReconnectPolicy {
            initial,
            multiplier: args.reconnect_multiplier,
            max,
        };

        let reporting = match args.endpoint_url.filter(|url| !url.trim().is_empty()) {
            Some(endpoint) => Some(ReportingConfig {
                endpoint,
                api_key: args.endpoint_api_key.filter(|key| !key.is_empty()),
                timeout: positive_secs(args.endpoint_timeout, "--endpoint-timeout")?,
                health_url: args.health_url,
            }),
            None => None,
        };
        if args.report_queue == 0 {
            bail!("--report-queue must be at least 1");
        }

        Ok(Self {
            source_uri,
            source_kind,
            backend: args.backend,
            capture_size: (args.width, args.height),
            screen,
            reconnect,
            capture_interval: Duration::from_millis(args.capture_interval_ms),
            process_interval: Duration::from_millis(args.process_interval_ms),
            frame_skip: args.frame_skip,
            detector,
            detection,
            matcher,
            engine,
            data_dir: args.data_dir,
            reporting,
            report_queue: args.report_queue,
            stall_timeout: positive_secs(args.stall_timeout, "--stall-timeout")?,
            telemetry: TelemetryOptions {
                chrome_trace_path: args.chrome_trace,
            },
            verbose: args.verbose,
        })
    }
}

fn default_detector_size(width: i32, height: i32) -> (i32, i32) {
    let max_dim = width.max(height).max(32);
    let aligned = ((max_dim + 31) / 32) * 32;
    (aligned, aligned)
}
