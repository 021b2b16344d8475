//! Pipeline supervisor tying together capture, detection, counting, and
//! reporting.
//!
//! The count engine and the report worker live for the whole process; the
//! capture source, detector, and watchdog are rebuilt on every restart so a
//! stalled stage cannot take the counters down with it.

use std::{
    path::Path,
    sync::{
        Arc, Once,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use anyhow::{Context, Result, bail};
use chrono::{Local, NaiveDateTime};
use ml_core::{DetectorConfig, PersonDetector, RemoteDetector};
use occupancy::{
    CountEngine, CountReporter, GreedyMatcher, JsonDailyStore, NoopReporter,
};
use reporting::ReportingClient;
use tracing::{debug, error, info, warn};
use video_ingest::{DeviceConnector, FfmpegConnector, FrameSourceOptions, LatestFrameSource};

use crate::counter::{
    config::{CaptureBackend, CounterConfig, DetectorSettings},
    dispatch::{ReportDispatcher, ReportWorker},
    processing::{FrameProcessor, Tick},
    telemetry,
    watchdog::{HealthComponent, PipelineHealth, WatchdogState, spawn_watchdog},
};

/// Read/connect timeout handed to the FFmpeg subprocess.
const FFMPEG_IO_TIMEOUT: Duration = Duration::from_secs(10);

/// Run the counter, automatically restarting on recoverable faults. Counts
/// are flushed to the daily store on exit.
pub fn run(config: CounterConfig) -> Result<()> {
    static CTRL_HANDLER: Once = Once::new();

    let _telemetry_guard = telemetry::enter_runtime(&config.telemetry);
    let _ = telemetry::init_metrics_recorder();

    let shutdown = Arc::new(AtomicBool::new(false));
    let handler_shutdown = shutdown.clone();
    CTRL_HANDLER.call_once(move || {
        if let Err(err) = ctrlc::set_handler(move || {
            handler_shutdown.store(true, Ordering::SeqCst);
        }) {
            warn!("Failed to install Ctrl+C handler: {err}");
        }
    });

    let (reporter, report_worker) = build_reporter(&config)?;
    let store = JsonDailyStore::new(config.data_dir.clone());
    info!("Daily summaries are written to {}", store.dir().display());
    let mut engine = CountEngine::new(
        config.engine.clone(),
        Box::new(GreedyMatcher::new(config.matcher)),
        reporter,
        Box::new(store),
        local_now(),
    );

    let mut attempt: u32 = 0;
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        match run_pipeline_once(&config, &mut engine, shutdown.clone()) {
            Ok(PipelineOutcome::Graceful) => break,
            Ok(PipelineOutcome::Restart(reason)) => {
                attempt = attempt.saturating_add(1);
                warn!("Pipeline watchdog requested restart (reason: {reason}), attempt #{attempt}");
                thread::sleep(Duration::from_secs(1));
            }
            Err(err) => {
                error!("Counter pipeline error: {err:?}");
                if shutdown.load(Ordering::SeqCst) {
                    break;
                }
                attempt = attempt.saturating_add(1);
                thread::sleep(Duration::from_secs(1));
            }
        }
    }

    if engine.flush(local_now()) {
        info!("Daily counts saved to {}", config.data_dir.display());
    }
    let snapshot = engine.snapshot();
    info!(
        hourly = snapshot.hourly_count,
        daily = snapshot.daily_count,
        total = snapshot.total_count,
        "Final counts"
    );
    match serde_json::to_string(&snapshot) {
        Ok(json) => debug!("Final snapshot: {json}"),
        Err(err) => debug!("Final snapshot unavailable: {err}"),
    }

    drop(engine);
    if let Some(worker) = report_worker {
        worker.join();
    }
    if let Some(handle) = telemetry::prometheus_handle() {
        debug!("Metrics at shutdown:\n{}", handle.render());
    }

    Ok(())
}

/// Open the source once, try the detector on the first frame and probe the
/// collector. Fails when no frame could be read.
pub fn probe(config: CounterConfig) -> Result<()> {
    let _telemetry_guard = telemetry::enter_runtime(&config.telemetry);

    let source = LatestFrameSource::new(build_connector(&config)?, source_options(&config));
    let described = source.describe();
    let frame = if source.connect() { source.read() } else { None };
    source.stop();

    match &frame {
        Some(captured) => info!(
            "Source {described} delivered a {}x{} frame",
            captured.frame.width, captured.frame.height
        ),
        None => error!("Source {described} did not deliver a frame"),
    }

    match (build_detector(&config), &frame) {
        (Ok(mut detector), Some(captured)) => match detector.detect(&captured.frame) {
            Ok(people) => info!("{} detector found {} people", detector.name(), people.len()),
            Err(err) => warn!("{} detector failed: {err}", detector.name()),
        },
        (Ok(detector), None) => info!("{} detector ready (no frame to test)", detector.name()),
        (Err(err), _) => warn!("Detector unavailable: {err:?}"),
    }

    match &config.reporting {
        Some(reporting) => {
            let client = ReportingClient::new(reporting.clone())
                .context("Invalid reporting configuration")?;
            if !client.health_check() {
                warn!("Collector at {} is unreachable", reporting.resolved_health_url());
            }
        }
        None => info!("No collector endpoint configured"),
    }

    if frame.is_none() {
        bail!("source {described} is unreachable");
    }
    Ok(())
}

/// Result of a single pipeline run attempt.
enum PipelineOutcome {
    Graceful,
    Restart(&'static str),
}

/// Execute the pipeline once, returning whether to exit or restart.
fn run_pipeline_once(
    config: &CounterConfig,
    engine: &mut CountEngine,
    shutdown: Arc<AtomicBool>,
) -> Result<PipelineOutcome> {
    if shutdown.load(Ordering::SeqCst) {
        return Ok(PipelineOutcome::Graceful);
    }

    let pipeline_span = tracing::info_span!(
        "counter.pipeline",
        source = tracing::field::Empty,
        device_id = %config.engine.device_id,
        location = %config.engine.location,
        detector = tracing::field::Empty,
    );
    let _pipeline_span_guard = pipeline_span.enter();

    let detector = build_detector(config).context("Failed to initialise detector")?;
    let mut processor = FrameProcessor::new(detector, config.frame_skip, config.verbose);
    pipeline_span.record("detector", processor.detector_name());

    let source = LatestFrameSource::new(build_connector(config)?, source_options(config));
    pipeline_span.record("source", tracing::field::display(source.describe()));
    debug!(
        "Capture source: {} ({})",
        source.describe(),
        config.source_kind.label()
    );
    if !source.connect() {
        warn!(
            "Initial connection to {} failed; retrying in the background",
            source.describe()
        );
    }
    source.start();

    let health = Arc::new(PipelineHealth::new(config.stall_timeout));
    let pipeline_running = Arc::new(AtomicBool::new(true));
    let watchdog_state = Arc::new(WatchdogState::new());
    let watchdog_handle = spawn_watchdog(
        health.clone(),
        pipeline_running.clone(),
        shutdown.clone(),
        watchdog_state.clone(),
    )
    .context("Failed to spawn watchdog thread")?;

    info!(
        "Counting people on {} with the {} detector; press Ctrl+C to stop",
        source.describe(),
        processor.detector_name()
    );

    while pipeline_running.load(Ordering::Relaxed) {
        if shutdown.load(Ordering::Relaxed) {
            pipeline_running.store(false, Ordering::SeqCst);
            break;
        }
        health.beat(HealthComponent::Processing);

        let latest = source.read();
        let fresh = processor.is_fresh(latest.as_ref());
        if fresh {
            health.beat(HealthComponent::Capture);
        }

        let tick = match latest.as_ref().map(|captured| captured.sequence) {
            Some(sequence) if fresh => tracing::info_span!("frame", frame = sequence)
                .in_scope(|| processor.tick(latest, engine, local_now())),
            _ => processor.tick(latest, engine, local_now()),
        };
        if let Tick::Processed { sequence, outcome } = &tick
            && outcome.resolved.iter().any(|r| r.newly_counted)
        {
            debug!(
                "frame #{sequence}: hourly={} daily={} total={}",
                outcome.hourly_count, outcome.daily_count, outcome.total_count
            );
        }

        thread::sleep(config.process_interval);
    }

    debug!("Stopping counter pipeline");
    pipeline_running.store(false, Ordering::SeqCst);
    source.stop();
    let _ = watchdog_handle.join();

    let stats = source.stats();
    info!(
        frames = stats.frames_captured,
        processed = processor.processed(),
        read_failures = stats.read_failures,
        reconnects = stats.reconnect_attempts,
        fps = processor.smoothed_fps(),
        "Capture stopped"
    );

    if watchdog_state.is_triggered() {
        let reason = watchdog_state
            .reason()
            .map(|component| component.label())
            .unwrap_or("watchdog");
        return Ok(PipelineOutcome::Restart(reason));
    }

    Ok(PipelineOutcome::Graceful)
}

fn local_now() -> NaiveDateTime {
    Local::now().naive_local()
}

fn source_options(config: &CounterConfig) -> FrameSourceOptions {
    FrameSourceOptions {
        reconnect: config.reconnect,
        frame_interval: config.capture_interval,
        ..FrameSourceOptions::default()
    }
}

fn build_reporter(config: &CounterConfig) -> Result<(Box<dyn CountReporter>, Option<ReportWorker>)> {
    let Some(reporting) = &config.reporting else {
        info!("No collector endpoint configured; hourly summaries are kept local");
        return Ok((Box::new(NoopReporter), None));
    };

    let client = ReportingClient::new(reporting.clone()).context("Invalid reporting configuration")?;
    if !client.health_check() {
        warn!(
            "Collector at {} is unreachable; data will only be stored locally until it recovers",
            reporting.endpoint
        );
    }

    let (dispatcher, worker) = ReportDispatcher::spawn(Box::new(client), config.report_queue)
        .context("Failed to spawn report worker")?;
    Ok((Box::new(dispatcher), Some(worker)))
}

fn build_connector(config: &CounterConfig) -> Result<Arc<dyn DeviceConnector>> {
    match config.backend {
        CaptureBackend::Ffmpeg => Ok(Arc::new(
            FfmpegConnector::new(
                config.source_uri.clone(),
                config.capture_size,
                FFMPEG_IO_TIMEOUT,
            )
            .with_screen(config.screen.clone()),
        )),
        CaptureBackend::Opencv => opencv_connector(config),
    }
}

#[cfg(feature = "opencv")]
fn opencv_connector(config: &CounterConfig) -> Result<Arc<dyn DeviceConnector>> {
    Ok(Arc::new(video_ingest::OpenCvConnector::new(
        config.source_uri.clone(),
        config.capture_size,
    )))
}

#[cfg(not(feature = "opencv"))]
fn opencv_connector(_config: &CounterConfig) -> Result<Arc<dyn DeviceConnector>> {
    bail!("OpenCV capture requires building with the `opencv` feature")
}

fn build_detector(config: &CounterConfig) -> Result<Box<dyn PersonDetector>> {
    match &config.detector {
        DetectorSettings::Remote { url, timeout } => {
            let detector = RemoteDetector::new(url.clone(), *timeout, config.detection)
                .context("Failed to build remote detector client")?;
            Ok(Box::new(detector))
        }
        DetectorSettings::TorchScript {
            model_path,
            input_size,
            use_cpu,
        } => load_torchscript(model_path, *input_size, *use_cpu, config.detection),
    }
}

#[cfg(feature = "with-tch")]
fn load_torchscript(
    model_path: &Path,
    input_size: (i64, i64),
    use_cpu: bool,
    detection: DetectorConfig,
) -> Result<Box<dyn PersonDetector>> {
    use ml_core::tch::Device;

    let device = if use_cpu {
        Device::Cpu
    } else {
        Device::cuda_if_available()
    };
    let detector = ml_core::TorchScriptDetector::new(model_path, device, input_size, detection)
        .with_context(|| format!("Failed to load TorchScript model {}", model_path.display()))?;
    debug!("Detector loaded on {:?}", detector.device());
    Ok(Box::new(detector))
}

#[cfg(not(feature = "with-tch"))]
fn load_torchscript(
    model_path: &Path,
    _input_size: (i64, i64),
    _use_cpu: bool,
    _detection: DetectorConfig,
) -> Result<Box<dyn PersonDetector>> {
    bail!(
        "Cannot load {}: TorchScript detection requires the `with-tch` feature",
        model_path.display()
    )
}
