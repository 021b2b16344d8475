//! Log output and metrics for the counter.
//!
//! Events go to stdout through the fmt layer, filtered by `RUST_LOG`
//! (default `info`). With `--chrome-trace` the `counter.pipeline` span and the
//! per-frame `frame` spans are also written to a Chrome trace file. Counters
//! and gauges from every crate land in one Prometheus recorder whose render is
//! logged at shutdown.

use std::{io, path::Path, sync::OnceLock, thread, time::Duration};

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::warn;
use tracing_subscriber::{
    filter::{EnvFilter, filter_fn},
    fmt,
    layer::SubscriberExt,
    prelude::*,
};

use crate::counter::config::TelemetryOptions;

static PROM_HANDLE: OnceLock<Option<PrometheusHandle>> = OnceLock::new();
static PROM_UPKEEP_THREAD: OnceLock<thread::JoinHandle<()>> = OnceLock::new();

/// Keeps the counter's subscriber installed and the Chrome trace open.
pub(crate) struct TelemetryGuard {
    _default_guard: tracing::subscriber::DefaultGuard,
    _chrome_guard: Option<tracing_chrome::FlushGuard>,
}

/// Install the Prometheus recorder that collects `occupancy_*`, `ingest_*`,
/// `detector_*` and `reporting_*` series. `None` when another recorder
/// already owns the global slot.
pub(crate) fn init_metrics_recorder() -> Option<&'static PrometheusHandle> {
    PROM_HANDLE
        .get_or_init(|| {
            let recorder = PrometheusBuilder::new().build_recorder();
            let handle = recorder.handle();

            if let Err(err) = metrics::set_global_recorder(recorder) {
                warn!("metrics recorder unavailable: {err}");
                return None;
            }

            let upkeep_handle = handle.clone();
            let spawned = spawn_thread("prometheus-upkeep", move || {
                loop {
                    thread::sleep(Duration::from_secs(5));
                    upkeep_handle.run_upkeep();
                }
            });
            match spawned {
                Ok(join) => {
                    let _ = PROM_UPKEEP_THREAD.set(join);
                }
                Err(err) => warn!("failed to spawn prometheus upkeep thread: {err}"),
            }

            Some(handle)
        })
        .as_ref()
}

/// Access the Prometheus handle when already initialised.
pub(crate) fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROM_HANDLE.get().and_then(Option::as_ref)
}

/// Install the counter's subscriber on this thread. Threads started through
/// [`spawn_thread`] inherit it, so the capture watchdog and report worker
/// log under the same filter and spans.
pub(crate) fn enter_runtime(opts: &TelemetryOptions) -> TelemetryGuard {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (chrome, chrome_guard) = match opts.chrome_trace_path.as_deref() {
        Some(path) => match build_chrome_layer(path) {
            Ok((layer, guard)) => (Some(layer), Some(guard)),
            Err(err) => {
                eprintln!("chrome trace disabled, cannot write {}: {err}", path.display());
                (None, None)
            }
        },
        None => (None, None),
    };

    // Chrome output only carries spans; per-frame events stay in the log.
    let spans_only = chrome.map(|layer| layer.with_filter(filter_fn(|meta| meta.is_span())));
    let log = fmt::layer()
        .with_target(false)
        .with_timer(fmt::time::uptime())
        .with_filter(env_filter);

    let default_guard = tracing::subscriber::set_default(
        tracing_subscriber::registry()
            .with(spans_only)
            .with(log)
            .with(tracing_error::ErrorLayer::default()),
    );

    TelemetryGuard {
        _default_guard: default_guard,
        _chrome_guard: chrome_guard,
    }
}

/// Spawn a thread that inherits the current tracing dispatcher.
pub(crate) fn spawn_thread<F, T>(name: impl Into<String>, f: F) -> io::Result<thread::JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let dispatch = tracing::dispatcher::get_default(|current| current.clone());
    thread::Builder::new()
        .name(name.into())
        .spawn(move || tracing::dispatcher::with_default(&dispatch, f))
}

fn build_chrome_layer(
    path: &Path,
) -> Result<
    (
        tracing_chrome::ChromeLayer<tracing_subscriber::Registry>,
        tracing_chrome::FlushGuard,
    ),
    std::io::Error,
> {
    let file = std::fs::File::create(path)?;
    let (layer, guard) = tracing_chrome::ChromeLayerBuilder::new()
        .writer(file)
        .include_args(true)
        .trace_style(tracing_chrome::TraceStyle::Threaded)
        .build();
    Ok((layer, guard))
}
