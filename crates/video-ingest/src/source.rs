//! Single-slot, most-recent-wins frame source with a self-healing acquisition
//! loop.
//!
//! One background thread owns the device. It keeps overwriting a shared slot
//! with the newest decoded frame; consumers read that slot without ever
//! waiting on the device. Read failures release the device and fall into a
//! reconnect path with bounded exponential backoff that repeats for as long
//! as the source is running.

use std::{
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use tracing::{debug, info, warn};

use crate::types::{CaptureDevice, DeviceConnector, Frame};

/// Delay policy applied between reconnect attempts.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ReconnectPolicy {
    /// Wait before the first reconnect attempt after a failure.
    pub initial: Duration,
    /// Growth factor applied per consecutive failed attempt. `1.0` keeps the
    /// interval fixed.
    pub multiplier: f64,
    /// Upper bound on any single wait.
    pub max: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(2),
            multiplier: 2.0,
            max: Duration::from_secs(30),
        }
    }
}

impl ReconnectPolicy {
    /// Wait before reconnect attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(64) as i32;
        let factor = self.multiplier.max(1.0).powi(exponent);
        let scaled = self.initial.as_secs_f64() * factor;
        if !scaled.is_finite() || scaled >= self.max.as_secs_f64() {
            return self.max.max(self.initial);
        }
        Duration::from_secs_f64(scaled)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct FrameSourceOptions {
    pub reconnect: ReconnectPolicy,
    /// Pause between device reads so the loop never busy-spins.
    pub frame_interval: Duration,
    /// How long `stop` waits for the acquisition thread before detaching it.
    pub stop_timeout: Duration,
}

impl Default for FrameSourceOptions {
    fn default() -> Self {
        Self {
            reconnect: ReconnectPolicy::default(),
            frame_interval: Duration::from_millis(33),
            stop_timeout: Duration::from_secs(2),
        }
    }
}

/// Latest frame as seen by consumers. The frame itself is immutable once
/// published, so clones are cheap snapshots the producer can never touch.
#[derive(Clone, Debug)]
pub struct CapturedFrame {
    pub frame: Arc<Frame>,
    /// Monotonic publish counter, starting at 1.
    pub sequence: u64,
    pub captured_at: Instant,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SourceStats {
    pub connected: bool,
    pub frames_captured: u64,
    pub read_failures: u64,
    pub reconnect_attempts: u64,
    pub consecutive_failures: u32,
}

struct Shared {
    connector: Arc<dyn DeviceConnector>,
    slot: Mutex<Option<CapturedFrame>>,
    device: Mutex<Option<Box<dyn CaptureDevice>>>,
    running: AtomicBool,
    connected: AtomicBool,
    sequence: AtomicU64,
    read_failures: AtomicU64,
    reconnect_attempts: AtomicU64,
    consecutive_failures: AtomicU32,
}

struct Worker {
    stop_tx: Sender<()>,
    /// Disconnects when the acquisition thread exits.
    done_rx: Receiver<()>,
    handle: JoinHandle<()>,
}

/// Live connection to one camera or stream exposing latest-frame semantics.
pub struct LatestFrameSource {
    shared: Arc<Shared>,
    options: FrameSourceOptions,
    worker: Mutex<Option<Worker>>,
}

impl LatestFrameSource {
    pub fn new(connector: Arc<dyn DeviceConnector>, options: FrameSourceOptions) -> Self {
        Self {
            shared: Arc::new(Shared {
                connector,
                slot: Mutex::new(None),
                device: Mutex::new(None),
                running: AtomicBool::new(false),
                connected: AtomicBool::new(false),
                sequence: AtomicU64::new(0),
                read_failures: AtomicU64::new(0),
                reconnect_attempts: AtomicU64::new(0),
                consecutive_failures: AtomicU32::new(0),
            }),
            options,
            worker: Mutex::new(None),
        }
    }

    pub fn describe(&self) -> String {
        self.shared.connector.describe()
    }

    /// Open the device and decode a first frame. Failures are logged and
    /// reported as `false`.
    pub fn connect(&self) -> bool {
        self.shared.connect()
    }

    /// Begin the background acquisition loop. Calling this while the loop is
    /// already running does nothing.
    pub fn start(&self) {
        let mut worker = lock(&self.worker);
        if let Some(existing) = worker.as_ref() {
            if !existing.handle.is_finished() {
                debug!(source = %self.describe(), "frame source already running");
                return;
            }
        }
        if let Some(stale) = worker.take() {
            let _ = stale.handle.join();
        }

        let (stop_tx, stop_rx) = bounded::<()>(1);
        let (done_tx, done_rx) = bounded::<()>(0);
        self.shared.running.store(true, Ordering::SeqCst);
        let shared = self.shared.clone();
        let options = self.options;
        let spawned = thread::Builder::new()
            .name("frame-source".into())
            .spawn(move || {
                acquisition_loop(shared, options, stop_rx);
                drop(done_tx);
            });

        match spawned {
            Ok(handle) => {
                info!(source = %self.describe(), "frame acquisition started");
                *worker = Some(Worker {
                    stop_tx,
                    done_rx,
                    handle,
                });
            }
            Err(err) => {
                self.shared.running.store(false, Ordering::SeqCst);
                warn!(source = %self.describe(), "failed to spawn acquisition thread: {err}");
            }
        }
    }

    /// Latest captured frame, or `None` when nothing has ever been decoded.
    /// Never waits on the device.
    pub fn read(&self) -> Option<CapturedFrame> {
        lock(&self.shared.slot).clone()
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> SourceStats {
        SourceStats {
            connected: self.shared.connected.load(Ordering::Relaxed),
            frames_captured: self.shared.sequence.load(Ordering::Relaxed),
            read_failures: self.shared.read_failures.load(Ordering::Relaxed),
            reconnect_attempts: self.shared.reconnect_attempts.load(Ordering::Relaxed),
            consecutive_failures: self.shared.consecutive_failures.load(Ordering::Relaxed),
        }
    }

    /// Stop the acquisition loop, wait up to `stop_timeout` for it to exit,
    /// then release the device. A thread stuck inside a device read is
    /// detached and drops its device once the read returns.
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        let worker = lock(&self.worker).take();
        if let Some(Worker {
            stop_tx,
            done_rx,
            handle,
        }) = worker
        {
            drop(stop_tx);
            match done_rx.recv_timeout(self.options.stop_timeout) {
                Err(RecvTimeoutError::Timeout) => {
                    warn!(
                        source = %self.describe(),
                        timeout_ms = self.options.stop_timeout.as_millis() as u64,
                        "acquisition thread stuck in a device read; detaching it"
                    );
                }
                _ => {
                    if handle.join().is_err() {
                        warn!(source = %self.describe(), "acquisition thread panicked");
                    }
                    info!(source = %self.describe(), "frame acquisition stopped");
                }
            }
        }
        self.shared.release_device();
    }
}

impl Drop for LatestFrameSource {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Shared {
    fn connect(&self) -> bool {
        let source = self.connector.describe();
        let mut device = match self.connector.open() {
            Ok(device) => device,
            Err(err) => {
                warn!(%source, "failed to open video source: {err}");
                self.note_failure();
                return false;
            }
        };

        match device.read_frame() {
            Ok(frame) => {
                self.publish(frame);
                *lock(&self.device) = Some(device);
                self.connected.store(true, Ordering::SeqCst);
                self.consecutive_failures.store(0, Ordering::Relaxed);
                info!(%source, "video source connected");
                true
            }
            Err(err) => {
                warn!(%source, "video source opened but first frame failed: {err}");
                self.note_failure();
                false
            }
        }
    }

    fn publish(&self, frame: Frame) {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let captured = CapturedFrame {
            frame: Arc::new(frame),
            sequence,
            captured_at: Instant::now(),
        };
        *lock(&self.slot) = Some(captured);
        metrics::counter!("ingest_frames_total").increment(1);
    }

    fn note_failure(&self) {
        self.read_failures.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("ingest_read_failures_total").increment(1);
    }

    fn release_device(&self) {
        let released = lock(&self.device).take();
        self.connected.store(false, Ordering::SeqCst);
        drop(released);
    }
}

fn acquisition_loop(shared: Arc<Shared>, options: FrameSourceOptions, stop_rx: Receiver<()>) {
    let mut attempt: u32 = 0;

    while shared.running.load(Ordering::SeqCst) {
        if shared.connected.load(Ordering::SeqCst) {
            // The device leaves the mutex for the duration of the read so
            // `stop` never waits on a stalled device.
            let taken = lock(&shared.device).take();
            match taken {
                Some(mut device) => match device.read_frame() {
                    Ok(frame) => {
                        shared.publish(frame);
                        shared.consecutive_failures.store(0, Ordering::Relaxed);
                        if shared.running.load(Ordering::SeqCst) {
                            *lock(&shared.device) = Some(device);
                        } else {
                            drop(device);
                            shared.connected.store(false, Ordering::SeqCst);
                        }
                    }
                    Err(err) => {
                        warn!(
                            source = %shared.connector.describe(),
                            "frame read failed ({err}); releasing device and reconnecting"
                        );
                        shared.note_failure();
                        drop(device);
                        shared.connected.store(false, Ordering::SeqCst);
                    }
                },
                None => shared.connected.store(false, Ordering::SeqCst),
            }
        }

        if !shared.connected.load(Ordering::SeqCst) {
            attempt = attempt.saturating_add(1);
            let delay = options.reconnect.delay_for(attempt);
            debug!(attempt, delay_ms = delay.as_millis() as u64, "waiting before reconnect");
            if stop_requested(&stop_rx, delay) {
                break;
            }
            shared.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("ingest_reconnect_attempts_total").increment(1);
            if shared.connect() {
                attempt = 0;
            }
            continue;
        }

        if stop_requested(&stop_rx, options.frame_interval) {
            break;
        }
    }
}

/// Sleep for `delay` unless a stop is signalled first.
fn stop_requested(stop_rx: &Receiver<()>, delay: Duration) -> bool {
    !matches!(stop_rx.recv_timeout(delay), Err(RecvTimeoutError::Timeout))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let policy = ReconnectPolicy {
            initial: Duration::from_secs(2),
            multiplier: 2.0,
            max: Duration::from_secs(10),
        };
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(3), Duration::from_secs(8));
        assert_eq!(policy.delay_for(4), Duration::from_secs(10));
        assert_eq!(policy.delay_for(400), Duration::from_secs(10));
    }

    #[test]
    fn unit_multiplier_keeps_interval_fixed() {
        let policy = ReconnectPolicy {
            initial: Duration::from_secs(3),
            multiplier: 1.0,
            max: Duration::from_secs(30),
        };
        for attempt in 1..10 {
            assert_eq!(policy.delay_for(attempt), Duration::from_secs(3));
        }
    }
}
