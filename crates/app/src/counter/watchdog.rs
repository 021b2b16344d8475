use std::{
    io,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use tracing::{error, info, warn};

use crate::counter::telemetry::spawn_thread;

pub(crate) const WATCHDOG_POLL_INTERVAL_MS: u64 = 500;
pub(crate) const WATCHDOG_STARTUP_GRACE_MS: u64 = 5_000;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum HealthComponent {
    Capture,
    Processing,
}

impl HealthComponent {
    pub(crate) fn label(self) -> &'static str {
        match self {
            HealthComponent::Capture => "capture",
            HealthComponent::Processing => "processing",
        }
    }
}

/// Last heartbeat per stage, in unix millis. Initialised in the future so a
/// fresh pipeline gets a startup grace period.
pub(crate) struct PipelineHealth {
    capture: AtomicU64,
    processing: AtomicU64,
    stale_after_ms: u64,
}

impl PipelineHealth {
    pub(crate) fn new(stale_after: Duration) -> Self {
        Self::starting_at(current_millis(), stale_after)
    }

    fn starting_at(now: u64, stale_after: Duration) -> Self {
        let grace_deadline = now.saturating_add(WATCHDOG_STARTUP_GRACE_MS);
        Self {
            capture: AtomicU64::new(grace_deadline),
            processing: AtomicU64::new(grace_deadline),
            stale_after_ms: stale_after.as_millis() as u64,
        }
    }

    pub(crate) fn beat(&self, component: HealthComponent) {
        self.beat_at(component, current_millis());
    }

    fn beat_at(&self, component: HealthComponent, now: u64) {
        match component {
            HealthComponent::Capture => self.capture.store(now, Ordering::Relaxed),
            HealthComponent::Processing => self.processing.store(now, Ordering::Relaxed),
        }
    }

    pub(crate) fn is_stale(&self, component: HealthComponent, now: u64) -> bool {
        let last = match component {
            HealthComponent::Capture => self.capture.load(Ordering::Relaxed),
            HealthComponent::Processing => self.processing.load(Ordering::Relaxed),
        };
        now.saturating_sub(last) > self.stale_after_ms
    }
}

pub(crate) struct WatchdogState {
    triggered: AtomicBool,
    reason: Mutex<Option<HealthComponent>>,
}

impl WatchdogState {
    pub(crate) fn new() -> Self {
        Self {
            triggered: AtomicBool::new(false),
            reason: Mutex::new(None),
        }
    }

    pub(crate) fn arm(&self, component: HealthComponent) {
        if let Ok(mut guard) = self.reason.lock() {
            *guard = Some(component);
        }
        self.triggered.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    pub(crate) fn reason(&self) -> Option<HealthComponent> {
        match self.reason.lock() {
            Ok(guard) => *guard,
            Err(_) => None,
        }
    }
}

/// Poll heartbeats until the pipeline stops. A stalled processing loop arms
/// the watchdog and stops the pipeline; a stalled capture is only logged
/// because the frame source reconnects on its own.
pub(crate) fn spawn_watchdog(
    health: Arc<PipelineHealth>,
    running: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
    state: Arc<WatchdogState>,
) -> io::Result<thread::JoinHandle<()>> {
    spawn_thread("counter-watchdog", move || {
        let mut capture_stalled = false;
        while running.load(Ordering::Relaxed) && !shutdown.load(Ordering::Relaxed) {
            thread::sleep(Duration::from_millis(WATCHDOG_POLL_INTERVAL_MS));
            let now = current_millis();

            if health.is_stale(HealthComponent::Processing, now) {
                error!(
                    "Watchdog detected stalled {} stage; requesting pipeline restart",
                    HealthComponent::Processing.label()
                );
                state.arm(HealthComponent::Processing);
                running.store(false, Ordering::SeqCst);
                break;
            }

            match (health.is_stale(HealthComponent::Capture, now), capture_stalled) {
                (true, false) => {
                    warn!("No new frames from the capture stage; source is reconnecting");
                    capture_stalled = true;
                }
                (false, true) => {
                    info!("Capture stage recovered");
                    capture_stalled = false;
                }
                _ => {}
            }
        }
    })
}

pub(crate) fn current_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
