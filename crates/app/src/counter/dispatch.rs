//! Off-thread delivery of hourly summaries.
//!
//! The engine calls [`ReportDispatcher::report`] from the processing loop;
//! the summary is queued and a dedicated worker performs the network call, so
//! a slow collector never stalls counting.

use std::{io, thread};

use crossbeam_channel::{Receiver, Sender, TrySendError};
use occupancy::{CountReporter, HourlySummary, ReportOutcome};
use tracing::{debug, warn};

use crate::counter::telemetry::spawn_thread;

pub(crate) struct ReportDispatcher {
    tx: Sender<HourlySummary>,
}

/// Join handle for the delivery worker. Joining drains every queued summary.
pub(crate) struct ReportWorker {
    handle: thread::JoinHandle<()>,
}

impl ReportWorker {
    pub(crate) fn join(self) {
        if self.handle.join().is_err() {
            warn!("report worker panicked");
        }
    }
}

impl ReportDispatcher {
    pub(crate) fn spawn(
        reporter: Box<dyn CountReporter>,
        capacity: usize,
    ) -> io::Result<(Self, ReportWorker)> {
        let (tx, rx) = crossbeam_channel::bounded(capacity.max(1));
        let handle = spawn_thread("report-worker", move || deliver(reporter, rx))?;
        Ok((Self { tx }, ReportWorker { handle }))
    }
}

fn deliver(reporter: Box<dyn CountReporter>, rx: Receiver<HourlySummary>) {
    for summary in rx.iter() {
        let outcome = reporter.report(&summary);
        debug!(ok = outcome.ok, info = %outcome.info, "report delivery finished");
    }
    debug!("report worker exiting");
}

impl CountReporter for ReportDispatcher {
    fn report(&self, summary: &HourlySummary) -> ReportOutcome {
        match self.tx.try_send(summary.clone()) {
            Ok(()) => ReportOutcome::success("queued for delivery"),
            Err(TrySendError::Full(dropped)) => {
                warn!(
                    hourly_count = dropped.hourly_count,
                    "report queue full; dropping hourly summary"
                );
                ReportOutcome::failure("report queue full")
            }
            Err(TrySendError::Disconnected(_)) => {
                ReportOutcome::failure("report worker stopped")
            }
        }
    }
}
