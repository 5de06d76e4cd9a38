use crate::api::SampleSource;
use crate::checkpoint::CheckpointStore;
use crate::poller::Poller;
use crate::sink::SampleSink;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, Instrument};

/// Runs polling cycles back to back with `interval` of sleep in between
/// until `cancel` fires. A running cycle is never interrupted mid-page; the
/// poller observes the token between pages. Returns the number of cycles run.
pub async fn run<A, C, S>(
    poller: &Poller<A, C, S>,
    interval: Duration,
    cancel: CancellationToken,
) -> u64
where
    A: SampleSource,
    C: CheckpointStore,
    S: SampleSink,
{
    let mut cycles = 0u64;
    while !cancel.is_cancelled() {
        cycles += 1;
        let started = Instant::now();
        let span = info_span!("cycle", cycle = cycles);
        match poller.run_cycle(&cancel).instrument(span).await {
            Ok(report) => info!(
                cycle = cycles,
                sensors = report.sensors.len(),
                failed = report.failed,
                sunk = report.sunk(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "cycle finished"
            ),
            Err(err) => error!(
                cycle = cycles,
                error = %err,
                "cycle aborted; checkpoint store unavailable"
            ),
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sleep(interval) => {}
        }
    }
    info!(cycles, "scheduler stopped");
    cycles
}
