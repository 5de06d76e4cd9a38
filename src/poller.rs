mod filter;
#[cfg(test)]
mod tests;

pub use filter::{BoundaryFilter, Verdict};

use crate::api::SampleSource;
use crate::checkpoint::CheckpointStore;
use crate::config::{Config, StartBound};
use crate::error::{CheckpointError, SensorCycleError, SinkError};
use crate::sample::{format_timestamp, Sample, Sensor};
use crate::sink::SampleSink;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

#[derive(Clone, Debug)]
pub struct PollerSettings {
    pub page_limit: usize,
    pub default_start: DateTime<Utc>,
    pub start_bound: StartBound,
    pub sensor_concurrency: usize,
}

impl PollerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            page_limit: config.page_limit as usize,
            default_start: config.default_start_time,
            start_bound: config.start_bound,
            sensor_concurrency: config.sensor_concurrency,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    /// The upstream returned a short page: nothing more to fetch.
    Exhausted,
    /// A full page held nothing newer than the cursor.
    Stalled,
    Cancelled,
    Failed,
}

#[derive(Clone, Debug)]
pub struct SensorReport {
    pub sensor_id: String,
    pub pages: usize,
    pub fetched: usize,
    pub sunk: usize,
    pub dropped: usize,
    pub checkpoint: Option<DateTime<Utc>>,
    pub stop: StopReason,
}

impl SensorReport {
    fn new(sensor: &Sensor) -> Self {
        Self {
            sensor_id: sensor.id.clone(),
            pages: 0,
            fetched: 0,
            sunk: 0,
            dropped: 0,
            checkpoint: None,
            stop: StopReason::Failed,
        }
    }
}

#[derive(Debug)]
pub struct SensorOutcome {
    pub report: SensorReport,
    pub error: Option<SensorCycleError>,
}

#[derive(Debug, Default)]
pub struct CycleReport {
    pub sensors: Vec<SensorReport>,
    pub failed: usize,
}

impl CycleReport {
    pub fn sunk(&self) -> usize {
        self.sensors.iter().map(|sensor| sensor.sunk).sum()
    }
}

/// Drives incremental ingestion: for each sensor, fetch pages from its
/// checkpoint, sink the new samples and advance the checkpoint page by page.
pub struct Poller<A, C, S> {
    source: A,
    checkpoints: C,
    sink: S,
    sensors: Vec<Sensor>,
    settings: PollerSettings,
}

impl<A, C, S> Poller<A, C, S>
where
    A: SampleSource,
    C: CheckpointStore,
    S: SampleSink,
{
    pub fn new(
        source: A,
        checkpoints: C,
        sink: S,
        sensors: Vec<Sensor>,
        settings: PollerSettings,
    ) -> Self {
        Self {
            source,
            checkpoints,
            sink,
            sensors,
            settings,
        }
    }

    /// Runs one cycle over every sensor. Per-sensor failures are reported and
    /// skipped; a checkpoint failure stops the cycle and is returned.
    pub async fn run_cycle(
        &self,
        cancel: &CancellationToken,
    ) -> Result<CycleReport, CheckpointError> {
        let abort = cancel.child_token();
        let mut outcomes = futures::stream::iter(self.sensors.iter())
            .map(|sensor| self.run_sensor(sensor, &abort))
            .buffer_unordered(self.settings.sensor_concurrency.max(1));

        let mut report = CycleReport::default();
        let mut fatal = None;
        while let Some(outcome) = outcomes.next().await {
            let SensorOutcome {
                report: sensor_report,
                error,
            } = outcome;
            log_sensor_outcome(&sensor_report, error.as_ref());
            match error {
                Some(SensorCycleError::Checkpoint(err)) => {
                    report.failed += 1;
                    if fatal.is_none() {
                        abort.cancel();
                        fatal = Some(err);
                    }
                }
                Some(_) => report.failed += 1,
                None => {}
            }
            report.sensors.push(sensor_report);
        }

        match fatal {
            Some(err) => Err(err),
            None => Ok(report),
        }
    }

    #[tracing::instrument(name = "sensor", skip_all, fields(sensor_id = %sensor.id))]
    pub async fn run_sensor(&self, sensor: &Sensor, cancel: &CancellationToken) -> SensorOutcome {
        let mut report = SensorReport::new(sensor);
        let error = match self.drain(sensor, cancel, &mut report).await {
            Ok(stop) => {
                report.stop = stop;
                None
            }
            Err(err) => {
                report.stop = StopReason::Failed;
                Some(err)
            }
        };
        SensorOutcome { report, error }
    }

    async fn drain(
        &self,
        sensor: &Sensor,
        cancel: &CancellationToken,
        report: &mut SensorReport,
    ) -> Result<StopReason, SensorCycleError> {
        if cancel.is_cancelled() {
            return Ok(StopReason::Cancelled);
        }
        let stored = self.checkpoints.load(sensor).await?;
        report.checkpoint = stored;
        let mut filter = match stored {
            Some(checkpoint) => BoundaryFilter::after(checkpoint),
            None => BoundaryFilter::starting_at(self.settings.default_start),
        };
        let limit = self.settings.page_limit;

        loop {
            if cancel.is_cancelled() {
                return Ok(StopReason::Cancelled);
            }

            let cursor = filter.cursor();
            // An inclusive upstream spends one slot of each page on the
            // already-sunk cursor sample; ask for one more so it cannot fill it.
            let request = match self.settings.start_bound {
                StartBound::Inclusive if !filter.includes_cursor() => limit + 1,
                _ => limit,
            };
            let page = self.source.fetch_page(sensor, cursor, request).await?;
            report.pages += 1;
            report.fetched += page.len();
            let full = page.len() >= request;

            let mut fresh: Vec<Sample> = Vec::with_capacity(page.len());
            for sample in page {
                match filter.admit(&sample) {
                    Verdict::New => fresh.push(sample),
                    Verdict::Behind => {
                        report.dropped += 1;
                        if sample.timestamp == cursor
                            && self.settings.start_bound == StartBound::Exclusive
                        {
                            warn!(
                                observed = %format_timestamp(sample.timestamp),
                                "upstream returned the start boundary although configured exclusive"
                            );
                        }
                    }
                    Verdict::Repeat => report.dropped += 1,
                }
            }

            let Some(newest) = fresh.iter().map(|sample| sample.timestamp).max() else {
                if full {
                    warn!(
                        cursor = %format_timestamp(cursor),
                        limit = request,
                        "full page with no new samples; stopping until next cycle"
                    );
                    return Ok(StopReason::Stalled);
                }
                return Ok(StopReason::Exhausted);
            };
            fresh.sort_by_key(|sample| sample.timestamp);

            let written = self.sink.write(sensor, &fresh).await?;
            if written != fresh.len() {
                return Err(SinkError::Partial {
                    written,
                    failed: fresh.len().saturating_sub(written),
                    first_error: "sink acknowledged fewer samples than sent".to_string(),
                }
                .into());
            }
            report.sunk += written;

            let checkpoint = self
                .checkpoints
                .advance(sensor, newest)
                .instrument(info_span!("advance_checkpoint"))
                .await?;
            report.checkpoint = Some(checkpoint);
            filter.advance(checkpoint);
            debug!(
                page = report.pages,
                written,
                checkpoint = %format_timestamp(checkpoint),
                "page sunk"
            );

            if !full {
                return Ok(StopReason::Exhausted);
            }
        }
    }
}

fn log_sensor_outcome(report: &SensorReport, error: Option<&SensorCycleError>) {
    let checkpoint = report
        .checkpoint
        .map(format_timestamp)
        .unwrap_or_else(|| "none".to_string());
    match error {
        None => info!(
            sensor_id = %report.sensor_id,
            pages = report.pages,
            fetched = report.fetched,
            sunk = report.sunk,
            dropped = report.dropped,
            checkpoint = %checkpoint,
            stop = ?report.stop,
            "sensor cycle finished"
        ),
        Some(err) if err.is_fatal() => error!(
            sensor_id = %report.sensor_id,
            pages = report.pages,
            sunk = report.sunk,
            checkpoint = %checkpoint,
            error = %err,
            "checkpoint store failed; aborting cycle"
        ),
        Some(err) => warn!(
            sensor_id = %report.sensor_id,
            pages = report.pages,
            sunk = report.sunk,
            checkpoint = %checkpoint,
            error = %err,
            "sensor cycle failed; will resume from checkpoint next cycle"
        ),
    }
}
