use super::{Poller, PollerSettings, StopReason};
use crate::api::SampleSource;
use crate::checkpoint::CheckpointStore;
use crate::config::StartBound;
use crate::error::{ApiError, CheckpointError, SensorCycleError, SinkError};
use crate::sample::{parse_timestamp, Measure, Sample, Sensor};
use crate::sink::SampleSink;
use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

fn t0() -> DateTime<Utc> {
    parse_timestamp("2025-01-01T00:00:00Z").unwrap()
}

/// The sample observed `offset` seconds after `t0`.
fn at(offset: i64) -> DateTime<Utc> {
    t0() + Duration::seconds(offset)
}

fn sample(sensor_id: &str, offset: i64) -> Sample {
    let mut measures = BTreeMap::new();
    measures.insert(Measure::Temperature, offset as f64);
    Sample {
        sensor_id: sensor_id.to_string(),
        timestamp: at(offset),
        gateways: None,
        measures,
        raw: json!({ "observed": at(offset).to_rfc3339(), "temperature": offset }),
    }
}

fn sensor(id: &str) -> Sensor {
    Sensor {
        id: id.to_string(),
        name: format!("sensor {id}"),
        description: String::new(),
    }
}

fn settings(page_limit: usize) -> PollerSettings {
    PollerSettings {
        page_limit,
        default_start: t0(),
        start_bound: StartBound::Inclusive,
        sensor_concurrency: 1,
    }
}

fn exclusive_settings(page_limit: usize) -> PollerSettings {
    PollerSettings {
        start_bound: StartBound::Exclusive,
        ..settings(page_limit)
    }
}

#[derive(Default)]
struct FakeSource {
    inclusive: bool,
    samples: Mutex<HashMap<String, Vec<Sample>>>,
    calls: Mutex<Vec<(String, DateTime<Utc>, usize)>>,
    /// 1-based call numbers that fail with an exhausted transient error.
    fail_calls: Mutex<HashSet<usize>>,
    fail_sensors: Mutex<HashSet<String>>,
}

impl FakeSource {
    fn inclusive() -> Arc<Self> {
        Arc::new(Self {
            inclusive: true,
            ..Self::default()
        })
    }

    fn exclusive() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn publish(&self, sensor_id: &str, offsets: impl IntoIterator<Item = i64>) {
        let mut samples = self.samples.lock().unwrap();
        let stream = samples.entry(sensor_id.to_string()).or_default();
        stream.extend(offsets.into_iter().map(|offset| sample(sensor_id, offset)));
        stream.sort_by_key(|sample| sample.timestamp);
    }

    fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn calls_for(&self, sensor_id: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _, _)| id == sensor_id)
            .count()
    }
}

impl SampleSource for Arc<FakeSource> {
    async fn fetch_page(
        &self,
        sensor: &Sensor,
        start: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Sample>, ApiError> {
        let call = {
            let mut calls = self.calls.lock().unwrap();
            calls.push((sensor.id.clone(), start, limit));
            calls.len()
        };
        let failing = self.fail_calls.lock().unwrap().contains(&call)
            || self.fail_sensors.lock().unwrap().contains(&sensor.id);
        if failing {
            return Err(ApiError::RetriesExhausted {
                attempts: 6,
                last: Box::new(ApiError::Transient {
                    status: Some(503),
                    message: "unavailable".to_string(),
                    retry_after: None,
                }),
            });
        }
        let samples = self.samples.lock().unwrap();
        Ok(samples
            .get(&sensor.id)
            .map(|stream| {
                stream
                    .iter()
                    .filter(|sample| {
                        if self.inclusive {
                            sample.timestamp >= start
                        } else {
                            sample.timestamp > start
                        }
                    })
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[derive(Default)]
struct FakeSink {
    stored: Mutex<Vec<Sample>>,
    batches: Mutex<Vec<usize>>,
    /// 1-based write numbers that fail.
    fail_writes: Mutex<HashSet<usize>>,
    cancel_after_write: Mutex<Option<CancellationToken>>,
}

impl FakeSink {
    fn batch_sizes(&self) -> Vec<usize> {
        self.batches.lock().unwrap().clone()
    }

    fn stored_offsets(&self, sensor_id: &str) -> Vec<i64> {
        let mut offsets: Vec<i64> = self
            .stored
            .lock()
            .unwrap()
            .iter()
            .filter(|sample| sample.sensor_id == sensor_id)
            .map(|sample| (sample.timestamp - t0()).num_seconds())
            .collect();
        offsets.sort_unstable();
        offsets
    }
}

impl SampleSink for Arc<FakeSink> {
    async fn write(&self, _sensor: &Sensor, samples: &[Sample]) -> Result<usize, SinkError> {
        let write = {
            let mut batches = self.batches.lock().unwrap();
            batches.push(samples.len());
            batches.len()
        };
        if self.fail_writes.lock().unwrap().contains(&write) {
            return Err(SinkError::Transport("connection reset".to_string()));
        }
        self.stored.lock().unwrap().extend(samples.iter().cloned());
        if let Some(token) = self.cancel_after_write.lock().unwrap().as_ref() {
            token.cancel();
        }
        Ok(samples.len())
    }
}

#[derive(Default)]
struct FakeStore {
    checkpoints: Mutex<HashMap<String, DateTime<Utc>>>,
    advances: Mutex<Vec<(String, DateTime<Utc>)>>,
    fail_advance: bool,
}

impl FakeStore {
    fn get(&self, sensor_id: &str) -> Option<DateTime<Utc>> {
        self.checkpoints.lock().unwrap().get(sensor_id).copied()
    }

    fn set(&self, sensor_id: &str, value: DateTime<Utc>) {
        self.checkpoints
            .lock()
            .unwrap()
            .insert(sensor_id.to_string(), value);
    }

    fn advance_count(&self) -> usize {
        self.advances.lock().unwrap().len()
    }
}

impl CheckpointStore for Arc<FakeStore> {
    async fn load(&self, sensor: &Sensor) -> Result<Option<DateTime<Utc>>, CheckpointError> {
        Ok(self.get(&sensor.id))
    }

    async fn advance(
        &self,
        sensor: &Sensor,
        observed: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, CheckpointError> {
        if self.fail_advance {
            return Err(CheckpointError::Unavailable("disk full".to_string()));
        }
        self.advances
            .lock()
            .unwrap()
            .push((sensor.id.clone(), observed));
        let mut checkpoints = self.checkpoints.lock().unwrap();
        let stored = checkpoints.entry(sensor.id.clone()).or_insert(observed);
        if observed > *stored {
            *stored = observed;
        }
        Ok(*stored)
    }
}

type FakePoller = Poller<Arc<FakeSource>, Arc<FakeStore>, Arc<FakeSink>>;

fn poller(
    source: &Arc<FakeSource>,
    store: &Arc<FakeStore>,
    sink: &Arc<FakeSink>,
    sensors: &[&str],
    settings: PollerSettings,
) -> FakePoller {
    Poller::new(
        source.clone(),
        store.clone(),
        sink.clone(),
        sensors.iter().map(|id| sensor(id)).collect(),
        settings,
    )
}

#[tokio::test]
async fn pagination_stops_after_the_partial_page() {
    let source = FakeSource::exclusive();
    source.publish("A", 1..=1200);
    let store = Arc::new(FakeStore::default());
    let sink = Arc::new(FakeSink::default());

    let report = poller(&source, &store, &sink, &["A"], exclusive_settings(500))
        .run_cycle(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(source.call_count(), 3);
    assert_eq!(sink.batch_sizes(), vec![500, 500, 200]);
    assert_eq!(report.sunk(), 1200);
    assert_eq!(report.sensors[0].stop, StopReason::Exhausted);
    assert_eq!(store.get("A"), Some(at(1200)));
}

#[tokio::test]
async fn two_pages_sink_then_checkpoint_in_order() {
    // Checkpoint at t0; the inclusive upstream echoes the t0 sample back.
    let source = FakeSource::inclusive();
    source.publish("A", 0..=700);
    let store = Arc::new(FakeStore::default());
    store.set("A", t0());
    let sink = Arc::new(FakeSink::default());

    let report = poller(&source, &store, &sink, &["A"], settings(500))
        .run_cycle(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(source.call_count(), 2);
    assert_eq!(report.sunk(), 700);
    assert_eq!(sink.batch_sizes(), vec![500, 200]);
    assert_eq!(store.advance_count(), 2);
    assert_eq!(store.get("A"), Some(at(700)));
    assert_eq!(sink.stored_offsets("A"), (1..=700).collect::<Vec<_>>());

    let calls = source.calls.lock().unwrap();
    assert_eq!((calls[0].1, calls[0].2), (t0(), 501));
    assert_eq!((calls[1].1, calls[1].2), (at(500), 501));
}

#[tokio::test]
async fn boundary_sample_is_dropped_on_inclusive_upstream() {
    let source = FakeSource::inclusive();
    source.publish("A", 1..=10);
    let store = Arc::new(FakeStore::default());
    store.set("A", at(5));
    let sink = Arc::new(FakeSink::default());

    let report = poller(&source, &store, &sink, &["A"], settings(500))
        .run_cycle(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(sink.stored_offsets("A"), vec![6, 7, 8, 9, 10]);
    assert_eq!(report.sensors[0].fetched, 6);
    assert_eq!(report.sensors[0].dropped, 1);
}

#[tokio::test]
async fn rerunning_a_finished_cycle_ingests_nothing() {
    let source = FakeSource::inclusive();
    source.publish("A", 1..=42);
    let store = Arc::new(FakeStore::default());
    let sink = Arc::new(FakeSink::default());
    let poller = poller(&source, &store, &sink, &["A"], settings(500));
    let cancel = CancellationToken::new();

    poller.run_cycle(&cancel).await.unwrap();
    let checkpoint = store.get("A");
    let writes = sink.batch_sizes().len();

    let second = poller.run_cycle(&cancel).await.unwrap();
    assert_eq!(second.sunk(), 0);
    assert_eq!(sink.batch_sizes().len(), writes);
    assert_eq!(store.get("A"), checkpoint);
}

#[tokio::test]
async fn consecutive_cycles_leave_no_gaps() {
    let source = FakeSource::inclusive();
    let store = Arc::new(FakeStore::default());
    let sink = Arc::new(FakeSink::default());
    let poller = poller(&source, &store, &sink, &["A"], settings(7));
    let cancel = CancellationToken::new();

    let mut published = Vec::new();
    for batch in [0..=20, 21..=21, 22..=60, 61..=63] {
        source.publish("A", batch.clone());
        published.extend(batch);
        poller.run_cycle(&cancel).await.unwrap();
    }

    assert_eq!(sink.stored_offsets("A"), published);
}

#[tokio::test]
async fn failed_write_is_refetched_next_cycle() {
    let source = FakeSource::inclusive();
    source.publish("A", 1..=700);
    let store = Arc::new(FakeStore::default());
    let sink = Arc::new(FakeSink::default());
    sink.fail_writes.lock().unwrap().insert(2);
    let poller = poller(&source, &store, &sink, &["A"], settings(500));
    let cancel = CancellationToken::new();

    let first = poller.run_cycle(&cancel).await.unwrap();
    assert_eq!(first.failed, 1);
    assert_eq!(first.sensors[0].stop, StopReason::Failed);
    assert_eq!(store.get("A"), Some(at(500)));

    let second = poller.run_cycle(&cancel).await.unwrap();
    assert_eq!(second.failed, 0);
    assert_eq!(store.get("A"), Some(at(700)));
    assert_eq!(sink.stored_offsets("A"), (1..=700).collect::<Vec<_>>());

    let advances = store.advances.lock().unwrap();
    assert!(advances.windows(2).all(|pair| pair[0].1 <= pair[1].1));
}

#[tokio::test]
async fn fetch_failure_keeps_the_checkpoint() {
    let source = FakeSource::inclusive();
    source.publish("A", 1..=10);
    source.fail_calls.lock().unwrap().insert(1);
    let store = Arc::new(FakeStore::default());
    store.set("A", at(3));
    let sink = Arc::new(FakeSink::default());

    let poller = poller(&source, &store, &sink, &["A"], settings(500));
    let outcome = poller
        .run_sensor(&sensor("A"), &CancellationToken::new())
        .await;

    assert!(matches!(outcome.error, Some(SensorCycleError::Api(_))));
    assert_eq!(outcome.report.stop, StopReason::Failed);
    assert_eq!(store.get("A"), Some(at(3)));
    assert!(sink.batch_sizes().is_empty());
}

#[tokio::test]
async fn one_failing_sensor_does_not_stop_the_others() {
    let source = FakeSource::inclusive();
    source.publish("A", 1..=5);
    source.publish("B", 1..=5);
    source.publish("C", 1..=5);
    source.fail_sensors.lock().unwrap().insert("B".to_string());
    let store = Arc::new(FakeStore::default());
    let sink = Arc::new(FakeSink::default());

    let report = poller(&source, &store, &sink, &["A", "B", "C"], settings(500))
        .run_cycle(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.failed, 1);
    assert_eq!(sink.stored_offsets("A").len(), 5);
    assert_eq!(sink.stored_offsets("C").len(), 5);
    assert_eq!(store.get("B"), None);
}

#[tokio::test]
async fn checkpoint_failure_aborts_the_cycle() {
    let source = FakeSource::inclusive();
    source.publish("A", 1..=5);
    source.publish("B", 1..=5);
    let store = Arc::new(FakeStore {
        fail_advance: true,
        ..FakeStore::default()
    });
    let sink = Arc::new(FakeSink::default());

    let result = poller(&source, &store, &sink, &["A", "B"], settings(500))
        .run_cycle(&CancellationToken::new())
        .await;

    assert!(matches!(result, Err(CheckpointError::Unavailable(_))));
    assert_eq!(source.calls_for("B"), 0);
}

#[tokio::test]
async fn full_page_of_boundary_repeats_stops_the_sensor() {
    let source = FakeSource::inclusive();
    source.publish("A", [5, 5, 5, 5, 6]);
    let store = Arc::new(FakeStore::default());
    store.set("A", at(5));
    let sink = Arc::new(FakeSink::default());

    let report = poller(&source, &store, &sink, &["A"], settings(3))
        .run_cycle(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(source.call_count(), 1);
    assert_eq!(report.sensors[0].stop, StopReason::Stalled);
    assert_eq!(report.failed, 0);
    assert_eq!(store.get("A"), Some(at(5)));
}

#[tokio::test]
async fn single_sample_pages_progress_past_the_boundary_echo() {
    let source = FakeSource::inclusive();
    source.publish("A", 1..=5);
    let store = Arc::new(FakeStore::default());
    let sink = Arc::new(FakeSink::default());
    let poller = poller(&source, &store, &sink, &["A"], settings(1));
    let cancel = CancellationToken::new();

    let first = poller.run_cycle(&cancel).await.unwrap();
    assert_eq!(first.sensors[0].stop, StopReason::Exhausted);
    assert_eq!(sink.stored_offsets("A"), vec![1, 2, 3, 4, 5]);
    assert_eq!(sink.batch_sizes(), vec![1; 5]);
    assert_eq!(store.get("A"), Some(at(5)));

    source.publish("A", 6..=7);
    let second = poller.run_cycle(&cancel).await.unwrap();
    assert_eq!(second.sensors[0].stop, StopReason::Exhausted);
    assert_eq!(sink.stored_offsets("A"), (1..=7).collect::<Vec<_>>());
}

#[tokio::test]
async fn cancellation_is_honoured_between_pages() {
    let source = FakeSource::inclusive();
    source.publish("A", 1..=1200);
    let store = Arc::new(FakeStore::default());
    let sink = Arc::new(FakeSink::default());
    let cancel = CancellationToken::new();
    *sink.cancel_after_write.lock().unwrap() = Some(cancel.clone());

    let report = poller(&source, &store, &sink, &["A"], settings(500))
        .run_cycle(&cancel)
        .await
        .unwrap();

    assert_eq!(source.call_count(), 1);
    assert_eq!(report.sensors[0].stop, StopReason::Cancelled);
    // The in-flight page finished and was checkpointed before stopping.
    assert_eq!(store.get("A"), Some(at(500)));
}

#[tokio::test]
async fn sensors_can_run_concurrently() {
    let source = FakeSource::exclusive();
    for id in ["A", "B", "C", "D"] {
        source.publish(id, 1..=120);
    }
    let store = Arc::new(FakeStore::default());
    let sink = Arc::new(FakeSink::default());
    let settings = PollerSettings {
        sensor_concurrency: 4,
        ..exclusive_settings(50)
    };

    let report = poller(&source, &store, &sink, &["A", "B", "C", "D"], settings)
        .run_cycle(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.sunk(), 480);
    for id in ["A", "B", "C", "D"] {
        assert_eq!(store.get(id), Some(at(120)));
        assert_eq!(source.calls_for(id), 3);
    }
}
