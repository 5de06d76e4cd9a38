mod types;

pub use types::{Gateway, SensorInfo};

use crate::auth::{CredentialProvider, Token};
use crate::error::ApiError;
use crate::retry::RetryPolicy;
use crate::sample::{format_timestamp, Measure, Sample, Sensor};
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, AUTHORIZATION, RETRY_AFTER};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};
use types::{Keyed, SamplesRequest, SamplesResponse};

/// Where the poller pulls pages of samples from.
pub trait SampleSource: Send + Sync {
    /// Returns up to `limit` samples for `sensor` observed at or after
    /// `start`, sorted by timestamp ascending.
    fn fetch_page(
        &self,
        sensor: &Sensor,
        start: DateTime<Utc>,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<Sample>, ApiError>> + Send;
}

pub struct SensorPushClient {
    http: Client,
    base_url: String,
    credentials: Arc<CredentialProvider>,
    retry: RetryPolicy,
    measures: Vec<Measure>,
}

impl SensorPushClient {
    pub fn new(
        http: Client,
        base_url: impl Into<String>,
        credentials: Arc<CredentialProvider>,
        retry: RetryPolicy,
        measures: Vec<Measure>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credentials,
            retry,
            measures,
        }
    }

    pub async fn list_gateways(&self) -> Result<Vec<Gateway>, ApiError> {
        let keyed: Keyed<Gateway> = self.post_json("devices/gateways", &json!({})).await?;
        Ok(keyed
            .into_iter()
            .map(|(id, mut gateway)| {
                if gateway.id.is_empty() {
                    gateway.id = id;
                }
                gateway
            })
            .collect())
    }

    pub async fn list_sensors(&self) -> Result<Vec<SensorInfo>, ApiError> {
        let keyed: Keyed<SensorInfo> = self.post_json("devices/sensors", &json!({})).await?;
        Ok(keyed
            .into_iter()
            .map(|(id, mut sensor)| {
                if sensor.id.is_empty() {
                    sensor.id = id;
                }
                sensor
            })
            .collect())
    }

    #[tracing::instrument(
        name = "fetch_page",
        skip(self, sensor),
        fields(sensor_id = %sensor.id, start = %format_timestamp(start))
    )]
    pub async fn fetch_samples(
        &self,
        sensor: &Sensor,
        start: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Sample>, ApiError> {
        let request = SamplesRequest {
            sensors: vec![sensor.id.as_str()],
            limit,
            start_time: format_timestamp(start),
            measures: self.measures.iter().map(|measure| measure.as_str()).collect(),
        };
        let response: SamplesResponse = self.post_json("samples", &request).await?;
        debug!(
            truncated = response.truncated,
            total_samples = response.total_samples,
            last_time = response.last_time.as_deref(),
            "samples page received"
        );
        Ok(normalize_page(response, &self.measures))
    }

    /// Sends one authenticated request, re-authenticating once on 401 and
    /// backing off on transient failures.
    async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let mut backoff = self.retry.backoff();
        let mut reauthenticated = false;
        loop {
            let result = match self.credentials.get_token().await {
                Ok(token) => {
                    let result = self.send(path, &token, body).await;
                    if matches!(result, Err(ApiError::Unauthorized(_))) {
                        self.credentials.invalidate(&token).await;
                    }
                    result
                }
                Err(err) => Err(err),
            };
            let err = match result {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            match err {
                ApiError::Unauthorized(_) if !reauthenticated => {
                    reauthenticated = true;
                    warn!(path, "access token rejected; re-authenticating");
                }
                err if err.is_transient() => match backoff.next_delay(err.retry_after()) {
                    Some(delay) => {
                        warn!(
                            path,
                            attempt = backoff.attempts() - 1,
                            delay_ms = delay.as_millis() as u64,
                            error = %err,
                            "transient upstream failure; retrying"
                        );
                        sleep(delay).await;
                    }
                    None => {
                        return Err(ApiError::RetriesExhausted {
                            attempts: backoff.attempts(),
                            last: Box::new(err),
                        })
                    }
                },
                err => return Err(err),
            }
        }
    }

    async fn send<B, T>(&self, path: &str, token: &Token, body: &B) -> Result<T, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let response = self
            .http
            .post(format!("{}/{}", self.base_url, path))
            .header("accept", "application/json")
            .header(AUTHORIZATION, token.as_str())
            .json(body)
            .send()
            .await
            .map_err(ApiError::from_transport)?;
        let status = response.status();
        if !status.is_success() {
            let retry_after = retry_after(response.headers());
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::from_status(status.as_u16(), body, retry_after));
        }
        response.json::<T>().await.map_err(ApiError::from_transport)
    }
}

impl SampleSource for SensorPushClient {
    async fn fetch_page(
        &self,
        sensor: &Sensor,
        start: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Sample>, ApiError> {
        self.fetch_samples(sensor, start, limit).await
    }
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn normalize_page(response: SamplesResponse, measures: &[Measure]) -> Vec<Sample> {
    let mut samples = Vec::new();
    for (sensor_id, readings) in response.sensors {
        for reading in readings {
            match Sample::from_reading(&sensor_id, reading, measures) {
                Some(sample) => samples.push(sample),
                None => warn!(sensor_id = %sensor_id, "dropping reading without a valid timestamp"),
            }
        }
    }
    samples.sort_by_key(|sample| sample.timestamp);
    samples
}
