mod document;

use document::{build_document, bulk_body, document_id, summarize_bulk_response};

use crate::error::SinkError;
use crate::sample::{Measure, Sample, Sensor};
use chrono::Utc;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Method, RequestBuilder};
use serde_json::Value as JsonValue;
use std::future::Future;

/// Durable destination for samples. `Ok(n)` means all `n` samples are
/// persisted; anything less is an error.
pub trait SampleSink: Send + Sync {
    fn write(
        &self,
        sensor: &Sensor,
        samples: &[Sample],
    ) -> impl Future<Output = Result<usize, SinkError>> + Send;
}

pub struct ElasticsearchSink {
    http: Client,
    url: String,
    index: String,
    username: Option<String>,
    password: Option<String>,
    measures: Vec<Measure>,
}

impl ElasticsearchSink {
    pub fn new(
        http: Client,
        url: impl Into<String>,
        index: impl Into<String>,
        username: Option<String>,
        password: Option<String>,
        measures: Vec<Measure>,
    ) -> Self {
        Self {
            http,
            url: url.into().trim_end_matches('/').to_string(),
            index: index.into(),
            username,
            password,
            measures,
        }
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let request = self.http.request(method, format!("{}/{}", self.url, path));
        match &self.username {
            Some(username) => request.basic_auth(username, self.password.as_deref()),
            None => request,
        }
    }

    /// Connectivity check run once at startup.
    pub async fn ping(&self) -> Result<(), SinkError> {
        let response = self
            .request(Method::GET, "")
            .send()
            .await
            .map_err(|err| SinkError::Transport(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SinkError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        let info: JsonValue = response.json().await.unwrap_or_default();
        tracing::info!(
            url = %self.url,
            cluster = info["cluster_name"].as_str().unwrap_or("unknown"),
            version = info["version"]["number"].as_str().unwrap_or("unknown"),
            "connected to Elasticsearch"
        );
        Ok(())
    }
}

impl SampleSink for ElasticsearchSink {
    #[tracing::instrument(
        name = "sink_page",
        skip(self, sensor, samples),
        fields(sensor_id = %sensor.id, count = samples.len())
    )]
    async fn write(&self, sensor: &Sensor, samples: &[Sample]) -> Result<usize, SinkError> {
        if samples.is_empty() {
            return Ok(0);
        }
        let ingested = Utc::now();
        let documents: Vec<(String, JsonValue)> = samples
            .iter()
            .map(|sample| {
                (
                    document_id(sample),
                    build_document(sensor, sample, &self.measures, ingested),
                )
            })
            .collect();

        let response = self
            .request(Method::POST, "_bulk")
            .header(CONTENT_TYPE, "application/x-ndjson")
            .body(bulk_body(&self.index, &documents))
            .send()
            .await
            .map_err(|err| SinkError::Transport(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SinkError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        let body: JsonValue = response
            .json()
            .await
            .map_err(|err| SinkError::Transport(format!("decode bulk response: {err}")))?;

        let summary = summarize_bulk_response(&body);
        if summary.failed > 0 || summary.acknowledged() != samples.len() {
            return Err(SinkError::Partial {
                written: summary.acknowledged(),
                failed: samples.len() - summary.acknowledged().min(samples.len()),
                first_error: summary
                    .first_error
                    .unwrap_or_else(|| "bulk response missing items".to_string()),
            });
        }
        if summary.duplicates > 0 {
            tracing::debug!(
                duplicates = summary.duplicates,
                "documents already indexed; treating as written"
            );
        }
        Ok(summary.acknowledged())
    }
}
