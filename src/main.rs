mod annotate;
mod api;
mod auth;
mod checkpoint;
mod config;
mod error;
mod poller;
mod retry;
mod sample;
mod scheduler;
mod sink;
#[cfg(test)]
mod test_support;

use crate::api::SensorPushClient;
use crate::auth::CredentialProvider;
use crate::checkpoint::SqliteCheckpointStore;
use crate::config::{Config, LogFormat};
use crate::poller::{Poller, PollerSettings};
use crate::sample::Sensor;
use crate::sink::ElasticsearchSink;
use anyhow::{Context, Result};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn init_tracing(config: &Config) -> Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{runtime::Tokio, trace::Config as OTelTraceConfig, Resource};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,sensorpush_ingest=info,sqlx=warn".into());
    let text_layer = (config.log_format == LogFormat::Text)
        .then(|| tracing_subscriber::fmt::layer().with_target(true));
    let json_layer = (config.log_format == LogFormat::Json).then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
    });

    let otel_layer = match &config.otlp_endpoint {
        Some(endpoint) => {
            let mut headers = HashMap::new();
            if let Some(token) = &config.apm_secret_token {
                headers.insert("Authorization".to_string(), format!("Bearer {token}"));
            }
            let exporter = opentelemetry_otlp::new_exporter()
                .http()
                .with_endpoint(normalize_otlp_http_endpoint(endpoint))
                .with_headers(headers);
            let tracer = opentelemetry_otlp::new_pipeline()
                .tracing()
                .with_exporter(exporter)
                .with_trace_config(OTelTraceConfig::default().with_resource(Resource::new(vec![
                    KeyValue::new("service.name", config.apm_service_name.clone()),
                    KeyValue::new("service.version", config.apm_service_version.clone()),
                    KeyValue::new("deployment.environment", config.apm_environment.clone()),
                ])))
                .install_batch(Tokio)?;
            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(text_layer)
        .with(json_layer)
        .with(otel_layer)
        .try_init()?;

    Ok(())
}

fn normalize_otlp_http_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    if trimmed.contains("/v1/traces") {
        return trimmed.to_string();
    }
    format!("{}/v1/traces", trimmed.trim_end_matches('/'))
}

/// Logs what the account can see and flags configured sensors it does not
/// know about. Failures here never stop startup.
async fn discover(client: &SensorPushClient, configured: &[Sensor]) {
    match client.list_gateways().await {
        Ok(gateways) => {
            for gateway in &gateways {
                tracing::debug!(
                    gateway_id = %gateway.id,
                    name = %gateway.name,
                    last_seen = gateway.last_seen.as_deref(),
                    version = gateway.version.as_deref(),
                    message = gateway.message.as_deref(),
                    "gateway"
                );
            }
            tracing::info!(count = gateways.len(), "discovered gateways");
        }
        Err(err) => tracing::warn!(error = %err, "failed to list gateways"),
    }

    match client.list_sensors().await {
        Ok(known) => {
            for sensor in &known {
                tracing::debug!(
                    sensor_id = %sensor.id,
                    name = %sensor.name,
                    device_id = sensor.device_id.as_deref(),
                    active = sensor.active,
                    battery_voltage = sensor.battery_voltage,
                    rssi = sensor.rssi,
                    "sensor"
                );
            }
            tracing::info!(count = known.len(), "discovered sensors");
            for sensor in configured {
                if !known.iter().any(|candidate| candidate.id == sensor.id) {
                    tracing::warn!(
                        sensor_id = %sensor.id,
                        name = %sensor.display_name(),
                        "configured sensor is not visible to this account"
                    );
                }
            }
        }
        Err(err) => tracing::warn!(error = %err, "failed to list sensors"),
    }
}

#[cfg(unix)]
async fn shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt()).context("install SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
    tokio::select! {
        _ = sigint.recv() => tracing::info!(signal = "SIGINT", "shutdown signal received"),
        _ = sigterm.recv() => tracing::info!(signal = "SIGTERM", "shutdown signal received"),
    }
    Ok(())
}

#[cfg(not(unix))]
async fn shutdown_signal() -> Result<()> {
    tokio::signal::ctrl_c().await.context("install ctrl-c handler")?;
    tracing::info!("shutdown signal received");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config)?;
    tracing::info!(
        sensors = config.sensors.len(),
        index = %config.index_name,
        interval_secs = config.poll_interval_secs,
        page_limit = config.page_limit,
        start_bound = ?config.start_bound,
        "starting sensorpush ingest"
    );

    let http = reqwest::Client::builder()
        .timeout(config.http_timeout())
        .user_agent(concat!("sensorpush-ingest/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("build HTTP client")?;

    let sink = ElasticsearchSink::new(
        http.clone(),
        config.es_url.clone(),
        config.index_name.clone(),
        config.es_username.clone(),
        config.es_password.clone(),
        config.measures.clone(),
    );
    sink.ping()
        .await
        .with_context(|| format!("Elasticsearch at {} is unreachable", config.es_url))?;

    if let Err(err) = annotate::post_deployment_annotation(&http, &config, Utc::now()).await {
        tracing::warn!(error = %err, "failed to post APM deployment annotation");
    }

    let checkpoints = SqliteCheckpointStore::open(&config.checkpoint_db)
        .await
        .with_context(|| format!("open checkpoint store {}", config.checkpoint_db.display()))?;

    let credentials = Arc::new(CredentialProvider::new(
        http.clone(),
        config.api_url.clone(),
        config.sensorpush_email.clone(),
        config.sensorpush_password.clone(),
        config.token_ttl(),
    ));
    let client = SensorPushClient::new(
        http,
        config.api_url.clone(),
        credentials,
        config.retry_policy(),
        config.measures.clone(),
    );
    discover(&client, &config.sensors).await;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(err) = shutdown_signal().await {
                tracing::error!(error = %err, "signal handling unavailable");
                return;
            }
            cancel.cancel();
        });
    }

    let poller = Poller::new(
        client,
        checkpoints,
        sink,
        config.sensors.clone(),
        PollerSettings::from_config(&config),
    );
    scheduler::run(&poller, config.poll_interval(), cancel).await;

    opentelemetry::global::shutdown_tracer_provider();
    Ok(())
}
