use crate::retry::RetryPolicy;
use crate::sample::{parse_timestamp, Measure, Sensor};
use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use dotenvy::dotenv;
use serde::Deserialize;
use std::collections::HashSet;
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_SETUP_CONFIG_PATH: &str = "config/settings.json";
const DEFAULT_API_URL: &str = "https://api.sensorpush.com/api/v1";
const DEFAULT_INDEX_NAME: &str = "sensorpush";
const DEFAULT_CHECKPOINT_DB: &str = "data/sensors.db";
const DEFAULT_SERVICE_NAME: &str = "sensorpush-ingest";

fn setup_config_path() -> PathBuf {
    if let Ok(path) = env::var("POLLER_CONFIG_PATH") {
        let trimmed = path.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }
    PathBuf::from(DEFAULT_SETUP_CONFIG_PATH)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartBound {
    /// The upstream returns samples at `startTime` as well as after it.
    Inclusive,
    Exclusive,
}

impl FromStr for StartBound {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "inclusive" => Ok(StartBound::Inclusive),
            "exclusive" => Ok(StartBound::Exclusive),
            other => Err(anyhow!("expected inclusive or exclusive, got {other:?}")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(anyhow!("expected text or json, got {other:?}")),
        }
    }
}

/// Structured settings that do not fit in env vars (the sensor list) plus
/// optional file-based defaults for the scalar ones.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SetupConfigOverrides {
    #[serde(default)]
    sensors: Vec<Sensor>,
    #[serde(default)]
    measures: Vec<String>,
    #[serde(default)]
    api_url: Option<String>,
    #[serde(default)]
    index_name: Option<String>,
    #[serde(default)]
    default_start_time: Option<String>,
    #[serde(default)]
    poll_interval_secs: Option<u64>,
    #[serde(default)]
    page_limit: Option<u32>,
    #[serde(default)]
    start_bound: Option<StartBound>,
    #[serde(default)]
    checkpoint_db: Option<String>,
    #[serde(default)]
    sensor_concurrency: Option<usize>,
    #[serde(default)]
    apm_service_name: Option<String>,
    #[serde(default)]
    apm_service_version: Option<String>,
    #[serde(default)]
    apm_environment: Option<String>,
}

impl SetupConfigOverrides {
    pub fn parse(contents: &str) -> Result<Self> {
        let mut bytes = contents.as_bytes().to_vec();
        simd_json::serde::from_slice(&mut bytes).context("invalid setup config JSON")
    }
}

/// A missing file yields `None`; one that exists but cannot be read or
/// parsed is an error.
fn load_setup_config_overrides(path: &Path) -> Result<Option<SetupConfigOverrides>> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read setup config {}", path.display()))?;
    let overrides = SetupConfigOverrides::parse(&contents)
        .with_context(|| format!("failed to parse setup config {}", path.display()))?;
    Ok(Some(overrides))
}

#[derive(Clone, Debug)]
pub struct Config {
    pub sensorpush_email: String,
    pub sensorpush_password: String,
    pub api_url: String,
    pub es_url: String,
    pub es_username: Option<String>,
    pub es_password: Option<String>,
    pub index_name: String,
    pub poll_interval_secs: u64,
    pub page_limit: u32,
    pub default_start_time: DateTime<Utc>,
    pub checkpoint_db: PathBuf,
    pub sensors: Vec<Sensor>,
    pub measures: Vec<Measure>,
    pub start_bound: StartBound,
    pub max_retries: u32,
    pub retry_base_ms: u64,
    pub retry_cap_ms: u64,
    pub http_timeout_secs: u64,
    pub sensor_concurrency: usize,
    pub token_ttl_secs: u64,
    pub log_format: LogFormat,
    pub otlp_endpoint: Option<String>,
    pub apm_secret_token: Option<String>,
    pub apm_service_name: String,
    pub apm_service_version: String,
    pub apm_environment: String,
    pub kibana_url: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();
        let overrides = load_setup_config_overrides(&setup_config_path())?;
        Self::from_sources(|key| env::var(key).ok(), overrides)
    }

    /// Builds the config from a key lookup (env vars in production) and the
    /// optional setup file. Lookup values win over file values.
    pub fn from_sources<F>(lookup: F, overrides: Option<SetupConfigOverrides>) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let file = overrides.unwrap_or_default();
        let mut missing: Vec<&str> = Vec::new();

        let sensorpush_email = get("SENSORPUSH_EMAIL");
        if sensorpush_email.is_none() {
            missing.push("SENSORPUSH_EMAIL");
        }
        let sensorpush_password = get("SENSORPUSH_PASSWORD");
        if sensorpush_password.is_none() {
            missing.push("SENSORPUSH_PASSWORD");
        }
        let es_url = get("ES_URL");
        if es_url.is_none() {
            missing.push("ES_URL");
        }
        let default_start_time = get("POLLER_DEFAULT_START_TIME").or(file.default_start_time);
        if default_start_time.is_none() {
            missing.push("POLLER_DEFAULT_START_TIME");
        }

        let sensors = if file.sensors.is_empty() {
            get("POLLER_SENSOR_IDS")
                .map(|raw| {
                    raw.split(',')
                        .map(str::trim)
                        .filter(|id| !id.is_empty())
                        .map(|id| Sensor {
                            id: id.to_string(),
                            name: id.to_string(),
                            description: String::new(),
                        })
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default()
        } else {
            file.sensors
        };
        if sensors.is_empty() {
            missing.push("POLLER_SENSOR_IDS (or sensors in the setup config)");
        }

        if !missing.is_empty() {
            bail!("missing required configuration: {}", missing.join(", "));
        }
        let (
            Some(sensorpush_email),
            Some(sensorpush_password),
            Some(es_url),
            Some(default_start_time),
        ) = (sensorpush_email, sensorpush_password, es_url, default_start_time)
        else {
            bail!("missing required configuration");
        };

        let default_start_time = parse_timestamp(&default_start_time)
            .with_context(|| format!("invalid POLLER_DEFAULT_START_TIME: {default_start_time}"))?;

        let mut seen = HashSet::new();
        for sensor in &sensors {
            if sensor.id.trim().is_empty() {
                bail!("sensor entries must have a non-empty id");
            }
            if !seen.insert(sensor.id.as_str()) {
                bail!("sensor {} is configured more than once", sensor.id);
            }
        }

        let measure_names: Vec<String> = match get("POLLER_MEASURES") {
            Some(raw) => raw.split(',').map(|name| name.to_string()).collect(),
            None => file.measures,
        };
        let mut measures = Vec::new();
        for name in measure_names.iter().map(|name| name.trim()) {
            if name.is_empty() {
                continue;
            }
            let measure = Measure::parse(name).ok_or_else(|| anyhow!("unknown measure {name:?}"))?;
            if !measures.contains(&measure) {
                measures.push(measure);
            }
        }
        if measures.is_empty() {
            measures = Measure::ALL.to_vec();
        }

        let page_limit = parse_value::<u32>(get("POLLER_PAGE_LIMIT"), "POLLER_PAGE_LIMIT")?
            .or(file.page_limit)
            .unwrap_or(500);
        if page_limit == 0 {
            bail!("POLLER_PAGE_LIMIT must be greater than zero");
        }

        let start_bound = match get("POLLER_START_BOUND") {
            Some(raw) => raw.parse().context("invalid POLLER_START_BOUND")?,
            None => file.start_bound.unwrap_or(StartBound::Inclusive),
        };
        let log_format = match get("POLLER_LOG_FORMAT") {
            Some(raw) => raw.parse().context("invalid POLLER_LOG_FORMAT")?,
            None => LogFormat::Text,
        };

        let poll_interval_secs =
            parse_value::<u64>(get("POLLER_INTERVAL_SECS"), "POLLER_INTERVAL_SECS")?
                .or(file.poll_interval_secs)
                .unwrap_or(300);
        let sensor_concurrency = parse_value::<usize>(
            get("POLLER_SENSOR_CONCURRENCY"),
            "POLLER_SENSOR_CONCURRENCY",
        )?
        .or(file.sensor_concurrency)
        .unwrap_or(1)
        .max(1);
        let max_retries =
            parse_value::<u32>(get("POLLER_MAX_RETRIES"), "POLLER_MAX_RETRIES")?.unwrap_or(5);
        let retry_base_ms =
            parse_value::<u64>(get("POLLER_RETRY_BASE_MS"), "POLLER_RETRY_BASE_MS")?
                .unwrap_or(1000);
        let retry_cap_ms = parse_value::<u64>(get("POLLER_RETRY_CAP_MS"), "POLLER_RETRY_CAP_MS")?
            .unwrap_or(30_000)
            .max(retry_base_ms);
        let http_timeout_secs =
            parse_value::<u64>(get("POLLER_HTTP_TIMEOUT_SECS"), "POLLER_HTTP_TIMEOUT_SECS")?
                .unwrap_or(15);
        let token_ttl_secs =
            parse_value::<u64>(get("POLLER_TOKEN_TTL_SECS"), "POLLER_TOKEN_TTL_SECS")?
                .unwrap_or(1800);

        let api_url = get("SENSORPUSH_API_URL")
            .or(file.api_url)
            .unwrap_or_else(|| DEFAULT_API_URL.to_string());
        let index_name = get("ES_INDEX")
            .or(file.index_name)
            .unwrap_or_else(|| DEFAULT_INDEX_NAME.to_string());
        let checkpoint_db = PathBuf::from(
            get("POLLER_CHECKPOINT_DB")
                .or(file.checkpoint_db)
                .unwrap_or_else(|| DEFAULT_CHECKPOINT_DB.to_string()),
        );

        Ok(Self {
            sensorpush_email,
            sensorpush_password,
            api_url: api_url.trim_end_matches('/').to_string(),
            es_url: es_url.trim_end_matches('/').to_string(),
            es_username: get("ES_USERNAME"),
            es_password: get("ES_PASSWORD"),
            index_name,
            poll_interval_secs,
            page_limit,
            default_start_time,
            checkpoint_db,
            sensors,
            measures,
            start_bound,
            max_retries,
            retry_base_ms,
            retry_cap_ms,
            http_timeout_secs,
            sensor_concurrency,
            token_ttl_secs,
            log_format,
            otlp_endpoint: get("OTEL_EXPORTER_OTLP_ENDPOINT").or_else(|| get("APM_SERVER_URL")),
            apm_secret_token: get("APM_SECRET_TOKEN"),
            apm_service_name: get("APM_SERVICE_NAME")
                .or(file.apm_service_name)
                .unwrap_or_else(|| DEFAULT_SERVICE_NAME.to_string()),
            apm_service_version: get("APM_SERVICE_VERSION")
                .or(file.apm_service_version)
                .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string()),
            apm_environment: get("APM_ENVIRONMENT")
                .or(file.apm_environment)
                .unwrap_or_else(|| "production".to_string()),
            kibana_url: get("KB_URL").map(|url| url.trim_end_matches('/').to_string()),
        })
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base: Duration::from_millis(self.retry_base_ms),
            cap: Duration::from_millis(self.retry_cap_ms),
        }
    }
}

fn parse_value<T>(raw: Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.map(|value| {
        value
            .parse::<T>()
            .with_context(|| format!("invalid {key}: {value}"))
    })
    .transpose()
}
