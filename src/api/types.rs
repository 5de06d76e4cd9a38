use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Deserialize)]
pub struct Gateway {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub last_seen: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SensorInfo {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "deviceId")]
    pub device_id: Option<String>,
    #[serde(default)]
    pub active: Option<bool>,
    #[serde(default)]
    pub battery_voltage: Option<f64>,
    #[serde(default)]
    pub rssi: Option<f64>,
}

/// Both device listings come back as objects keyed by id.
pub(crate) type Keyed<T> = BTreeMap<String, T>;

#[derive(Debug, Serialize)]
pub(crate) struct SamplesRequest<'a> {
    pub sensors: Vec<&'a str>,
    pub limit: usize,
    #[serde(rename = "startTime")]
    pub start_time: String,
    pub measures: Vec<&'static str>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct SamplesResponse {
    #[serde(default)]
    pub sensors: BTreeMap<String, Vec<JsonValue>>,
    #[serde(default)]
    pub truncated: bool,
    #[serde(default)]
    pub last_time: Option<String>,
    #[serde(default)]
    pub total_samples: Option<u64>,
}
