use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::fmt;

/// A statically configured SensorPush sensor.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Sensor {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
}

impl Sensor {
    pub fn display_name(&self) -> &str {
        if self.name.trim().is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Measure {
    Temperature,
    Humidity,
    Dewpoint,
    BarometricPressure,
    Altitude,
}

impl Measure {
    pub const ALL: [Measure; 5] = [
        Measure::Temperature,
        Measure::Humidity,
        Measure::Dewpoint,
        Measure::BarometricPressure,
        Measure::Altitude,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Measure::Temperature => "temperature",
            Measure::Humidity => "humidity",
            Measure::Dewpoint => "dewpoint",
            Measure::BarometricPressure => "barometric_pressure",
            Measure::Altitude => "altitude",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let normalized = value.trim().to_ascii_lowercase();
        Measure::ALL
            .into_iter()
            .find(|measure| measure.as_str() == normalized)
    }
}

impl fmt::Display for Measure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a sample within one sensor stream.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SampleKey {
    pub sensor_id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Sample {
    pub sensor_id: String,
    pub timestamp: DateTime<Utc>,
    pub gateways: Option<String>,
    pub measures: BTreeMap<Measure, f64>,
    /// The reading exactly as the upstream returned it.
    pub raw: JsonValue,
}

impl Sample {
    pub fn key(&self) -> SampleKey {
        SampleKey {
            sensor_id: self.sensor_id.clone(),
            timestamp: self.timestamp,
        }
    }

    /// Normalizes one upstream reading. Returns `None` for readings without a
    /// sensor id or a parseable `observed` timestamp.
    pub fn from_reading(sensor_id: &str, reading: JsonValue, measures: &[Measure]) -> Option<Self> {
        let sensor_id = sensor_id.trim();
        if sensor_id.is_empty() {
            return None;
        }
        let object = reading.as_object()?;
        let timestamp = object
            .get("observed")
            .and_then(JsonValue::as_str)
            .and_then(parse_timestamp)?;
        let gateways = object
            .get("gateways")
            .and_then(JsonValue::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(|value| value.to_string());

        let mut values = BTreeMap::new();
        for measure in measures {
            if let Some(value) = object
                .get(measure.as_str())
                .and_then(JsonValue::as_f64)
                .filter(|value| value.is_finite())
            {
                values.insert(*measure, value);
            }
        }

        Some(Self {
            sensor_id: sensor_id.to_string(),
            timestamp,
            gateways,
            measures: values,
            raw: reading,
        })
    }
}

pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Wire format used for `startTime` and document timestamps.
pub fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reading_keeps_only_enabled_numeric_measures() {
        let reading = json!({
            "observed": "2025-01-01T00:05:00.000Z",
            "gateways": "Barn",
            "temperature": 71.5,
            "humidity": 40.1,
            "altitude": "n/a",
        });

        let sample = Sample::from_reading(
            "123.45",
            reading,
            &[Measure::Temperature, Measure::Altitude],
        )
        .unwrap();

        assert_eq!(sample.sensor_id, "123.45");
        assert_eq!(format_timestamp(sample.timestamp), "2025-01-01T00:05:00.000Z");
        assert_eq!(sample.gateways.as_deref(), Some("Barn"));
        assert_eq!(sample.measures.len(), 1);
        assert_eq!(sample.measures.get(&Measure::Temperature), Some(&71.5));
    }

    #[test]
    fn reading_without_timestamp_or_sensor_is_invalid() {
        let missing_observed = json!({ "temperature": 70.0 });
        assert!(Sample::from_reading("1", missing_observed, &Measure::ALL).is_none());

        let bad_observed = json!({ "observed": "yesterday" });
        assert!(Sample::from_reading("1", bad_observed, &Measure::ALL).is_none());

        let ok = json!({ "observed": "2025-01-01T00:00:00Z" });
        assert!(Sample::from_reading("  ", ok, &Measure::ALL).is_none());
    }

    #[test]
    fn measure_names_round_trip_through_parse() {
        for measure in Measure::ALL {
            assert_eq!(Measure::parse(measure.as_str()), Some(measure));
        }
        assert_eq!(Measure::parse(" Barometric_Pressure "), Some(Measure::BarometricPressure));
        assert_eq!(Measure::parse("vpd"), None);
    }
}
