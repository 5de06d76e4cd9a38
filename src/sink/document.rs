use crate::sample::{format_timestamp, Measure, Sample, Sensor};
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value as JsonValue};
use sha2::{Digest, Sha256};

/// Shapes one sample into the flat document stored in the index.
pub fn build_document(
    sensor: &Sensor,
    sample: &Sample,
    measures: &[Measure],
    ingested: DateTime<Utc>,
) -> JsonValue {
    let observed = format_timestamp(sample.timestamp);
    let mut doc = Map::new();
    doc.insert("@timestamp".to_string(), json!(observed));
    doc.insert("message".to_string(), sample.raw.clone());
    doc.insert("sensor.id".to_string(), json!(sample.sensor_id));
    doc.insert("sensor.name".to_string(), json!(sensor.display_name()));
    doc.insert("sensor.description".to_string(), json!(sensor.description));
    doc.insert("sensor.observed".to_string(), json!(observed));
    doc.insert("sensor.ingested".to_string(), json!(format_timestamp(ingested)));
    doc.insert("sensor.gateways".to_string(), json!(sample.gateways));
    for measure in measures {
        doc.insert(
            format!("sensor.{}", measure.as_str()),
            json!(sample.measures.get(measure)),
        );
    }
    JsonValue::Object(doc)
}

/// Content hash of the sample: stable across re-fetches of the same reading,
/// so re-sinking it is a no-op for `create` actions.
pub fn document_id(sample: &Sample) -> String {
    let mut canonical = String::new();
    write_canonical(&sample.raw, &mut canonical);

    let mut hasher = Sha256::new();
    hasher.update(sample.sensor_id.as_bytes());
    hasher.update(b"\n");
    hasher.update(canonical.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn write_canonical(value: &JsonValue, out: &mut String) {
    match value {
        JsonValue::Object(map) => {
            let mut entries: Vec<(&String, &JsonValue)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (idx, (key, value)) in entries.into_iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                out.push_str(&JsonValue::String(key.clone()).to_string());
                out.push(':');
                write_canonical(value, out);
            }
            out.push('}');
        }
        JsonValue::Array(items) => {
            out.push('[');
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// NDJSON body for `_bulk`: one `create` action line and one source line per
/// document.
pub fn bulk_body(index: &str, documents: &[(String, JsonValue)]) -> String {
    let mut body = String::new();
    for (id, document) in documents {
        let action = json!({ "create": { "_index": index, "_id": id } });
        body.push_str(&action.to_string());
        body.push('\n');
        body.push_str(&document.to_string());
        body.push('\n');
    }
    body
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct BulkSummary {
    pub written: usize,
    /// `create` conflicts: the document is already in the index.
    pub duplicates: usize,
    pub failed: usize,
    pub first_error: Option<String>,
}

impl BulkSummary {
    pub fn acknowledged(&self) -> usize {
        self.written + self.duplicates
    }
}

pub fn summarize_bulk_response(response: &JsonValue) -> BulkSummary {
    let mut summary = BulkSummary::default();
    let items = response
        .get("items")
        .and_then(JsonValue::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    for item in items {
        let Some(result) = item
            .as_object()
            .and_then(|actions| actions.values().next())
        else {
            summary.failed += 1;
            continue;
        };
        let status = result.get("status").and_then(JsonValue::as_u64).unwrap_or(0);
        match status {
            200..=299 => summary.written += 1,
            409 => summary.duplicates += 1,
            _ => {
                summary.failed += 1;
                if summary.first_error.is_none() {
                    let reason = result
                        .get("error")
                        .map(|error| {
                            error
                                .get("reason")
                                .and_then(JsonValue::as_str)
                                .map(str::to_string)
                                .unwrap_or_else(|| error.to_string())
                        })
                        .unwrap_or_else(|| "no error detail".to_string());
                    summary.first_error = Some(format!("status {status}: {reason}"));
                }
            }
        }
    }
    summary
}
