use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    /// Timeouts, connection failures, 5xx and 429. Safe to retry.
    #[error("transient upstream failure{}: {message}", status_suffix(.status))]
    Transient {
        status: Option<u16>,
        message: String,
        retry_after: Option<Duration>,
    },
    #[error("upstream rejected credentials: {0}")]
    Unauthorized(String),
    #[error("upstream rejected request ({status}): {body}")]
    Terminal { status: u16, body: String },
    #[error("failed to decode upstream response: {0}")]
    Decode(String),
    #[error("giving up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: Box<ApiError> },
}

impl ApiError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ApiError::Transient { .. })
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ApiError::Transient { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Maps a non-success HTTP status onto the error taxonomy.
    pub(crate) fn from_status(status: u16, body: String, retry_after: Option<Duration>) -> Self {
        match status {
            401 => ApiError::Unauthorized(body),
            429 | 500..=599 => ApiError::Transient {
                status: Some(status),
                message: body,
                retry_after,
            },
            _ => ApiError::Terminal { status, body },
        }
    }

    pub(crate) fn from_transport(err: reqwest::Error) -> Self {
        if err.is_decode() {
            return ApiError::Decode(err.to_string());
        }
        ApiError::Transient {
            status: err.status().map(|status| status.as_u16()),
            message: err.to_string(),
            retry_after: None,
        }
    }
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|code| format!(" ({code})")).unwrap_or_default()
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("bulk request failed: {0}")]
    Transport(String),
    #[error("bulk request rejected ({status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("bulk write partially failed: {written} written, {failed} failed (first error: {first_error})")]
    Partial {
        written: usize,
        failed: usize,
        first_error: String,
    },
}

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("checkpoint for sensor {sensor_id} is unreadable: {detail}")]
    Corrupt { sensor_id: String, detail: String },
    #[error("checkpoint store unavailable: {0}")]
    Unavailable(String),
}

/// Why one sensor's cycle stopped early. The sensor's checkpoint is left at the
/// last page that was fully sunk.
#[derive(Debug, Error)]
pub enum SensorCycleError {
    #[error("fetch failed: {0}")]
    Api(#[from] ApiError),
    #[error("sink failed: {0}")]
    Sink(#[from] SinkError),
    #[error("checkpoint failed: {0}")]
    Checkpoint(#[from] CheckpointError),
}

impl SensorCycleError {
    /// Without a trustworthy checkpoint the resume point is unknown, so the
    /// whole cycle stops.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SensorCycleError::Checkpoint(_))
    }
}
