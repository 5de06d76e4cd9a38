use crate::error::CheckpointError;
use crate::sample::{format_timestamp, Sensor};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::future::Future;
use std::path::Path;

/// Durable per-sensor high-water marks: the newest sample timestamp that has
/// been acknowledged by the sink.
pub trait CheckpointStore: Send + Sync {
    fn load(
        &self,
        sensor: &Sensor,
    ) -> impl Future<Output = Result<Option<DateTime<Utc>>, CheckpointError>> + Send;

    /// Moves the sensor's checkpoint forward to `observed` and returns the
    /// stored value. Never moves it backwards.
    fn advance(
        &self,
        sensor: &Sensor,
        observed: DateTime<Utc>,
    ) -> impl Future<Output = Result<DateTime<Utc>, CheckpointError>> + Send;
}

pub struct SqliteCheckpointStore {
    pool: SqlitePool,
}

impl SqliteCheckpointStore {
    pub async fn open(path: &Path) -> Result<Self, CheckpointError> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|err| {
                CheckpointError::Unavailable(format!("create {}: {err}", parent.display()))
            })?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS checkpoints (
                sensor_id TEXT PRIMARY KEY,
                name TEXT,
                description TEXT,
                observed_ns INTEGER NOT NULL,
                observed TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        tracing::info!(path = %path.display(), "checkpoint store ready");
        Ok(Self { pool })
    }
}

impl CheckpointStore for SqliteCheckpointStore {
    async fn load(&self, sensor: &Sensor) -> Result<Option<DateTime<Utc>>, CheckpointError> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT observed_ns FROM checkpoints WHERE sensor_id = ?1")
                .bind(&sensor.id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(observed_ns,)| DateTime::from_timestamp_nanos(observed_ns)))
    }

    async fn advance(
        &self,
        sensor: &Sensor,
        observed: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, CheckpointError> {
        let observed_ns = observed
            .timestamp_nanos_opt()
            .ok_or_else(|| CheckpointError::Corrupt {
                sensor_id: sensor.id.clone(),
                detail: format!("{} is outside the storable range", format_timestamp(observed)),
            })?;
        let (stored_ns,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO checkpoints (sensor_id, name, description, observed_ns, observed, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT (sensor_id)
            DO UPDATE SET
                name = excluded.name,
                description = excluded.description,
                observed = CASE
                    WHEN excluded.observed_ns > checkpoints.observed_ns THEN excluded.observed
                    ELSE checkpoints.observed
                END,
                observed_ns = MAX(checkpoints.observed_ns, excluded.observed_ns),
                updated_at = excluded.updated_at
            RETURNING observed_ns
            "#,
        )
        .bind(&sensor.id)
        .bind(&sensor.name)
        .bind(&sensor.description)
        .bind(observed_ns)
        .bind(format_timestamp(observed))
        .bind(format_timestamp(Utc::now()))
        .fetch_one(&self.pool)
        .await?;
        Ok(DateTime::from_timestamp_nanos(stored_ns))
    }
}
