use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPool;
use tracing::{debug, instrument};

/// One accepted sensor reading. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub install_code: String,
    /// Temperature in degrees Celsius
    pub temperature: f64,
    /// Relative humidity in percent
    pub humidity: f64,
    pub timestamp: DateTime<Utc>,
}

/// Append side of the time-series store
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SensorStore: Send + Sync {
    async fn append(&self, reading: &SensorReading) -> Result<()>;
}

/// Sensor store backed by the TimescaleDB `sensors` hypertable
pub struct TimescaleSensorStore {
    pool: PgPool,
}

impl TimescaleSensorStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SensorStore for TimescaleSensorStore {
    #[instrument(skip(self, reading), fields(install_code = %reading.install_code))]
    async fn append(&self, reading: &SensorReading) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sensors (install_code, suhu, kelembaban, timestamp)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(&reading.install_code)
        .bind(reading.temperature)
        .bind(reading.humidity)
        .bind(reading.timestamp)
        .execute(&self.pool)
        .await
        .context("Failed to insert sensor reading")?;

        debug!(timestamp = %reading.timestamp, "Sensor reading stored");

        Ok(())
    }
}
