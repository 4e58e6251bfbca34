use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::postgres::PgPool;
use tracing::instrument;

/// Lookup of provisioned devices by install code.
///
/// Registrations are created by device provisioning elsewhere; this side only reads them.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    /// Whether `install_code` belongs to a provisioned device
    async fn is_registered(&self, install_code: &str) -> Result<bool>;
}

/// Device registry backed by the `iot_devices` table
pub struct PgDeviceRegistry {
    pool: PgPool,
}

impl PgDeviceRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeviceRegistry for PgDeviceRegistry {
    #[instrument(skip(self))]
    async fn is_registered(&self, install_code: &str) -> Result<bool> {
        let exists: (bool,) =
            sqlx::query_as("SELECT EXISTS(SELECT 1 FROM iot_devices WHERE install_code = $1)")
                .bind(install_code)
                .fetch_one(&self.pool)
                .await
                .context("Failed to look up install code")?;

        Ok(exists.0)
    }
}
