use crate::config::DatabaseConfig;
use anyhow::{Context, Result};
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::info;

/// Connection pools for the relational and time-series stores.
///
/// The pools are cheap to clone; every store implementation holds its own handle and
/// connection pooling stays the pool's responsibility.
#[derive(Clone)]
pub struct Databases {
    pub postgres: PgPool,
    pub timescale: PgPool,
}

impl Databases {
    /// Connect both pools
    pub async fn connect(postgres: &DatabaseConfig, timescale: &DatabaseConfig) -> Result<Self> {
        let postgres = connect_pool(postgres, "postgres")
            .await
            .context("Failed to connect to PostgreSQL")?;
        let timescale = connect_pool(timescale, "timescale")
            .await
            .context("Failed to connect to TimescaleDB")?;

        Ok(Self {
            postgres,
            timescale,
        })
    }

    /// Close both pools, waiting for checked-out connections to return
    pub async fn close(&self) {
        self.postgres.close().await;
        self.timescale.close().await;
        info!("Database pools closed");
    }
}

async fn connect_pool(config: &DatabaseConfig, name: &str) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(config.connect_timeout())
        .idle_timeout(Some(config.idle_timeout()))
        .connect(&config.url)
        .await?;

    info!(database = name, "Connected to database");

    Ok(pool)
}
