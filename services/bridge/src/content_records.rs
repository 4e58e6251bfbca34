use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::postgres::PgPool;
use thiserror::Error;
use tracing::{debug, instrument};

/// A record update matched no row
#[derive(Debug, Error)]
#[error("{entity} {id} not found")]
pub struct RecordNotFound {
    pub entity: &'static str,
    pub id: i64,
}

/// Relational records that reference uploaded objects
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ContentRecords: Send + Sync {
    /// Round-trip to the database, for readiness checks
    async fn ping(&self) -> Result<()>;

    async fn article_exists(&self, article_id: i64) -> Result<bool>;

    /// Point the user's profile image at `url`
    async fn set_user_profile_image(&self, user_id: i64, url: &str) -> Result<()>;

    /// Point the article's cover image at `url`
    async fn set_article_cover(&self, article_id: i64, url: &str) -> Result<()>;
}

pub struct PgContentRecords {
    pool: PgPool,
}

impl PgContentRecords {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ContentRecords for PgContentRecords {
    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .context("Database ping failed")?;
        Ok(())
    }

    async fn article_exists(&self, article_id: i64) -> Result<bool> {
        let exists: (bool,) = sqlx::query_as("SELECT EXISTS(SELECT 1 FROM articles WHERE id = $1)")
            .bind(article_id)
            .fetch_one(&self.pool)
            .await
            .context("Failed to check article")?;

        Ok(exists.0)
    }

    #[instrument(skip(self))]
    async fn set_user_profile_image(&self, user_id: i64, url: &str) -> Result<()> {
        let result = sqlx::query("UPDATE users SET img_profile = $1 WHERE id = $2")
            .bind(url)
            .bind(user_id)
            .execute(&self.pool)
            .await
            .context("Failed to update user profile image")?;

        if result.rows_affected() == 0 {
            return Err(RecordNotFound {
                entity: "user",
                id: user_id,
            }
            .into());
        }

        debug!("User profile image updated");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn set_article_cover(&self, article_id: i64, url: &str) -> Result<()> {
        let result = sqlx::query("UPDATE articles SET cover_image = $1 WHERE id = $2")
            .bind(url)
            .bind(article_id)
            .execute(&self.pool)
            .await
            .context("Failed to update article cover")?;

        if result.rows_affected() == 0 {
            return Err(RecordNotFound {
                entity: "article",
                id: article_id,
            }
            .into());
        }

        debug!("Article cover updated");
        Ok(())
    }
}
