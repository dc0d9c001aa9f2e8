//! SQLite-backed cache regions: one row per (generation, url).
use chrono::Utc;
use sqlx::Row;
use tracing::instrument;

use super::generation::GenerationPhase;
use crate::db::Pool;
use crate::error::{Error, Result};
use crate::fetch::HttpResponse;

#[derive(Debug, Clone)]
pub struct AssetStore {
    pool: Pool,
}

impl AssetStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, generation: &str, url: &str) -> Result<Option<HttpResponse>> {
        let row = sqlx::query(
            "SELECT status, headers, body FROM cache_assets WHERE generation = ? AND url = ?",
        )
        .bind(generation)
        .bind(url)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let status: i64 = row.try_get("status")?;
        let headers: String = row.try_get("headers")?;
        Ok(Some(HttpResponse {
            status: u16::try_from(status).map_err(|_| {
                Error::StorageUnavailable(format!("cached asset {url} has bad status {status}"))
            })?,
            headers: serde_json::from_str(&headers)?,
            body: row.try_get("body")?,
        }))
    }

    #[instrument(skip_all, fields(generation = %generation, url = %url))]
    pub async fn put(&self, generation: &str, url: &str, response: &HttpResponse) -> Result<()> {
        sqlx::query(
            "INSERT INTO cache_assets (generation, url, status, headers, body, stored_at) \
             VALUES (?, ?, ?, ?, ?, ?) \
             ON CONFLICT(generation, url) DO UPDATE SET status = excluded.status, \
             headers = excluded.headers, body = excluded.body, stored_at = excluded.stored_at",
        )
        .bind(generation)
        .bind(url)
        .bind(i64::from(response.status))
        .bind(serde_json::to_string(&response.headers)?)
        .bind(&response.body)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn count_assets(&self, generation: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM cache_assets WHERE generation = ?")
            .bind(generation)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Drop every asset of `generation`, keeping the generation itself.
    pub async fn clear_generation(&self, generation: &str) -> Result<u64> {
        let res = sqlx::query("DELETE FROM cache_assets WHERE generation = ?")
            .bind(generation)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }

    /// Register `name` as installing. An existing row keeps its phase.
    pub async fn begin_generation(&self, name: &str) -> Result<()> {
        sqlx::query("INSERT INTO cache_generations (name, phase) VALUES (?, ?) ON CONFLICT(name) DO NOTHING")
            .bind(name)
            .bind(GenerationPhase::Installing.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Remove a generation and all of its assets.
    #[instrument(skip_all, fields(name = %name))]
    pub async fn delete_generation(&self, name: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM cache_assets WHERE generation = ?")
            .bind(name)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM cache_generations WHERE name = ?")
            .bind(name)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Every generation name known to the store, including ones that only have assets.
    pub async fn list_generations(&self) -> Result<Vec<String>> {
        let names: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM cache_generations UNION SELECT DISTINCT generation FROM cache_assets ORDER BY 1",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(names)
    }

    pub async fn phase(&self, name: &str) -> Result<Option<GenerationPhase>> {
        let phase: Option<String> =
            sqlx::query_scalar("SELECT phase FROM cache_generations WHERE name = ?")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;
        Ok(phase.and_then(|p| GenerationPhase::parse_phase(&p)))
    }

    pub async fn active_generation(&self) -> Result<Option<String>> {
        let name: Option<String> = sqlx::query_scalar(
            "SELECT name FROM cache_generations WHERE phase = ? ORDER BY created_at DESC LIMIT 1",
        )
        .bind(GenerationPhase::Active.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(name)
    }

    /// Mark `name` active and purge every other generation in one transaction.
    /// Returns the purged names.
    ///
    /// Only an `installing` generation, or the one already active, can be
    /// activated. Unknown names are rejected: purged generations leave no row.
    #[instrument(skip_all, fields(name = %name))]
    pub async fn activate(&self, name: &str) -> Result<Vec<String>> {
        let mut tx = self.pool.begin().await?;
        let phase: Option<String> =
            sqlx::query_scalar("SELECT phase FROM cache_generations WHERE name = ?")
                .bind(name)
                .fetch_optional(&mut *tx)
                .await?;
        match phase.as_deref().and_then(GenerationPhase::parse_phase) {
            Some(GenerationPhase::Active) => {}
            Some(phase) if phase.can_advance_to(GenerationPhase::Active) => {}
            other => {
                return Err(Error::GenerationLifecycle {
                    generation: name.to_string(),
                    phase: other.map_or("missing", |p| p.as_str()),
                });
            }
        }
        let purged: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM cache_generations WHERE name <> ? \
             UNION SELECT DISTINCT generation FROM cache_assets WHERE generation <> ? ORDER BY 1",
        )
        .bind(name)
        .bind(name)
        .fetch_all(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM cache_assets WHERE generation <> ?")
            .bind(name)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM cache_generations WHERE name <> ?")
            .bind(name)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO cache_generations (name, phase) VALUES (?, ?) \
             ON CONFLICT(name) DO UPDATE SET phase = excluded.phase",
        )
        .bind(name)
        .bind(GenerationPhase::Active.as_str())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(purged)
    }
}
