// Cached analysis reports, one row per (identity, mode).

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::{Result, Store};

/// A row from the analysis_cache table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CachedAnalysis {
    pub identity_key: String,
    pub mode: String,
    pub reference_url: String,
    pub display_name: String,
    pub report: Value,
    pub review_count: i64,
    pub created_at: DateTime<Utc>,
}

impl CachedAnalysis {
    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.created_at
    }
}

impl Store {
    /// Fetch a cached report. The TTL is evaluated at read time: an expired
    /// row counts as absent unless `allow_stale` is set, in which case it is
    /// returned with its age intact so callers can label it.
    pub async fn cached_analysis(
        &self,
        identity_key: &str,
        mode: &str,
        ttl: Duration,
        allow_stale: bool,
    ) -> Result<Option<CachedAnalysis>> {
        let row = sqlx::query_as::<_, CachedAnalysis>(
            "SELECT * FROM analysis_cache WHERE identity_key = ?1 AND mode = ?2",
        )
        .bind(identity_key)
        .bind(mode)
        .fetch_optional(self.pool())
        .await?;

        let Some(row) = row else { return Ok(None) };
        if allow_stale {
            return Ok(Some(row));
        }

        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        if row.age() >= ttl {
            return Ok(None);
        }
        Ok(Some(row))
    }

    /// Insert or replace the cached report for (identity, mode).
    pub async fn put_analysis(
        &self,
        identity_key: &str,
        mode: &str,
        reference_url: &str,
        display_name: &str,
        report: &Value,
        review_count: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO analysis_cache
                (identity_key, mode, reference_url, display_name,
                 report, review_count, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(identity_key)
        .bind(mode)
        .bind(reference_url)
        .bind(display_name)
        .bind(report)
        .bind(review_count)
        .bind(Utc::now())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Drop cached reports for an identity. `mode = None` clears every mode.
    /// Returns the number of rows removed.
    pub async fn delete_analysis(&self, identity_key: &str, mode: Option<&str>) -> Result<u64> {
        let result = match mode {
            Some(mode) => {
                sqlx::query("DELETE FROM analysis_cache WHERE identity_key = ?1 AND mode = ?2")
                    .bind(identity_key)
                    .bind(mode)
                    .execute(self.pool())
                    .await?
            }
            None => {
                sqlx::query("DELETE FROM analysis_cache WHERE identity_key = ?1")
                    .bind(identity_key)
                    .execute(self.pool())
                    .await?
            }
        };
        Ok(result.rows_affected())
    }

    /// Physically remove entries older than `ttl`. Returns the count removed.
    pub async fn purge_expired(&self, ttl: Duration) -> Result<u64> {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        let cutoff = Utc::now() - ttl;
        let result = sqlx::query("DELETE FROM analysis_cache WHERE created_at <= ?1")
            .bind(cutoff)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected())
    }

    /// Most recently produced reports, newest first.
    pub async fn recent_analyses(&self, limit: i64) -> Result<Vec<CachedAnalysis>> {
        let rows = sqlx::query_as::<_, CachedAnalysis>(
            "SELECT * FROM analysis_cache ORDER BY created_at DESC LIMIT ?1",
        )
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }
}
