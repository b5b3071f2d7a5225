// Bulk job records. Progress survives process restarts and quota aborts.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{Result, Store};

/// A row from the jobs table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Job {
    pub id: String,
    pub kind: String,
    pub tag: String,
    pub status: String,
    pub total: i64,
    pub completed: i64,
    pub failed: i64,
    pub skipped: i64,
    pub detail: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Partial progress update. `None` fields keep their stored value.
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub total: Option<i64>,
    pub completed: Option<i64>,
    pub failed: Option<i64>,
    pub skipped: Option<i64>,
    pub detail: Option<String>,
}

/// Detail column cap; upstream errors can embed whole response bodies.
const MAX_DETAIL_CHARS: usize = 500;

fn clip_detail(detail: &str) -> &str {
    match detail.char_indices().nth(MAX_DETAIL_CHARS) {
        Some((idx, _)) => &detail[..idx],
        None => detail,
    }
}

impl Store {
    /// Create a running job record and return its id.
    pub async fn create_job(&self, kind: &str, tag: &str) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO jobs (id, kind, tag, status, started_at, updated_at)
            VALUES (?1, ?2, ?3, 'running', ?4, ?4)
            "#,
        )
        .bind(&id)
        .bind(kind)
        .bind(tag)
        .bind(now)
        .execute(self.pool())
        .await?;
        Ok(id)
    }

    /// Apply a partial progress update and bump the heartbeat timestamp.
    pub async fn update_job(&self, id: &str, update: &JobUpdate) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs SET
                total = COALESCE(?2, total),
                completed = COALESCE(?3, completed),
                failed = COALESCE(?4, failed),
                skipped = COALESCE(?5, skipped),
                detail = COALESCE(?6, detail),
                updated_at = ?7
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .bind(update.total)
        .bind(update.completed)
        .bind(update.failed)
        .bind(update.skipped)
        .bind(update.detail.as_deref().map(clip_detail))
        .bind(Utc::now())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Mark a job finished with a terminal status.
    pub async fn finish_job(&self, id: &str, status: &str, detail: Option<&str>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs SET
                status = ?2,
                detail = COALESCE(?3, detail),
                updated_at = ?4,
                finished_at = ?4
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .bind(status)
        .bind(detail.map(clip_detail))
        .bind(Utc::now())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn job(&self, id: &str) -> Result<Option<Job>> {
        let row = sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = ?1")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        Ok(row)
    }

    pub async fn recent_jobs(&self, limit: i64) -> Result<Vec<Job>> {
        let rows =
            sqlx::query_as::<_, Job>("SELECT * FROM jobs ORDER BY started_at DESC LIMIT ?1")
                .bind(limit)
                .fetch_all(self.pool())
                .await?;
        Ok(rows)
    }
}
