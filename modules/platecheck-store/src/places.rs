// Per-place summary side channel, updated after each successful analysis.

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::{Result, Store};

/// A row from the places table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PlaceSummary {
    pub place_identity: String,
    pub display_name: String,
    pub reference_url: String,
    pub last_mode: Option<String>,
    pub last_review_count: i64,
    pub summary: Option<Value>,
    pub updated_at: DateTime<Utc>,
}

impl Store {
    /// Record the latest known state of a place. An empty display name never
    /// overwrites a non-empty one.
    pub async fn upsert_place_summary(
        &self,
        place_identity: &str,
        display_name: &str,
        reference_url: &str,
        mode: &str,
        review_count: i64,
        summary: Option<&Value>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO places
                (place_identity, display_name, reference_url, last_mode,
                 last_review_count, summary, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT (place_identity) DO UPDATE SET
                display_name = CASE
                    WHEN excluded.display_name != '' THEN excluded.display_name
                    ELSE display_name
                END,
                reference_url = excluded.reference_url,
                last_mode = excluded.last_mode,
                last_review_count = excluded.last_review_count,
                summary = COALESCE(excluded.summary, summary),
                updated_at = excluded.updated_at
            "#,
        )
        .bind(place_identity)
        .bind(display_name)
        .bind(reference_url)
        .bind(mode)
        .bind(review_count)
        .bind(summary)
        .bind(Utc::now())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn place_summary(&self, place_identity: &str) -> Result<Option<PlaceSummary>> {
        let row = sqlx::query_as::<_, PlaceSummary>(
            "SELECT * FROM places WHERE place_identity = ?1",
        )
        .bind(place_identity)
        .fetch_optional(self.pool())
        .await?;
        Ok(row)
    }
}
