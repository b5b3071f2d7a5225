// Durable review archive, deduplicated per place.

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::{Result, Store};

/// An incoming review prior to insertion.
#[derive(Debug, Clone)]
pub struct NewReview {
    pub review_id: String,
    pub author: String,
    pub rating: Option<f64>,
    pub text: String,
    pub published_at: Option<DateTime<Utc>>,
    pub has_photo: bool,
    pub photo_urls: Value,
    pub raw: Value,
}

/// A row from the place_reviews table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredReview {
    pub id: i64,
    pub place_identity: String,
    pub review_id: String,
    pub author: String,
    pub rating: Option<f64>,
    pub text: String,
    pub published_at: Option<DateTime<Utc>>,
    pub has_photo: bool,
    pub photo_urls: Option<Value>,
    pub raw: Value,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

/// Aggregate view of a place's archived reviews.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ReviewSummary {
    pub total: i64,
    pub with_text: i64,
    pub average_rating: Option<f64>,
    pub latest_published_at: Option<DateTime<Utc>>,
}

impl Store {
    /// Archive a batch of reviews for a place. Rows are keyed by
    /// (place, review_id). A re-seen review only refreshes `raw` and
    /// `last_seen_at`; `first_seen_at` never changes. Returns
    /// (newly inserted, processed): the skip-reanalysis decision depends on
    /// the inserted count covering only genuinely new rows.
    pub async fn upsert_reviews(
        &self,
        place_identity: &str,
        reviews: &[NewReview],
    ) -> Result<(u64, u64)> {
        let _guard = self.write_lock().lock().await;
        let now = Utc::now();
        let mut inserted = 0u64;

        for review in reviews {
            let result = sqlx::query(
                r#"
                INSERT OR IGNORE INTO place_reviews
                    (place_identity, review_id, author, rating, text,
                     published_at, has_photo, photo_urls, raw,
                     first_seen_at, last_seen_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)
                "#,
            )
            .bind(place_identity)
            .bind(&review.review_id)
            .bind(&review.author)
            .bind(review.rating)
            .bind(&review.text)
            .bind(review.published_at)
            .bind(review.has_photo)
            .bind(&review.photo_urls)
            .bind(&review.raw)
            .bind(now)
            .execute(self.pool())
            .await?;

            if result.rows_affected() > 0 {
                inserted += 1;
            } else {
                sqlx::query(
                    r#"
                    UPDATE place_reviews SET raw = ?3, last_seen_at = ?4
                    WHERE place_identity = ?1 AND review_id = ?2
                    "#,
                )
                .bind(place_identity)
                .bind(&review.review_id)
                .bind(&review.raw)
                .bind(now)
                .execute(self.pool())
                .await?;
            }
        }

        Ok((inserted, reviews.len() as u64))
    }

    /// Archived reviews for a place, newest first. Reviews without a publish
    /// date sort last.
    pub async fn reviews_for(
        &self,
        place_identity: &str,
        limit: i64,
    ) -> Result<Vec<StoredReview>> {
        let limit = limit.clamp(1, 500);
        let rows = sqlx::query_as::<_, StoredReview>(
            r#"
            SELECT * FROM place_reviews
            WHERE place_identity = ?1
            ORDER BY published_at IS NULL, published_at DESC
            LIMIT ?2
            "#,
        )
        .bind(place_identity)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    pub async fn review_count(&self, place_identity: &str) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM place_reviews WHERE place_identity = ?1",
        )
        .bind(place_identity)
        .fetch_one(self.pool())
        .await?;
        Ok(count)
    }

    pub async fn review_summary(&self, place_identity: &str) -> Result<ReviewSummary> {
        let summary = sqlx::query_as::<_, ReviewSummary>(
            r#"
            SELECT
                COUNT(*) AS total,
                COUNT(CASE WHEN length(text) > 0 THEN 1 END) AS with_text,
                AVG(rating) AS average_rating,
                MAX(published_at) AS latest_published_at
            FROM place_reviews
            WHERE place_identity = ?1
            "#,
        )
        .bind(place_identity)
        .fetch_one(self.pool())
        .await?;
        Ok(summary)
    }
}
