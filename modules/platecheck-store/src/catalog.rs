// Discovery catalog: places found by bulk search, grouped under a tag.
// Each entry also tracks its own analysis lifecycle, which is what makes a
// crashed bulk run resumable by re-invoking with the same tag.

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::{Result, Store};

/// An incoming catalog entry from a discovery pass.
#[derive(Debug, Clone)]
pub struct NewCatalogPlace {
    pub place_identity: String,
    pub name: String,
    pub address: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub map_url: Option<String>,
    pub place_id: Option<String>,
    pub cid: Option<String>,
    pub categories: Value,
    pub rating: Option<f64>,
    pub reviews_count: Option<i64>,
    pub source_query: Option<String>,
}

/// A row from the place_catalog table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CatalogPlace {
    pub id: i64,
    pub tag: String,
    pub place_identity: String,
    pub name: String,
    pub address: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub map_url: Option<String>,
    pub place_id: Option<String>,
    pub cid: Option<String>,
    pub categories: Option<Value>,
    pub rating: Option<f64>,
    pub reviews_count: Option<i64>,
    pub source_query: Option<String>,
    pub analyze_status: String,
    pub last_analyzed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub discovered_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

/// Catalog entry joined with its cached report, if one exists.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CatalogRow {
    #[sqlx(flatten)]
    pub place: CatalogPlace,
    pub report: Option<Value>,
}

impl Store {
    /// Insert or merge a discovered place under a tag. Re-discovery refreshes
    /// the name and fills gaps without erasing fields a later pass failed to
    /// return. Returns true when the row is genuinely new under this tag.
    pub async fn upsert_catalog_place(&self, tag: &str, place: &NewCatalogPlace) -> Result<bool> {
        let _guard = self.write_lock().lock().await;
        let now = Utc::now();

        let existing = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM place_catalog WHERE tag = ?1 AND place_identity = ?2",
        )
        .bind(tag)
        .bind(&place.place_identity)
        .fetch_one(self.pool())
        .await?;

        sqlx::query(
            r#"
            INSERT INTO place_catalog
                (tag, place_identity, name, address, latitude, longitude,
                 map_url, place_id, cid, categories, rating, reviews_count,
                 source_query, discovered_at, last_seen_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?14)
            ON CONFLICT (tag, place_identity) DO UPDATE SET
                name = CASE WHEN excluded.name != '' THEN excluded.name ELSE name END,
                address = COALESCE(excluded.address, address),
                latitude = COALESCE(excluded.latitude, latitude),
                longitude = COALESCE(excluded.longitude, longitude),
                map_url = COALESCE(excluded.map_url, map_url),
                place_id = COALESCE(excluded.place_id, place_id),
                cid = COALESCE(excluded.cid, cid),
                categories = COALESCE(excluded.categories, categories),
                rating = COALESCE(excluded.rating, rating),
                reviews_count = COALESCE(excluded.reviews_count, reviews_count),
                source_query = COALESCE(excluded.source_query, source_query),
                last_seen_at = excluded.last_seen_at
            "#,
        )
        .bind(tag)
        .bind(&place.place_identity)
        .bind(&place.name)
        .bind(&place.address)
        .bind(place.latitude)
        .bind(place.longitude)
        .bind(&place.map_url)
        .bind(&place.place_id)
        .bind(&place.cid)
        .bind(&place.categories)
        .bind(place.rating)
        .bind(place.reviews_count)
        .bind(&place.source_query)
        .bind(now)
        .execute(self.pool())
        .await?;

        Ok(existing == 0)
    }

    /// Record an analysis lifecycle transition for one catalog entry. Error
    /// text is kept as given; callers truncate. Terminal transitions stamp
    /// `last_analyzed_at`.
    pub async fn set_analyze_status(
        &self,
        tag: &str,
        place_identity: &str,
        status: &str,
        error: Option<&str>,
    ) -> Result<()> {
        let analyzed_at = match status {
            "done" | "skipped_no_new_data" | "error" => Some(Utc::now()),
            _ => None,
        };
        sqlx::query(
            r#"
            UPDATE place_catalog SET
                analyze_status = ?3,
                last_error = ?4,
                last_analyzed_at = COALESCE(?5, last_analyzed_at)
            WHERE tag = ?1 AND place_identity = ?2
            "#,
        )
        .bind(tag)
        .bind(place_identity)
        .bind(status)
        .bind(error)
        .bind(analyzed_at)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Every catalog entry under a tag, ordered by name.
    pub async fn catalog_places(&self, tag: &str) -> Result<Vec<CatalogPlace>> {
        let rows = sqlx::query_as::<_, CatalogPlace>(
            "SELECT * FROM place_catalog WHERE tag = ?1 ORDER BY name, place_identity",
        )
        .bind(tag)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    /// Catalog entries joined with their cached report for a mode.
    pub async fn catalog_with_analysis(&self, tag: &str, mode: &str) -> Result<Vec<CatalogRow>> {
        let rows = sqlx::query_as::<_, CatalogRow>(
            r#"
            SELECT c.*, a.report AS report
            FROM place_catalog c
            LEFT JOIN analysis_cache a
                ON a.identity_key = c.place_identity AND a.mode = ?2
            WHERE c.tag = ?1
            ORDER BY c.name, c.place_identity
            "#,
        )
        .bind(tag)
        .bind(mode)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    pub async fn catalog_count(&self, tag: &str) -> Result<i64> {
        let count =
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM place_catalog WHERE tag = ?1")
                .bind(tag)
                .fetch_one(self.pool())
                .await?;
        Ok(count)
    }
}
