//! SQLite persistence for platecheck: analysis cache, review archive,
//! discovery catalog, place summaries, and bulk job records.

pub mod error;

mod cache;
mod catalog;
mod jobs;
mod places;
mod reviews;

pub use cache::CachedAnalysis;
pub use catalog::{CatalogPlace, CatalogRow, NewCatalogPlace};
pub use error::{Result, StoreError};
pub use jobs::{Job, JobUpdate};
pub use places::PlaceSummary;
pub use reviews::{NewReview, ReviewSummary, StoredReview};

use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tokio::sync::Mutex;

pub struct Store {
    pool: SqlitePool,
    // SQLite allows one writer; multi-statement sequences take this lock so
    // they never interleave.
    write_lock: Mutex<()>,
}

impl Store {
    /// Open (creating if needed) the database at `database_url`.
    ///
    /// The pool is capped at one connection: in-memory databases are
    /// per-connection, and the single-writer model keeps dedup sequences
    /// simple.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Ok(Self {
            pool,
            write_lock: Mutex::new(()),
        })
    }

    /// Run the embedded SQL migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Canonical key for a previously upgraded identity, if one is recorded.
    pub async fn resolve_alias(&self, key: &str) -> Result<Option<String>> {
        let canonical = sqlx::query_scalar::<_, String>(
            "SELECT canonical FROM identity_aliases WHERE alias = ?1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(canonical)
    }

    /// Move every row keyed by `old_key` under `new_key`, and record the old
    /// key as an alias so future lookups land on the new one.
    ///
    /// Used when a short link or free-text search later resolves to a real
    /// place identifier. Rows already present under the new key win; the old
    /// ones are dropped.
    pub async fn reassign_identity(&self, old_key: &str, new_key: &str) -> Result<()> {
        if old_key == new_key {
            return Ok(());
        }
        let _guard = self.write_lock.lock().await;

        sqlx::query(
            "INSERT OR REPLACE INTO identity_aliases (alias, canonical, created_at) VALUES (?1, ?2, ?3)",
        )
        .bind(old_key)
        .bind(new_key)
        .bind(chrono::Utc::now())
        .execute(&self.pool)
        .await?;
        // Anything that pointed at the old key now points through it.
        sqlx::query("UPDATE identity_aliases SET canonical = ?2 WHERE canonical = ?1")
            .bind(old_key)
            .bind(new_key)
            .execute(&self.pool)
            .await?;

        sqlx::query("UPDATE OR IGNORE place_reviews SET place_identity = ?2 WHERE place_identity = ?1")
            .bind(old_key)
            .bind(new_key)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM place_reviews WHERE place_identity = ?1")
            .bind(old_key)
            .execute(&self.pool)
            .await?;

        sqlx::query("UPDATE OR IGNORE place_catalog SET place_identity = ?2 WHERE place_identity = ?1")
            .bind(old_key)
            .bind(new_key)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM place_catalog WHERE place_identity = ?1")
            .bind(old_key)
            .execute(&self.pool)
            .await?;

        sqlx::query("UPDATE OR IGNORE analysis_cache SET identity_key = ?2 WHERE identity_key = ?1")
            .bind(old_key)
            .bind(new_key)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM analysis_cache WHERE identity_key = ?1")
            .bind(old_key)
            .execute(&self.pool)
            .await?;

        sqlx::query("UPDATE OR IGNORE places SET place_identity = ?2 WHERE place_identity = ?1")
            .bind(old_key)
            .bind(new_key)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM places WHERE place_identity = ?1")
            .bind(old_key)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub(crate) fn write_lock(&self) -> &Mutex<()> {
        &self.write_lock
    }
}
