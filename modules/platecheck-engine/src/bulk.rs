// Bulk discovery and analysis over a geographic catalog.
//
// Both passes record durable progress in the jobs table and abort cleanly
// when an external quota runs out: whatever was persisted stays persisted,
// and the job row says how far the run got.

use std::sync::Arc;
use std::time::Duration;

use futures::{stream, StreamExt};
use serde_json::json;
use tracing::{info, warn};

use apify_client::PlaceResult;
use platecheck_common::{resolve, Mode};
use platecheck_store::{CatalogPlace, JobUpdate, NewCatalogPlace, Store};

use crate::analyze::{AnalyzeOptions, Analyzer};
use crate::error::{EngineError, Result};
use crate::gateway::{Gateway, PlaceSearcher};
use crate::heartbeat::Heartbeat;

/// Catalog `last_error` entries are capped; upstream errors can embed whole
/// response bodies.
const MAX_ERROR_CHARS: usize = 300;

#[derive(Debug, Clone, Copy)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lng: f64,
    pub max_lng: f64,
}

impl BoundingBox {
    pub fn contains(&self, lat: f64, lng: f64) -> bool {
        lat >= self.min_lat && lat <= self.max_lat && lng >= self.min_lng && lng <= self.max_lng
    }
}

/// Keeps search results inside the intended region. Text searches leak
/// look-alike places from neighboring districts, so results are filtered
/// before they enter the catalog.
#[derive(Debug, Clone, Default)]
pub struct RegionFilter {
    /// Address must contain at least one of these (when non-empty).
    pub required_terms: Vec<String>,
    /// Address containing any of these is rejected outright.
    pub excluded_terms: Vec<String>,
    /// Coordinate fallback for results without a usable address.
    pub bbox: Option<BoundingBox>,
}

impl RegionFilter {
    pub fn accepts(&self, address: Option<&str>, lat: Option<f64>, lng: Option<f64>) -> bool {
        if let Some(address) = address.filter(|a| !a.trim().is_empty()) {
            let address = address.to_lowercase();
            if self
                .excluded_terms
                .iter()
                .any(|term| address.contains(&term.to_lowercase()))
            {
                return false;
            }
            if self.required_terms.is_empty() {
                return true;
            }
            return self
                .required_terms
                .iter()
                .any(|term| address.contains(&term.to_lowercase()));
        }

        // No address signal: fall back to coordinates when a bbox is set.
        match self.bbox {
            Some(bbox) => matches!((lat, lng), (Some(lat), Some(lng)) if bbox.contains(lat, lng)),
            None => true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    pub limit_per_query: u32,
    pub language: String,
    pub filter: RegionFilter,
    pub workers: usize,
    /// Queries per actor run. One run handles several searches.
    pub queries_per_batch: usize,
    /// Stop early once this many genuinely new places entered the catalog.
    /// Late queries in a saturated region mostly re-find known places.
    pub max_new_places: Option<u64>,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            limit_per_query: 100,
            language: "en".to_string(),
            filter: RegionFilter::default(),
            workers: 2,
            queries_per_batch: 4,
            max_new_places: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DiscoveryReport {
    pub job_id: String,
    pub found: u64,
    pub kept: u64,
    /// Kept places not already in the catalog under this tag.
    pub new: u64,
    pub filtered: u64,
}

#[derive(Debug, Clone)]
pub struct AnalysisRunOptions {
    pub mode: Mode,
    pub workers: usize,
    /// Re-analyze even when the scrape turned up nothing new.
    pub refresh: bool,
}

#[derive(Debug, Clone)]
pub struct AnalysisReport {
    pub job_id: String,
    pub analyzed: u64,
    pub skipped: u64,
    pub failed: u64,
}

pub struct BulkOrchestrator {
    store: Arc<Store>,
    gateway: Arc<Gateway>,
    searcher: Arc<dyn PlaceSearcher>,
    analyzer: Arc<Analyzer>,
    heartbeat_interval: Duration,
}

impl BulkOrchestrator {
    pub fn new(
        store: Arc<Store>,
        gateway: Arc<Gateway>,
        searcher: Arc<dyn PlaceSearcher>,
        analyzer: Arc<Analyzer>,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            store,
            gateway,
            searcher,
            analyzer,
            heartbeat_interval,
        }
    }

    fn job_heartbeat(&self, job_id: &str) -> Heartbeat {
        let store = Arc::clone(&self.store);
        let job_id = job_id.to_string();
        Heartbeat::start(self.heartbeat_interval, move || {
            let store = Arc::clone(&store);
            let job_id = job_id.clone();
            async move {
                if let Err(err) = store.update_job(&job_id, &JobUpdate::default()).await {
                    warn!(job = %job_id, error = %err, "Job heartbeat write failed");
                }
            }
        })
    }

    /// Run text searches and file accepted places into the catalog under
    /// `tag`. Returns `QuotaExhausted` when the quota ran out mid-run; every
    /// batch persisted before the abort stays in the catalog.
    pub async fn run_discovery(
        &self,
        tag: &str,
        queries: &[String],
        options: &DiscoveryOptions,
    ) -> Result<DiscoveryReport> {
        let batches: Vec<Vec<String>> = queries
            .chunks(options.queries_per_batch.max(1))
            .map(|c| c.to_vec())
            .collect();

        let job_id = self.store.create_job("discovery", tag).await?;
        self.store
            .update_job(
                &job_id,
                &JobUpdate {
                    total: Some(batches.len() as i64),
                    ..Default::default()
                },
            )
            .await?;
        let heartbeat = self.job_heartbeat(&job_id);

        info!(tag, job = %job_id, queries = queries.len(), batches = batches.len(), "Starting discovery");

        let mut report = DiscoveryReport {
            job_id: job_id.clone(),
            found: 0,
            kept: 0,
            new: 0,
            filtered: 0,
        };
        let mut completed = 0i64;
        let mut failed = 0i64;
        let mut quota: Option<String> = None;
        let mut saturated = false;

        let mut results = stream::iter(batches)
            .map(|batch| {
                let gateway = Arc::clone(&self.gateway);
                let searcher = Arc::clone(&self.searcher);
                let language = options.language.clone();
                let limit = options.limit_per_query;
                async move {
                    gateway
                        .call("place-search", searcher.search_places(&batch, limit, &language))
                        .await
                }
            })
            .buffer_unordered(options.workers.max(1));

        while let Some(result) = results.next().await {
            match result {
                Ok(places) => {
                    report.found += places.len() as u64;
                    for place in &places {
                        let Some(entry) = catalog_entry(place) else {
                            report.filtered += 1;
                            continue;
                        };
                        let accepted = options.filter.accepts(
                            place.address.as_deref(),
                            place.location.as_ref().and_then(|l| l.lat),
                            place.location.as_ref().and_then(|l| l.lng),
                        );
                        if !accepted {
                            report.filtered += 1;
                            continue;
                        }
                        let inserted = self.store.upsert_catalog_place(tag, &entry).await?;
                        report.kept += 1;
                        if inserted {
                            report.new += 1;
                        }
                    }
                    completed += 1;
                }
                Err(err) if err.is_quota() => {
                    // The aborted batch still counts as a failure in the job
                    // row; the counters must account for every batch touched.
                    failed += 1;
                    quota = Some(err.to_string());
                }
                Err(err) => {
                    warn!(tag, error = %err, "Search batch failed");
                    failed += 1;
                    completed += 1;
                }
            }
            self.store
                .update_job(
                    &job_id,
                    &JobUpdate {
                        completed: Some(completed),
                        failed: Some(failed),
                        ..Default::default()
                    },
                )
                .await?;
            if quota.is_some() {
                break;
            }

            if let Some(threshold) = options.max_new_places {
                if report.new >= threshold {
                    info!(tag, new = report.new, threshold, "New-place threshold reached, stopping early");
                    saturated = true;
                    break;
                }
            }
        }
        drop(results);
        heartbeat.stop().await;

        match quota {
            Some(message) => {
                self.store
                    .finish_job(&job_id, "error", Some(&message))
                    .await?;
                warn!(tag, job = %job_id, "Discovery aborted on quota");
                Err(EngineError::QuotaExhausted(message))
            }
            None => {
                let detail = saturated.then_some("new-place threshold reached");
                self.store.finish_job(&job_id, "done", detail).await?;
                info!(
                    tag, job = %job_id,
                    kept = report.kept, new = report.new, filtered = report.filtered,
                    "Discovery finished"
                );
                Ok(report)
            }
        }
    }

    /// Analyze every catalog entry under `tag`, skipping places whose archive
    /// gained nothing new since their last report.
    pub async fn run_analysis(
        &self,
        tag: &str,
        options: &AnalysisRunOptions,
    ) -> Result<AnalysisReport> {
        let places = self.store.catalog_places(tag).await?;

        let job_id = self.store.create_job("analysis", tag).await?;
        self.store
            .update_job(
                &job_id,
                &JobUpdate {
                    total: Some(places.len() as i64),
                    ..Default::default()
                },
            )
            .await?;
        let heartbeat = self.job_heartbeat(&job_id);

        info!(tag, job = %job_id, places = places.len(), mode = %options.mode, "Starting bulk analysis");

        // Always scrape: the archive keeps growing on every run, and the skip
        // decision is made after the merge, from how many new reviews landed.
        let analyze_options = AnalyzeOptions {
            mode: options.mode,
            force_refresh: true,
            allow_stale: false,
            skip_unchanged: !options.refresh,
            max_reviews: None,
        };

        let mut report = AnalysisReport {
            job_id: job_id.clone(),
            analyzed: 0,
            skipped: 0,
            failed: 0,
        };
        let mut quota: Option<String> = None;

        // Each worker is a spawned task, not a bare future inside the buffer.
        // The consume loop below holds the store between `next()` calls, and a
        // worker suspended mid-query must keep running to release it.
        let mut outcomes = stream::iter(places)
            .map(|place| {
                let analyzer = Arc::clone(&self.analyzer);
                let store = Arc::clone(&self.store);
                let opts = analyze_options.clone();
                let tag = tag.to_string();
                let name = place.name.clone();
                let identity = place.place_identity.clone();
                let worker = tokio::spawn(async move {
                    let Some(input) = reference_for(&place) else {
                        return None;
                    };
                    if let Err(err) = store
                        .set_analyze_status(&tag, &place.place_identity, "running", None)
                        .await
                    {
                        warn!(tag, place = %place.place_identity, error = %err, "Status write failed");
                    }
                    Some(analyzer.analyze_place(&input, &opts).await)
                });
                async move {
                    match worker.await {
                        Ok(outcome) => (name, identity, outcome),
                        Err(err) => (
                            name,
                            identity,
                            Some(Err(EngineError::Upstream(format!(
                                "analysis worker died: {err}"
                            )))),
                        ),
                    }
                }
            })
            .buffer_unordered(options.workers.max(1));

        while let Some((name, identity, outcome)) = outcomes.next().await {
            // Analysis may have upgraded the identity and moved the catalog
            // row under the new key.
            let identity = self
                .store
                .resolve_alias(&identity)
                .await?
                .unwrap_or(identity);
            let status: (&str, Option<String>) = match outcome {
                Some(Ok(result)) if result.from_cache || result.skipped => {
                    report.skipped += 1;
                    ("skipped_no_new_data", None)
                }
                Some(Ok(_)) => {
                    report.analyzed += 1;
                    ("done", None)
                }
                Some(Err(err)) if err.is_quota() => {
                    // Not this place's fault: leave it eligible for the next run.
                    self.store
                        .set_analyze_status(tag, &identity, "pending", None)
                        .await?;
                    quota = Some(err.to_string());
                    break;
                }
                Some(Err(err)) => {
                    warn!(tag, place = %name, error = %err, "Place analysis failed");
                    report.failed += 1;
                    let message = err.to_string();
                    let truncated =
                        ai_client::util::truncate_to_char_boundary(&message, MAX_ERROR_CHARS);
                    ("error", Some(truncated.to_string()))
                }
                None => {
                    warn!(tag, place = %name, "No usable reference for catalog entry");
                    report.failed += 1;
                    ("error", Some("no usable reference".to_string()))
                }
            };
            self.store
                .set_analyze_status(tag, &identity, status.0, status.1.as_deref())
                .await?;
            self.store
                .update_job(
                    &job_id,
                    &JobUpdate {
                        completed: Some((report.analyzed + report.skipped) as i64),
                        failed: Some(report.failed as i64),
                        skipped: Some(report.skipped as i64),
                        ..Default::default()
                    },
                )
                .await?;
        }
        drop(outcomes);
        heartbeat.stop().await;

        match quota {
            Some(message) => {
                self.store
                    .finish_job(&job_id, "error", Some(&message))
                    .await?;
                warn!(tag, job = %job_id, "Bulk analysis aborted on quota");
                Err(EngineError::QuotaExhausted(message))
            }
            None => {
                self.store.finish_job(&job_id, "done", None).await?;
                info!(
                    tag, job = %job_id,
                    analyzed = report.analyzed, skipped = report.skipped, failed = report.failed,
                    "Bulk analysis finished"
                );
                Ok(report)
            }
        }
    }
}

/// Convert a search result into a catalog entry. Results with no stable
/// identifier at all are dropped.
fn catalog_entry(place: &PlaceResult) -> Option<NewCatalogPlace> {
    let place_identity = if let Some(pid) = &place.place_id {
        format!("place:{pid}")
    } else if let Some(cid) = &place.cid {
        format!("cid:{cid}")
    } else if let Some(url) = &place.url {
        resolve(url).identity_key
    } else {
        return None;
    };

    let categories = if place.categories.is_empty() {
        match &place.category_name {
            Some(name) => json!([name]),
            None => json!([]),
        }
    } else {
        json!(place.categories)
    };

    Some(NewCatalogPlace {
        place_identity,
        name: place.title.clone().unwrap_or_default(),
        address: place.address.clone(),
        latitude: place.location.as_ref().and_then(|l| l.lat),
        longitude: place.location.as_ref().and_then(|l| l.lng),
        map_url: place.url.clone(),
        place_id: place.place_id.clone(),
        cid: place.cid.clone(),
        categories,
        rating: place.total_score,
        reviews_count: place.reviews_count,
        source_query: place.search_string.clone(),
    })
}

/// The map URL to analyze a catalog entry through, rebuilt from identifiers
/// when discovery returned no URL.
fn reference_for(place: &CatalogPlace) -> Option<String> {
    if let Some(url) = &place.map_url {
        return Some(url.clone());
    }
    if let Some(pid) = &place.place_id {
        return Some(format!("https://www.google.com/maps/place/?q=place_id:{pid}"));
    }
    if let Some(cid) = &place.cid {
        return Some(format!("https://maps.google.com/?cid={cid}"));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter() -> RegionFilter {
        RegionFilter {
            required_terms: vec!["East District".to_string(), "東區".to_string()],
            excluded_terms: vec!["North District".to_string()],
            bbox: Some(BoundingBox {
                min_lat: 24.95,
                max_lat: 25.00,
                min_lng: 121.20,
                max_lng: 121.30,
            }),
        }
    }

    #[test]
    fn address_match_is_case_insensitive() {
        assert!(filter().accepts(Some("12 Main St, east district, Hsinchu"), None, None));
    }

    #[test]
    fn exclusion_vetoes_inclusion() {
        // Address mentions both regions: exclusion wins.
        assert!(!filter().accepts(
            Some("East District border, North District, Hsinchu"),
            None,
            None
        ));
    }

    #[test]
    fn address_outside_region_is_rejected() {
        assert!(!filter().accepts(Some("99 Elsewhere Rd, West District"), None, None));
    }

    #[test]
    fn bbox_applies_only_without_address() {
        let f = filter();
        // Coordinates inside the box do not rescue a wrong address.
        assert!(!f.accepts(Some("99 Elsewhere Rd, West District"), Some(24.97), Some(121.25)));
        // Without an address, the box decides.
        assert!(f.accepts(None, Some(24.97), Some(121.25)));
        assert!(!f.accepts(None, Some(25.10), Some(121.25)));
        assert!(!f.accepts(None, None, None));
    }

    #[test]
    fn empty_filter_accepts_everything() {
        let f = RegionFilter::default();
        assert!(f.accepts(Some("anywhere"), None, None));
        assert!(f.accepts(None, None, None));
    }

    #[test]
    fn catalog_entry_prefers_place_id() {
        let place = PlaceResult {
            place_id: Some("ChIJabc".to_string()),
            cid: Some("42".to_string()),
            url: Some("https://maps.google.com/?cid=42".to_string()),
            title: Some("Noodle House".to_string()),
            ..Default::default()
        };
        let entry = catalog_entry(&place).unwrap();
        assert_eq!(entry.place_identity, "place:ChIJabc");
    }

    #[test]
    fn catalog_entry_without_identifiers_is_dropped() {
        assert!(catalog_entry(&PlaceResult::default()).is_none());
    }
}
