// Interactive analysis pipeline: resolve, consult cache, scrape, archive,
// analyze, cache.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use platecheck_common::{content_hash16, resolve, CanonicalReference, Mode};
use platecheck_store::{CachedAnalysis, NewReview, Store, StoredReview};

use crate::error::{EngineError, Result};
use crate::gateway::{Gateway, ReviewAnalyst, ReviewScraper};

/// Individual review text is capped before prompting; review pages repeat
/// whole menus sometimes.
const MAX_REVIEW_CHARS: usize = 600;

/// Total size cap for the review block handed to the analyst.
const MAX_BLOCK_CHARS: usize = 24_000;

/// Photo URLs kept per review.
const MAX_REVIEW_PHOTOS: usize = 8;

#[derive(Debug, Clone)]
pub struct AnalyzeOptions {
    pub mode: Mode,
    /// Bypass the cache and re-scrape even on a fresh hit.
    pub force_refresh: bool,
    /// On upstream failure, fall back to an expired cached report instead of
    /// surfacing the error.
    pub allow_stale: bool,
    /// When set, skip the analyst if the scrape produced no unseen reviews
    /// and a prior report exists. Bulk refresh runs use this.
    pub skip_unchanged: bool,
    pub max_reviews: Option<u32>,
}

impl AnalyzeOptions {
    pub fn for_mode(mode: Mode) -> Self {
        Self {
            mode,
            force_refresh: false,
            allow_stale: false,
            skip_unchanged: false,
            max_reviews: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisOutcome {
    pub reference: CanonicalReference,
    pub mode: Mode,
    pub report: Value,
    pub review_count: i64,
    pub new_reviews: u64,
    pub generated_at: DateTime<Utc>,
    pub from_cache: bool,
    /// True when the report served is past its TTL.
    pub stale: bool,
    /// True when analysis was skipped because nothing new arrived.
    pub skipped: bool,
}

impl AnalysisOutcome {
    fn from_cached(reference: CanonicalReference, mode: Mode, cached: CachedAnalysis) -> Self {
        Self {
            reference,
            mode,
            report: cached.report,
            review_count: cached.review_count,
            new_reviews: 0,
            generated_at: cached.created_at,
            from_cache: true,
            stale: false,
            skipped: false,
        }
    }
}

pub struct Analyzer {
    store: Arc<Store>,
    gateway: Arc<Gateway>,
    scraper: Arc<dyn ReviewScraper>,
    analyst: Arc<dyn ReviewAnalyst>,
    cache_ttl: Duration,
    language: String,
    max_reviews_for_analysis: usize,
}

impl Analyzer {
    pub fn new(
        store: Arc<Store>,
        gateway: Arc<Gateway>,
        scraper: Arc<dyn ReviewScraper>,
        analyst: Arc<dyn ReviewAnalyst>,
        cache_ttl: Duration,
        language: &str,
        max_reviews_for_analysis: usize,
    ) -> Self {
        Self {
            store,
            gateway,
            scraper,
            analyst,
            cache_ttl,
            language: language.to_string(),
            max_reviews_for_analysis,
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Turn any place reference into a quality report.
    ///
    /// Serves from cache when a fresh report exists, otherwise scrapes the
    /// newest reviews, archives them, and runs the analyst over the archive.
    pub async fn analyze_place(
        &self,
        input: &str,
        options: &AnalyzeOptions,
    ) -> Result<AnalysisOutcome> {
        let input = input.trim();
        if input.is_empty() {
            return Err(EngineError::InvalidInput("empty place reference".into()));
        }

        let mode = options.mode;
        let mut reference = resolve(input);

        // A short link or search that previously upgraded to a real place
        // identity keeps hitting that place's cache.
        if let Some(canonical) = self.store.resolve_alias(&reference.identity_key).await? {
            reference.identity_key = canonical;
        }

        if !options.force_refresh {
            if let Some(cached) = self
                .store
                .cached_analysis(&reference.identity_key, mode.as_str(), self.cache_ttl, false)
                .await?
            {
                info!(identity = %reference.identity_key, mode = %mode, "Cache hit");
                return Ok(AnalysisOutcome::from_cached(reference, mode, cached));
            }
        }

        let max_reviews = options.max_reviews.unwrap_or_else(|| mode.default_max_reviews());
        let scraped = match self
            .gateway
            .call(
                "reviews",
                self.scraper
                    .fetch_reviews(&reference.reference_url, max_reviews, &self.language),
            )
            .await
        {
            Ok(items) => items,
            Err(err) => return self.stale_fallback(reference, mode, options, err).await,
        };

        // A scrape can teach us who the place really is: short links and
        // free-text searches upgrade to a durable place identity.
        if let Some(upgraded) = self.upgrade_identity(&reference, &scraped).await? {
            reference = upgraded;
        }

        let (reviews, place_title) = parse_reviews(&scraped);
        let (new_reviews, processed) = self
            .store
            .upsert_reviews(&reference.identity_key, &reviews)
            .await?;
        info!(
            identity = %reference.identity_key,
            processed,
            new = new_reviews,
            "Archived reviews"
        );

        if reference.display_name.is_empty() {
            if let Some(title) = place_title {
                reference.display_name = title;
            }
        }

        if options.skip_unchanged && new_reviews == 0 {
            if let Some(cached) = self
                .store
                .cached_analysis(&reference.identity_key, mode.as_str(), self.cache_ttl, true)
                .await?
            {
                info!(identity = %reference.identity_key, "No new reviews, keeping prior report");
                let mut outcome = AnalysisOutcome::from_cached(reference, mode, cached);
                outcome.skipped = true;
                return Ok(outcome);
            }
        }

        let archived = self
            .store
            .reviews_for(&reference.identity_key, self.max_reviews_for_analysis as i64)
            .await?;
        if archived.is_empty() {
            return Err(EngineError::NoReviews);
        }

        let block = build_review_block(&archived);
        let report = match self
            .gateway
            .call(
                "analysis",
                self.analyst.analyze(&reference.display_name, &block, mode),
            )
            .await
        {
            Ok(report) => report,
            Err(err) => return self.stale_fallback(reference, mode, options, err).await,
        };

        let review_count = self.store.review_count(&reference.identity_key).await?;
        self.store
            .put_analysis(
                &reference.identity_key,
                mode.as_str(),
                &reference.reference_url,
                &reference.display_name,
                &report,
                review_count,
            )
            .await?;
        self.store
            .upsert_place_summary(
                &reference.identity_key,
                &reference.display_name,
                &reference.reference_url,
                mode.as_str(),
                review_count,
                Some(&report),
            )
            .await?;

        Ok(AnalysisOutcome {
            reference,
            mode,
            report,
            review_count,
            new_reviews,
            generated_at: Utc::now(),
            from_cache: false,
            stale: false,
            skipped: false,
        })
    }

    /// On upstream failure, serve an expired report when the caller opted in.
    /// Quota errors always propagate so bulk runs can abort.
    async fn stale_fallback(
        &self,
        reference: CanonicalReference,
        mode: Mode,
        options: &AnalyzeOptions,
        err: EngineError,
    ) -> Result<AnalysisOutcome> {
        if options.allow_stale && !err.is_quota() {
            if let Some(cached) = self
                .store
                .cached_analysis(&reference.identity_key, mode.as_str(), self.cache_ttl, true)
                .await?
            {
                warn!(
                    identity = %reference.identity_key,
                    error = %err,
                    "Upstream failed, serving stale report"
                );
                let mut outcome = AnalysisOutcome::from_cached(reference, mode, cached);
                outcome.stale = true;
                return Ok(outcome);
            }
        }
        Err(err)
    }

    /// When a hash-keyed reference scrapes into a payload carrying a real
    /// place id, move its rows under the durable key.
    async fn upgrade_identity(
        &self,
        reference: &CanonicalReference,
        scraped: &[Value],
    ) -> Result<Option<CanonicalReference>> {
        if reference.identity_key.starts_with("place:") {
            return Ok(None);
        }
        let Some(place_id) = scraped
            .iter()
            .find_map(|item| item.get("placeId").and_then(Value::as_str))
        else {
            return Ok(None);
        };

        let new_key = format!("place:{place_id}");
        info!(from = %reference.identity_key, to = %new_key, "Upgrading place identity");
        self.store
            .reassign_identity(&reference.identity_key, &new_key)
            .await?;

        let mut upgraded = reference.clone();
        upgraded.identity_key = new_key;
        upgraded.place_id = Some(place_id.to_string());
        upgraded.reference_url =
            format!("https://www.google.com/maps/place/?q=place_id:{place_id}");
        Ok(Some(upgraded))
    }
}

/// Convert raw scraper items into archive rows, also surfacing the place
/// title when present. Items without a source id fall back to a content hash
/// over (author, text, date); items with no signal at all are dropped.
fn parse_reviews(items: &[Value]) -> (Vec<NewReview>, Option<String>) {
    let mut reviews = Vec::with_capacity(items.len());
    let mut title = None;

    for item in items {
        if title.is_none() {
            title = item
                .get("title")
                .and_then(Value::as_str)
                .filter(|t| !t.is_empty())
                .map(str::to_string);
        }

        let author = item.get("name").and_then(Value::as_str).unwrap_or_default();
        let text = item
            .get("text")
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
            .or_else(|| item.get("textTranslated").and_then(Value::as_str))
            .unwrap_or_default();
        let published_raw = item
            .get("publishedAtDate")
            .and_then(Value::as_str)
            .unwrap_or_default();

        let review_id = match item
            .get("reviewId")
            .and_then(Value::as_str)
            .or_else(|| item.get("reviewUrl").and_then(Value::as_str))
            .filter(|id| !id.is_empty())
        {
            Some(id) => id.to_string(),
            None if author.is_empty() && text.is_empty() && published_raw.is_empty() => continue,
            None => content_hash16(&format!("{author}\n{text}\n{published_raw}")),
        };

        let photo_urls: Vec<String> = item
            .get("reviewImageUrls")
            .and_then(Value::as_array)
            .map(|urls| {
                urls.iter()
                    .filter_map(Value::as_str)
                    .filter(|u| u.starts_with("http"))
                    .take(MAX_REVIEW_PHOTOS)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        reviews.push(NewReview {
            review_id,
            author: author.to_string(),
            rating: item
                .get("stars")
                .and_then(Value::as_f64)
                .or_else(|| item.get("rating").and_then(Value::as_f64)),
            text: text.to_string(),
            published_at: DateTime::parse_from_rfc3339(published_raw)
                .ok()
                .map(|dt| dt.with_timezone(&Utc)),
            has_photo: !photo_urls.is_empty(),
            photo_urls: Value::from(photo_urls),
            raw: item.clone(),
        });
    }

    (reviews, title)
}

/// Render archived reviews into the text block the analyst sees.
fn build_review_block(reviews: &[StoredReview]) -> String {
    let mut block = String::new();
    for (i, review) in reviews.iter().enumerate() {
        let rating = match review.rating {
            Some(stars) => format!("{stars:.0}/5"),
            None => "unrated".to_string(),
        };
        let date = review
            .published_at
            .map(|dt| dt.format(" (%Y-%m-%d)").to_string())
            .unwrap_or_default();
        let text = ai_client::util::truncate_to_char_boundary(&review.text, MAX_REVIEW_CHARS);
        let entry = format!("{}. [{rating}]{date} {text}\n", i + 1);
        if block.len() + entry.len() > MAX_BLOCK_CHARS {
            break;
        }
        block.push_str(&entry);
    }
    block
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_reviews_extracts_fields_and_title() {
        let items = vec![
            json!({
                "reviewId": "r1",
                "name": "A",
                "stars": 5,
                "text": "great noodles",
                "publishedAtDate": "2026-01-02T03:04:05+00:00",
                "reviewImageUrls": ["https://img.example/1.jpg"],
                "title": "Noodle House",
                "placeId": "ChIJabc"
            }),
            json!({"text": "no id, keyed by content hash"}),
            json!({"reviewUrl": "https://maps.example/r2", "textTranslated": "ok"}),
            json!({"likesCount": 3}),
        ];
        let (reviews, title) = parse_reviews(&items);
        assert_eq!(reviews.len(), 3);
        assert_eq!(title.as_deref(), Some("Noodle House"));
        assert_eq!(reviews[0].rating, Some(5.0));
        assert!(reviews[0].published_at.is_some());
        assert!(reviews[0].has_photo);
        assert_eq!(reviews[1].review_id.len(), 16);
        assert!(!reviews[1].has_photo);
        assert_eq!(reviews[2].text, "ok");
    }

    #[test]
    fn hash_fallback_ids_are_stable() {
        let item = json!({"name": "A", "text": "same words", "stars": 4});
        let (first, _) = parse_reviews(std::slice::from_ref(&item));
        let (second, _) = parse_reviews(std::slice::from_ref(&item));
        assert_eq!(first[0].review_id, second[0].review_id);
    }

    #[test]
    fn review_block_caps_total_size() {
        let long = "x".repeat(MAX_REVIEW_CHARS * 2);
        let reviews: Vec<StoredReview> = (0..200)
            .map(|i| StoredReview {
                id: i,
                place_identity: "place:abc".into(),
                review_id: format!("r{i}"),
                author: "A".into(),
                rating: Some(4.0),
                text: long.clone(),
                published_at: None,
                has_photo: false,
                photo_urls: None,
                raw: json!({}),
                first_seen_at: Utc::now(),
                last_seen_at: Utc::now(),
            })
            .collect();
        let block = build_review_block(&reviews);
        assert!(block.len() <= MAX_BLOCK_CHARS);
        assert!(!block.is_empty());
    }
}
