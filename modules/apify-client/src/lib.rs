pub mod error;
pub mod types;

pub use error::{ApifyError, Result};
pub use types::{PlaceLocation, PlaceResult, PlaceSearchInput, ReviewScrapeInput, StartUrl};

use serde::de::DeserializeOwned;
use serde::Serialize;
use types::DatasetResponse;

const BASE_URL: &str = "https://api.apify.com/v2";

/// Actor ID for compass/google-maps-reviews-scraper.
const REVIEWS_SCRAPER: &str = "compass~google-maps-reviews-scraper";

/// Actor ID for compass/crawler-google-places.
const PLACES_CRAWLER: &str = "compass~crawler-google-places";

pub struct ApifyClient {
    client: reqwest::Client,
    token: String,
}

impl ApifyClient {
    pub fn new(token: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            token,
        }
    }

    /// Run an actor synchronously and return its dataset items. The
    /// run-sync-get-dataset-items endpoint blocks server-side until the run
    /// finishes, so no polling loop is needed.
    async fn run_sync<I: Serialize, T: DeserializeOwned>(
        &self,
        actor: &str,
        input: &I,
    ) -> Result<Vec<T>> {
        let url = format!("{}/acts/{}/run-sync-get-dataset-items", BASE_URL, actor);
        let resp = self
            .client
            .post(&url)
            .query(&[("token", self.token.as_str()), ("format", "json")])
            .json(input)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ApifyError::from_status(status.as_u16(), body));
        }

        let data: DatasetResponse<T> = resp.json().await?;
        Ok(data.into_items())
    }

    /// Scrape the newest reviews for a Google Maps place URL.
    ///
    /// Items are returned as raw JSON values: the review payload is persisted
    /// verbatim downstream and its schema is not guaranteed stable.
    pub async fn scrape_reviews(
        &self,
        map_url: &str,
        max_reviews: u32,
        language: &str,
    ) -> Result<Vec<serde_json::Value>> {
        tracing::info!(map_url, max_reviews, "Starting Google Maps review scrape");

        let input = ReviewScrapeInput::new(map_url, max_reviews, language);
        let items: Vec<serde_json::Value> = self.run_sync(REVIEWS_SCRAPER, &input).await?;

        tracing::info!(map_url, count = items.len(), "Fetched reviews");
        Ok(items)
    }

    /// Search Google Maps for places matching a batch of text queries.
    pub async fn search_places(
        &self,
        queries: &[String],
        limit_per_query: u32,
        language: &str,
    ) -> Result<Vec<PlaceResult>> {
        tracing::info!(
            queries = queries.len(),
            limit_per_query,
            "Starting Google Maps place search"
        );

        let input = PlaceSearchInput {
            search_strings_array: queries.to_vec(),
            max_crawled_places_per_search: limit_per_query,
            language: language.to_string(),
        };
        let places: Vec<PlaceResult> = self.run_sync(PLACES_CRAWLER, &input).await?;

        tracing::info!(count = places.len(), "Fetched places");
        Ok(places)
    }
}
