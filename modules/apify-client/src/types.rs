use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize)]
pub struct StartUrl {
    pub url: String,
}

/// Input for the Google Maps reviews scraper actor.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewScrapeInput {
    pub start_urls: Vec<StartUrl>,
    pub max_reviews: u32,
    /// "newest" keeps incremental re-scrapes cheap: new reviews surface first.
    pub reviews_sort: String,
    pub language: String,
    pub personal_data: bool,
}

impl ReviewScrapeInput {
    pub fn new(url: &str, max_reviews: u32, language: &str) -> Self {
        Self {
            start_urls: vec![StartUrl {
                url: url.to_string(),
            }],
            max_reviews,
            reviews_sort: "newest".to_string(),
            language: language.to_string(),
            personal_data: false,
        }
    }
}

/// Input for the Google Maps places crawler actor (text search).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaceSearchInput {
    pub search_strings_array: Vec<String>,
    pub max_crawled_places_per_search: u32,
    pub language: String,
}

/// One place record from the places crawler dataset. The actor's output
/// schema drifts over time, so every field is optional with aliases for the
/// variants observed in the wild.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaceResult {
    #[serde(default, alias = "mapsUrl")]
    pub url: Option<String>,
    #[serde(default)]
    pub place_id: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub cid: Option<String>,
    #[serde(default, alias = "name")]
    pub title: Option<String>,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub category_name: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub location: Option<PlaceLocation>,
    #[serde(default, alias = "rating")]
    pub total_score: Option<f64>,
    #[serde(default, alias = "userRatingsTotal")]
    pub reviews_count: Option<i64>,
    #[serde(default)]
    pub search_string: Option<String>,
}

/// The crawler emits cid sometimes as a string, sometimes as a bare number.
fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(u64),
    }
    Ok(Option::<Raw>::deserialize(deserializer)?.map(|raw| match raw {
        Raw::Text(s) => s,
        Raw::Number(n) => n.to_string(),
    }))
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PlaceLocation {
    #[serde(default)]
    pub lat: Option<f64>,
    #[serde(default)]
    pub lng: Option<f64>,
}

/// The run-sync dataset endpoint usually returns a bare JSON array, but some
/// error paths wrap items in an object.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum DatasetResponse<T> {
    Items(Vec<T>),
    Wrapped { items: Vec<T> },
}

impl<T> DatasetResponse<T> {
    pub(crate) fn into_items(self) -> Vec<T> {
        match self {
            DatasetResponse::Items(items) => items,
            DatasetResponse::Wrapped { items } => items,
        }
    }
}
