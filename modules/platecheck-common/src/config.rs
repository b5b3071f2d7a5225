use std::env;
use std::time::Duration;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    // External services
    pub apify_token: String,
    pub openai_api_key: String,
    pub openai_base_url: Option<String>,
    pub model: String,

    // Storage
    pub database_url: String,

    // Admission control
    pub max_concurrent_external_calls: usize,
    pub interactive_workers: usize,
    pub batch_workers: usize,

    // Scraping limits
    pub max_scrape_reviews: u32,
    pub max_reviews_for_analysis: usize,
    pub language: String,

    // Lifetimes
    pub cache_ttl: Duration,
    pub task_ttl: Duration,
    pub heartbeat_interval: Duration,
    pub call_timeout: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    /// Panics with a clear message if required vars are missing.
    pub fn from_env() -> Self {
        Self {
            apify_token: required_env("APIFY_TOKEN"),
            openai_api_key: required_env("OPENAI_API_KEY"),
            openai_base_url: env::var("OPENAI_BASE_URL").ok().filter(|s| !s.is_empty()),
            model: env::var("PLATECHECK_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://platecheck.db".to_string()),
            max_concurrent_external_calls: parsed_env("MAX_CONCURRENT_EXTERNAL_CALLS", 8),
            interactive_workers: parsed_env("INTERACTIVE_WORKERS", 3),
            batch_workers: parsed_env("BATCH_WORKERS", 6),
            max_scrape_reviews: parsed_env("MAX_SCRAPE_REVIEWS", 90),
            max_reviews_for_analysis: parsed_env("MAX_REVIEWS_FOR_ANALYSIS", 60),
            language: env::var("REVIEW_LANGUAGE").unwrap_or_else(|_| "en".to_string()),
            cache_ttl: Duration::from_secs(parsed_env("CACHE_TTL_SECS", 7 * 24 * 3600)),
            task_ttl: Duration::from_secs(parsed_env("TASK_TTL_SECS", 2 * 3600)),
            heartbeat_interval: Duration::from_secs(parsed_env("HEARTBEAT_INTERVAL_SECS", 5)),
            call_timeout: Duration::from_secs(parsed_env("CALL_TIMEOUT_SECS", 300)),
        }
    }
}

fn required_env(key: &str) -> String {
    env::var(key).unwrap_or_else(|_| panic!("{key} environment variable is required"))
}

fn parsed_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .unwrap_or_else(|_| panic!("{key} must be a valid number")),
        Err(_) => default,
    }
}
