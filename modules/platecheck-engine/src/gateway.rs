// External-call seam: traits for the scraper and analyst dependencies, plus
// the Gateway that gates every outbound call behind a shared semaphore and a
// timeout.
//
// The traits enable deterministic testing with mock scrapers and analysts:
// no network, no API keys.

use std::sync::Arc;
use std::time::Duration;

use ai_client::{AiClient, AiError, ChatMessage, ChatRequest, ResponseFormat};
use apify_client::{ApifyClient, ApifyError, PlaceResult};
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::debug;

use platecheck_common::Mode;

use crate::error::{EngineError, Result};
use crate::heartbeat::Heartbeat;

/// Failure classes at the external-call seam. Quota failures abort bulk runs;
/// transient ones fail a single unit of work and let the rest proceed.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error("quota exhausted: {0}")]
    Quota(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("malformed payload: {0}")]
    Malformed(String),
}

#[async_trait]
pub trait ReviewScraper: Send + Sync {
    /// Fetch the newest reviews for a map URL as raw JSON items.
    async fn fetch_reviews(
        &self,
        map_url: &str,
        max_reviews: u32,
        language: &str,
    ) -> std::result::Result<Vec<Value>, CallError>;
}

#[async_trait]
pub trait PlaceSearcher: Send + Sync {
    /// Run a batch of text searches and return the discovered places.
    async fn search_places(
        &self,
        queries: &[String],
        limit_per_query: u32,
        language: &str,
    ) -> std::result::Result<Vec<PlaceResult>, CallError>;
}

#[async_trait]
pub trait ReviewAnalyst: Send + Sync {
    /// Produce a structured quality report from a block of review text.
    async fn analyze(
        &self,
        place_name: &str,
        reviews: &str,
        mode: Mode,
    ) -> std::result::Result<Value, CallError>;
}

fn classify_apify(err: ApifyError) -> CallError {
    if err.is_quota_exceeded() {
        CallError::Quota(err.to_string())
    } else {
        CallError::Transient(err.to_string())
    }
}

#[async_trait]
impl ReviewScraper for ApifyClient {
    async fn fetch_reviews(
        &self,
        map_url: &str,
        max_reviews: u32,
        language: &str,
    ) -> std::result::Result<Vec<Value>, CallError> {
        self.scrape_reviews(map_url, max_reviews, language)
            .await
            .map_err(classify_apify)
    }
}

#[async_trait]
impl PlaceSearcher for ApifyClient {
    async fn search_places(
        &self,
        queries: &[String],
        limit_per_query: u32,
        language: &str,
    ) -> std::result::Result<Vec<PlaceResult>, CallError> {
        ApifyClient::search_places(self, queries, limit_per_query, language)
            .await
            .map_err(classify_apify)
    }
}

const QUICK_SYSTEM_PROMPT: &str = "You are a restaurant quality analyst. You receive customer \
reviews for one place and return a single JSON object with exactly these keys: \
verdict (one short sentence), score (integer 1-10), summary (2-3 sentences), \
strengths (array of short strings), weaknesses (array of short strings), \
dish_recommendations (array of dish names mentioned positively), \
confidence (\"low\", \"medium\" or \"high\" based on review volume and agreement). \
Base everything strictly on the reviews given. Respond with JSON only.";

const DEEP_SYSTEM_PROMPT: &str = "You are a restaurant quality analyst writing a thorough \
assessment. You receive customer reviews for one place and return a single JSON object with \
exactly these keys: verdict (one short sentence), score (integer 1-10), summary (one detailed \
paragraph), strengths (array), weaknesses (array), dish_recommendations (array of dish names \
mentioned positively), service_notes (string), value_notes (string on pricing and value), \
ambience_notes (string), best_for (array of occasions), \
confidence (\"low\", \"medium\" or \"high\" based on review volume and agreement). \
Base everything strictly on the reviews given; say so in the relevant field when the reviews \
carry no signal for it. Respond with JSON only.";

/// Review analyst backed by an OpenAI-compatible chat model.
pub struct ModelAnalyst {
    client: AiClient,
    model: String,
}

impl ModelAnalyst {
    pub fn new(client: AiClient, model: &str) -> Self {
        Self {
            client,
            model: model.to_string(),
        }
    }
}

fn classify_ai(err: AiError) -> CallError {
    match err {
        AiError::Api { status, .. } if status == 402 || status == 429 => {
            CallError::Quota(err.to_string())
        }
        AiError::MalformedPayload(_) => CallError::Malformed(err.to_string()),
        other => CallError::Transient(other.to_string()),
    }
}

#[async_trait]
impl ReviewAnalyst for ModelAnalyst {
    async fn analyze(
        &self,
        place_name: &str,
        reviews: &str,
        mode: Mode,
    ) -> std::result::Result<Value, CallError> {
        let system = match mode {
            Mode::Quick => QUICK_SYSTEM_PROMPT,
            Mode::Deep => DEEP_SYSTEM_PROMPT,
        };
        let user = if place_name.is_empty() {
            format!("Reviews:\n\n{reviews}")
        } else {
            format!("Place: {place_name}\n\nReviews:\n\n{reviews}")
        };
        let request = ChatRequest {
            model: self.model.clone(),
            temperature: 0.2,
            messages: vec![ChatMessage::system(system), ChatMessage::user(user)],
            response_format: Some(ResponseFormat::json_object()),
        };
        self.client
            .structured_json(&request)
            .await
            .map_err(classify_ai)
    }
}

/// Gates every outbound call: one shared semaphore for all external traffic
/// plus a hard per-call timeout. Interactive and bulk paths share the same
/// admission budget so a bulk run cannot starve the APIs.
pub struct Gateway {
    semaphore: Arc<Semaphore>,
    call_timeout: Duration,
    heartbeat_interval: Duration,
}

impl Gateway {
    pub fn new(
        max_concurrent: usize,
        call_timeout: Duration,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            call_timeout,
            heartbeat_interval,
        }
    }

    /// Run one external call under the admission semaphore and timeout,
    /// mapping seam failures into engine errors. A heartbeat logs while the
    /// call waits for admission or runs, so long scrapes stay visibly alive.
    pub async fn call<T, F>(&self, label: &str, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = std::result::Result<T, CallError>>,
    {
        let hb_label = label.to_string();
        let heartbeat = Heartbeat::start(self.heartbeat_interval, move || {
            let label = hb_label.clone();
            async move {
                debug!(label = %label, "External call still in flight");
            }
        });

        let outcome = async {
            let _permit = self
                .semaphore
                .acquire()
                .await
                .map_err(|_| EngineError::Upstream("admission gate closed".to_string()))?;

            debug!(label, "Dispatching external call");

            match tokio::time::timeout(self.call_timeout, fut).await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(CallError::Quota(msg))) => Err(EngineError::QuotaExhausted(msg)),
                Ok(Err(CallError::Transient(msg))) => Err(EngineError::Upstream(msg)),
                Ok(Err(CallError::Malformed(msg))) => Err(EngineError::Malformed(msg)),
                Err(_) => Err(EngineError::Timeout(self.call_timeout)),
            }
        }
        .await;

        heartbeat.stop().await;
        outcome
    }
}
