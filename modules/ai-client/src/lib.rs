pub mod error;
pub mod types;
pub mod util;

pub use error::{AiError, Result};
pub use types::{ChatMessage, ChatRequest, ChatResponse, ResponseFormat};

use tracing::{debug, warn};
use util::parse_json_payload;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Appended to the conversation when the first response fails to parse.
const CORRECTIVE_INSTRUCTION: &str =
    "Your previous reply was not valid JSON. Respond again with exactly one \
     well-formed JSON object and nothing else: no markdown, no code fences, \
     no commentary.";

pub struct AiClient {
    api_key: String,
    http: reqwest::Client,
    base_url: String,
}

impl AiClient {
    pub fn new(api_key: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            http: reqwest::Client::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    /// Point at an OpenAI-compatible gateway instead of api.openai.com.
    pub fn with_base_url(mut self, url: &str) -> Self {
        self.base_url = url.trim_end_matches('/').to_string();
        self
    }

    pub async fn chat(&self, request: &ChatRequest) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url);

        debug!(model = %request.model, "Chat completion request");

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(AiError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let chat: ChatResponse = response
            .json()
            .await
            .map_err(|e| AiError::MalformedPayload(e.to_string()))?;

        chat.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or(AiError::Empty)
    }

    /// Run a chat completion whose answer must be a single JSON object.
    ///
    /// Tolerates code fences and surrounding prose. On parse failure, retries
    /// once with a corrective instruction appended; a second failure surfaces
    /// as `MalformedPayload` rather than returning partial data.
    pub async fn structured_json(&self, request: &ChatRequest) -> Result<serde_json::Value> {
        let content = self.chat(request).await?;
        if let Some(value) = parse_json_payload(&content) {
            return Ok(value);
        }

        warn!(model = %request.model, "Model payload was not valid JSON, retrying once");

        let mut retry = request.clone();
        retry.messages.push(ChatMessage::user(CORRECTIVE_INSTRUCTION));

        let content = self.chat(&retry).await?;
        parse_json_payload(&content).ok_or_else(|| {
            AiError::MalformedPayload(
                util::truncate_to_char_boundary(&content, 200).to_string(),
            )
        })
    }
}
