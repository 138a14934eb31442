//! OpenAI Chat Completions client.
//!
//! Sends the whole conversation to `POST {base_url}/chat/completions` with
//! `stream: true` and turns the SSE frames into text deltas. `top_p` and `n`
//! are pinned to 1: the relay only ever shows a single answer.

use std::time::Duration;

use serde_json::{Value, json};

use relay_types::ApiKey;
use crate::retry::{RetryConfig, RetryOutcome, send_with_retry};
use crate::sse_types::chat as typed;
use crate::{
    CompletionProvider, CompletionRequest, CompletionStream, DEFAULT_STREAM_IDLE_TIMEOUT,
    ProviderError, SseParseAction, SseParser, StreamEvent, build_http_client,
    read_capped_error_body, spawn_sse_reader,
};

/// Public OpenAI API root.
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Default)]
struct ChatParser;

impl SseParser for ChatParser {
    fn parse(&mut self, json: &Value) -> SseParseAction {
        let chunk: typed::Chunk = match serde_json::from_value(json.clone()) {
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::debug!("Failed to parse OpenAI chat chunk: {e}");
                return SseParseAction::Continue;
            }
        };

        if let Some(error) = chunk.error {
            let message = if error.message.is_empty() {
                "unknown error".to_string()
            } else {
                error.message
            };
            return SseParseAction::Error(format!("OpenAI stream error: {message}"));
        }

        let events: Vec<StreamEvent> = chunk
            .choices
            .into_iter()
            .filter(|choice| choice.index == 0)
            .flat_map(|choice| [choice.delta.content, choice.delta.refusal])
            .flatten()
            .filter(|text| !text.is_empty())
            .map(StreamEvent::TextDelta)
            .collect();

        if events.is_empty() {
            SseParseAction::Continue
        } else {
            SseParseAction::Emit(events)
        }
    }

    fn provider_name(&self) -> &'static str {
        "openai"
    }
}

fn build_request_body(request: &CompletionRequest) -> Value {
    let messages: Vec<Value> = request
        .messages
        .iter()
        .map(|(role, content)| {
            json!({
                "role": role.as_str(),
                "content": content,
            })
        })
        .collect();

    json!({
        "model": request.model.as_str(),
        "messages": messages,
        "temperature": request.temperature,
        "top_p": 1,
        "n": 1,
        "stream": true,
    })
}

/// Prefer the API's `error.message` over the raw body.
fn error_message(body: &str) -> String {
    serde_json::from_str::<typed::ErrorEnvelope>(body)
        .ok()
        .map(|envelope| envelope.error.message)
        .filter(|message| !message.is_empty())
        .unwrap_or_else(|| body.trim().to_string())
}

/// Streaming Chat Completions client.
///
/// ```no_run
/// use relay_providers::openai::OpenAiClient;
/// use relay_types::ApiKey;
///
/// let client = OpenAiClient::new(ApiKey::new("sk-...")).unwrap();
/// # let _ = client;
/// ```
#[derive(Debug, Clone)]
pub struct OpenAiClient {
    http: reqwest::Client,
    api_key: ApiKey,
    base_url: String,
    retry: RetryConfig,
    idle_timeout: Duration,
}

impl OpenAiClient {
    pub fn new(api_key: ApiKey) -> Result<Self, ProviderError> {
        Self::with_base_url(api_key, DEFAULT_BASE_URL)
    }

    /// Client for an OpenAI-compatible endpoint rooted at `base_url`.
    pub fn with_base_url(api_key: ApiKey, base_url: &str) -> Result<Self, ProviderError> {
        let base_url = base_url.trim_end_matches('/').to_string();
        let http = build_http_client(base_url.starts_with("https://"))
            .map_err(ProviderError::Build)?;
        Ok(Self {
            http,
            api_key,
            base_url,
            retry: RetryConfig::default(),
            idle_timeout: DEFAULT_STREAM_IDLE_TIMEOUT,
        })
    }

    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

impl CompletionProvider for OpenAiClient {
    async fn stream_completion(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionStream, ProviderError> {
        let body = build_request_body(&request);
        let url = self.endpoint();

        tracing::debug!(
            model = %request.model,
            messages = request.messages.len(),
            "Requesting chat completion"
        );

        let outcome = send_with_retry(
            || {
                self.http
                    .post(&url)
                    .bearer_auth(self.api_key.expose_secret())
                    .header("accept", "text/event-stream")
                    .json(&body)
            },
            &self.retry,
        )
        .await;

        let response = match outcome {
            RetryOutcome::Success(response) => response,
            RetryOutcome::HttpError(response) => {
                let status = response.status();
                let body = read_capped_error_body(response).await;
                return Err(ProviderError::Http {
                    status,
                    message: error_message(&body),
                });
            }
            RetryOutcome::ConnectionError { attempts, source } => {
                return Err(ProviderError::Connection { attempts, source });
            }
            RetryOutcome::NonRetryable(source) => return Err(ProviderError::Request(source)),
        };

        Ok(spawn_sse_reader(response, ChatParser, self.idle_timeout))
    }
}
