//! Streaming chat-completion providers.
//!
//! # Architecture
//!
//! - [`CompletionProvider`] - the seam the relay engine depends on
//! - [`openai`] - OpenAI Chat Completions client (`stream: true`)
//! - [`scripted`] - in-process provider replaying canned streams
//!
//! A successful call returns a [`CompletionStream`]: a single-pass, finite
//! sequence of text deltas read by a background task. Dropping the stream
//! aborts that task, so the HTTP body is released on every exit path.
//!
//! # Error Handling
//!
//! Failures before the first byte of the answer (authentication, network,
//! non-2xx after retries) are returned as [`ProviderError`]. Failures after
//! streaming started are yielded once as a [`StreamError`] and end the stream,
//! so the deltas received up to that point stay usable.

pub mod openai;
pub mod retry;
pub mod scripted;
pub mod sse_types;

use std::future::Future;
use std::time::Duration;

use reqwest::StatusCode;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub use relay_types;
pub(crate) use relay_types::{ModelName, Role, StreamEvent};

const CONNECT_TIMEOUT_SECS: u64 = 30;
const TCP_KEEPALIVE_SECS: u64 = 60;
const POOL_MAX_IDLE_PER_HOST: usize = 32;
const POOL_IDLE_TIMEOUT_SECS: u64 = 90;

/// Silence between two stream chunks after which the stream is failed.
pub const DEFAULT_STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

const MAX_SSE_BUFFER_BYTES: usize = 4 * 1024 * 1024;

const MAX_SSE_PARSE_ERRORS: usize = 3;

const MAX_ERROR_BODY_BYTES: usize = 32 * 1024;

const STREAM_CHANNEL_CAPACITY: usize = 64;

/// Builds the HTTP client used by provider clients.
///
/// `https_only` should be `true` for every real endpoint; it is relaxed only
/// when a client is pointed at a plain-HTTP base URL (local mocks, proxies).
pub fn build_http_client(https_only: bool) -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
        .redirect(reqwest::redirect::Policy::none())
        .https_only(https_only)
        .tcp_keepalive(Some(Duration::from_secs(TCP_KEEPALIVE_SECS)))
        .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
        .pool_idle_timeout(Some(Duration::from_secs(POOL_IDLE_TIMEOUT_SECS)))
        .build()
}

// ============================================================================
// Provider contract
// ============================================================================

/// One completion call: the full history, oldest first, plus sampling knobs.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub messages: Vec<(Role, String)>,
    pub model: ModelName,
    pub temperature: f32,
}

/// The provider could not be invoked. No part of the answer was produced.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("API error {status}: {message}")]
    Http { status: StatusCode, message: String },
    #[error("Request failed after {attempts} attempts: {source}")]
    Connection {
        attempts: u32,
        #[source]
        source: reqwest::Error,
    },
    #[error("Request failed: {0}")]
    Request(#[source] reqwest::Error),
    #[error("Failed to build HTTP client: {0}")]
    Build(#[source] reqwest::Error),
}

impl ProviderError {
    /// `true` when the API rejected the credentials.
    #[must_use]
    pub fn is_auth(&self) -> bool {
        matches!(
            self,
            Self::Http { status, .. }
                if *status == StatusCode::UNAUTHORIZED || *status == StatusCode::FORBIDDEN
        )
    }
}

/// The stream failed after it started. Deltas already yielded remain valid.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct StreamError {
    pub message: String,
}

impl StreamError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// A streaming chat-completion backend.
pub trait CompletionProvider: Send + Sync + 'static {
    fn stream_completion(
        &self,
        request: CompletionRequest,
    ) -> impl Future<Output = Result<CompletionStream, ProviderError>> + Send;
}

/// Single-pass sequence of answer deltas.
///
/// Yields `Ok(delta)` for every non-empty text fragment, at most one
/// `Err(StreamError)`, and then `None` forever.
#[derive(Debug)]
pub struct CompletionStream {
    rx: mpsc::Receiver<StreamEvent>,
    reader: Option<JoinHandle<()>>,
    finished: bool,
}

impl CompletionStream {
    pub(crate) fn new(rx: mpsc::Receiver<StreamEvent>, reader: Option<JoinHandle<()>>) -> Self {
        Self {
            rx,
            reader,
            finished: false,
        }
    }

    /// A stream that replays `events` without any background task.
    #[must_use]
    pub fn from_events(events: Vec<StreamEvent>) -> Self {
        let (tx, rx) = mpsc::channel(events.len().max(1));
        for event in events {
            // Capacity covers every event.
            let _ = tx.try_send(event);
        }
        Self::new(rx, None)
    }

    /// A stream that replays `events`, waiting the paired delay before each.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn from_timed_events(events: Vec<(Duration, StreamEvent)>) -> Self {
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let reader = tokio::spawn(async move {
            for (delay, event) in events {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                if tx.send(event).await.is_err() {
                    return;
                }
            }
        });
        Self::new(rx, Some(reader))
    }

    /// Next text delta, the terminal error, or `None` once the stream ended.
    pub async fn next_delta(&mut self) -> Option<Result<String, StreamError>> {
        if self.finished {
            return None;
        }
        loop {
            match self.rx.recv().await {
                Some(StreamEvent::TextDelta(text)) => {
                    if text.is_empty() {
                        continue;
                    }
                    return Some(Ok(text));
                }
                Some(StreamEvent::Done) | None => {
                    self.finish();
                    return None;
                }
                Some(StreamEvent::Error(message)) => {
                    self.finish();
                    return Some(Err(StreamError { message }));
                }
            }
        }
    }

    /// Releases the underlying connection.
    pub fn close(self) {}

    fn finish(&mut self) {
        self.finished = true;
        self.rx.close();
    }
}

impl Drop for CompletionStream {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

// ============================================================================
// SSE framing
// ============================================================================

fn find_sse_event_boundary(buffer: &[u8]) -> Option<(usize, usize)> {
    let lf = buffer.windows(2).position(|w| w == b"\n\n");
    let crlf = buffer.windows(4).position(|w| w == b"\r\n\r\n");
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a <= b { (a, 2) } else { (b, 4) }),
        (Some(a), None) => Some((a, 2)),
        (None, Some(b)) => Some((b, 4)),
        (None, None) => None,
    }
}

fn drain_next_sse_event(buffer: &mut Vec<u8>) -> Option<Vec<u8>> {
    let (pos, delim_len) = find_sse_event_boundary(buffer)?;
    let event = buffer[..pos].to_vec();
    buffer.drain(..pos + delim_len);
    Some(event)
}

fn extract_sse_data(event: &str) -> Option<String> {
    let mut data = String::new();
    let mut found = false;

    for line in event.lines() {
        let line = line.strip_suffix('\r').unwrap_or(line);

        if let Some(mut rest) = line.strip_prefix("data:") {
            if let Some(stripped) = rest.strip_prefix(' ') {
                rest = stripped;
            }

            if found {
                data.push('\n');
            }
            data.push_str(rest);
            found = true;
        }
    }

    if found { Some(data) } else { None }
}

#[derive(Debug)]
pub(crate) enum SseParseAction {
    /// Nothing to emit for this payload
    Continue,
    Emit(Vec<StreamEvent>),
    Done,
    Error(String),
}

pub(crate) trait SseParser {
    fn parse(&mut self, json: &serde_json::Value) -> SseParseAction;
    fn provider_name(&self) -> &'static str;
}

async fn send_event(tx: &mpsc::Sender<StreamEvent>, event: StreamEvent) -> bool {
    tx.send(event).await.is_ok()
}

/// Reads an SSE body to completion, forwarding parsed events to `tx`.
///
/// Always ends with exactly one terminal event (`Done` or `Error`) unless the
/// receiver went away first:
/// - `[DONE]` or a parser `Done` → `Done`
/// - idle timeout, oversized buffer, invalid UTF-8, transport error,
///   repeated invalid JSON, or EOF without a completion marker → `Error`
pub(crate) async fn process_sse_stream<P: SseParser>(
    response: reqwest::Response,
    parser: &mut P,
    tx: &mpsc::Sender<StreamEvent>,
    idle_timeout: Duration,
) {
    use futures_util::StreamExt;

    let mut stream = response.bytes_stream();
    let mut buffer: Vec<u8> = Vec::new();
    let mut parse_errors = 0usize;

    loop {
        let Ok(next) = tokio::time::timeout(idle_timeout, stream.next()).await else {
            let _ = send_event(tx, StreamEvent::Error("Stream idle timeout".to_string())).await;
            return;
        };

        let Some(chunk) = next else { break };
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                let _ = send_event(tx, StreamEvent::Error(format!("Stream read failed: {e}"))).await;
                return;
            }
        };
        buffer.extend_from_slice(&chunk);

        if buffer.len() > MAX_SSE_BUFFER_BYTES {
            let _ = send_event(
                tx,
                StreamEvent::Error("SSE buffer exceeded maximum size (4 MiB)".to_string()),
            )
            .await;
            return;
        }

        while let Some(event) = drain_next_sse_event(&mut buffer) {
            if event.is_empty() {
                continue;
            }

            let Ok(event) = std::str::from_utf8(&event) else {
                let _ = send_event(
                    tx,
                    StreamEvent::Error("Received invalid UTF-8 from SSE stream".to_string()),
                )
                .await;
                return;
            };

            let Some(data) = extract_sse_data(event) else {
                continue;
            };

            if data == "[DONE]" {
                let _ = send_event(tx, StreamEvent::Done).await;
                return;
            }

            match serde_json::from_str::<serde_json::Value>(&data) {
                Ok(json) => {
                    parse_errors = 0;
                    match parser.parse(&json) {
                        SseParseAction::Continue => {}
                        SseParseAction::Emit(events) => {
                            for event in events {
                                let is_terminal = event.is_terminal();
                                if !send_event(tx, event).await || is_terminal {
                                    return;
                                }
                            }
                        }
                        SseParseAction::Done => {
                            let _ = send_event(tx, StreamEvent::Done).await;
                            return;
                        }
                        SseParseAction::Error(msg) => {
                            let _ = send_event(tx, StreamEvent::Error(msg)).await;
                            return;
                        }
                    }
                }
                Err(e) => {
                    parse_errors = parse_errors.saturating_add(1);
                    tracing::warn!(
                        %e,
                        payload_bytes = data.len(),
                        provider = parser.provider_name(),
                        "Invalid SSE JSON payload"
                    );
                    if parse_errors >= MAX_SSE_PARSE_ERRORS {
                        let _ = send_event(
                            tx,
                            StreamEvent::Error(format!("Invalid stream payload: {e}")),
                        )
                        .await;
                        return;
                    }
                }
            }
        }
    }

    let _ = send_event(
        tx,
        StreamEvent::Error("Connection closed before stream completed".to_string()),
    )
    .await;
}

/// Reads at most 32 KiB of an error response body.
pub async fn read_capped_error_body(response: reqwest::Response) -> String {
    use futures_util::StreamExt;
    let mut body = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let Ok(chunk) = chunk else { break };
        body.extend_from_slice(&chunk);
        if body.len() > MAX_ERROR_BODY_BYTES {
            body.truncate(MAX_ERROR_BODY_BYTES);
            let text = String::from_utf8_lossy(&body);
            return format!("{text}...(truncated)");
        }
    }
    String::from_utf8_lossy(&body).into_owned()
}

/// Spawns the reader task for an accepted SSE response.
pub(crate) fn spawn_sse_reader<P>(
    response: reqwest::Response,
    mut parser: P,
    idle_timeout: Duration,
) -> CompletionStream
where
    P: SseParser + Send + 'static,
{
    let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
    let reader = tokio::spawn(async move {
        process_sse_stream(response, &mut parser, &tx, idle_timeout).await;
    });
    CompletionStream::new(rx, Some(reader))
}
