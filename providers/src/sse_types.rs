//! Typed SSE payloads for the Chat Completions stream.
//!
//! Parse errors happen at the serde boundary, not scattered through parsing
//! logic. Every field is optional so new or omitted keys never break a stream.

pub mod chat {
    use serde::Deserialize;

    /// One `data:` frame of a streamed chat completion.
    ///
    /// Error frames carry an `error` object instead of `choices`.
    #[derive(Debug, Default, Deserialize)]
    pub struct Chunk {
        #[serde(default)]
        pub id: Option<String>,
        #[serde(default)]
        pub choices: Vec<Choice>,
        #[serde(default)]
        pub error: Option<ApiError>,
    }

    #[derive(Debug, Default, Deserialize)]
    pub struct Choice {
        #[serde(default)]
        pub index: u32,
        #[serde(default)]
        pub delta: Delta,
        #[serde(default)]
        pub finish_reason: Option<String>,
    }

    #[derive(Debug, Default, Deserialize)]
    pub struct Delta {
        #[serde(default)]
        pub role: Option<String>,
        #[serde(default)]
        pub content: Option<String>,
        #[serde(default)]
        pub refusal: Option<String>,
    }

    /// Error object used both in SSE error frames and non-2xx JSON bodies.
    #[derive(Debug, Default, Deserialize)]
    pub struct ApiError {
        #[serde(default)]
        pub message: String,
        #[serde(default, rename = "type")]
        pub error_type: Option<String>,
        #[serde(default)]
        pub code: Option<serde_json::Value>,
    }

    /// Body of a non-2xx response: `{"error": {...}}`.
    #[derive(Debug, Deserialize)]
    pub struct ErrorEnvelope {
        pub error: ApiError,
    }
}
