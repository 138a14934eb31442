//! In-process provider that replays canned answers.
//!
//! Each call to [`CompletionProvider::stream_completion`] consumes the next
//! queued [`Script`]. Requests are recorded so callers can inspect exactly
//! what history was sent.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use reqwest::StatusCode;

use crate::{CompletionProvider, CompletionRequest, CompletionStream, ProviderError, StreamEvent};

/// What one provider call should do.
#[derive(Debug, Clone)]
pub enum Script {
    /// Stream these events, each after its paired delay.
    Stream(Vec<(Duration, StreamEvent)>),
    /// Fail the invocation with an HTTP error.
    Fail { status: StatusCode, message: String },
}

impl Script {
    /// Streams `deltas` back to back, then completes.
    pub fn answer<I, S>(deltas: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::paced(Duration::ZERO, deltas)
    }

    /// Streams `deltas` with `gap` before each one, then completes.
    pub fn paced<I, S>(gap: Duration, deltas: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut events: Vec<_> = deltas
            .into_iter()
            .map(|delta| (gap, StreamEvent::TextDelta(delta.into())))
            .collect();
        events.push((Duration::ZERO, StreamEvent::Done));
        Self::Stream(events)
    }

    /// Streams `deltas`, then fails mid-stream with `message`.
    pub fn interrupted<I, S>(deltas: I, message: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut events: Vec<_> = deltas
            .into_iter()
            .map(|delta| (Duration::ZERO, StreamEvent::TextDelta(delta.into())))
            .collect();
        events.push((Duration::ZERO, StreamEvent::Error(message.into())));
        Self::Stream(events)
    }

    pub fn fail(status: StatusCode, message: impl Into<String>) -> Self {
        Self::Fail {
            status,
            message: message.into(),
        }
    }
}

/// Replays queued [`Script`]s in order.
///
/// A call with nothing queued fails with `503 Service Unavailable`.
#[derive(Debug, Default)]
pub struct ScriptedProvider {
    scripts: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedProvider {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_scripts(scripts: impl IntoIterator<Item = Script>) -> Self {
        let provider = Self::new();
        for script in scripts {
            provider.push(script);
        }
        provider
    }

    pub fn push(&self, script: Script) {
        self.scripts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(script);
    }

    /// Every request received so far, oldest first.
    #[must_use]
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn call_count(&self) -> usize {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl CompletionProvider for ScriptedProvider {
    async fn stream_completion(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionStream, ProviderError> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request);
        let script = self
            .scripts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();

        match script {
            Some(Script::Stream(events)) => Ok(CompletionStream::from_timed_events(events)),
            Some(Script::Fail { status, message }) => Err(ProviderError::Http { status, message }),
            None => Err(ProviderError::Http {
                status: StatusCode::SERVICE_UNAVAILABLE,
                message: "no scripted response queued".to_string(),
            }),
        }
    }
}
