//! Shared test utilities and fixtures
//!
//! A recording messenger plus helpers to assemble a relay around it.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use relay_context::{HeuristicEstimator, SessionStore, TokenEstimator};
use relay_engine::{Messenger, PublishError, Relay, TurnSettings};
use relay_providers::CompletionProvider;
use relay_types::{ChatId, MessageId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    Send { id: MessageId, text: String },
    Silent { id: MessageId, text: String },
    Edit { id: MessageId, text: String },
    Typing,
}

/// Messenger that records every call together with when it happened.
#[derive(Debug)]
pub struct RecordingMessenger {
    started: Instant,
    log: Mutex<Vec<(Duration, ChatId, Outgoing)>>,
    next_id: Mutex<i64>,
}

impl Default for RecordingMessenger {
    fn default() -> Self {
        Self {
            started: Instant::now(),
            log: Mutex::new(Vec::new()),
            next_id: Mutex::new(100),
        }
    }
}

impl RecordingMessenger {
    pub fn calls(&self) -> Vec<Outgoing> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .map(|(_, _, call)| call.clone())
            .collect()
    }

    pub fn timed_calls(&self) -> Vec<(Duration, Outgoing)> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .map(|(at, _, call)| (*at, call.clone()))
            .collect()
    }

    /// Sends and edits, i.e. the deliveries of an answer.
    pub fn deliveries(&self) -> Vec<Outgoing> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c, Outgoing::Send { .. } | Outgoing::Edit { .. }))
            .collect()
    }

    /// Text the user sees in `id` after all edits.
    pub fn visible_text(&self, id: MessageId) -> Option<String> {
        self.calls().into_iter().rev().find_map(|c| match c {
            Outgoing::Send { id: i, text }
            | Outgoing::Silent { id: i, text }
            | Outgoing::Edit { id: i, text }
                if i == id =>
            {
                Some(text)
            }
            _ => None,
        })
    }

    fn record(&self, chat: ChatId, call: Outgoing) {
        self.log
            .lock()
            .unwrap()
            .push((self.started.elapsed(), chat, call));
    }

    fn allocate_id(&self) -> MessageId {
        let mut next = self.next_id.lock().unwrap();
        *next += 1;
        MessageId::new(*next)
    }
}

impl Messenger for RecordingMessenger {
    async fn send(&self, chat: ChatId, text: &str) -> Result<MessageId, PublishError> {
        let id = self.allocate_id();
        self.record(
            chat,
            Outgoing::Send {
                id,
                text: text.to_string(),
            },
        );
        Ok(id)
    }

    async fn send_silent(&self, chat: ChatId, text: &str) -> Result<MessageId, PublishError> {
        let id = self.allocate_id();
        self.record(
            chat,
            Outgoing::Silent {
                id,
                text: text.to_string(),
            },
        );
        Ok(id)
    }

    async fn edit(
        &self,
        chat: ChatId,
        message_id: MessageId,
        text: &str,
    ) -> Result<(), PublishError> {
        self.record(
            chat,
            Outgoing::Edit {
                id: message_id,
                text: text.to_string(),
            },
        );
        Ok(())
    }

    async fn typing(&self, chat: ChatId) -> Result<(), PublishError> {
        self.record(chat, Outgoing::Typing);
        Ok(())
    }
}

/// A relay over a fresh store, the heuristic estimator and a recording messenger.
pub fn relay_with<P: CompletionProvider>(
    provider: Arc<P>,
    settings: TurnSettings,
) -> (Relay<P, RecordingMessenger>, Arc<RecordingMessenger>) {
    relay_with_estimator(provider, Arc::new(HeuristicEstimator), settings)
}

pub fn relay_with_estimator<P: CompletionProvider>(
    provider: Arc<P>,
    estimator: Arc<dyn TokenEstimator>,
    settings: TurnSettings,
) -> (Relay<P, RecordingMessenger>, Arc<RecordingMessenger>) {
    let messenger = Arc::new(RecordingMessenger::default());
    let relay = Relay::new(
        Arc::new(SessionStore::new()),
        provider,
        Arc::clone(&messenger),
        estimator,
        settings,
    );
    (relay, messenger)
}

/// Mount a streaming Chat Completions response made of `deltas`.
pub async fn mount_chat_stream(server: &MockServer, deltas: &[&str]) {
    let mut sse_body = String::new();
    for delta in deltas {
        let chunk = serde_json::json!({
            "id": "chatcmpl-test",
            "object": "chat.completion.chunk",
            "choices": [{"index": 0, "delta": {"content": delta}, "finish_reason": null}]
        });
        sse_body.push_str(&format!("data: {chunk}\n\n"));
    }
    let last = serde_json::json!({
        "id": "chatcmpl-test",
        "object": "chat.completion.chunk",
        "choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}]
    });
    sse_body.push_str(&format!("data: {last}\n\n"));
    sse_body.push_str("data: [DONE]\n\n");

    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(sse_body)
                .insert_header("content-type", "text/event-stream"),
        )
        .mount(server)
        .await;
}
