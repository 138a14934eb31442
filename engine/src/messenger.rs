//! Messaging-platform seam.
//!
//! The engine publishes through [`Messenger`] and consumes [`Inbound`]
//! messages; the platform client (Telegram) lives in its own crate.

use std::future::Future;

use relay_types::{ChatId, MessageId, UserId};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PublishError {
    /// The platform answered and refused the request.
    #[error("platform rejected the request: {0}")]
    Rejected(String),
    /// The platform could not be reached or answered garbage.
    #[error("platform unreachable: {0}")]
    Transport(String),
}

/// Outbound side of the messaging platform.
pub trait Messenger: Send + Sync + 'static {
    /// Posts a new message and returns its id.
    fn send(
        &self,
        chat: ChatId,
        text: &str,
    ) -> impl Future<Output = Result<MessageId, PublishError>> + Send;

    /// Like [`Messenger::send`] but without notifying the recipient.
    fn send_silent(
        &self,
        chat: ChatId,
        text: &str,
    ) -> impl Future<Output = Result<MessageId, PublishError>> + Send {
        self.send(chat, text)
    }

    /// Replaces the text of a message previously returned by `send`.
    fn edit(
        &self,
        chat: ChatId,
        message_id: MessageId,
        text: &str,
    ) -> impl Future<Output = Result<(), PublishError>> + Send;

    /// Shows a "typing..." indicator. Best effort.
    fn typing(&self, chat: ChatId) -> impl Future<Output = Result<(), PublishError>> + Send;
}

/// Bot commands the relay understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    Help,
    New,
    Unknown(String),
}

impl Command {
    /// Maps a command name (without the leading `/`) to a command.
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "start" => Self::Start,
            "help" => Self::Help,
            "new" => Self::New,
            _ => Self::Unknown(name.to_string()),
        }
    }
}

/// A text message received from an end user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    pub user_id: UserId,
    pub chat_id: ChatId,
    pub text: String,
    /// Set when the message is a bot command; `text` still holds the raw input.
    pub command: Option<Command>,
}
