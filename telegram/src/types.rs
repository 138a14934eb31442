//! Bot API wire types. Only the fields the relay reads are modeled.

use serde::{Deserialize, Serialize};

use relay_engine::{Command, Inbound};
use relay_types::{ChatId, UserId};

/// Every Bot API response is wrapped in this envelope.
#[derive(Debug, Deserialize)]
pub(crate) struct ApiResponse<T> {
    pub ok: bool,
    pub result: Option<T>,
    pub error_code: Option<i64>,
    pub description: Option<String>,
    pub parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ResponseParameters {
    pub retry_after: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    pub message: Option<Message>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub message_id: i64,
    pub from: Option<User>,
    pub chat: Chat,
    pub text: Option<String>,
    #[serde(default)]
    pub entities: Vec<MessageEntity>,
}

impl Message {
    /// A command is a message whose first entity is a `bot_command` at offset 0.
    #[must_use]
    pub fn is_command(&self) -> bool {
        self.entities
            .first()
            .is_some_and(|e| e.kind == "bot_command" && e.offset == 0)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub id: i64,
    #[serde(default)]
    pub is_bot: bool,
    pub first_name: String,
    pub username: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageEntity {
    #[serde(rename = "type")]
    pub kind: String,
    pub offset: usize,
    pub length: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BotCommand {
    pub command: String,
    pub description: String,
}

impl BotCommand {
    pub fn new(command: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            description: description.into(),
        }
    }
}

/// The command menu registered at startup.
#[must_use]
pub fn default_commands() -> Vec<BotCommand> {
    vec![
        BotCommand::new("help", "Get help"),
        BotCommand::new("new", "Clear context and start a new conversation"),
    ]
}

/// Extracts the command name from `/name@botname args`.
///
/// Returns `None` when `text` does not start with `/` or the name is empty.
#[must_use]
pub fn parse_command(text: &str) -> Option<&str> {
    let token = text.strip_prefix('/')?.split_whitespace().next()?;
    let name = token.split_once('@').map_or(token, |(name, _bot)| name);
    (!name.is_empty()).then_some(name)
}

impl Update {
    /// Converts a text message into an engine [`Inbound`].
    ///
    /// Updates without a message, sender or text are skipped.
    #[must_use]
    pub fn into_inbound(self) -> Option<Inbound> {
        let message = self.message?;
        let from = message.from.as_ref()?;
        let user_id = UserId::new(from.id);
        let command = if message.is_command() {
            message
                .text
                .as_deref()
                .and_then(parse_command)
                .map(Command::from_name)
        } else {
            None
        };
        let text = message.text?;
        Some(Inbound {
            user_id,
            chat_id: ChatId::new(message.chat.id),
            text,
            command,
        })
    }
}
