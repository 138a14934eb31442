//! Telegram Bot API client.
//!
//! [`TelegramClient`] speaks the JSON flavour of the Bot API
//! (`POST {api_url}/bot{token}/{method}`) and implements the engine's
//! [`Messenger`] seam. [`UpdatePoller`] drives `getUpdates` long polling and
//! yields engine [`Inbound`](relay_engine::Inbound) messages.
//!
//! A response with `"ok": false` becomes [`TelegramError::Api`] carrying the
//! Bot API's `error_code` and `description`.

mod poller;
mod types;

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::json;

use relay_engine::{Messenger, PublishError};
use relay_types::{ApiKey, ChatId, MessageId};

pub use poller::UpdatePoller;
pub use types::{
    BotCommand, Chat, Message, MessageEntity, Update, User, default_commands, parse_command,
};

use types::ApiResponse;

pub const DEFAULT_API_URL: &str = "https://api.telegram.org";

const CONNECT_TIMEOUT_SECS: u64 = 10;
const REQUEST_TIMEOUT_SECS: u64 = 30;
/// Extra time on top of the long-poll timeout before the HTTP request gives up.
const POLL_GRACE_SECS: u64 = 10;

#[derive(Debug, thiserror::Error)]
pub enum TelegramError {
    #[error("Telegram API error {code}: {description}")]
    Api {
        code: i64,
        description: String,
        retry_after: Option<Duration>,
    },
    #[error("Telegram request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Telegram returned ok without a result for {method}")]
    MissingResult { method: &'static str },
}

impl TelegramError {
    /// Editing a message to its current text is reported as an error by the API.
    #[must_use]
    pub fn is_not_modified(&self) -> bool {
        matches!(self, Self::Api { description, .. } if description.contains("message is not modified"))
    }
}

impl From<TelegramError> for PublishError {
    fn from(err: TelegramError) -> Self {
        match err {
            TelegramError::Api { .. } | TelegramError::MissingResult { .. } => {
                Self::Rejected(err.to_string())
            }
            TelegramError::Http(e) => Self::Transport(e.to_string()),
        }
    }
}

pub struct TelegramClient {
    http: reqwest::Client,
    api_url: String,
    token: ApiKey,
}

impl fmt::Debug for TelegramClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TelegramClient")
            .field("api_url", &self.api_url)
            .field("token", &"<redacted>")
            .finish_non_exhaustive()
    }
}

impl TelegramClient {
    pub fn new(token: ApiKey) -> Result<Self, TelegramError> {
        Self::with_api_url(token, DEFAULT_API_URL)
    }

    /// Points the client at another Bot API server (self-hosted or a mock).
    pub fn with_api_url(token: ApiKey, api_url: &str) -> Result<Self, TelegramError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self {
            http,
            api_url: api_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    #[must_use]
    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    async fn call<B, T>(
        &self,
        method: &'static str,
        body: &B,
        timeout: Duration,
    ) -> Result<T, TelegramError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = format!(
            "{}/bot{}/{method}",
            self.api_url,
            self.token.expose_secret()
        );
        let response = self
            .http
            .post(url)
            .json(body)
            .timeout(timeout)
            .send()
            .await
            // The URL embeds the bot token.
            .map_err(reqwest::Error::without_url)?;
        // Error statuses still carry the JSON envelope.
        let envelope: ApiResponse<T> = response.json().await.map_err(reqwest::Error::without_url)?;

        if !envelope.ok {
            let err = TelegramError::Api {
                code: envelope.error_code.unwrap_or_default(),
                description: envelope
                    .description
                    .unwrap_or_else(|| "unknown error".to_string()),
                retry_after: envelope
                    .parameters
                    .and_then(|p| p.retry_after)
                    .map(Duration::from_secs),
            };
            tracing::debug!(method, error = %err, "Bot API call failed");
            return Err(err);
        }
        envelope
            .result
            .ok_or(TelegramError::MissingResult { method })
    }

    pub async fn get_me(&self) -> Result<User, TelegramError> {
        self.call("getMe", &json!({}), Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .await
    }

    /// Long-polls for updates with `update_id >= offset`.
    pub async fn get_updates(
        &self,
        offset: Option<i64>,
        timeout: Duration,
    ) -> Result<Vec<Update>, TelegramError> {
        let body = json!({
            "offset": offset,
            "timeout": timeout.as_secs(),
            "allowed_updates": ["message"],
        });
        self.call(
            "getUpdates",
            &body,
            timeout + Duration::from_secs(POLL_GRACE_SECS),
        )
        .await
    }

    pub async fn send_message(
        &self,
        chat: ChatId,
        text: &str,
        disable_notification: bool,
    ) -> Result<Message, TelegramError> {
        let body = json!({
            "chat_id": chat.as_i64(),
            "text": text,
            "disable_notification": disable_notification,
        });
        self.call(
            "sendMessage",
            &body,
            Duration::from_secs(REQUEST_TIMEOUT_SECS),
        )
        .await
    }

    /// Replaces a message's text. Re-sending the current text is not an error.
    pub async fn edit_message_text(
        &self,
        chat: ChatId,
        message_id: MessageId,
        text: &str,
    ) -> Result<(), TelegramError> {
        let body = json!({
            "chat_id": chat.as_i64(),
            "message_id": message_id.as_i64(),
            "text": text,
        });
        // The result is the edited Message, or `true` for inline messages.
        let result: Result<serde_json::Value, _> = self
            .call(
                "editMessageText",
                &body,
                Duration::from_secs(REQUEST_TIMEOUT_SECS),
            )
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_modified() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// `action` is a Bot API chat action such as `"typing"`.
    pub async fn send_chat_action(&self, chat: ChatId, action: &str) -> Result<(), TelegramError> {
        let body = json!({ "chat_id": chat.as_i64(), "action": action });
        let _: bool = self
            .call(
                "sendChatAction",
                &body,
                Duration::from_secs(REQUEST_TIMEOUT_SECS),
            )
            .await?;
        Ok(())
    }

    pub async fn set_my_commands(&self, commands: &[BotCommand]) -> Result<(), TelegramError> {
        let body = json!({ "commands": commands });
        let _: bool = self
            .call(
                "setMyCommands",
                &body,
                Duration::from_secs(REQUEST_TIMEOUT_SECS),
            )
            .await?;
        Ok(())
    }
}

impl Messenger for TelegramClient {
    async fn send(&self, chat: ChatId, text: &str) -> Result<MessageId, PublishError> {
        let message = self.send_message(chat, text, false).await?;
        Ok(MessageId::new(message.message_id))
    }

    async fn send_silent(&self, chat: ChatId, text: &str) -> Result<MessageId, PublishError> {
        let message = self.send_message(chat, text, true).await?;
        Ok(MessageId::new(message.message_id))
    }

    async fn edit(
        &self,
        chat: ChatId,
        message_id: MessageId,
        text: &str,
    ) -> Result<(), PublishError> {
        self.edit_message_text(chat, message_id, text).await?;
        Ok(())
    }

    async fn typing(&self, chat: ChatId) -> Result<(), PublishError> {
        self.send_chat_action(chat, "typing").await?;
        Ok(())
    }
}
