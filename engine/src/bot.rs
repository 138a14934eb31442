//! Update dispatch: access control, commands and prompts.

use std::sync::Arc;

use tokio::task::JoinHandle;

use relay_providers::CompletionProvider;
use relay_types::{ChatId, NonEmptyString, UserId};

use crate::errors::{format_stream_error, format_turn_error};
use crate::gate::{TurnGate, TurnTicket};
use crate::messenger::{Command, Inbound, Messenger};
use crate::turn::{Relay, TurnError, TurnReport};

pub const WELCOME_TEXT: &str = "Welcome to ChatGPT bot! Write something to start a conversation. Use /new to clear context and start a new conversation.";
pub const HELP_TEXT: &str =
    "Write something to start a conversation. Use /new to clear context and start a new conversation.";
pub const NEW_CONVERSATION_TEXT: &str = "OK, let's start a new conversation.";
pub const UNKNOWN_COMMAND_TEXT: &str = "I don't know that command";
pub const CONTEXT_TRIMMED_TEXT: &str = "Context trimmed.";
pub const EMPTY_ANSWER_TEXT: &str = "The model returned an empty answer. Please try rephrasing.";
pub const PROMPT_TOO_LONG_TEXT: &str =
    "Your message is too long for the conversation's token budget and was not sent. Please shorten it.";

/// What [`Bot::handle`] did with an update.
#[derive(Debug)]
pub enum Handled {
    /// The sender is not on the allow-list.
    NotAllowed,
    Command(Command),
    /// Whitespace-only text; nothing was sent.
    Ignored,
    Turn(Result<TurnReport, TurnError>),
}

/// Front-end that turns inbound messages into turns and replies.
pub struct Bot<P, M> {
    relay: Relay<P, M>,
    gate: TurnGate,
    allowed_users: Vec<UserId>,
}

impl<P, M> Bot<P, M>
where
    P: CompletionProvider,
    M: Messenger,
{
    /// An empty `allowed_users` lets everyone in.
    pub fn new(relay: Relay<P, M>, allowed_users: Vec<UserId>) -> Self {
        Self {
            relay,
            gate: TurnGate::new(),
            allowed_users,
        }
    }

    #[must_use]
    pub fn relay(&self) -> &Relay<P, M> {
        &self.relay
    }

    #[must_use]
    pub fn is_allowed(&self, user_id: UserId) -> bool {
        self.allowed_users.is_empty() || self.allowed_users.contains(&user_id)
    }

    /// Handles `inbound` on its own task so slow turns never block other users.
    ///
    /// The user's queue place is taken before spawning, so prompts from one
    /// user run in the order they were dispatched.
    pub fn dispatch(self: &Arc<Self>, inbound: Inbound) -> JoinHandle<()> {
        let ticket = self.gate.reserve(inbound.user_id);
        let bot = Arc::clone(self);
        tokio::spawn(async move {
            bot.handle_in_order(inbound, ticket).await;
        })
    }

    pub async fn handle(&self, inbound: Inbound) -> Handled {
        let ticket = self.gate.reserve(inbound.user_id);
        self.handle_in_order(inbound, ticket).await
    }

    async fn handle_in_order(&self, inbound: Inbound, ticket: TurnTicket) -> Handled {
        let Inbound {
            user_id,
            chat_id,
            text,
            command,
        } = inbound;
        let messenger = self.relay.messenger();

        if !self.is_allowed(user_id) {
            tracing::info!(%user_id, "Rejected message from user outside the allow-list");
            let reply = format!("You are not allowed to use this bot. User ID: {user_id}");
            self.reply(chat_id, &reply).await;
            return Handled::NotAllowed;
        }

        if let Err(e) = messenger.typing(chat_id).await {
            tracing::debug!(%chat_id, error = %e, "Typing indicator failed");
        }

        if let Some(command) = command {
            self.run_command(user_id, chat_id, &command).await;
            return Handled::Command(command);
        }

        let Ok(prompt) = NonEmptyString::new(text) else {
            tracing::debug!(%user_id, "Ignoring blank message");
            return Handled::Ignored;
        };

        let _permit = ticket.admit().await;
        let result = self.relay.run_turn(user_id, chat_id, prompt.as_str()).await;
        match &result {
            Err(e) => {
                let text = format_turn_error(e, &self.relay.settings().model);
                self.reply(chat_id, &text).await;
            }
            Ok(report) => self.follow_up(chat_id, report).await,
        }
        Handled::Turn(result)
    }

    async fn run_command(&self, user_id: UserId, chat_id: ChatId, command: &Command) {
        let text = match command {
            Command::Start => WELCOME_TEXT,
            Command::Help => HELP_TEXT,
            Command::New => {
                if self.relay.store().delete(user_id) {
                    tracing::info!(%user_id, "Conversation reset by user");
                }
                NEW_CONVERSATION_TEXT
            }
            Command::Unknown(name) => {
                tracing::debug!(%user_id, command = %name, "Unknown command");
                UNKNOWN_COMMAND_TEXT
            }
        };
        self.reply(chat_id, text).await;
    }

    /// Notices sent after the answer itself has been published.
    async fn follow_up(&self, chat_id: ChatId, report: &TurnReport) {
        if report.prompt_dropped {
            self.reply(chat_id, PROMPT_TOO_LONG_TEXT).await;
        } else if let Some(err) = &report.stream_error {
            self.reply(chat_id, &format_stream_error(err)).await;
        } else if report.answer.is_empty() {
            self.reply(chat_id, EMPTY_ANSWER_TEXT).await;
        }

        if report.context_trimmed
            && let Err(e) = self
                .relay
                .messenger()
                .send_silent(chat_id, CONTEXT_TRIMMED_TEXT)
                .await
        {
            tracing::warn!(%chat_id, error = %e, "Failed to send trim notice");
        }
    }

    async fn reply(&self, chat_id: ChatId, text: &str) {
        if let Err(e) = self.relay.messenger().send(chat_id, text).await {
            tracing::error!(%chat_id, error = %e, "Failed to send reply");
        }
    }
}
