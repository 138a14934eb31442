//! Relay engine: turns, throttled delivery and the bot front-end.
//!
//! A turn takes one user prompt through the provider and streams the answer
//! back through a [`Messenger`]:
//!
//! 1. expire the user's session if it sat idle too long,
//! 2. append the prompt (rolled back if the provider cannot be called),
//! 3. run the generator, throttler and publisher tasks (see [`pipeline`]),
//! 4. commit the answer and trim the history to the token budget.
//!
//! [`Bot`] sits in front of [`Relay`] and adds access control, commands,
//! per-user serialization ([`TurnGate`]) and user-facing error replies.
//! [`spawn_idle_sweeper`] evicts idle sessions in the background.

mod bot;
mod errors;
mod gate;
mod messenger;
pub mod pipeline;
mod sweeper;
mod turn;

pub use bot::{
    Bot, CONTEXT_TRIMMED_TEXT, EMPTY_ANSWER_TEXT, HELP_TEXT, Handled, NEW_CONVERSATION_TEXT,
    PROMPT_TOO_LONG_TEXT, UNKNOWN_COMMAND_TEXT, WELCOME_TEXT,
};
pub use errors::{format_provider_error, format_stream_error, format_turn_error};
pub use gate::{TurnGate, TurnPermit, TurnTicket};
pub use messenger::{Command, Inbound, Messenger, PublishError};
pub use pipeline::{PublishReport, ThrottleReport};
pub use sweeper::{IDLE_NOTICE, spawn_idle_sweeper, sweep_and_notify};
pub use turn::{Relay, TurnError, TurnReport, TurnSettings};

pub(crate) mod clock {
    use std::time::Instant;

    /// Wall clock that follows tokio's, so paused-time tests drive session stamps.
    pub(crate) fn now() -> Instant {
        tokio::time::Instant::now().into_std()
    }
}
