//! Conversation state for the relay.
//!
//! This crate provides:
//! - Approximate token estimation via tiktoken (or a cheap heuristic)
//! - An in-memory, per-user session store
//! - Budget trimming of conversation history
//! - Idle expiry of sessions, lazily per message or by periodic sweep
//!
//! # Architecture
//!
//! ```text
//! SessionStore (DashMap, one shard lock per key range)
//! └── SessionHandle = Arc<Mutex<Session>>
//!     ├── history: Vec<ConversationMessage> (oldest first)
//!     ├── last_active_at: Instant
//!     └── latest_reply: Option<PublishedReply>
//!
//! TokenEstimator (strategy)
//! ├── TiktokenEstimator
//! └── HeuristicEstimator
//! ```

mod expiry;
mod store;
mod token_counter;
mod trim;

pub use expiry::{expire_if_idle, maybe_expire, sweep_idle};
pub use store::{PublishedReply, Session, SessionHandle, SessionStore, lock_session};
pub use token_counter::{
    HeuristicEstimator, TiktokenEstimator, TokenEstimationError, TokenEstimator,
    estimate_or_exhaust,
};
pub use trim::{DEFAULT_TOKEN_BUDGET, TrimOutcome, TrimStrategy, trim_to_budget};
