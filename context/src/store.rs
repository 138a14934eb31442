//! In-memory session store keyed by user id.
//!
//! The map is sharded (`DashMap`), and each session sits behind its own
//! mutex, so turns for different users never contend on a shared lock.
//! Session mutexes are synchronous and must never be held across an `.await`.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use relay_types::{ChatId, ConversationMessage, MessageId, UserId};

use crate::trim::{TrimOutcome, trim_to_budget};

/// The last message the bot published to a user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedReply {
    pub chat_id: ChatId,
    pub message_id: MessageId,
    pub text: String,
}

/// One user's conversation.
#[derive(Debug, Clone)]
pub struct Session {
    user_id: UserId,
    last_active_at: Instant,
    history: Vec<ConversationMessage>,
    latest_reply: Option<PublishedReply>,
}

impl Session {
    #[must_use]
    pub fn new(user_id: UserId, now: Instant) -> Self {
        Self {
            user_id,
            last_active_at: now,
            history: Vec::new(),
            latest_reply: None,
        }
    }

    #[must_use]
    pub const fn user_id(&self) -> UserId {
        self.user_id
    }

    #[must_use]
    pub const fn last_active_at(&self) -> Instant {
        self.last_active_at
    }

    #[must_use]
    pub fn history(&self) -> &[ConversationMessage] {
        &self.history
    }

    #[must_use]
    pub fn latest_reply(&self) -> Option<&PublishedReply> {
        self.latest_reply.as_ref()
    }

    pub fn set_latest_reply(&mut self, reply: PublishedReply) {
        self.latest_reply = Some(reply);
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_active_at = now;
    }

    pub fn push(&mut self, message: ConversationMessage) {
        self.history.push(message);
    }

    /// Sum of the stored token costs.
    #[must_use]
    pub fn total_tokens(&self) -> u64 {
        self.history
            .iter()
            .map(|m| u64::from(m.token_cost()))
            .sum()
    }

    /// Copy of the history, to be handed back to [`Session::restore`] if the
    /// turn that follows fails before producing anything.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ConversationMessage> {
        self.history.clone()
    }

    pub fn restore(&mut self, snapshot: Vec<ConversationMessage>) {
        self.history = snapshot;
    }

    pub fn trim_to_budget(&mut self, budget: u32) -> TrimOutcome {
        trim_to_budget(&mut self.history, budget)
    }

    /// `true` when `last_active_at + timeout` lies strictly before `now`.
    #[must_use]
    pub fn is_idle(&self, now: Instant, timeout: Duration) -> bool {
        self.last_active_at
            .checked_add(timeout)
            .is_some_and(|deadline| deadline < now)
    }
}

pub type SessionHandle = Arc<Mutex<Session>>;

/// Lock a session, recovering the data if a previous holder panicked.
///
/// Session state stays consistent across a panic because every mutation is a
/// single push, drain or assignment.
pub fn lock_session(handle: &SessionHandle) -> MutexGuard<'_, Session> {
    handle.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: DashMap<UserId, SessionHandle>,
}

impl SessionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the user's session, creating an empty one stamped `now` if absent.
    pub fn get_or_create(&self, user_id: UserId, now: Instant) -> SessionHandle {
        let entry = self.sessions.entry(user_id).or_insert_with(|| {
            tracing::debug!(%user_id, "Creating session");
            Arc::new(Mutex::new(Session::new(user_id, now)))
        });
        Arc::clone(entry.value())
    }

    #[must_use]
    pub fn get(&self, user_id: UserId) -> Option<SessionHandle> {
        self.sessions
            .get(&user_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Removes the user's session. Returns `false` if there was none.
    pub fn delete(&self, user_id: UserId) -> bool {
        let removed = self.sessions.remove(&user_id).is_some();
        if removed {
            tracing::debug!(%user_id, "Session deleted");
        }
        removed
    }

    pub fn touch(&self, user_id: UserId, now: Instant) {
        if let Some(handle) = self.get(user_id) {
            lock_session(&handle).touch(now);
        }
    }

    /// Snapshot of the user ids currently holding a session.
    #[must_use]
    pub fn list_user_ids(&self) -> Vec<UserId> {
        self.sessions.iter().map(|entry| *entry.key()).collect()
    }

    /// Removes the session when `predicate` holds for it, atomically with
    /// respect to other store operations on the same key.
    pub(crate) fn remove_if(
        &self,
        user_id: UserId,
        predicate: impl FnOnce(&Session) -> bool,
    ) -> Option<Session> {
        let (_, handle) = self
            .sessions
            .remove_if(&user_id, |_, handle| predicate(&*lock_session(handle)))?;
        let session = lock_session(&handle).clone();
        Some(session)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
