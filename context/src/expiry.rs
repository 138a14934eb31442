//! Idle expiry of sessions.
//!
//! Evaluated lazily on every inbound message, before the new prompt is
//! appended, so an expired conversation starts empty instead of inheriting
//! stale history. The optional background sweep calls [`sweep_idle`] on a
//! timer and notifies the owners of the evicted sessions.

use std::time::{Duration, Instant};

use relay_types::UserId;

use crate::store::{Session, SessionStore};

/// Removes the user's session if it has been idle longer than `timeout`.
///
/// Returns the evicted session so the caller can notify the user about it.
pub fn expire_if_idle(
    store: &SessionStore,
    user_id: UserId,
    now: Instant,
    timeout: Duration,
) -> Option<Session> {
    let expired = store.remove_if(user_id, |session| session.is_idle(now, timeout))?;
    tracing::info!(
        %user_id,
        idle_secs = now.saturating_duration_since(expired.last_active_at()).as_secs(),
        dropped_messages = expired.history().len(),
        "Session expired"
    );
    Some(expired)
}

/// Returns `true` when the session existed and was cleared for inactivity.
pub fn maybe_expire(store: &SessionStore, user_id: UserId, now: Instant, timeout: Duration) -> bool {
    expire_if_idle(store, user_id, now, timeout).is_some()
}

/// Expires every idle session in the store, returning the evicted ones.
pub fn sweep_idle(store: &SessionStore, now: Instant, timeout: Duration) -> Vec<Session> {
    store
        .list_user_ids()
        .into_iter()
        .filter_map(|user_id| expire_if_idle(store, user_id, now, timeout))
        .collect()
}
