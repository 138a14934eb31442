//! Background idle sweep with user notification.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use relay_context::{SessionStore, sweep_idle};

use crate::clock;
use crate::messenger::Messenger;

/// Appended to the last answer of a conversation cleared by the sweeper.
pub const IDLE_NOTICE: &str = "\n\nContext cleared due to inactivity.";

/// Expires idle sessions once and edits each owner's last answer.
///
/// Returns the number of sessions expired.
pub async fn sweep_and_notify<M: Messenger>(
    store: &SessionStore,
    messenger: &M,
    idle_timeout: Duration,
) -> usize {
    let expired = sweep_idle(store, clock::now(), idle_timeout);
    for session in &expired {
        let Some(reply) = session.latest_reply() else {
            continue;
        };
        let text = format!("{}{IDLE_NOTICE}", reply.text);
        if let Err(e) = messenger.edit(reply.chat_id, reply.message_id, &text).await {
            tracing::warn!(
                user_id = %session.user_id(),
                error = %e,
                "Failed to notify user about cleared context"
            );
        }
    }
    expired.len()
}

/// Runs [`sweep_and_notify`] every `interval` until the handle is aborted.
pub fn spawn_idle_sweeper<M: Messenger>(
    store: Arc<SessionStore>,
    messenger: Arc<M>,
    idle_timeout: Duration,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let expired = sweep_and_notify(&store, messenger.as_ref(), idle_timeout).await;
            if expired > 0 {
                tracing::debug!(expired, "Idle sweep finished");
            }
        }
    })
}
