use std::sync::Arc;
use std::time::Duration;

use relay_engine::Inbound;

use crate::{TelegramClient, TelegramError};

/// Long-polling cursor over `getUpdates`.
///
/// Each successful batch acknowledges everything it returned, so an update is
/// handed out at most once even when it cannot be converted.
#[derive(Debug)]
pub struct UpdatePoller {
    client: Arc<TelegramClient>,
    offset: Option<i64>,
    timeout: Duration,
}

impl UpdatePoller {
    pub fn new(client: Arc<TelegramClient>, timeout: Duration) -> Self {
        Self {
            client,
            offset: None,
            timeout,
        }
    }

    #[must_use]
    pub fn offset(&self) -> Option<i64> {
        self.offset
    }

    /// Waits up to the poll timeout for new messages.
    ///
    /// Updates that are not text messages are acknowledged and dropped. An
    /// empty batch means the poll timed out.
    pub async fn next_batch(&mut self) -> Result<Vec<Inbound>, TelegramError> {
        let updates = self.client.get_updates(self.offset, self.timeout).await?;
        if let Some(last) = updates.iter().map(|u| u.update_id).max() {
            self.offset = Some(last + 1);
        }

        let received = updates.len();
        let batch: Vec<Inbound> = updates
            .into_iter()
            .filter_map(crate::Update::into_inbound)
            .collect();
        if received > batch.len() {
            tracing::debug!(skipped = received - batch.len(), "Skipped non-text updates");
        }
        Ok(batch)
    }
}
