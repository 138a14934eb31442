//! Throttled delivery pipeline.
//!
//! One turn runs three tasks connected by unbounded channels:
//!
//! ```text
//! generator ──A: full answer so far──▶ throttler ──B: at most one per interval──▶ publisher
//! ```
//!
//! - The generator drives the provider stream, accumulates the answer and
//!   commits it to the session. It never waits on delivery: a send on A that
//!   fails because the downstream stages stopped is ignored.
//! - The throttler forwards the newest snapshot at most once per interval.
//!   Snapshots that arrive in between supersede each other, and a pending
//!   snapshot is always flushed once A closes.
//! - The publisher posts the first snapshot and edits that message with each
//!   later one.
//!
//! Snapshots are cumulative, so the last one the publisher sees is the whole
//! answer and their lengths never decrease.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::time::{Instant, sleep_until};

use relay_context::{SessionHandle, TokenEstimator, estimate_or_exhaust, lock_session};
use relay_providers::{CompletionProvider, CompletionRequest, ProviderError, StreamError};
use relay_types::{ChatId, ConversationMessage, MessageId, Role};

use crate::messenger::{Messenger, PublishError};

// ============================================================================
// Generator
// ============================================================================

/// Everything the generator needs to run one provider call.
pub(crate) struct GeneratorInput<P> {
    pub provider: Arc<P>,
    pub session: SessionHandle,
    /// History as it was before the prompt was appended.
    pub rollback: Vec<ConversationMessage>,
    pub request: CompletionRequest,
    pub estimator: Arc<dyn TokenEstimator>,
    pub token_budget: u32,
    /// A pre-call trim already dropped messages this turn.
    pub pre_trimmed: bool,
}

/// Result of a generator run that reached the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generation {
    pub answer: String,
    pub context_trimmed: bool,
    pub stream_error: Option<StreamError>,
}

/// Calls the provider and streams cumulative snapshots on `snapshots`.
///
/// On invocation failure the session history is restored to `rollback` and
/// the error returned. A stream that fails before its first delta also
/// restores `rollback` and reports the stream error. Otherwise the (possibly
/// partial) answer is committed, the history is trimmed to budget and the
/// session touched.
pub(crate) async fn generate<P: CompletionProvider>(
    input: GeneratorInput<P>,
    snapshots: UnboundedSender<String>,
) -> Result<Generation, ProviderError> {
    let GeneratorInput {
        provider,
        session,
        rollback,
        request,
        estimator,
        token_budget,
        pre_trimmed,
    } = input;
    let model = request.model.clone();

    let mut stream = match provider.stream_completion(request).await {
        Ok(stream) => stream,
        Err(e) => {
            lock_session(&session).restore(rollback);
            return Err(e);
        }
    };

    let mut answer = String::new();
    let mut stream_error = None;
    while let Some(delta) = stream.next_delta().await {
        match delta {
            Ok(text) => {
                answer.push_str(&text);
                // Publisher may be gone; generation continues regardless.
                let _ = snapshots.send(answer.clone());
            }
            Err(e) => {
                tracing::warn!(error = %e, partial_len = answer.len(), "Completion stream failed");
                stream_error = Some(e);
                break;
            }
        }
    }
    stream.close();
    drop(snapshots);

    if answer.is_empty()
        && let Some(e) = stream_error.take()
    {
        // Nothing streamed, so the turn leaves no trace in history.
        lock_session(&session).restore(rollback);
        tracing::warn!(error = %e, "Stream failed before the first delta; history rolled back");
        return Ok(Generation {
            answer,
            context_trimmed: false,
            stream_error: Some(e),
        });
    }

    let cost = if answer.is_empty() {
        0
    } else {
        estimate_or_exhaust(estimator.as_ref(), Role::Assistant, &answer, &model)
    };

    let trim = {
        let mut session = lock_session(&session);
        if !answer.is_empty() {
            session.push(ConversationMessage::assistant(answer.clone(), cost));
        }
        let trim = session.trim_to_budget(token_budget);
        session.touch(crate::clock::now());
        trim
    };

    if trim.trimmed() {
        tracing::info!(
            dropped = trim.dropped,
            remaining_tokens = trim.remaining_tokens,
            "Trimmed conversation history"
        );
    }

    Ok(Generation {
        answer,
        context_trimmed: pre_trimmed || trim.trimmed(),
        stream_error,
    })
}

// ============================================================================
// Throttler
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThrottleReport {
    pub received: usize,
    pub forwarded: usize,
}

/// Forwards the newest value from `rx` to `tx` at most once per `interval`.
///
/// The first value goes out immediately. Returns when `rx` closes (after
/// flushing any pending value) or when `tx` has no receiver left.
pub async fn throttle(
    mut rx: UnboundedReceiver<String>,
    tx: UnboundedSender<String>,
    interval: Duration,
) -> ThrottleReport {
    let mut report = ThrottleReport::default();
    let mut pending: Option<String> = None;
    let mut next_emit = Instant::now();

    loop {
        if pending.is_some() {
            tokio::select! {
                biased;
                () = sleep_until(next_emit) => {
                    // Pick up anything that arrived while sleeping.
                    while let Ok(value) = rx.try_recv() {
                        report.received += 1;
                        pending = Some(value);
                    }
                    if let Some(value) = pending.take() {
                        if tx.send(value).is_err() {
                            return report;
                        }
                        report.forwarded += 1;
                        next_emit = Instant::now() + interval;
                    }
                }
                value = rx.recv() => match value {
                    Some(value) => {
                        report.received += 1;
                        pending = Some(value);
                    }
                    None => break,
                },
            }
        } else {
            let Some(value) = rx.recv().await else { break };
            report.received += 1;
            let now = Instant::now();
            if now >= next_emit {
                if tx.send(value).is_err() {
                    return report;
                }
                report.forwarded += 1;
                next_emit = now + interval;
            } else {
                pending = Some(value);
            }
        }
    }

    if let Some(value) = pending.take()
        && tx.send(value).is_ok()
    {
        report.forwarded += 1;
    }

    tracing::debug!(
        received = report.received,
        forwarded = report.forwarded,
        "Throttler finished"
    );
    report
}

// ============================================================================
// Publisher
// ============================================================================

/// What the publisher managed to show the user.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Id of the message carrying the answer, once the first send succeeded.
    pub message_id: Option<MessageId>,
    /// Text the user currently sees in that message.
    pub published_text: Option<String>,
    pub edits: usize,
    pub failed_edits: usize,
    /// Set when the first send failed; nothing was published.
    pub send_error: Option<PublishError>,
}

/// Sends the first snapshot, then edits that message with each later one.
///
/// A failed first send stops publishing. A failed edit is logged and the
/// next snapshot is tried.
pub async fn publish<M: Messenger>(
    messenger: Arc<M>,
    chat: ChatId,
    mut rx: UnboundedReceiver<String>,
) -> PublishReport {
    let mut report = PublishReport::default();

    while let Some(text) = rx.recv().await {
        let Some(message_id) = report.message_id else {
            match messenger.send(chat, &text).await {
                Ok(message_id) => {
                    report.message_id = Some(message_id);
                    report.published_text = Some(text);
                }
                Err(e) => {
                    tracing::error!(%chat, error = %e, "Failed to send answer");
                    report.send_error = Some(e);
                    break;
                }
            }
            continue;
        };

        if report.published_text.as_deref() == Some(text.as_str()) {
            continue;
        }

        match messenger.edit(chat, message_id, &text).await {
            Ok(()) => {
                tracing::debug!(%chat, %message_id, len = text.len(), "Edited answer");
                report.edits += 1;
                report.published_text = Some(text);
            }
            Err(e) => {
                tracing::warn!(%chat, %message_id, error = %e, "Failed to edit answer");
                report.failed_edits += 1;
            }
        }
    }

    report
}
