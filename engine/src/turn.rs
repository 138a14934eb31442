//! Turn orchestration: one prompt in, one streamed answer out.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use relay_config::RelayConfig;
use relay_context::{
    PublishedReply, SessionStore, TokenEstimator, TrimStrategy, estimate_or_exhaust, lock_session,
    maybe_expire,
};
use relay_providers::{CompletionProvider, CompletionRequest, ProviderError, StreamError};
use relay_types::{ChatId, ConversationMessage, ModelName, Role, UserId};

use crate::clock;
use crate::messenger::Messenger;
use crate::pipeline::{GeneratorInput, PublishReport, generate, publish, throttle};

/// Per-deployment knobs for a turn.
#[derive(Debug, Clone)]
pub struct TurnSettings {
    pub model: ModelName,
    pub temperature: f32,
    pub token_budget: u32,
    pub trim_strategy: TrimStrategy,
    pub edit_interval: Duration,
    pub idle_timeout: Duration,
}

impl TurnSettings {
    #[must_use]
    pub fn from_config(config: &RelayConfig) -> Self {
        Self {
            model: config.model.clone(),
            temperature: config.temperature,
            token_budget: config.token_budget,
            trim_strategy: config.trim_strategy,
            edit_interval: config.edit_interval,
            idle_timeout: config.idle_timeout,
        }
    }
}

impl Default for TurnSettings {
    fn default() -> Self {
        Self {
            model: ModelName::default(),
            temperature: 1.0,
            token_budget: relay_context::DEFAULT_TOKEN_BUDGET,
            trim_strategy: TrimStrategy::default(),
            edit_interval: Duration::from_millis(1500),
            idle_timeout: Duration::from_secs(900),
        }
    }
}

/// Outcome of a turn that did not fail to invoke the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnReport {
    /// Everything the provider produced, possibly partial.
    pub answer: String,
    /// Some history was dropped to fit the budget.
    pub context_trimmed: bool,
    /// The stream broke after it started; `answer` is what arrived before.
    pub stream_error: Option<StreamError>,
    /// The prompt alone exceeded the budget and was trimmed away before
    /// the provider call, so nothing was requested.
    pub prompt_dropped: bool,
    pub publish: PublishReport,
}

#[derive(Debug, thiserror::Error)]
pub enum TurnError {
    /// The provider could not be called. History was rolled back.
    #[error(transparent)]
    ProviderInvocation(#[from] ProviderError),
    /// A pipeline task panicked or was cancelled.
    #[error("turn task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Runs turns against a shared session store.
pub struct Relay<P, M> {
    store: Arc<SessionStore>,
    provider: Arc<P>,
    messenger: Arc<M>,
    estimator: Arc<dyn TokenEstimator>,
    settings: TurnSettings,
}

impl<P, M> Relay<P, M>
where
    P: CompletionProvider,
    M: Messenger,
{
    pub fn new(
        store: Arc<SessionStore>,
        provider: Arc<P>,
        messenger: Arc<M>,
        estimator: Arc<dyn TokenEstimator>,
        settings: TurnSettings,
    ) -> Self {
        Self {
            store,
            provider,
            messenger,
            estimator,
            settings,
        }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    #[must_use]
    pub fn messenger(&self) -> &Arc<M> {
        &self.messenger
    }

    #[must_use]
    pub fn settings(&self) -> &TurnSettings {
        &self.settings
    }

    /// Runs one prompt through the provider and streams the answer to `chat`.
    ///
    /// Callers must not run two turns for the same user concurrently; see
    /// [`crate::TurnGate`].
    pub async fn run_turn(
        &self,
        user_id: UserId,
        chat_id: ChatId,
        prompt: &str,
    ) -> Result<TurnReport, TurnError> {
        let settings = &self.settings;
        let now = clock::now();

        if maybe_expire(&self.store, user_id, now, settings.idle_timeout) {
            tracing::info!(%user_id, "Starting fresh conversation after inactivity");
        }

        let prompt_cost =
            estimate_or_exhaust(self.estimator.as_ref(), Role::User, prompt, &settings.model);
        let session = self.store.get_or_create(user_id, now);

        let (rollback, messages, pre_trimmed) = {
            let mut guard = lock_session(&session);
            let rollback = guard.snapshot();
            guard.push(ConversationMessage::user(prompt, prompt_cost));
            guard.touch(now);

            let pre_trimmed = if settings.trim_strategy.trims_before_call() {
                let outcome = guard.trim_to_budget(settings.token_budget);
                if outcome.trimmed() {
                    tracing::info!(
                        %user_id,
                        dropped = outcome.dropped,
                        remaining_tokens = outcome.remaining_tokens,
                        "Trimmed history before provider call"
                    );
                }
                outcome.trimmed()
            } else {
                false
            };

            let messages: Vec<(Role, String)> = guard
                .history()
                .iter()
                .map(|m| (m.role(), m.content().to_string()))
                .collect();
            (rollback, messages, pre_trimmed)
        };

        if messages.is_empty() {
            tracing::warn!(
                %user_id,
                prompt_tokens = prompt_cost,
                budget = settings.token_budget,
                "Prompt exceeds the token budget on its own; skipping provider call"
            );
            return Ok(TurnReport {
                answer: String::new(),
                context_trimmed: true,
                stream_error: None,
                prompt_dropped: true,
                publish: PublishReport::default(),
            });
        }

        tracing::info!(
            %user_id,
            history_len = messages.len(),
            prompt_tokens = prompt_cost,
            "Starting turn"
        );

        let request = CompletionRequest {
            messages,
            model: settings.model.clone(),
            temperature: settings.temperature,
        };

        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();

        let generator = tokio::spawn(generate(
            GeneratorInput {
                provider: Arc::clone(&self.provider),
                session: Arc::clone(&session),
                rollback,
                request,
                estimator: Arc::clone(&self.estimator),
                token_budget: settings.token_budget,
                pre_trimmed,
            },
            tx_a,
        ));
        let throttler = tokio::spawn(throttle(rx_a, tx_b, settings.edit_interval));
        let publisher = tokio::spawn(publish(Arc::clone(&self.messenger), chat_id, rx_b));

        let (generation, throttled, published) = tokio::join!(generator, throttler, publisher);
        let generation = match generation? {
            Ok(generation) => generation,
            Err(e) => {
                tracing::warn!(%user_id, error = %e, "Provider invocation failed; history rolled back");
                return Err(TurnError::ProviderInvocation(e));
            }
        };
        let throttled = throttled?;
        let published = published?;

        if let (Some(message_id), Some(text)) = (published.message_id, &published.published_text) {
            lock_session(&session).set_latest_reply(PublishedReply {
                chat_id,
                message_id,
                text: text.clone(),
            });
        }

        tracing::info!(
            %user_id,
            answer_len = generation.answer.len(),
            snapshots = throttled.received,
            published = throttled.forwarded,
            edits = published.edits,
            context_trimmed = generation.context_trimmed,
            stream_failed = generation.stream_error.is_some(),
            "Turn finished"
        );

        Ok(TurnReport {
            answer: generation.answer,
            context_trimmed: generation.context_trimmed,
            stream_error: generation.stream_error,
            prompt_dropped: false,
            publish: published,
        })
    }
}
