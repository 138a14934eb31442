//! Relay binary: Telegram long polling in, OpenAI streaming out.
//!
//! ```text
//! getUpdates ─▶ UpdatePoller ─▶ Bot::dispatch (one task per message)
//!                                   │
//!                                   └─▶ Relay::run_turn ─▶ OpenAiClient
//!                                                       └─▶ TelegramClient (send / edit)
//! ```
//!
//! Configuration comes from `~/.relay/config.toml` and the environment (see
//! `relay_config`). Logs go to stderr; set `RUST_LOG` to change the filter.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use relay_config::{EstimatorKind, RelayConfig};
use relay_context::{HeuristicEstimator, SessionStore, TiktokenEstimator, TokenEstimator};
use relay_engine::{Bot, Relay, TurnSettings, spawn_idle_sweeper};
use relay_providers::openai::OpenAiClient;
use relay_telegram::{DEFAULT_API_URL, TelegramClient, TelegramError, UpdatePoller, default_commands};

/// Pause after a failed `getUpdates` when the API gave no `retry_after`.
const POLL_ERROR_BACKOFF: Duration = Duration::from_secs(3);

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();
}

fn build_estimator(kind: EstimatorKind) -> Arc<dyn TokenEstimator> {
    match kind {
        EstimatorKind::Tiktoken => Arc::new(TiktokenEstimator::new()),
        EstimatorKind::Heuristic => Arc::new(HeuristicEstimator),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = RelayConfig::load().context("failed to load configuration")?;

    let provider = Arc::new(
        OpenAiClient::with_base_url(config.openai_api_key.clone(), &config.openai_base_url)
            .context("failed to build OpenAI client")?,
    );
    let telegram = Arc::new(
        TelegramClient::with_api_url(
            config.telegram_token.clone(),
            config
                .telegram_api_url
                .as_deref()
                .unwrap_or(DEFAULT_API_URL),
        )
        .context("failed to build Telegram client")?,
    );

    let me = telegram
        .get_me()
        .await
        .context("Telegram rejected the bot token")?;
    tracing::info!(
        username = me.username.as_deref().unwrap_or(&me.first_name),
        "Authorized on Telegram"
    );

    if let Err(e) = telegram.set_my_commands(&default_commands()).await {
        tracing::warn!(error = %e, "Failed to register bot commands");
    }

    let store = Arc::new(SessionStore::new());
    let sweeper = config.notify_on_idle_timeout.then(|| {
        spawn_idle_sweeper(
            Arc::clone(&store),
            Arc::clone(&telegram),
            config.idle_timeout,
            config.sweep_interval,
        )
    });

    let relay = Relay::new(
        store,
        provider,
        Arc::clone(&telegram),
        build_estimator(config.estimator),
        TurnSettings::from_config(&config),
    );
    let bot = Arc::new(Bot::new(relay, config.allowed_users.clone()));

    tracing::info!(
        model = %config.model,
        idle_timeout_secs = config.idle_timeout.as_secs(),
        token_budget = config.token_budget,
        allowed_users = config.allowed_users.len(),
        "Relay started"
    );

    let mut poller = UpdatePoller::new(telegram, config.poll_timeout);
    tokio::select! {
        () = poll_forever(&bot, &mut poller) => {}
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for shutdown signal")?;
            tracing::info!("Shutting down");
        }
    }

    if let Some(sweeper) = sweeper {
        sweeper.abort();
    }
    Ok(())
}

async fn poll_forever<P, M>(bot: &Arc<Bot<P, M>>, poller: &mut UpdatePoller)
where
    P: relay_providers::CompletionProvider,
    M: relay_engine::Messenger,
{
    loop {
        match poller.next_batch().await {
            Ok(batch) => {
                for inbound in batch {
                    bot.dispatch(inbound);
                }
            }
            Err(e) => {
                let backoff = match &e {
                    TelegramError::Api {
                        retry_after: Some(after),
                        ..
                    } => *after,
                    _ => POLL_ERROR_BACKOFF,
                };
                tracing::warn!(error = %e, backoff_secs = backoff.as_secs(), "Polling updates failed");
                tokio::time::sleep(backoff).await;
            }
        }
    }
}
