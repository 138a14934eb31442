//! Whole-turn behavior against a scripted provider.

use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;

use relay_context::{
    HeuristicEstimator, TokenEstimationError, TokenEstimator, TrimStrategy, lock_session,
};
use relay_engine::{TurnError, TurnSettings};
use relay_providers::scripted::{Script, ScriptedProvider};
use relay_types::{ChatId, ModelName, Role, UserId};

use crate::common::{relay_with, relay_with_estimator};

const USER: UserId = UserId::new(1);
const CHAT: ChatId = ChatId::new(1);

fn roles_and_text(relay_history: &[relay_types::ConversationMessage]) -> Vec<(Role, String)> {
    relay_history
        .iter()
        .map(|m| (m.role(), m.content().to_string()))
        .collect()
}

#[tokio::test]
async fn hello_turn_streams_and_commits() {
    let provider = Arc::new(ScriptedProvider::with_scripts([Script::answer([
        "Hi", " there",
    ])]));
    let (relay, messenger) = relay_with(Arc::clone(&provider), TurnSettings::default());

    let report = relay.run_turn(USER, CHAT, "hello").await.unwrap();

    assert_eq!(report.answer, "Hi there");
    assert!(!report.context_trimmed);
    assert!(report.stream_error.is_none());

    let session = relay.store().get(USER).unwrap();
    assert_eq!(
        roles_and_text(lock_session(&session).history()),
        vec![
            (Role::User, "hello".to_string()),
            (Role::Assistant, "Hi there".to_string()),
        ]
    );

    let id = report.publish.message_id.unwrap();
    assert_eq!(messenger.visible_text(id).as_deref(), Some("Hi there"));
    assert_eq!(
        lock_session(&session).latest_reply().map(|r| r.text.clone()),
        Some("Hi there".to_string())
    );

    let sent = provider.requests();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].messages, vec![(Role::User, "hello".to_string())]);
}

#[tokio::test]
async fn second_turn_sends_full_history() {
    let provider = Arc::new(ScriptedProvider::with_scripts([
        Script::answer(["4"]),
        Script::answer(["8"]),
    ]));
    let (relay, _messenger) = relay_with(Arc::clone(&provider), TurnSettings::default());

    relay.run_turn(USER, CHAT, "2+2?").await.unwrap();
    relay.run_turn(USER, CHAT, "times two?").await.unwrap();

    let second = &provider.requests()[1];
    assert_eq!(
        second.messages,
        vec![
            (Role::User, "2+2?".to_string()),
            (Role::Assistant, "4".to_string()),
            (Role::User, "times two?".to_string()),
        ]
    );
}

#[tokio::test]
async fn invocation_failure_rolls_back_history() {
    let provider = Arc::new(ScriptedProvider::with_scripts([
        Script::answer(["first answer"]),
        Script::fail(StatusCode::INTERNAL_SERVER_ERROR, "boom"),
    ]));
    let (relay, messenger) = relay_with(provider, TurnSettings::default());

    relay.run_turn(USER, CHAT, "first").await.unwrap();
    let session = relay.store().get(USER).unwrap();
    let before = lock_session(&session).history().len();
    let deliveries_before = messenger.deliveries().len();

    let err = relay.run_turn(USER, CHAT, "second").await.unwrap_err();

    assert!(matches!(err, TurnError::ProviderInvocation(_)));
    assert_eq!(lock_session(&session).history().len(), before);
    // Nothing was published for the failed turn.
    assert_eq!(messenger.deliveries().len(), deliveries_before);
}

#[tokio::test]
async fn interrupted_stream_commits_partial_answer() {
    let provider = Arc::new(ScriptedProvider::with_scripts([Script::interrupted(
        ["Once upon", " a time"],
        "Connection closed before stream completed",
    )]));
    let (relay, messenger) = relay_with(provider, TurnSettings::default());

    let report = relay.run_turn(USER, CHAT, "tell a story").await.unwrap();

    assert_eq!(report.answer, "Once upon a time");
    assert_eq!(
        report.stream_error.map(|e| e.message),
        Some("Connection closed before stream completed".to_string())
    );
    let session = relay.store().get(USER).unwrap();
    let history = roles_and_text(lock_session(&session).history());
    assert_eq!(
        history.last(),
        Some(&(Role::Assistant, "Once upon a time".to_string()))
    );
    let id = report.publish.message_id.unwrap();
    assert_eq!(
        messenger.visible_text(id).as_deref(),
        Some("Once upon a time")
    );
}

#[tokio::test]
async fn stream_failing_before_first_delta_rolls_back() {
    let provider = Arc::new(ScriptedProvider::with_scripts([
        Script::answer(["first answer"]),
        Script::interrupted(Vec::<String>::new(), "boom"),
        Script::answer(["third answer"]),
    ]));
    let (relay, messenger) = relay_with(Arc::clone(&provider), TurnSettings::default());

    relay.run_turn(USER, CHAT, "first").await.unwrap();
    let session = relay.store().get(USER).unwrap();
    let before = lock_session(&session).history().len();
    let deliveries_before = messenger.deliveries().len();

    let report = relay.run_turn(USER, CHAT, "second").await.unwrap();

    assert!(report.answer.is_empty());
    assert_eq!(report.stream_error.map(|e| e.message), Some("boom".to_string()));
    assert_eq!(lock_session(&session).history().len(), before);
    assert_eq!(messenger.deliveries().len(), deliveries_before);

    // The failed prompt left nothing behind, so roles still alternate.
    relay.run_turn(USER, CHAT, "third").await.unwrap();
    assert_eq!(
        provider.requests()[2].messages,
        vec![
            (Role::User, "first".to_string()),
            (Role::Assistant, "first answer".to_string()),
            (Role::User, "third".to_string()),
        ]
    );
}

#[tokio::test]
async fn budget_overflow_drops_oldest_messages() {
    // Heuristic cost: ceil(chars / 4) + 4 per message.
    let settings = TurnSettings {
        token_budget: 40,
        ..TurnSettings::default()
    };
    let provider = Arc::new(ScriptedProvider::with_scripts([
        Script::answer(["a".repeat(48)]),
        Script::answer(["b".repeat(48)]),
    ]));
    let (relay, _messenger) = relay_with(provider, settings);

    let first = relay.run_turn(USER, CHAT, "one").await.unwrap();
    assert!(!first.context_trimmed);

    let second = relay.run_turn(USER, CHAT, "two").await.unwrap();
    assert!(second.context_trimmed);

    let session = relay.store().get(USER).unwrap();
    let guard = lock_session(&session);
    assert!(guard.total_tokens() <= 40);
    let history = roles_and_text(guard.history());
    assert_eq!(
        history.last(),
        Some(&(Role::Assistant, "b".repeat(48)))
    );
    assert!(!history.contains(&(Role::User, "one".to_string())));
}

#[tokio::test]
async fn pre_call_trim_shrinks_the_request() {
    let settings = TurnSettings {
        token_budget: 40,
        trim_strategy: TrimStrategy::PreCall,
        ..TurnSettings::default()
    };
    let provider = Arc::new(ScriptedProvider::with_scripts([
        Script::answer(["a".repeat(48)]),
        Script::answer(["ok"]),
    ]));
    let (relay, _messenger) = relay_with(Arc::clone(&provider), settings);

    relay.run_turn(USER, CHAT, "one").await.unwrap();
    let report = relay.run_turn(USER, CHAT, "x".repeat(80).as_str()).await.unwrap();

    assert!(report.context_trimmed);
    let second = &provider.requests()[1];
    assert!(!second.messages.contains(&(Role::User, "one".to_string())));
    assert_eq!(
        second.messages.last(),
        Some(&(Role::User, "x".repeat(80)))
    );
}

#[tokio::test]
async fn pre_call_oversized_prompt_skips_the_provider() {
    // A 400-character prompt costs 104 heuristic tokens.
    let settings = TurnSettings {
        token_budget: 10,
        trim_strategy: TrimStrategy::PreCall,
        ..TurnSettings::default()
    };
    let provider = Arc::new(ScriptedProvider::with_scripts([Script::answer(["ok"])]));
    let (relay, messenger) = relay_with(Arc::clone(&provider), settings);

    let report = relay
        .run_turn(USER, CHAT, "x".repeat(400).as_str())
        .await
        .unwrap();

    assert!(report.context_trimmed);
    assert!(report.prompt_dropped);
    assert!(report.answer.is_empty());
    assert!(report.stream_error.is_none());
    assert_eq!(provider.call_count(), 0);
    assert!(messenger.deliveries().is_empty());
    let session = relay.store().get(USER).unwrap();
    assert!(lock_session(&session).history().is_empty());

    // A prompt that fits goes out alone.
    let next = relay.run_turn(USER, CHAT, "hi").await.unwrap();
    assert!(!next.prompt_dropped);
    assert_eq!(
        provider.requests()[0].messages,
        vec![(Role::User, "hi".to_string())]
    );
}

/// Fails for user messages and falls back to the heuristic otherwise.
struct UserBlindEstimator;

impl TokenEstimator for UserBlindEstimator {
    fn estimate(
        &self,
        role: Role,
        content: &str,
        model: &ModelName,
    ) -> Result<u32, TokenEstimationError> {
        match role {
            Role::User => Err(TokenEstimationError::EncoderUnavailable("cl100k_base")),
            Role::Assistant => HeuristicEstimator.estimate(role, content, model),
        }
    }
}

#[tokio::test]
async fn unestimable_prompt_is_trimmed_and_turn_completes() {
    let provider = Arc::new(ScriptedProvider::with_scripts([Script::answer([
        "still answered",
    ])]));
    let (relay, messenger) = relay_with_estimator(
        Arc::clone(&provider),
        Arc::new(UserBlindEstimator),
        TurnSettings::default(),
    );

    let report = relay.run_turn(USER, CHAT, "hello").await.unwrap();

    assert_eq!(report.answer, "still answered");
    assert!(report.context_trimmed);
    assert!(report.stream_error.is_none());
    let id = report.publish.message_id.unwrap();
    assert_eq!(messenger.visible_text(id).as_deref(), Some("still answered"));

    let session = relay.store().get(USER).unwrap();
    let guard = lock_session(&session);
    assert_eq!(
        roles_and_text(guard.history()),
        vec![(Role::Assistant, "still answered".to_string())]
    );
    assert!(guard.total_tokens() <= u64::from(relay_context::DEFAULT_TOKEN_BUDGET));
}

#[tokio::test(start_paused = true)]
async fn idle_session_starts_empty() {
    let settings = TurnSettings {
        idle_timeout: Duration::from_secs(60),
        ..TurnSettings::default()
    };
    let provider = Arc::new(ScriptedProvider::with_scripts([
        Script::answer(["first"]),
        Script::answer(["second"]),
    ]));
    let (relay, _messenger) = relay_with(Arc::clone(&provider), settings);

    relay.run_turn(USER, CHAT, "hello").await.unwrap();
    tokio::time::advance(Duration::from_secs(61)).await;
    relay.run_turn(USER, CHAT, "again").await.unwrap();

    assert_eq!(
        provider.requests()[1].messages,
        vec![(Role::User, "again".to_string())]
    );
}

#[tokio::test]
async fn users_have_separate_histories() {
    let provider = Arc::new(ScriptedProvider::with_scripts([
        Script::answer(["for one"]),
        Script::answer(["for two"]),
    ]));
    let (relay, _messenger) = relay_with(Arc::clone(&provider), TurnSettings::default());

    relay.run_turn(UserId::new(1), ChatId::new(1), "a").await.unwrap();
    relay.run_turn(UserId::new(2), ChatId::new(2), "b").await.unwrap();

    assert_eq!(
        provider.requests()[1].messages,
        vec![(Role::User, "b".to_string())]
    );
    assert_eq!(relay.store().len(), 2);
}
