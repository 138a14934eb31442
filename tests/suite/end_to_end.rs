//! Bot front-end wired to the real OpenAI client against a mock server.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use relay_context::lock_session;
use relay_engine::{Bot, CONTEXT_TRIMMED_TEXT, Command, Handled, Inbound, TurnSettings};
use relay_providers::openai::OpenAiClient;
use relay_providers::retry::RetryConfig;
use relay_providers::scripted::{Script, ScriptedProvider};
use relay_types::{ApiKey, ChatId, UserId};

use crate::common::{Outgoing, mount_chat_stream, relay_with};

fn openai(server: &MockServer) -> Arc<OpenAiClient> {
    Arc::new(
        OpenAiClient::with_base_url(ApiKey::new("sk-test"), &format!("{}/v1", server.uri()))
            .unwrap()
            .with_retry_config(RetryConfig {
                max_retries: 0,
                ..RetryConfig::default()
            }),
    )
}

fn prompt(user: i64, text: &str) -> Inbound {
    Inbound {
        user_id: UserId::new(user),
        chat_id: ChatId::new(user),
        text: text.to_string(),
        command: None,
    }
}

#[tokio::test]
async fn prompt_round_trip_through_openai() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer sk-test"))
        .and(body_partial_json(json!({
            "model": "gpt-3.5-turbo",
            "stream": true,
            "messages": [{"role": "user", "content": "hello"}]
        })))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(concat!(
                    "data: {\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\"}}]}\n\n",
                    "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Hi\"}}]}\n\n",
                    "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\" there\"}}]}\n\n",
                    "data: [DONE]\n\n",
                )),
        )
        .expect(1)
        .mount(&server)
        .await;

    let (relay, messenger) = relay_with(openai(&server), TurnSettings::default());
    let bot = Bot::new(relay, vec![]);

    let handled = bot.handle(prompt(9, "hello")).await;

    let report = match handled {
        Handled::Turn(Ok(report)) => report,
        other => panic!("expected a finished turn, got {other:?}"),
    };
    assert_eq!(report.answer, "Hi there");
    let id = report.publish.message_id.unwrap();
    assert_eq!(messenger.visible_text(id).as_deref(), Some("Hi there"));
    assert_eq!(messenger.calls()[0], Outgoing::Typing);
}

#[tokio::test]
async fn rejected_key_rolls_back_and_explains() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "error": {"message": "Incorrect API key provided", "type": "invalid_request_error"}
        })))
        .mount(&server)
        .await;

    let (relay, messenger) = relay_with(openai(&server), TurnSettings::default());
    let bot = Bot::new(relay, vec![]);

    let handled = bot.handle(prompt(9, "hello")).await;

    assert!(matches!(handled, Handled::Turn(Err(_))));
    let session = bot.relay().store().get(UserId::new(9)).unwrap();
    assert!(lock_session(&session).history().is_empty());
    let Some(Outgoing::Send { text, .. }) = messenger.calls().last().cloned() else {
        panic!("expected an error reply");
    };
    assert!(text.contains("authentication failed"));
    assert!(text.contains("OPENAI_API_KEY"));
}

#[tokio::test]
async fn trim_notice_follows_the_answer() {
    let server = MockServer::start().await;
    mount_chat_stream(&server, &["a long answer that costs many tokens"]).await;

    let settings = TurnSettings {
        token_budget: 20,
        ..TurnSettings::default()
    };
    let (relay, messenger) = relay_with(openai(&server), settings);
    let bot = Bot::new(relay, vec![]);

    bot.handle(prompt(3, "first question")).await;
    bot.handle(prompt(3, "second question")).await;

    assert!(matches!(
        messenger.calls().last(),
        Some(Outgoing::Silent { text, .. }) if text == CONTEXT_TRIMMED_TEXT
    ));
}

#[tokio::test]
async fn new_command_forgets_history() {
    let provider = Arc::new(ScriptedProvider::with_scripts([
        Script::answer(["one"]),
        Script::answer(["two"]),
    ]));
    let (relay, _messenger) = relay_with(Arc::clone(&provider), TurnSettings::default());
    let bot = Bot::new(relay, vec![UserId::new(4)]);

    bot.handle(prompt(4, "remember me")).await;
    bot.handle(Inbound {
        command: Some(Command::New),
        ..prompt(4, "/new")
    })
    .await;
    bot.handle(prompt(4, "who am I?")).await;

    assert_eq!(provider.requests()[1].messages.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn same_user_prompts_are_serialized() {
    let provider = Arc::new(ScriptedProvider::with_scripts([
        Script::paced(Duration::from_millis(200), ["first"]),
        Script::paced(Duration::from_millis(200), ["second"]),
    ]));
    let (relay, _messenger) = relay_with(Arc::clone(&provider), TurnSettings::default());
    let bot = Arc::new(Bot::new(relay, vec![]));

    let a = bot.dispatch(prompt(5, "q1"));
    let b = bot.dispatch(prompt(5, "q2"));
    a.await.unwrap();
    b.await.unwrap();

    // The second turn saw the first one's full exchange.
    let second = &provider.requests()[1];
    assert_eq!(second.messages.len(), 3);
}
