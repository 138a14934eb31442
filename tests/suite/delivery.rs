//! Throttled delivery of streamed answers.

use std::sync::Arc;
use std::time::Duration;

use relay_engine::TurnSettings;
use relay_providers::scripted::{Script, ScriptedProvider};
use relay_types::{ChatId, UserId};

use crate::common::{Outgoing, relay_with};

fn settings(edit_interval: Duration) -> TurnSettings {
    TurnSettings {
        edit_interval,
        ..TurnSettings::default()
    }
}

#[tokio::test(start_paused = true)]
async fn deliveries_respect_edit_interval() {
    let interval = Duration::from_secs(1);
    let deltas: Vec<String> = (0..40).map(|i| format!("w{i} ")).collect();
    let provider = Arc::new(ScriptedProvider::with_scripts([Script::paced(
        Duration::from_millis(100),
        deltas.clone(),
    )]));
    let (relay, messenger) = relay_with(provider, settings(interval));

    let started = tokio::time::Instant::now();
    let report = relay
        .run_turn(UserId::new(1), ChatId::new(1), "count")
        .await
        .unwrap();
    let elapsed = started.elapsed();

    let deliveries = messenger.deliveries();
    let bound = elapsed.as_millis().div_ceil(interval.as_millis()) + 1;
    assert!(
        deliveries.len() as u128 <= bound,
        "{} deliveries in {elapsed:?}",
        deliveries.len()
    );
    assert!(deliveries.len() >= 2);
    assert_eq!(report.answer, deltas.concat());
}

#[tokio::test(start_paused = true)]
async fn last_delivery_is_the_whole_answer() {
    let provider = Arc::new(ScriptedProvider::with_scripts([Script::paced(
        Duration::from_millis(30),
        ["The", " quick", " brown", " fox"],
    )]));
    let (relay, messenger) = relay_with(provider, settings(Duration::from_millis(50)));

    let report = relay
        .run_turn(UserId::new(1), ChatId::new(1), "go")
        .await
        .unwrap();

    let texts: Vec<String> = messenger
        .deliveries()
        .into_iter()
        .map(|d| match d {
            Outgoing::Send { text, .. } | Outgoing::Edit { text, .. } => text,
            other => panic!("unexpected delivery {other:?}"),
        })
        .collect();
    assert_eq!(texts.last().map(String::as_str), Some("The quick brown fox"));
    assert_eq!(report.publish.published_text.as_deref(), Some("The quick brown fox"));
    // Snapshots are cumulative, so each one extends the previous.
    for pair in texts.windows(2) {
        assert!(pair[1].starts_with(&pair[0]));
    }
}

#[tokio::test(start_paused = true)]
async fn first_delivery_is_a_send_then_edits() {
    let provider = Arc::new(ScriptedProvider::with_scripts([Script::paced(
        Duration::from_millis(600),
        ["a", "b", "c"],
    )]));
    let (relay, messenger) = relay_with(provider, settings(Duration::from_millis(500)));

    relay
        .run_turn(UserId::new(1), ChatId::new(1), "go")
        .await
        .unwrap();

    let timed = messenger.timed_calls();
    assert!(matches!(timed[0].1, Outgoing::Send { ref text, .. } if text == "a"));
    assert!(
        timed[1..]
            .iter()
            .all(|(_, call)| matches!(call, Outgoing::Edit { .. }))
    );
    // Deltas are slower than the interval, so every snapshot is shown.
    assert_eq!(timed.len(), 3);
}
