//! Turn-taking behaviour of the conversation orchestrator, end to end with fake engines.

mod common;

use avatar_voice::{AvatarError, ErrorKind, Message, MicrophoneToggle, Role, SessionStatus};
use common::{eventually, wait_until, HarnessBuilder, ScriptedCompletion, TestSynth};
use tokio_test::{assert_err, assert_ok};

const PROMPT: &str = "You are an AI assistant that helps people find information.";

#[tokio::test]
async fn weather_question_is_answered_and_spoken_once() {
    let completion = ScriptedCompletion::new();
    completion.reply("I don't have weather data.");
    let h = HarnessBuilder::new().completion(completion).active().await;

    h.hear("What is the weather?");
    eventually(|| h.synth.finished().len() == 1).await;

    assert_eq!(
        h.transcript().await,
        vec![
            Message::system(PROMPT),
            Message::user("What is the weather?"),
            Message::assistant("I don't have weather data."),
        ]
    );
    assert_eq!(h.synth.started(), vec!["I don't have weather data."]);
    assert_eq!(h.completion.request_count(), 1);
    h.handle.stop().await;
}

#[tokio::test]
async fn failed_completion_keeps_session_active() {
    let completion = ScriptedCompletion::new();
    completion.fail("connection reset");
    let mut h = HarnessBuilder::new().completion(completion).active().await;

    h.hear("Hello?");
    let (kind, message) = h.next_error().await;
    assert_eq!(kind, ErrorKind::Completion);
    assert!(message.contains("connection reset"));

    assert_eq!(h.transcript().await, vec![Message::system(PROMPT), Message::user("Hello?")]);
    assert_eq!(*h.handle.session_status().borrow(), SessionStatus::Active);
    assert!(h.synth.started().is_empty());

    // The next turn still works.
    h.hear("Are you there?");
    eventually(|| h.synth.finished().len() == 1).await;
    assert_eq!(h.synth.finished(), vec!["You said: Are you there?"]);
}

#[tokio::test]
async fn one_user_message_per_non_empty_final() {
    let h = HarnessBuilder::new().active().await;

    for text in ["first", "   ", "second", "", "third"] {
        h.hear(text);
    }
    eventually(|| h.completion.request_count() == 3).await;

    let users: Vec<String> = h
        .transcript()
        .await
        .into_iter()
        .filter(|m| m.role == Role::User)
        .map(|m| m.content)
        .collect();
    assert_eq!(users, vec!["first", "second", "third"]);
}

#[tokio::test]
async fn barge_in_cancels_before_next_reply_renders() {
    let synth = TestSynth::gated();
    let h = HarnessBuilder::new().synth(synth.clone()).active().await;
    let mut speaking = h.handle.speaking();

    h.hear("Tell me a long story");
    eventually(|| synth.started().len() == 1).await;
    wait_until(&mut speaking, |s| *s).await;

    h.hear("Actually, stop");
    eventually(|| synth.started().len() == 2).await;
    assert_eq!(synth.cancels(), 1);
    assert!(synth.finished().is_empty());

    synth.release(1);
    eventually(|| synth.finished().len() == 1).await;
    assert_eq!(synth.finished(), vec!["You said: Actually, stop"]);
    wait_until(&mut speaking, |s| !*s).await;
}

#[tokio::test]
async fn stop_during_render_cancels_and_ends() {
    let synth = TestSynth::gated();
    let h = HarnessBuilder::new().synth(synth.clone()).active().await;

    h.hear("Say something");
    eventually(|| synth.started().len() == 1).await;
    wait_until(&mut h.handle.speaking(), |s| *s).await;

    h.handle.stop().await;
    assert_eq!(*h.handle.session_status().borrow(), SessionStatus::Ended);
    assert_eq!(synth.cancels(), 1);
    assert!(!*h.handle.speaking().borrow());
    assert!(!*h.handle.microphone_active().borrow());
    assert!(!h.feed.is_listening());
}

#[tokio::test]
async fn late_completion_after_stop_is_discarded() {
    let completion = ScriptedCompletion::gated();
    let h = HarnessBuilder::new().completion(completion.clone()).active().await;

    h.hear("Slow question");
    eventually(|| completion.request_count() == 1).await;
    h.handle.stop().await;
    completion.release(1);

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let transcript = h.transcript().await;
    assert_eq!(transcript.last(), Some(&Message::user("Slow question")));
    assert!(h.synth.started().is_empty());
}

#[tokio::test]
async fn superseded_completion_is_dropped() {
    let completion = ScriptedCompletion::gated();
    let h = HarnessBuilder::new().completion(completion.clone()).active().await;

    h.hear("one");
    h.hear("two");
    eventually(|| completion.request_count() == 2).await;
    completion.release(2);
    eventually(|| h.synth.finished().len() == 1).await;
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    assert_eq!(
        h.transcript().await,
        vec![
            Message::system(PROMPT),
            Message::user("one"),
            Message::user("two"),
            Message::assistant("You said: two"),
        ]
    );
    assert_eq!(h.synth.started(), vec!["You said: two"]);
}

#[tokio::test]
async fn reset_leaves_only_seed_and_new_turn() {
    let h = HarnessBuilder::new().active().await;

    h.hear("old topic");
    eventually(|| h.synth.finished().len() == 1).await;
    assert_ok!(h.handle.reset_conversation().await);
    assert_eq!(h.transcript().await, vec![Message::system(PROMPT)]);

    h.hear("new topic");
    eventually(|| h.completion.request_count() == 2).await;
    assert_eq!(
        h.completion.requests()[1],
        vec![Message::system(PROMPT), Message::user("new topic")]
    );
}

#[tokio::test]
async fn single_shot_stops_listening_after_utterance() {
    let h = HarnessBuilder::new()
        .config(|c| c.options.continuous_conversation = false)
        .active()
        .await;
    let mut mic = h.handle.microphone_active();

    h.hear("Just one thing");
    wait_until(&mut mic, |on| !*on).await;
    eventually(|| h.synth.finished().len() == 1).await;
    assert!(!h.feed.is_listening());

    // Re-activation is explicit.
    assert_eq!(h.handle.toggle_microphone().await.unwrap(), MicrophoneToggle::Started);
    assert!(*mic.borrow());
}

#[tokio::test]
async fn continuous_mode_keeps_listening() {
    let h = HarnessBuilder::new().active().await;
    h.hear("Keep going");
    eventually(|| h.synth.finished().len() == 1).await;
    assert!(*h.handle.microphone_active().borrow());
    assert!(h.feed.is_listening());
}

#[tokio::test]
async fn turn_mode_change_applies_to_live_session() {
    let h = HarnessBuilder::new().active().await;
    h.config.modify(|c| c.options.continuous_conversation = false);
    let mut mic = h.handle.microphone_active();

    // Give the orchestrator a moment to observe the change.
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    h.hear("Switching modes");
    wait_until(&mut mic, |on| !*on).await;
}

#[tokio::test]
async fn typed_message_needs_active_session() {
    let h = HarnessBuilder::new().spawn();
    let err = h.handle.send_typed_message("hi").await.unwrap_err();
    assert!(matches!(err, AvatarError::SessionInactive));

    h.handle.start().await.unwrap();
    wait_until(&mut h.handle.session_status(), |s| *s == SessionStatus::Active).await;
    wait_until(&mut h.handle.microphone_active(), |on| *on).await;

    assert_ok!(h.handle.send_typed_message("  typed hello  ").await);
    assert_ok!(h.handle.send_typed_message("   ").await);
    eventually(|| h.synth.finished().len() == 1).await;

    let transcript = h.transcript().await;
    assert_eq!(transcript[1], Message::user("typed hello"));
    assert_eq!(transcript.iter().filter(|m| m.role == Role::User).count(), 1);
    assert!(*h.handle.microphone_active().borrow());
}

#[tokio::test]
async fn failed_render_is_reported_and_skipped() {
    let synth = TestSynth::instant();
    *synth.fail_on.lock().unwrap() = Some("You said: first".to_string());
    let mut h = HarnessBuilder::new().synth(synth.clone()).active().await;

    h.hear("first");
    let (kind, _) = h.next_error().await;
    assert_eq!(kind, ErrorKind::Synthesis);

    h.hear("second");
    eventually(|| synth.finished() == vec!["You said: second"]).await;
    assert_eq!(*h.handle.session_status().borrow(), SessionStatus::Active);
}

#[tokio::test]
async fn stop_speaking_silences_avatar() {
    let synth = TestSynth::gated();
    let h = HarnessBuilder::new().synth(synth.clone()).active().await;
    let mut speaking = h.handle.speaking();

    h.hear("Talk to me");
    wait_until(&mut speaking, |s| *s).await;
    assert_ok!(h.handle.stop_speaking().await);
    wait_until(&mut speaking, |s| !*s).await;
    assert_eq!(synth.cancels(), 1);
    assert_err!(h.handle.check_microphone().await);
}

#[tokio::test]
async fn empty_reply_is_reported_and_not_spoken() {
    let completion = ScriptedCompletion::new();
    completion.reply("   ");
    let mut h = HarnessBuilder::new().completion(completion).active().await;

    h.hear("Anything?");
    let (kind, message) = h.next_error().await;
    assert_eq!(kind, ErrorKind::Completion);
    assert!(message.contains("empty reply"));
    assert_eq!(h.transcript().await, vec![Message::system(PROMPT), Message::user("Anything?")]);
    assert!(h.synth.started().is_empty());
}

#[tokio::test]
async fn voice_and_grounding_changes_apply_to_live_session() {
    let h = HarnessBuilder::new().active().await;
    h.hear("before");
    eventually(|| h.synth.finished().len() == 1).await;

    h.config.modify(|c| {
        c.speech.tts_voice = "en-US-JennyNeural".into();
        c.options.enable_oyd = true;
        c.cognitive_search.endpoint = "https://search.example".into();
        c.cognitive_search.api_key = "search-key".into();
        c.cognitive_search.index_name = "products".into();
    });
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    h.hear("after");
    eventually(|| h.synth.finished().len() == 2).await;

    assert_eq!(h.completion.indexes(), vec![None, Some("products".to_string())]);
    let ssml = h.synth.ssml();
    assert!(ssml[0].contains("en-US-AvaMultilingualNeural"));
    assert!(ssml[1].contains("en-US-JennyNeural"));
}
