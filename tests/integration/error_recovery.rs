//! Stage failures, load failures and shutdown.

use crate::helpers::{FRAME, Script, start};
use parley::dialog::Speaker;
use parley::engine::scripted::{
    MemoryOutput, ScriptedGenerator, ScriptedSynthesizer, ScriptedTranscriber, ScriptedWakeWord,
};
use parley::{
    AssistantConfig, AssistantError, ConversationState, PipelineCoordinator, RuntimeEvent, Stage,
};
use std::time::Duration;
use tokio::sync::broadcast;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn synthesis_failure_resets_to_listening() {
    let generator = ScriptedGenerator::new(["fine", " boom", " more", " words"]);
    let mut script = Script::ask("Say something", generator);
    script.synthesizer = ScriptedSynthesizer::new(1_000, 10).failing_on("boom");
    script.warmup_secs = 1.0;
    let mut session = start(script);

    session.route(2);
    session.settle().await;

    assert_eq!(session.error_stages(), [Stage::Synthesis]);
    assert_eq!(session.coordinator.state(), ConversationState::Listening);
    // Held warmup audio is dropped, never played.
    assert!(session.output.writes().is_empty());
    assert_eq!(session.synthesizer.streams_closed(), 1);
    assert_eq!(session.output.devices_released(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn generation_failure_resets_and_the_next_wake_word_works() {
    let generator =
        ScriptedGenerator::new(["Half", " an answer"]).failing_after(1, "model crashed");
    let mut script = Script::ask("Question", generator);
    script.wake_word = ScriptedWakeWord::new([0, 1]);
    let mut session = start(script);

    session.route(2);
    session.settle().await;

    assert_eq!(session.error_stages(), [Stage::Generation]);
    assert!(session.completions().is_empty());
    assert_eq!(session.coordinator.state(), ConversationState::Listening);
    assert_eq!(session.output.devices_released(), 1);
    assert_eq!(session.synthesizer.streams_closed(), 1);

    // What was already spoken answers the question.
    let dialog = session.coordinator.dialog().unwrap();
    let turns: Vec<(Speaker, &str)> = dialog
        .turns()
        .iter()
        .map(|t| (t.speaker, t.text.as_str()))
        .collect();
    assert_eq!(turns, [(Speaker::Human, "Question"), (Speaker::Model, "Half")]);

    session.route(1);
    assert_eq!(session.coordinator.state(), ConversationState::Transcribing);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn device_failure_is_reported_as_playback() {
    let mut script = Script::ask("Play", ScriptedGenerator::new(["Sound"]));
    script.output = MemoryOutput::new().failing_writes();
    let mut session = start(script);

    session.route(2);
    session.settle().await;

    assert_eq!(session.error_stages(), [Stage::Playback]);
    assert_eq!(session.coordinator.state(), ConversationState::Listening);
    assert_eq!(session.output.devices_released(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn late_failure_of_a_finished_answer_keeps_the_next_utterance() {
    let mut script = Script::ask("Question", ScriptedGenerator::new(["Sure."]));
    script.wake_word = ScriptedWakeWord::new([0, 1]);
    script.transcriber = ScriptedTranscriber::new().endpoint("Question").partial("Second");
    script.synthesizer = ScriptedSynthesizer::new(1_000, 10)
        .with_synthesis_delay(Duration::from_millis(300))
        .failing_on("Sure");
    let mut session = start(script);

    session.route(2);
    assert!(
        session
            .wait_until(|s| {
                s.completions().len() == 1
                    && s.coordinator.state() == ConversationState::Listening
            })
            .await
    );

    // Wake again while the finished answer is still being synthesized.
    session.route(2);
    assert_eq!(session.coordinator.state(), ConversationState::Transcribing);
    session.settle().await;

    assert_eq!(session.error_stages(), [Stage::Synthesis]);
    assert_eq!(session.coordinator.state(), ConversationState::Transcribing);
    assert_eq!(session.router.live_utterance(), Some("Second"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn transcriber_failure_drops_the_utterance() {
    let mut script = Script::ask("unused", ScriptedGenerator::new(["unused"]));
    script.transcriber = ScriptedTranscriber::new()
        .partial("Half a")
        .failure("decoder lost sync");
    let mut session = start(script);

    session.route(3);

    assert_eq!(session.error_stages(), [Stage::Transcription]);
    assert_eq!(session.coordinator.state(), ConversationState::Listening);
    assert_eq!(session.router.live_utterance(), None);
    assert_eq!(session.output.devices_opened(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_mid_answer_releases_everything() {
    let generator =
        ScriptedGenerator::new(["Still", " talking"]).hold_after(1, Duration::from_secs(10));
    let mut session = start(Script::ask("Talk", generator));

    session.route(2);
    assert!(session.wait_until(|s| !s.tokens().is_empty()).await);

    tokio::time::timeout(Duration::from_secs(5), session.coordinator.shutdown())
        .await
        .expect("shutdown hung");

    assert_eq!(session.coordinator.state(), ConversationState::Idle);
    assert!(session.coordinator.dialog().is_none());
    assert_eq!(session.output.devices_opened(), session.output.devices_released());
    assert_eq!(session.synthesizer.streams_opened(), session.synthesizer.streams_closed());

    session.router.route(&FRAME);
    assert!(!session.router.is_active());

    // A second shutdown has nothing left to do.
    session.coordinator.shutdown().await;
    assert_eq!(session.coordinator.state(), ConversationState::Idle);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_load_returns_to_idle_and_can_be_retried() {
    let (tx, mut rx) = broadcast::channel(64);
    let mut coordinator =
        PipelineCoordinator::new(AssistantConfig::default()).with_runtime_events(tx);

    let err = coordinator
        .load(|_| Err(AssistantError::init(Stage::Transcription, "model file missing")))
        .err()
        .expect("load should fail");
    assert!(matches!(err, AssistantError::Init { stage: Stage::Transcription, .. }));
    assert_eq!(coordinator.state(), ConversationState::Idle);

    let reported = std::iter::from_fn(|| rx.try_recv().ok()).any(|e| {
        matches!(e, RuntimeEvent::Error { stage: Stage::Transcription, .. })
    });
    assert!(reported);

    let engines = Script::ask("unused", ScriptedGenerator::new(["unused"]));
    let router = coordinator.load(move |_| {
        Ok(parley::engine::InitializedEngines {
            wake_word: Box::new(engines.wake_word),
            transcriber: Box::new(engines.transcriber),
            generator: Box::new(engines.generator),
            synthesizer: std::sync::Arc::new(engines.synthesizer),
            output: std::sync::Arc::new(engines.output),
        })
    });
    assert!(router.is_ok());
    assert_eq!(coordinator.state(), ConversationState::Listening);
}

