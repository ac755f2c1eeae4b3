//! Interrupting the assistant mid-answer.

use crate::helpers::{Script, completion_reason, start};
use parley::ConversationState;
use parley::dialog::Speaker;
use parley::engine::scripted::{
    MemoryOutput, ScriptedGenerator, ScriptedTranscriber, ScriptedWakeWord,
};
use parley::pipeline::EndpointReason;
use std::time::Duration;

/// Wake, ask, then hold the answer open after its first fragment.
fn story_script() -> Script {
    let generator = ScriptedGenerator::new(["Once", " upon", " a time"])
        .hold_after(1, Duration::from_secs(10));
    let mut script = Script::ask("Tell me a story", generator);
    script.wake_word = ScriptedWakeWord::new([0, 1]);
    script.transcriber = ScriptedTranscriber::new()
        .endpoint("Tell me a story")
        .partial("Actually")
        .partial(" never mind");
    script
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn wake_word_during_generation_interrupts_and_listens_again() {
    let mut session = start(story_script());
    session.route(2);
    assert_eq!(session.coordinator.state(), ConversationState::Generating);
    assert!(session.wait_until(|s| s.tokens() == ["Once"]).await);

    // Second detector hit while generating.
    session.route(1);
    assert!(session.wait_for_state(ConversationState::Transcribing).await);
    session.settle().await;

    assert_eq!(completion_reason(&session.completions()), EndpointReason::Interrupted);
    assert_eq!(session.tokens(), ["Once"]);
    assert!(!session.synthesizer.fragments().contains(&" upon".to_owned()));

    // The next frames build a fresh utterance.
    session.route(2);
    assert_eq!(session.router.live_utterance(), Some("Actually never mind"));
    assert_eq!(session.output.devices_released(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn interrupted_answer_is_kept_in_the_dialog() {
    let mut session = start(story_script());
    session.route(2);
    assert!(session.wait_until(|s| !s.tokens().is_empty()).await);
    assert!(session.coordinator.interrupt());
    session.settle().await;

    let dialog = session.coordinator.dialog().unwrap();
    let turns: Vec<(Speaker, &str)> = dialog
        .turns()
        .iter()
        .map(|t| (t.speaker, t.text.as_str()))
        .collect();
    assert_eq!(
        turns,
        [(Speaker::Human, "Tell me a story"), (Speaker::Model, "Once")]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn interrupt_without_a_run_is_a_no_op() {
    let session = start(Script::ask("unused", ScriptedGenerator::new(["unused"])));
    assert!(!session.coordinator.interrupt());
    assert!(!session.coordinator.interrupt());
    assert_eq!(session.coordinator.state(), ConversationState::Listening);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn repeated_interrupts_complete_the_run_once() {
    let mut session = start(story_script());
    session.route(2);
    assert!(session.wait_until(|s| !s.tokens().is_empty()).await);

    session.coordinator.interrupt();
    session.coordinator.interrupt();
    session.coordinator.interrupt();
    session.settle().await;

    assert_eq!(completion_reason(&session.completions()), EndpointReason::Interrupted);
    assert_eq!(session.coordinator.state(), ConversationState::Transcribing);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn no_writes_reach_the_device_after_a_stop() {
    let fragments: Vec<String> = (0..40).map(|i| format!("w{i} ")).collect();
    let mut script = Script::ask("Count", ScriptedGenerator::new(fragments));
    script.output = MemoryOutput::new().with_write_delay(Duration::from_millis(10));
    let mut session = start(script);

    session.route(2);
    assert!(session.wait_until(|s| s.output.writes().len() >= 2).await);
    session.coordinator.interrupt();
    let at_stop = session.output.writes().len();
    session.settle().await;

    // A write already past the started check may still land.
    let written = session.output.writes().len();
    assert!(written <= at_stop + 1, "{written} writes after stopping at {at_stop}");
    assert!(written < 40);
    assert_eq!(session.output.devices_released(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn barge_in_reaches_an_answer_queued_behind_the_previous_one() {
    let mut script = Script::ask("First", ScriptedGenerator::new(["abc"]));
    script.wake_word = ScriptedWakeWord::new([0, 1, 2]);
    script.transcriber = ScriptedTranscriber::new().endpoint("First").endpoint("Second");
    script.output = MemoryOutput::new().with_write_delay(Duration::from_millis(400));
    let mut session = start(script);

    session.route(2);
    assert!(
        session
            .wait_until(|s| {
                s.coordinator.state() == ConversationState::Listening
                    && !s.output.writes().is_empty()
            })
            .await
    );

    // The first answer is still inside its device write when the second
    // question ends, so the second run waits for the device.
    session.route(2);
    assert_eq!(session.coordinator.state(), ConversationState::Generating);
    assert_eq!(session.output.devices_released(), 0);
    session.route(1);
    session.settle().await;

    let reasons: Vec<EndpointReason> =
        session.completions().into_iter().map(|(_, reason)| reason).collect();
    assert_eq!(reasons, [EndpointReason::NaturalStop, EndpointReason::Interrupted]);
    assert_eq!(session.coordinator.state(), ConversationState::Transcribing);
    assert_eq!(session.output.writes().len(), 1);
}
