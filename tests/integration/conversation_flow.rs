//! One full exchange: wake word, transcript, streamed answer, playback.

use crate::helpers::{Script, chunk_ordinals, completion_reason, start};
use parley::ConversationState;
use parley::dialog::Speaker;
use parley::engine::scripted::{
    ScriptedGenerator, ScriptedSynthesizer, ScriptedTranscriber, ScriptedWakeWord,
};
use parley::RuntimeEvent;
use parley::pipeline::EndpointReason;

fn weather_script() -> Script {
    let mut script = Script::ask(
        "",
        ScriptedGenerator::new(["It's", " sunny", " today", "</s>"]),
    );
    script.transcriber = ScriptedTranscriber::new()
        .partial("What's")
        .partial(" the")
        .endpoint(" weather");
    script
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn weather_question_is_answered_and_played() {
    let mut session = start(weather_script());
    assert_eq!(session.coordinator.state(), ConversationState::Listening);

    session.route(1);
    assert_eq!(session.coordinator.state(), ConversationState::Transcribing);
    session.route(3);
    session.settle().await;

    assert_eq!(session.coordinator.state(), ConversationState::Listening);
    assert_eq!(session.tokens(), ["It's", " sunny", " today"]);
    assert_eq!(completion_reason(&session.completions()), EndpointReason::NaturalStop);
    assert_eq!(session.completions()[0].0, "It's sunny today");
    assert!(session
        .events()
        .contains(&RuntimeEvent::FinalTranscript("What's the weather".into())));

    assert_eq!(session.synthesizer.fragments(), ["It's", " sunny", " today"]);
    assert_eq!(chunk_ordinals(&session.output.writes()), [1, 2, 3]);
    assert_eq!(session.output.samples().len(), 160);
    assert_eq!(session.output.devices_released(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn states_follow_the_exchange() {
    let mut session = start(weather_script());
    session.route(4);
    session.settle().await;

    assert_eq!(
        session.states(),
        [
            ConversationState::LoadingModel,
            ConversationState::Listening,
            ConversationState::Transcribing,
            ConversationState::Generating,
            ConversationState::Listening,
        ]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dialog_records_both_sides_of_each_exchange() {
    let mut script = Script::ask("Hi there", ScriptedGenerator::new(["Hello!"]));
    script.wake_word = ScriptedWakeWord::new([0, 1]);
    script.transcriber = ScriptedTranscriber::new()
        .endpoint("Hi there")
        .endpoint("And again");
    let mut session = start(script);

    session.route(2);
    session.settle().await;
    assert_eq!(session.coordinator.state(), ConversationState::Listening);
    session.route(2);
    session.settle().await;

    let dialog = session.coordinator.dialog().unwrap();
    let turns: Vec<(Speaker, &str)> = dialog
        .turns()
        .iter()
        .map(|t| (t.speaker, t.text.as_str()))
        .collect();
    assert_eq!(
        turns,
        [
            (Speaker::Human, "Hi there"),
            (Speaker::Model, "Hello!"),
            (Speaker::Human, "And again"),
            (Speaker::Model, "Hello!"),
        ]
    );

    // The second prompt carries the first exchange.
    let prompts = session.prompts.lock().unwrap();
    assert_eq!(prompts.len(), 2);
    assert_eq!(prompts[1].len(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn silence_before_the_endpoint_keeps_transcribing() {
    let mut script = Script::ask("", ScriptedGenerator::new(["Yes."]));
    script.transcriber = ScriptedTranscriber::new()
        .partial("Is it")
        .silence(3)
        .endpoint(" raining");
    let mut session = start(script);

    session.route(5);
    assert_eq!(session.coordinator.state(), ConversationState::Transcribing);
    assert_eq!(session.router.live_utterance(), Some("Is it"));
    session.route(1);
    session.settle().await;

    assert!(session
        .events()
        .contains(&RuntimeEvent::FinalTranscript("Is it raining".into())));
    assert_eq!(session.coordinator.state(), ConversationState::Listening);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn empty_utterance_launches_nothing() {
    let mut script = Script::ask("   ", ScriptedGenerator::new(["unused"]));
    script.transcriber = ScriptedTranscriber::new().endpoint("   ").partial("Hello");
    let mut session = start(script);

    session.route(2);
    session.settle().await;
    assert_eq!(session.coordinator.state(), ConversationState::Transcribing);
    assert!(session.coordinator.dialog().unwrap().is_empty());
    assert_eq!(session.output.devices_opened(), 0);

    session.route(1);
    assert_eq!(session.router.live_utterance(), Some("Hello"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn profile_report_follows_a_successful_run() {
    let mut script = weather_script();
    script.profile = true;
    script.synthesizer = ScriptedSynthesizer::new(16_000, 160);
    let mut session = start(script);

    session.route(4);
    session.settle().await;

    let report = session
        .events()
        .iter()
        .find_map(|e| match e {
            RuntimeEvent::Profile(report) => Some(*report),
            _ => None,
        })
        .expect("profile event");
    assert!(report.tokens_per_sec >= 0.0);
    assert!(report.real_time_factor >= 0.0);
    assert!(report.first_audio_delay_secs >= 0.0);
}
