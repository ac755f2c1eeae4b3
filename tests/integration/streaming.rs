//! Token and audio streaming: ordering, warmup and empty answers.

use crate::helpers::{Script, chunk_ordinals, completion_reason, start};
use parley::ConversationState;
use parley::engine::scripted::{ScriptedGenerator, ScriptedSynthesizer};
use parley::pipeline::EndpointReason;
use std::time::Duration;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn short_answer_below_warmup_plays_as_one_chunk() {
    let mut script = Script::ask("Hi", ScriptedGenerator::new(["abc", "def"]));
    script.synthesizer = ScriptedSynthesizer::new(1_000, 100);
    script.warmup_secs = 1.0;
    let mut session = start(script);

    session.route(2);
    session.settle().await;

    let writes = session.output.writes();
    assert_eq!(writes.len(), 1, "0.6s of audio arrives as a single chunk");
    assert_eq!(writes[0].len(), 600);
    assert_eq!(&writes[0][..300], &[1; 300][..]);
    assert_eq!(&writes[0][300..], &[2; 300][..]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn warmup_releases_once_the_floor_is_reached() {
    let fragments = ["aaaa", "bbbb", "cccc", "dd"];
    let mut script = Script::ask("Go", ScriptedGenerator::new(fragments));
    script.synthesizer = ScriptedSynthesizer::new(1_000, 100);
    script.warmup_secs = 0.5;
    let mut session = start(script);

    session.route(2);
    session.settle().await;

    let lengths: Vec<usize> = session.output.writes().iter().map(Vec::len).collect();
    assert_eq!(lengths, [800, 400, 200]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn chunks_play_in_generation_order() {
    let fragments: Vec<String> = (0..20).map(|i| format!("word{i} ")).collect();
    let generator =
        ScriptedGenerator::new(fragments.clone()).with_fragment_delay(Duration::from_millis(1));
    let mut script = Script::ask("Count to twenty", generator);
    script.synthesizer = ScriptedSynthesizer::new(16_000, 4);
    let mut session = start(script);

    session.route(2);
    session.settle().await;

    assert_eq!(session.tokens(), fragments);
    assert_eq!(session.synthesizer.fragments(), fragments);
    let expected: Vec<i16> = (1..=20).collect();
    assert_eq!(chunk_ordinals(&session.output.writes()), expected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn zero_token_answer_completes_without_hanging() {
    let mut script = Script::ask("Hello?", ScriptedGenerator::new(["</s>"]));
    script.synthesizer = ScriptedSynthesizer::new(1_000, 10).with_flush_samples(50);
    script.warmup_secs = 1.0;
    let mut session = start(script);

    session.route(2);
    session.settle().await;

    assert!(session.tokens().is_empty());
    assert_eq!(completion_reason(&session.completions()), EndpointReason::NaturalStop);
    assert_eq!(session.coordinator.state(), ConversationState::Listening);
    // Only the flushed tail is played.
    assert_eq!(session.output.writes(), [vec![1; 50]]);
    assert_eq!(session.synthesizer.streams_closed(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn silent_answer_opens_and_releases_the_device() {
    let mut session = start(Script::ask("Hello?", ScriptedGenerator::new(Vec::<String>::new())));

    session.route(2);
    session.settle().await;

    assert!(session.output.writes().is_empty());
    assert_eq!(session.output.devices_opened(), 1);
    assert_eq!(session.output.devices_released(), 1);
    assert_eq!(session.coordinator.state(), ConversationState::Listening);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn token_limit_is_reported() {
    let generator =
        ScriptedGenerator::new(["Long", " answer"]).ending_with(EndpointReason::TokenLimit);
    let mut session = start(Script::ask("Ramble", generator));

    session.route(2);
    session.settle().await;

    assert_eq!(completion_reason(&session.completions()), EndpointReason::TokenLimit);
    assert_eq!(session.coordinator.state(), ConversationState::Listening);
}
