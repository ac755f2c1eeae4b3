//! Generation stage: dialog in, token chunks out.
//!
//! The engine call blocks, so it runs on the blocking pool and streams
//! fragments back over an mpsc channel. This task awaits each fragment,
//! filters it, and pushes it to the token handoff.

use crate::dialog::{DialogHistory, Speaker};
use crate::engine::{GenerateParams, Generator};
use crate::error::{AssistantError, Result};
use crate::llm::{contains_stop_phrase, strip_stop_phrases};
use crate::pipeline::handoff::Producer;
use crate::pipeline::messages::{Completion, EndpointReason, TokenChunk};
use crate::profiling::TpsProfiler;
use crate::runtime::{EventSink, RuntimeEvent};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// The generator and the dialog it is prompted with. Both belong to the
/// generation stage while a run is active.
pub struct GenerationSlot {
    pub generator: Box<dyn Generator>,
    pub dialog: DialogHistory,
}

/// Slot shared between runs; `None` once the engines were released.
pub type SharedGeneration = Arc<Mutex<Option<GenerationSlot>>>;

/// One utterance to answer.
#[derive(Debug, Clone)]
pub struct GenerationJob {
    pub run_id: u64,
    pub utterance: String,
    pub params: GenerateParams,
}

/// What the stage reports once the completion has been handed off.
#[derive(Debug, Clone)]
pub struct GenerationOutcome {
    pub completion: Completion,
    pub tokens_per_sec: f64,
}

/// Run the generation stage for one job.
///
/// `on_complete` sees the completion before the token handoff finishes, so
/// the state machine has moved on by the time synthesis observes the end
/// of the token stream.
///
/// # Errors
///
/// Returns the generator's error, or a pipeline error if the engines were
/// released or the worker panicked. The token handoff is finished on every
/// path.
pub async fn run_generation_stage(
    job: GenerationJob,
    slot: SharedGeneration,
    mut tokens: Producer<TokenChunk>,
    cancel: CancellationToken,
    events: EventSink,
    on_complete: impl FnOnce(&Completion),
) -> Result<GenerationOutcome> {
    let GenerationJob {
        run_id,
        utterance,
        params,
    } = job;
    let stop_phrases = params.stop_phrases.clone();

    let (fragment_tx, mut fragment_rx) = mpsc::unbounded_channel::<String>();
    let worker_slot = Arc::clone(&slot);
    let worker = tokio::task::spawn_blocking(move || {
        let mut guard = worker_slot.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = guard
            .as_mut()
            .ok_or_else(|| AssistantError::Pipeline("generator already released".into()))?;

        slot.dialog.push_human(utterance);
        let generated = slot.generator.generate(&slot.dialog, &params, &fragment_tx)?;
        slot.dialog
            .push_model(strip_stop_phrases(&generated.text, &params.stop_phrases));
        Ok::<_, AssistantError>(generated)
    });

    let mut tps = TpsProfiler::new();
    let mut spoken = String::new();
    while let Some(fragment) = fragment_rx.recv().await {
        tps.tock();
        if fragment.is_empty() {
            continue;
        }
        if contains_stop_phrase(&fragment, &stop_phrases) {
            debug!("suppressed stop phrase fragment {fragment:?}");
            continue;
        }
        if cancel.is_cancelled() {
            continue;
        }
        events.emit(RuntimeEvent::Token(fragment.clone()));
        spoken.push_str(&fragment);
        tokens.push(fragment);
    }

    let generated = match worker
        .await
        .map_err(|e| AssistantError::Pipeline(format!("generation worker failed: {e}")))?
    {
        Ok(generated) => generated,
        Err(e) => {
            close_failed_turn(&slot, &spoken);
            return Err(e);
        }
    };

    let reason = if cancel.is_cancelled() {
        EndpointReason::Interrupted
    } else {
        generated.endpoint
    };
    let completion = Completion {
        run_id,
        text: strip_stop_phrases(&generated.text, &stop_phrases),
        reason,
        tokens_pushed: tokens.pushed(),
    };
    let tokens_per_sec = tps.tps();
    info!(
        "run {run_id} generated {} chunks ({reason}, {tokens_per_sec:.1} tok/s)",
        completion.tokens_pushed
    );

    on_complete(&completion);
    tokens.finish();

    Ok(GenerationOutcome {
        completion,
        tokens_per_sec,
    })
}

/// Answer a human turn left open by a failed generator with whatever was
/// already streamed, so the next prompt still alternates speakers.
fn close_failed_turn(slot: &SharedGeneration, spoken: &str) {
    let mut guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
    let Some(slot) = guard.as_mut() else {
        return;
    };
    let open = slot
        .dialog
        .turns()
        .last()
        .is_some_and(|turn| turn.speaker == Speaker::Human);
    if open {
        slot.dialog.push_model(spoken);
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::dialog::Speaker;
    use crate::engine::scripted::ScriptedGenerator;
    use crate::pipeline::handoff::handoff;

    fn slot(generator: ScriptedGenerator) -> SharedGeneration {
        Arc::new(Mutex::new(Some(GenerationSlot {
            generator: Box::new(generator),
            dialog: DialogHistory::default(),
        })))
    }

    fn job(utterance: &str) -> GenerationJob {
        GenerationJob {
            run_id: 1,
            utterance: utterance.into(),
            params: GenerateParams {
                token_cap: 64,
                stop_phrases: vec!["</s>".into()],
            },
        }
    }

    fn drain(rx: &crate::pipeline::handoff::Consumer<TokenChunk>) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(t) = rx.try_pop() {
            out.push(t);
        }
        out
    }

    #[tokio::test]
    async fn stop_phrase_fragments_never_reach_the_queue() {
        let shared = slot(ScriptedGenerator::new(["It's", " sunny", " today", "</s>"]));
        let (tx, rx) = handoff();
        let flag = tx.active_flag();

        let mut seen_active = None;
        let outcome = run_generation_stage(
            job("What's the weather"),
            Arc::clone(&shared),
            tx,
            CancellationToken::new(),
            EventSink::disabled(),
            |_| seen_active = Some(flag.is_active()),
        )
        .await
        .unwrap();

        assert_eq!(seen_active, Some(true), "completion precedes the flag clearing");
        assert!(!rx.is_producer_active());
        assert_eq!(drain(&rx), ["It's", " sunny", " today"]);
        assert_eq!(outcome.completion.reason, EndpointReason::NaturalStop);
        assert_eq!(outcome.completion.text, "It's sunny today");
        assert_eq!(outcome.completion.tokens_pushed, 3);

        let guard = shared.lock().unwrap();
        let turns = guard.as_ref().unwrap().dialog.turns();
        assert_eq!(turns[0].speaker, Speaker::Human);
        assert_eq!(turns[0].text, "What's the weather");
        assert_eq!(turns[1].speaker, Speaker::Model);
        assert_eq!(turns[1].text, "It's sunny today");
    }

    #[tokio::test]
    async fn cancelled_run_reports_interrupted_and_stops_pushing() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let (tx, rx) = handoff();
        let outcome = run_generation_stage(
            job("hi"),
            slot(ScriptedGenerator::new(["a", "b"])),
            tx,
            cancel,
            EventSink::disabled(),
            |_| {},
        )
        .await
        .unwrap();

        assert_eq!(outcome.completion.reason, EndpointReason::Interrupted);
        assert_eq!(outcome.completion.tokens_pushed, 0);
        assert!(rx.is_drained());
    }

    #[tokio::test]
    async fn interrupted_model_turn_is_still_recorded() {
        let generator = ScriptedGenerator::new(["Well", " then"])
            .hold_after(1, std::time::Duration::from_secs(5));
        let flag = generator.interrupt_flag();
        let shared = slot(generator);
        let (tx, _rx) = handoff();

        let raiser = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(30)).await;
            flag.raise();
        });
        let outcome = run_generation_stage(
            job("tell me"),
            Arc::clone(&shared),
            tx,
            CancellationToken::new(),
            EventSink::disabled(),
            |_| {},
        )
        .await
        .unwrap();
        raiser.await.unwrap();

        assert_eq!(outcome.completion.reason, EndpointReason::Interrupted);
        let guard = shared.lock().unwrap();
        assert_eq!(guard.as_ref().unwrap().dialog.turns()[1].text, "Well");
    }

    #[tokio::test]
    async fn generator_error_clears_the_flag() {
        let shared = slot(ScriptedGenerator::new(["a", "b"]).failing_after(1, "boom"));
        let (tx, rx) = handoff();
        let mut called = false;
        let result = run_generation_stage(
            job("hi"),
            Arc::clone(&shared),
            tx,
            CancellationToken::new(),
            EventSink::disabled(),
            |_| called = true,
        )
        .await;

        assert!(result.is_err());
        assert!(!called);
        assert_eq!(drain(&rx), ["a"]);
        assert!(rx.is_drained());

        // The spoken part answers the question.
        let guard = shared.lock().unwrap();
        let turns: Vec<(Speaker, &str)> = guard
            .as_ref()
            .unwrap()
            .dialog
            .turns()
            .iter()
            .map(|t| (t.speaker, t.text.as_str()))
            .collect();
        assert_eq!(turns, [(Speaker::Human, "hi"), (Speaker::Model, "a")]);
    }

    #[tokio::test]
    async fn released_slot_is_an_error() {
        let (tx, rx) = handoff();
        let result = run_generation_stage(
            job("hi"),
            Arc::new(Mutex::new(None)),
            tx,
            CancellationToken::new(),
            EventSink::disabled(),
            |_| {},
        )
        .await;
        assert!(matches!(result, Err(AssistantError::Pipeline(_))));
        assert!(rx.is_drained());
    }
}
