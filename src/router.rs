//! Frame router: the single consumption point for captured audio.
//!
//! Every frame is classified against the current conversation state and
//! handed to the wake-word detector or the transcriber. All state-machine
//! events that come from audio are applied here, one frame at a time.

use crate::conversation::{ConversationState, ConversationStateMachine, StateEvent, Utterance};
use crate::engine::{Transcriber, WakeWordDetector};
use crate::error::{AssistantError, Stage};
use crate::interrupt::InterruptController;
use crate::pipeline::coordinator::RunLauncher;
use crate::runtime::{EventSink, RuntimeEvent};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Dispatches frames from the capture thread.
pub struct FrameRouter {
    wake_word: Option<Box<dyn WakeWordDetector>>,
    transcriber: Option<Box<dyn Transcriber>>,
    utterance: Option<Utterance>,
    state: Arc<ConversationStateMachine>,
    interrupts: Arc<InterruptController>,
    launcher: Arc<RunLauncher>,
    events: EventSink,
}

impl FrameRouter {
    pub(crate) fn new(
        wake_word: Box<dyn WakeWordDetector>,
        transcriber: Box<dyn Transcriber>,
        state: Arc<ConversationStateMachine>,
        interrupts: Arc<InterruptController>,
        launcher: Arc<RunLauncher>,
        events: EventSink,
    ) -> Self {
        Self {
            wake_word: Some(wake_word),
            transcriber: Some(transcriber),
            utterance: None,
            state,
            interrupts,
            launcher,
            events,
        }
    }

    /// Route one fixed-length frame. Never blocks on the pipeline.
    pub fn route(&mut self, frame: &[i16]) {
        if self.launcher.is_closed() {
            self.release();
            return;
        }
        match self.state.current() {
            ConversationState::Listening => self.listen(frame),
            ConversationState::Generating => self.watch_for_barge_in(frame),
            ConversationState::Transcribing => self.transcribe(frame),
            ConversationState::Idle | ConversationState::LoadingModel => {}
        }
    }

    /// Whether the router still holds its engines.
    pub fn is_active(&self) -> bool {
        self.wake_word.is_some() || self.transcriber.is_some()
    }

    /// Text of the live utterance, if one is open.
    pub fn live_utterance(&self) -> Option<&str> {
        self.utterance.as_ref().map(Utterance::text)
    }

    fn listen(&mut self, frame: &[i16]) {
        if !self.detect(frame) {
            return;
        }
        // Also cuts off the tail of a finished run that is still playing.
        self.interrupts.interrupt();
        if self.state.apply(StateEvent::WakeWord).is_some() {
            self.utterance = Some(Utterance::new());
        }
    }

    fn watch_for_barge_in(&mut self, frame: &[i16]) {
        if self.detect(frame) {
            info!("barge-in while generating");
            self.interrupts.interrupt();
        }
    }

    /// Run the wake-word detector. Errors are reported and count as no hit.
    fn detect(&mut self, frame: &[i16]) -> bool {
        let Some(detector) = self.wake_word.as_mut() else {
            return false;
        };
        match detector.process(frame) {
            Ok(Some(0)) => true,
            Ok(Some(index)) => {
                debug!("ignoring keyword {index}");
                false
            }
            Ok(None) => false,
            Err(e) => {
                self.engine_failed(Stage::WakeWord, &e);
                false
            }
        }
    }

    fn transcribe(&mut self, frame: &[i16]) {
        let Some(transcriber) = self.transcriber.as_mut() else {
            return;
        };
        let partial = match transcriber.process(frame) {
            Ok(partial) => partial,
            Err(e) => return self.engine_failed(Stage::Transcription, &e),
        };

        let utterance = self.utterance.get_or_insert_with(Utterance::new);
        if !partial.text.is_empty() {
            utterance.push(&partial.text);
            self.events
                .emit(RuntimeEvent::PartialTranscript(utterance.text().to_owned()));
        }
        if partial.is_endpoint {
            self.finish_utterance();
        }
    }

    fn finish_utterance(&mut self) {
        let tail = match self.transcriber.as_mut().map(|t| t.flush()) {
            Some(Ok(tail)) => tail,
            Some(Err(e)) => return self.engine_failed(Stage::Transcription, &e),
            None => return,
        };
        let mut utterance = self.utterance.take().unwrap_or_default();
        utterance.push(&tail);
        let text = utterance.finalize();

        if text.is_empty() {
            debug!("empty utterance dropped");
            self.utterance = Some(Utterance::new());
            return;
        }
        info!("utterance: {text:?}");
        self.events.emit(RuntimeEvent::FinalTranscript(text.clone()));
        if self.state.apply(StateEvent::Endpoint).is_some() {
            self.launcher.launch(text);
        }
    }

    fn engine_failed(&mut self, stage: Stage, err: &AssistantError) {
        let stage = err.stage().unwrap_or(stage);
        error!("{stage} failed: {err}");
        self.events.emit(RuntimeEvent::Error {
            stage,
            message: err.to_string(),
        });
        self.utterance = None;
        self.state.apply(StateEvent::EngineError);
    }

    fn release(&mut self) {
        if self.is_active() {
            info!("router releasing wake word detector and transcriber");
            self.wake_word = None;
            self.transcriber = None;
            self.utterance = None;
        }
    }
}
