//! Pipeline coordinator: engine lifecycle and per-utterance runs.
//!
//! Each finalized utterance becomes one run: a generation task plus
//! synthesis and playback workers on the blocking pool, joined by two
//! handoffs and one cancellation token. Runs are chained so a new run
//! starts only after the previous one released the output device.

use crate::audio::PlayState;
use crate::config::{AssistantConfig, PipelineConfig};
use crate::conversation::{ConversationState, ConversationStateMachine, StateEvent};
use crate::dialog::DialogHistory;
use crate::engine::{AudioOutput, GenerateParams, InitializedEngines, InterruptFlag, Synthesizer};
use crate::error::{AssistantError, Result, Stage};
use crate::interrupt::{InterruptController, RunHandle};
use crate::pipeline::generation::{
    GenerationJob, GenerationSlot, SharedGeneration, run_generation_stage,
};
use crate::pipeline::handoff::{Consumer, Producer, handoff};
use crate::pipeline::messages::{Completion, PcmChunk, TokenChunk};
use crate::pipeline::playback::run_playback_stage;
use crate::pipeline::synthesis::{SynthesisSettings, run_synthesis_stage};
use crate::profiling::ProfileReport;
use crate::router::FrameRouter;
use crate::runtime::{EventSink, RuntimeEvent};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::{broadcast, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Owns the conversation state, the interrupt controller and, once
/// loaded, every engine.
pub struct PipelineCoordinator {
    config: AssistantConfig,
    events: EventSink,
    state: Arc<ConversationStateMachine>,
    interrupts: Arc<InterruptController>,
    launcher: Option<Arc<RunLauncher>>,
}

impl PipelineCoordinator {
    pub fn new(config: AssistantConfig) -> Self {
        Self {
            config,
            events: EventSink::disabled(),
            state: Arc::new(ConversationStateMachine::new(EventSink::disabled())),
            interrupts: Arc::new(InterruptController::new()),
            launcher: None,
        }
    }

    /// Attach a runtime event broadcaster for UI/observability.
    #[must_use]
    pub fn with_runtime_events(mut self, tx: broadcast::Sender<RuntimeEvent>) -> Self {
        self.events = EventSink::new(tx);
        self.state = Arc::new(ConversationStateMachine::new(self.events.clone()));
        self
    }

    pub fn state(&self) -> ConversationState {
        self.state.current()
    }

    /// Build the engines with `init` and start listening.
    ///
    /// Must be called from within a tokio runtime; runs are spawned on it.
    /// The returned router is the single entry point for audio frames.
    ///
    /// # Errors
    ///
    /// Returns `init`'s error after moving back to idle, or a pipeline
    /// error if engines are already loaded or no runtime is available.
    pub fn load<F>(&mut self, init: F) -> Result<FrameRouter>
    where
        F: FnOnce(&AssistantConfig) -> Result<InitializedEngines>,
    {
        if self.launcher.is_some() {
            return Err(AssistantError::Pipeline("engines are already loaded".into()));
        }
        let runtime = Handle::try_current().map_err(|e| {
            AssistantError::Pipeline(format!("loading requires a tokio runtime: {e}"))
        })?;
        if self.state.apply(StateEvent::BeginLoad).is_none() {
            return Err(AssistantError::Pipeline(format!(
                "cannot load engines while {}",
                self.state.current()
            )));
        }

        info!("loading engines");
        let engines = match init(&self.config) {
            Ok(engines) => engines,
            Err(e) => {
                error!("engine initialization failed: {e}");
                self.events.emit(RuntimeEvent::Error {
                    stage: e.stage().unwrap_or(Stage::WakeWord),
                    message: e.to_string(),
                });
                self.state.apply(StateEvent::LoadFailed);
                return Err(e);
            }
        };

        let InitializedEngines {
            wake_word,
            transcriber,
            generator,
            synthesizer,
            output,
        } = engines;

        let (finished, _) = watch::channel(0);
        let launcher = Arc::new(RunLauncher {
            runtime,
            pipeline: self.config.pipeline.clone(),
            params: GenerateParams {
                token_cap: self.config.llm.completion_token_limit,
                stop_phrases: self.config.llm.stop_phrases.clone(),
            },
            state: Arc::clone(&self.state),
            interrupts: Arc::clone(&self.interrupts),
            events: self.events.clone(),
            stop_generation: generator.interrupt_flag(),
            generation: Arc::new(Mutex::new(Some(GenerationSlot {
                generator,
                dialog: DialogHistory::new(self.config.llm.system_prompt.clone()),
            }))),
            synthesizer: Mutex::new(Some(synthesizer)),
            output: Mutex::new(Some(output)),
            next_id: AtomicU64::new(0),
            current: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            tail: Mutex::new(None),
            finished,
            closed: AtomicBool::new(false),
        });
        self.launcher = Some(Arc::clone(&launcher));
        self.state.apply(StateEvent::Loaded);

        Ok(FrameRouter::new(
            wake_word,
            transcriber,
            Arc::clone(&self.state),
            Arc::clone(&self.interrupts),
            launcher,
            self.events.clone(),
        ))
    }

    /// Barge in on the active run. Safe to call at any time.
    pub fn interrupt(&self) -> bool {
        self.interrupts.interrupt()
    }

    /// Snapshot of the dialog. Blocks while a generation is in flight.
    pub fn dialog(&self) -> Option<DialogHistory> {
        self.launcher.as_ref().and_then(|l| l.dialog())
    }

    /// Wait until every run launched so far has finished.
    pub async fn wait_for_runs(&self) {
        if let Some(launcher) = &self.launcher {
            launcher.settle().await;
        }
    }

    /// Stop the active run, release every engine and move to idle.
    ///
    /// Idempotent. The router drops its own engines on its next frame.
    pub async fn shutdown(&mut self) {
        let Some(launcher) = self.launcher.take() else {
            debug!("shutdown: no engines loaded");
            return;
        };
        info!("shutting down pipeline");
        self.interrupts.interrupt();
        launcher.close().await;
        self.state.apply(StateEvent::Shutdown);
    }
}

/// Starts runs and holds the engines they share.
pub(crate) struct RunLauncher {
    runtime: Handle,
    pipeline: PipelineConfig,
    params: GenerateParams,
    state: Arc<ConversationStateMachine>,
    interrupts: Arc<InterruptController>,
    events: EventSink,
    stop_generation: InterruptFlag,
    generation: SharedGeneration,
    synthesizer: Mutex<Option<Arc<dyn Synthesizer>>>,
    output: Mutex<Option<Arc<dyn AudioOutput>>>,
    next_id: AtomicU64,
    /// Id of the most recently launched run.
    current: AtomicU64,
    /// Highest run id whose completion reached the state machine.
    completed: AtomicU64,
    /// The most recently launched run's task.
    tail: Mutex<Option<JoinHandle<()>>>,
    /// Id of the last run that finished.
    finished: watch::Sender<u64>,
    closed: AtomicBool,
}

impl RunLauncher {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Queue a run for `utterance`. Returns its id, or `None` after close.
    ///
    /// The run is interruptible from the moment this returns, even while
    /// it still waits for the previous run to release the device.
    pub(crate) fn launch(self: &Arc<Self>, utterance: String) -> Option<u64> {
        if self.is_closed() {
            warn!("dropping utterance after shutdown");
            return None;
        }
        let id = self.next_id.fetch_add(1, Ordering::AcqRel) + 1;
        self.current.store(id, Ordering::Release);

        let (token_tx, token_rx) = handoff::<TokenChunk>();
        let handle = RunHandle {
            id,
            cancel: CancellationToken::new(),
            play_state: PlayState::new(),
            generating: token_tx.active_flag(),
            stop_generation: self.stop_generation.clone(),
        };
        self.interrupts.register(handle.clone());
        let run = QueuedRun {
            handle,
            utterance,
            started_at: Instant::now(),
            token_tx,
            token_rx,
        };

        let mut tail = lock(&self.tail);
        let previous = tail.take();
        let launcher = Arc::clone(self);
        *tail = Some(self.runtime.spawn(async move {
            launcher.execute(run, previous).await;
            launcher.interrupts.unregister(id);
            launcher.finished.send_modify(|done| *done = (*done).max(id));
        }));
        Some(id)
    }

    async fn execute(&self, queued: QueuedRun, previous: Option<JoinHandle<()>>) {
        let QueuedRun {
            handle: run,
            utterance,
            started_at,
            token_tx,
            token_rx,
        } = queued;
        let id = run.id;
        if let Some(previous) = previous {
            if let Err(e) = previous.await {
                warn!("previous run ended abnormally: {e}");
            }
        }
        let synthesizer = lock(&self.synthesizer).clone();
        let output = lock(&self.output).clone();
        let (Some(synthesizer), Some(output)) = (synthesizer, output) else {
            debug!("run {id} skipped: engines released");
            return;
        };

        let cancel = run.cancel.clone();
        let play_state = run.play_state.clone();
        let (pcm_tx, pcm_rx) = handoff::<PcmChunk>();
        self.stop_generation.clear();
        // Re-raise an interrupt that landed while the run was queued.
        if self.is_closed() || cancel.is_cancelled() {
            run.signal();
        }
        info!("run {id} started for {utterance:?}");

        let poll = Duration::from_millis(self.pipeline.poll_interval_ms);
        let sample_rate = synthesizer.sample_rate();
        let synthesis = {
            let cancel = cancel.clone();
            let settings = SynthesisSettings {
                warmup_secs: self.pipeline.warmup_secs,
                poll_interval: poll,
                started_at,
            };
            tokio::task::spawn_blocking(move || {
                run_synthesis_stage(synthesizer, token_rx, pcm_tx, cancel, settings)
            })
        };
        let playback = {
            let play_state = play_state.clone();
            tokio::task::spawn_blocking(move || {
                run_playback_stage(output, sample_rate, pcm_rx, play_state, poll)
            })
        };

        let job = GenerationJob {
            run_id: id,
            utterance,
            params: self.params.clone(),
        };
        let generation = async {
            let result = run_generation_stage(
                job,
                Arc::clone(&self.generation),
                token_tx,
                cancel.clone(),
                self.events.clone(),
                |completion| self.complete(completion),
            )
            .await;
            if let Err(e) = &result {
                self.fail(&run, Stage::Generation, e);
            }
            result
        };
        let synthesis = async {
            let result = joined(synthesis.await, Stage::Synthesis);
            if let Err(e) = &result {
                self.fail(&run, Stage::Synthesis, e);
            }
            result
        };
        let playback = async {
            let result = joined(playback.await, Stage::Playback);
            if let Err(e) = &result {
                self.fail(&run, Stage::Playback, e);
            }
            result
        };

        let (generated, synthesized, played) = tokio::join!(generation, synthesis, playback);

        let (Ok(generated), Ok(synthesized), Ok(played)) = (generated, synthesized, played) else {
            debug!("run {id} ended with errors");
            return;
        };
        info!(
            "run {id} finished ({}): {} chunks played",
            generated.completion.reason, played.chunks_written
        );
        if self.pipeline.profile {
            let report = ProfileReport {
                tokens_per_sec: generated.tokens_per_sec,
                real_time_factor: synthesized.real_time_factor,
                first_audio_delay_secs: synthesized.first_audio_delay_secs,
            };
            info!(
                "run {id} profile: {:.1} tok/s, rtf {:.2}, first audio after {:.2}s",
                report.tokens_per_sec, report.real_time_factor, report.first_audio_delay_secs
            );
            self.events.emit(RuntimeEvent::Profile(report));
        }
    }

    /// Hand a completion to the state machine. Stale runs are ignored.
    fn complete(&self, completion: &Completion) {
        self.events.emit(RuntimeEvent::Completion {
            text: completion.text.clone(),
            reason: completion.reason,
        });
        if completion.run_id != self.current.load(Ordering::Acquire) {
            debug!("ignoring completion of stale run {}", completion.run_id);
            return;
        }
        self.completed.fetch_max(completion.run_id, Ordering::AcqRel);
        self.state.apply(StateEvent::Completed {
            interrupted: completion.is_interrupted(),
        });
    }

    /// Report a stage failure and cancel the run so its siblings drain.
    ///
    /// Only a current run whose completion is still outstanding moves the
    /// state machine; later failures belong to audio the user already
    /// talked over.
    fn fail(&self, run: &RunHandle, stage: Stage, err: &AssistantError) {
        let stage = err.stage().unwrap_or(stage);
        error!("run {} {stage} failed: {err}", run.id);
        self.events.emit(RuntimeEvent::Error {
            stage,
            message: err.to_string(),
        });
        let owns_state = run.id == self.current.load(Ordering::Acquire)
            && run.id > self.completed.load(Ordering::Acquire);
        if owns_state {
            self.state.apply(StateEvent::EngineError);
        } else {
            debug!("run {} already handed off; state left as is", run.id);
        }
        run.signal();
    }

    fn dialog(&self) -> Option<DialogHistory> {
        lock(&self.generation).as_ref().map(|slot| slot.dialog.clone())
    }

    async fn settle(&self) {
        let launched = self.next_id.load(Ordering::Acquire);
        let mut finished = self.finished.subscribe();
        if finished.wait_for(|done| *done >= launched).await.is_err() {
            warn!("run tracker closed while waiting");
        }
    }

    /// Refuse new runs, wait for the outstanding one, release engines.
    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let tail = lock(&self.tail).take();
        if let Some(tail) = tail {
            if let Err(e) = tail.await {
                warn!("run ended abnormally during shutdown: {e}");
            }
        }
        let generator = lock(&self.generation).take();
        let synthesizer = lock(&self.synthesizer).take();
        let output = lock(&self.output).take();
        info!(
            "released engines (generator: {}, synthesizer: {}, output: {})",
            generator.is_some(),
            synthesizer.is_some(),
            output.is_some()
        );
    }
}

/// A launched run waiting for its turn.
struct QueuedRun {
    handle: RunHandle,
    utterance: String,
    started_at: Instant,
    token_tx: Producer<TokenChunk>,
    token_rx: Consumer<TokenChunk>,
}

fn joined<T>(result: std::result::Result<Result<T>, JoinError>, stage: Stage) -> Result<T> {
    result.map_err(|e| AssistantError::Pipeline(format!("{stage} worker failed: {e}")))?
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
