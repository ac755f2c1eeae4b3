//! Shared harness for driving the pipeline with scripted engines.

use parley::engine::InitializedEngines;
use parley::engine::scripted::{
    MemoryOutput, PromptLog, ScriptedGenerator, ScriptedSynthesizer, ScriptedTranscriber,
    ScriptedWakeWord,
};
use parley::pipeline::EndpointReason;
use parley::{AssistantConfig, ConversationState, FrameRouter, PipelineCoordinator, RuntimeEvent};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

/// Frame content is irrelevant to the scripted engines.
pub(crate) const FRAME: [i16; 16] = [0; 16];

const WAIT_LIMIT: Duration = Duration::from_secs(5);

/// Engines for one session.
pub(crate) struct Script {
    pub wake_word: ScriptedWakeWord,
    pub transcriber: ScriptedTranscriber,
    pub generator: ScriptedGenerator,
    pub synthesizer: ScriptedSynthesizer,
    pub output: MemoryOutput,
    pub warmup_secs: f32,
    pub profile: bool,
}

impl Script {
    /// Wake on the first frame, ask one question on the second.
    pub(crate) fn ask(question: &str, generator: ScriptedGenerator) -> Self {
        Self {
            wake_word: ScriptedWakeWord::new([0]),
            transcriber: ScriptedTranscriber::new().endpoint(question),
            generator,
            synthesizer: ScriptedSynthesizer::new(1_000, 10),
            output: MemoryOutput::new(),
            warmup_secs: 0.0,
            profile: false,
        }
    }
}

/// A loaded coordinator plus handles on everything the engines record.
pub(crate) struct Session {
    pub coordinator: PipelineCoordinator,
    pub router: FrameRouter,
    pub output: MemoryOutput,
    pub synthesizer: ScriptedSynthesizer,
    pub prompts: PromptLog,
    events: broadcast::Receiver<RuntimeEvent>,
    seen: Vec<RuntimeEvent>,
}

/// Load a session. Must be called inside a multi-threaded runtime.
pub(crate) fn start(script: Script) -> Session {
    let (tx, rx) = broadcast::channel(4096);
    let mut config = AssistantConfig::default();
    config.pipeline.warmup_secs = script.warmup_secs;
    config.pipeline.poll_interval_ms = 1;
    config.pipeline.profile = script.profile;

    let output = script.output;
    let synthesizer = script.synthesizer;
    let prompts = script.generator.prompt_log();
    let engines = InitializedEngines {
        wake_word: Box::new(script.wake_word),
        transcriber: Box::new(script.transcriber),
        generator: Box::new(script.generator),
        synthesizer: Arc::new(synthesizer.clone()),
        output: Arc::new(output.clone()),
    };

    let mut coordinator = PipelineCoordinator::new(config).with_runtime_events(tx);
    let router = coordinator.load(move |_| Ok(engines)).unwrap();
    Session {
        coordinator,
        router,
        output,
        synthesizer,
        prompts,
        events: rx,
        seen: Vec::new(),
    }
}

impl Session {
    pub(crate) fn route(&mut self, frames: usize) {
        for _ in 0..frames {
            self.router.route(&FRAME);
        }
    }

    /// Every event received so far.
    pub(crate) fn events(&mut self) -> &[RuntimeEvent] {
        while let Ok(event) = self.events.try_recv() {
            self.seen.push(event);
        }
        &self.seen
    }

    pub(crate) fn tokens(&mut self) -> Vec<String> {
        self.events()
            .iter()
            .filter_map(|e| match e {
                RuntimeEvent::Token(t) => Some(t.clone()),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn completions(&mut self) -> Vec<(String, EndpointReason)> {
        self.events()
            .iter()
            .filter_map(|e| match e {
                RuntimeEvent::Completion { text, reason } => Some((text.clone(), *reason)),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn error_stages(&mut self) -> Vec<parley::Stage> {
        self.events()
            .iter()
            .filter_map(|e| match e {
                RuntimeEvent::Error { stage, .. } => Some(*stage),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn states(&mut self) -> Vec<ConversationState> {
        self.events()
            .iter()
            .filter_map(|e| match e {
                RuntimeEvent::StateChanged { to, .. } => Some(*to),
                _ => None,
            })
            .collect()
    }

    /// Poll until `cond` holds. Returns false on timeout.
    pub(crate) async fn wait_until(&mut self, mut cond: impl FnMut(&mut Self) -> bool) -> bool {
        let deadline = Instant::now() + WAIT_LIMIT;
        while Instant::now() < deadline {
            if cond(self) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        cond(self)
    }

    pub(crate) async fn wait_for_state(&mut self, state: ConversationState) -> bool {
        self.wait_until(|s| s.coordinator.state() == state).await
    }

    /// Wait for every launched run, bounded so a hang fails the test.
    pub(crate) async fn settle(&self) {
        tokio::time::timeout(WAIT_LIMIT, self.coordinator.wait_for_runs())
            .await
            .expect("runs did not settle");
    }
}

/// Chunk ordinals in write order, as stamped by [`ScriptedSynthesizer`].
pub(crate) fn chunk_ordinals(writes: &[Vec<i16>]) -> Vec<i16> {
    let mut ordinals: Vec<i16> = writes.iter().flatten().copied().collect();
    ordinals.dedup();
    ordinals
}

pub(crate) fn completion_reason(completions: &[(String, EndpointReason)]) -> EndpointReason {
    assert_eq!(completions.len(), 1, "expected one completion: {completions:?}");
    completions[0].1
}

