//! Startup initialization: builds every engine up front.
//!
//! Call [`initialize_engines`] before loading the coordinator so the first
//! wake word is never delayed by engine setup.

use crate::audio::playback::CpalOutput;
use crate::config::AssistantConfig;
use crate::engine::InitializedEngines;
use crate::error::Result;
use crate::llm::ApiGenerator;
use crate::stt::ApiTranscriber;
use crate::tts::ApiSynthesizer;
use crate::wakeword::WakewordSpotter;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

/// Build the wake-word spotter, transcriber, generator, synthesizer and
/// audio output described by `config`.
///
/// # Errors
///
/// Returns the first engine's init error; engines built before it are
/// dropped.
pub fn initialize_engines(config: &AssistantConfig) -> Result<InitializedEngines> {
    let rate = config.audio.sample_rate;
    let started = Instant::now();

    let wake_word = load_engine("wake word spotter", || {
        WakewordSpotter::new(&config.wakeword, rate)
    })?;
    let transcriber = load_engine(&format!("transcriber ({})", config.stt.model), || {
        ApiTranscriber::new(&config.stt, rate)
    })?;
    let generator = load_engine(&format!("generator ({})", config.llm.model), || {
        ApiGenerator::new(&config.llm)
    })?;
    let synthesizer = load_engine(&format!("synthesizer ({})", config.tts.voice), || {
        ApiSynthesizer::new(&config.tts)
    })?;
    let output = load_engine("audio output", || Ok(CpalOutput::new(&config.audio)))?;

    info!(
        "all engines ready in {:.1}s",
        started.elapsed().as_secs_f64()
    );
    Ok(InitializedEngines {
        wake_word: Box::new(wake_word),
        transcriber: Box::new(transcriber),
        generator: Box::new(generator),
        synthesizer: Arc::new(synthesizer),
        output: Arc::new(output),
    })
}

/// Run one loader with timing and logging.
fn load_engine<T>(name: &str, loader: impl FnOnce() -> Result<T>) -> Result<T> {
    info!("loading {name}");
    let start = Instant::now();
    let engine = loader()?;
    info!("{name} loaded in {:.2}s", start.elapsed().as_secs_f64());
    Ok(engine)
}
