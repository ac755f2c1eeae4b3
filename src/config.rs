//! Configuration types for the voice assistant.

use crate::error::{AssistantError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// End-of-turn markers emitted by common model families.
pub const DEFAULT_STOP_PHRASES: &[&str] = &[
    "</s>",
    "<end_of_turn>",
    "<|endoftext|>",
    "<|eot_id|>",
    "<|end|>",
    "<|user|>",
    "<|assistant|>",
];

/// Top-level configuration for the assistant.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AssistantConfig {
    /// Audio capture/playback settings.
    pub audio: AudioConfig,
    /// Wake word detection (MFCC+DTW keyword spotter).
    pub wakeword: WakewordConfig,
    /// Speech-to-text settings.
    pub stt: SttConfig,
    /// Language model settings.
    pub llm: LlmConfig,
    /// Text-to-speech settings.
    pub tts: TtsConfig,
    /// Streaming pipeline tuning.
    pub pipeline: PipelineConfig,
}

/// Audio I/O configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Sample rate of the frames handed to the wake word detector and
    /// transcriber, in Hz.
    pub sample_rate: u32,
    /// Number of samples per routed frame.
    pub frame_length: usize,
    /// Input device name (None = system default).
    pub input_device: Option<String>,
    /// Output device name (None = system default).
    pub output_device: Option<String>,
    /// Upper bound on audio queued inside the output device, in seconds.
    /// Writes block while the device holds more than this.
    pub max_buffered_secs: f32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            frame_length: 512,
            input_device: None,
            output_device: None,
            max_buffered_secs: 1.0,
        }
    }
}

/// Wake word spotter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WakewordConfig {
    /// Directory holding 16 kHz mono WAV recordings of the keyword.
    pub references_dir: PathBuf,
    /// Similarity score (0..1) above which a window counts as a match.
    pub threshold: f32,
    /// Number of MFCC coefficients per analysis frame.
    pub num_mfcc: usize,
    /// Frames are ignored for this long after a match.
    pub cooldown_ms: u64,
}

impl Default for WakewordConfig {
    fn default() -> Self {
        Self {
            references_dir: default_data_dir().join("wakeword"),
            threshold: 0.5,
            num_mfcc: 13,
            cooldown_ms: 2_000,
        }
    }
}

/// Speech-to-text configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SttConfig {
    /// Base URL of an OpenAI-compatible transcription server.
    pub api_url: String,
    /// Transcription model name.
    pub model: String,
    /// Bearer token (empty = none).
    pub api_key: String,
    /// Optional ISO-639-1 language hint.
    pub language: Option<String>,
    /// RMS energy above which a frame counts as speech.
    pub energy_threshold: f32,
    /// Trailing silence that marks the end of an utterance, in milliseconds.
    pub endpoint_silence_ms: u32,
    /// Speech shorter than this is discarded, in milliseconds.
    pub min_speech_ms: u32,
    /// Hard cap on a single utterance, in seconds.
    pub max_utterance_secs: f32,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:8000".into(),
            model: "whisper-1".into(),
            api_key: String::new(),
            language: None,
            energy_threshold: 0.01,
            endpoint_silence_ms: 1_000,
            min_speech_ms: 250,
            max_utterance_secs: 30.0,
        }
    }
}

/// Language model configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Base URL of an OpenAI-compatible chat completions server.
    pub api_url: String,
    /// Model identifier.
    pub model: String,
    /// Bearer token (empty = none).
    pub api_key: String,
    /// System prompt prepended to every request.
    pub system_prompt: String,
    /// Maximum number of tokens per completion.
    pub completion_token_limit: u32,
    /// Sampling temperature.
    pub temperature: f32,
    /// Nucleus sampling threshold.
    pub top_p: f32,
    /// Presence penalty.
    pub presence_penalty: f32,
    /// Frequency penalty.
    pub frequency_penalty: f32,
    /// Fragments containing any of these are never spoken or displayed.
    pub stop_phrases: Vec<String>,
    /// Number of most recent dialog turns sent with each request.
    pub dialog_window: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:11434".into(),
            model: "llama3.2".into(),
            api_key: String::new(),
            system_prompt: "You are a helpful voice assistant. Keep answers short and \
                            conversational; your replies are spoken aloud."
                .into(),
            completion_token_limit: 128,
            temperature: 0.7,
            top_p: 0.9,
            presence_penalty: 0.0,
            frequency_penalty: 0.0,
            stop_phrases: DEFAULT_STOP_PHRASES.iter().map(|s| (*s).to_owned()).collect(),
            dialog_window: 16,
        }
    }
}

/// Text-to-speech configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsConfig {
    /// Base URL of an OpenAI-compatible speech server.
    pub api_url: String,
    /// Speech model name.
    pub model: String,
    /// Voice identifier.
    pub voice: String,
    /// Bearer token (empty = none).
    pub api_key: String,
    /// Speaking rate multiplier (1.0 = normal).
    pub speed: f32,
    /// Sample rate of the raw PCM the server returns, in Hz.
    pub sample_rate: u32,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:8880".into(),
            model: "tts-1".into(),
            voice: "alloy".into(),
            api_key: String::new(),
            speed: 1.0,
            sample_rate: 24_000,
        }
    }
}

/// Streaming pipeline tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Minimum audio held back before playback starts, in seconds.
    /// Zero disables the warmup buffer.
    pub warmup_secs: f32,
    /// Sleep between polls of an empty stage queue, in milliseconds.
    pub poll_interval_ms: u64,
    /// Report tokens/sec, real-time factor and first-audio delay per run.
    pub profile: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            warmup_secs: 1.0,
            poll_interval_ms: 2,
            profile: false,
        }
    }
}

impl AssistantConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self =
            toml::from_str(&content).map_err(|e| AssistantError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| AssistantError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject values no pipeline can run with.
    ///
    /// # Errors
    ///
    /// Returns [`AssistantError::Config`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.audio.sample_rate == 0 {
            return Err(AssistantError::Config("audio.sample_rate must be > 0".into()));
        }
        if self.audio.frame_length == 0 {
            return Err(AssistantError::Config("audio.frame_length must be > 0".into()));
        }
        if self.tts.sample_rate == 0 {
            return Err(AssistantError::Config("tts.sample_rate must be > 0".into()));
        }
        if self.llm.completion_token_limit == 0 {
            return Err(AssistantError::Config(
                "llm.completion_token_limit must be > 0".into(),
            ));
        }
        if !self.pipeline.warmup_secs.is_finite() || self.pipeline.warmup_secs < 0.0 {
            return Err(AssistantError::Config(
                "pipeline.warmup_secs must be a non-negative number".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.wakeword.threshold) {
            return Err(AssistantError::Config(
                "wakeword.threshold must be within 0..=1".into(),
            ));
        }
        Ok(())
    }

    /// Returns the default config file path: `~/.config/parley/config.toml`.
    pub fn default_config_path() -> PathBuf {
        if let Some(config) = std::env::var_os("XDG_CONFIG_HOME") {
            PathBuf::from(config).join("parley").join("config.toml")
        } else if let Some(home) = std::env::var_os("HOME") {
            PathBuf::from(home)
                .join(".config")
                .join("parley")
                .join("config.toml")
        } else {
            PathBuf::from("/tmp/parley-config/config.toml")
        }
    }
}

/// Returns the default data directory: `~/.local/share/parley`.
pub fn default_data_dir() -> PathBuf {
    if let Some(data) = std::env::var_os("XDG_DATA_HOME") {
        PathBuf::from(data).join("parley")
    } else if let Some(home) = std::env::var_os("HOME") {
        PathBuf::from(home).join(".local").join("share").join("parley")
    } else {
        PathBuf::from("/tmp/parley-data")
    }
}
