//! Streaming text-to-speech over an OpenAI-compatible speech endpoint.
//!
//! Token fragments are buffered until a clause boundary so every request
//! carries enough text to sound natural, then the server renders raw
//! 16-bit little-endian mono PCM.

use crate::config::TtsConfig;
use crate::engine::{SynthesisStream, Synthesizer};
use crate::error::{AssistantError, Result, Stage};
use crate::llm::api::endpoint_url;
use std::io::Read;
use tracing::{debug, info};

/// Clause punctuation only splits once the buffer is at least this long.
const CLAUSE_MIN_LEN: usize = 20;

/// Synthesizer backed by `/v1/audio/speech`.
pub struct ApiSynthesizer {
    config: TtsConfig,
    url: String,
    agent: ureq::Agent,
}

impl ApiSynthesizer {
    /// # Errors
    ///
    /// Returns an init error if the URL or voice is missing.
    pub fn new(config: &TtsConfig) -> Result<Self> {
        if config.api_url.trim().is_empty() {
            return Err(AssistantError::init(Stage::Synthesis, "tts.api_url is empty"));
        }
        if config.voice.trim().is_empty() {
            return Err(AssistantError::init(Stage::Synthesis, "tts.voice is empty"));
        }
        let url = endpoint_url(&config.api_url, "audio/speech");
        info!(
            "API synthesizer configured: {url} voice={} rate={}Hz",
            config.voice, config.sample_rate
        );
        Ok(Self {
            config: config.clone(),
            url,
            agent: ureq::agent(),
        })
    }
}

impl Synthesizer for ApiSynthesizer {
    fn sample_rate(&self) -> u32 {
        self.config.sample_rate
    }

    fn open_stream(&self) -> Result<Box<dyn SynthesisStream>> {
        Ok(Box::new(ApiSynthesisStream {
            config: self.config.clone(),
            url: self.url.clone(),
            agent: self.agent.clone(),
            pending: String::new(),
        }))
    }
}

struct ApiSynthesisStream {
    config: TtsConfig,
    url: String,
    agent: ureq::Agent,
    pending: String,
}

impl ApiSynthesisStream {
    fn render(&self, text: &str) -> Result<Vec<i16>> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(Vec::new());
        }
        debug!("synthesizing {text:?}");

        let body = serde_json::json!({
            "model": self.config.model,
            "input": text,
            "voice": self.config.voice,
            "speed": self.config.speed,
            "response_format": "pcm",
        });

        let body = serde_json::to_string(&body).map_err(|e| {
            AssistantError::engine(Stage::Synthesis, format!("JSON serialization failed: {e}"))
        })?;

        let mut req = self
            .agent
            .post(&self.url)
            .set("Content-Type", "application/json");
        if !self.config.api_key.is_empty() {
            let auth = format!("Bearer {}", self.config.api_key);
            req = req.set("Authorization", &auth);
        }
        let response = req.send_string(&body).map_err(|e| {
            AssistantError::engine(Stage::Synthesis, format!("API request failed: {e}"))
        })?;

        let mut bytes = Vec::new();
        response
            .into_reader()
            .read_to_end(&mut bytes)
            .map_err(|e| AssistantError::engine(Stage::Synthesis, format!("read error: {e}")))?;
        Ok(pcm_from_le_bytes(&bytes))
    }
}

impl SynthesisStream for ApiSynthesisStream {
    fn synthesize(&mut self, text: &str) -> Result<Vec<i16>> {
        self.pending.push_str(text);
        let Some(end) = clause_end(&self.pending) else {
            return Ok(Vec::new());
        };
        let ready: String = self.pending.drain(..end).collect();
        self.render(&ready)
    }

    fn flush(&mut self) -> Result<Vec<i16>> {
        let rest = std::mem::take(&mut self.pending);
        self.render(&rest)
    }
}

/// Byte offset just past the first sentence end, or past the last clause
/// mark once the text is long enough. `None` when nothing is speakable yet.
pub(crate) fn clause_end(text: &str) -> Option<usize> {
    let followed_by_break = |i: usize, c: char| {
        let rest = &text[i + c.len_utf8()..];
        rest.is_empty() || rest.starts_with(char::is_whitespace)
    };

    if let Some((i, c)) = text
        .char_indices()
        .find(|&(i, c)| matches!(c, '.' | '!' | '?' | '\n') && followed_by_break(i, c))
    {
        return Some(i + c.len_utf8());
    }

    if text.len() < CLAUSE_MIN_LEN {
        return None;
    }
    text.char_indices()
        .rev()
        .find(|&(i, c)| {
            matches!(c, ',' | ';' | ':' | '\u{2014}' | '\u{2013}') && followed_by_break(i, c)
        })
        .map(|(i, c)| i + c.len_utf8())
}

/// Decode 16-bit little-endian PCM; a trailing odd byte is dropped.
fn pcm_from_le_bytes(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}
