//! Speech-to-text over an OpenAI-compatible transcription endpoint.
//!
//! Frames are buffered while the energy endpointer hears speech; at the
//! endpoint the utterance is encoded as WAV and posted to
//! `/v1/audio/transcriptions`.

use crate::config::SttConfig;
use crate::engine::{TranscriptPartial, Transcriber};
use crate::error::{AssistantError, Result, Stage};
use crate::llm::api::endpoint_url;
use crate::vad::{EnergyEndpointer, VadEvent};
use std::io::Cursor;
use std::time::Instant;
use tracing::{debug, info};

const BOUNDARY: &str = "----parley-audio-boundary";

/// Transcriber that endpoints locally and recognizes remotely.
pub struct ApiTranscriber {
    config: SttConfig,
    url: String,
    agent: ureq::Agent,
    sample_rate: u32,
    endpointer: EnergyEndpointer,
}

impl ApiTranscriber {
    /// # Errors
    ///
    /// Returns an init error if the URL is missing or the sample rate is zero.
    pub fn new(config: &SttConfig, sample_rate: u32) -> Result<Self> {
        if config.api_url.trim().is_empty() {
            return Err(AssistantError::init(Stage::Transcription, "stt.api_url is empty"));
        }
        if sample_rate == 0 {
            return Err(AssistantError::init(Stage::Transcription, "sample rate is zero"));
        }
        let url = endpoint_url(&config.api_url, "audio/transcriptions");
        info!(
            "API transcriber configured: {url} model={} endpoint after {}ms silence",
            config.model, config.endpoint_silence_ms
        );
        Ok(Self {
            config: config.clone(),
            url,
            agent: ureq::agent(),
            sample_rate,
            endpointer: EnergyEndpointer::new(config, sample_rate),
        })
    }

    fn transcribe(&self, samples: &[i16]) -> Result<String> {
        let started = Instant::now();
        let wav = encode_wav(samples, self.sample_rate)?;
        let body = multipart_body(&self.config, &wav);

        let mut req = self.agent.post(&self.url).set(
            "Content-Type",
            &format!("multipart/form-data; boundary={BOUNDARY}"),
        );
        if !self.config.api_key.is_empty() {
            let auth = format!("Bearer {}", self.config.api_key);
            req = req.set("Authorization", &auth);
        }

        let response = req.send_bytes(&body).map_err(|e| {
            AssistantError::engine(Stage::Transcription, format!("API request failed: {e}"))
        })?;
        let json: serde_json::Value = serde_json::from_reader(response.into_reader())
            .map_err(|e| {
                AssistantError::engine(Stage::Transcription, format!("JSON parse error: {e}"))
            })?;
        let text = json["text"]
            .as_str()
            .ok_or_else(|| AssistantError::engine(Stage::Transcription, "response has no text"))?
            .trim()
            .to_owned();

        info!(
            "transcribed {:.1}s of audio in {:.2}s: {text:?}",
            samples.len() as f32 / self.sample_rate as f32,
            started.elapsed().as_secs_f64()
        );
        Ok(text)
    }
}

impl Transcriber for ApiTranscriber {
    fn process(&mut self, frame: &[i16]) -> Result<TranscriptPartial> {
        match self.endpointer.process(frame) {
            VadEvent::Endpoint(samples) => Ok(TranscriptPartial {
                text: self.transcribe(&samples)?,
                is_endpoint: true,
            }),
            VadEvent::Speech | VadEvent::Silence => Ok(TranscriptPartial::default()),
        }
    }

    fn flush(&mut self) -> Result<String> {
        match self.endpointer.take() {
            Some(samples) => self.transcribe(&samples),
            None => {
                debug!("transcriber flush with no buffered speech");
                Ok(String::new())
            }
        }
    }
}

/// Encode mono 16-bit PCM as an in-memory WAV file.
fn encode_wav(samples: &[i16], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    let wav_err =
        |e: hound::Error| AssistantError::engine(Stage::Transcription, format!("WAV error: {e}"));
    let mut writer = hound::WavWriter::new(&mut cursor, spec).map_err(wav_err)?;
    for &s in samples {
        writer.write_sample(s).map_err(wav_err)?;
    }
    writer.finalize().map_err(wav_err)?;
    Ok(cursor.into_inner())
}

fn multipart_body(config: &SttConfig, wav: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(wav.len() + 512);
    let mut field = |name: &str, value: &str| {
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
            )
            .as_bytes(),
        );
    };
    field("model", &config.model);
    field("response_format", "json");
    if let Some(language) = &config.language {
        field("language", language);
    }
    body.extend_from_slice(
        format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"utterance.wav\"\r\nContent-Type: audio/wav\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(wav);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
    body
}
