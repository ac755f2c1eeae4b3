//! OpenAI-compatible chat completions backend.
//!
//! Works against any server implementing the streaming chat completions
//! API (Ollama, llama.cpp server, vLLM, MLX server, hosted providers).
//! The request runs on the calling thread; the pipeline calls it from a
//! blocking worker.

use crate::config::LlmConfig;
use crate::dialog::DialogHistory;
use crate::engine::{GenerateParams, GeneratedText, Generator, InterruptFlag, TokenSink};
use crate::error::{AssistantError, Result, Stage};
use crate::pipeline::messages::EndpointReason;
use std::io::BufRead;
use std::time::Instant;
use tracing::{debug, info};

/// At most this many stop strings are forwarded to the server; the rest
/// are still enforced locally.
const MAX_SERVER_STOP_STRINGS: usize = 4;

/// Generator backed by a streaming chat completions endpoint.
pub struct ApiGenerator {
    config: LlmConfig,
    url: String,
    agent: ureq::Agent,
    interrupt: InterruptFlag,
}

impl ApiGenerator {
    /// Create a generator for the configured endpoint.
    ///
    /// # Errors
    ///
    /// Returns an init error if the URL or model is missing.
    pub fn new(config: &LlmConfig) -> Result<Self> {
        if config.api_url.trim().is_empty() {
            return Err(AssistantError::init(Stage::Generation, "llm.api_url is empty"));
        }
        if config.model.trim().is_empty() {
            return Err(AssistantError::init(Stage::Generation, "llm.model is empty"));
        }

        let url = endpoint_url(&config.api_url, "chat/completions");
        info!("API generator configured: {url} model={}", config.model);

        Ok(Self {
            config: config.clone(),
            url,
            agent: ureq::agent(),
            interrupt: InterruptFlag::new(),
        })
    }

    fn request_body(&self, dialog: &DialogHistory, params: &GenerateParams) -> serde_json::Value {
        let mut messages = Vec::new();
        if let Some(system) = dialog.system_prompt() {
            messages.push(serde_json::json!({ "role": "system", "content": system }));
        }
        for turn in dialog.window(self.config.dialog_window) {
            messages.push(serde_json::json!({
                "role": turn.speaker.role(),
                "content": turn.text,
            }));
        }

        let stop: Vec<&str> = params
            .stop_phrases
            .iter()
            .filter(|s| !s.is_empty())
            .take(MAX_SERVER_STOP_STRINGS)
            .map(String::as_str)
            .collect();

        serde_json::json!({
            "model": self.config.model,
            "messages": messages,
            "stream": true,
            "max_tokens": params.token_cap,
            "temperature": self.config.temperature,
            "top_p": self.config.top_p,
            "presence_penalty": self.config.presence_penalty,
            "frequency_penalty": self.config.frequency_penalty,
            "stop": stop,
        })
    }
}

impl Generator for ApiGenerator {
    fn generate(
        &mut self,
        dialog: &DialogHistory,
        params: &GenerateParams,
        tokens: &TokenSink,
    ) -> Result<GeneratedText> {
        let started = Instant::now();

        let body = serde_json::to_string(&self.request_body(dialog, params)).map_err(|e| {
            AssistantError::engine(Stage::Generation, format!("JSON serialization failed: {e}"))
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
            AssistantError::engine(Stage::Generation, format!("API request failed: {e}"))
        })?;

        let reader = std::io::BufReader::new(response.into_reader());
        let generated = stream_completion(reader, params, &self.interrupt, tokens)?;

        info!(
            "API generated {} chars in {:.1}s ({})",
            generated.text.len(),
            started.elapsed().as_secs_f64(),
            generated.endpoint
        );
        Ok(generated)
    }

    fn interrupt_flag(&self) -> InterruptFlag {
        self.interrupt.clone()
    }
}

/// One decoded server-sent event.
#[derive(Debug, PartialEq)]
enum SseEvent {
    Delta {
        content: Option<String>,
        finish_reason: Option<String>,
    },
    Done,
    Ignored,
}

fn parse_sse_line(line: &str) -> Result<SseEvent> {
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(SseEvent::Ignored);
    };
    let data = data.trim();
    if data == "[DONE]" {
        return Ok(SseEvent::Done);
    }
    let chunk: serde_json::Value = serde_json::from_str(data).map_err(|e| {
        AssistantError::engine(Stage::Generation, format!("JSON parse error: {e}"))
    })?;
    if let Some(message) = chunk["error"]["message"].as_str() {
        return Err(AssistantError::engine(Stage::Generation, message));
    }
    let choice = &chunk["choices"][0];
    Ok(SseEvent::Delta {
        content: choice["delta"]["content"].as_str().map(str::to_owned),
        finish_reason: choice["finish_reason"].as_str().map(str::to_owned),
    })
}

/// Consume an SSE body, forwarding fragments to `tokens`.
fn stream_completion(
    reader: impl BufRead,
    params: &GenerateParams,
    interrupt: &InterruptFlag,
    tokens: &TokenSink,
) -> Result<GeneratedText> {
    let mut text = String::new();
    let mut fragments: u32 = 0;
    let mut in_think_block = false;

    for line in reader.lines() {
        if interrupt.is_raised() {
            return finish(text, EndpointReason::Interrupted);
        }

        let line = line.map_err(|e| {
            AssistantError::engine(Stage::Generation, format!("read error: {e}"))
        })?;
        if line.is_empty() {
            continue;
        }

        let (content, finish_reason) = match parse_sse_line(&line)? {
            SseEvent::Ignored => continue,
            SseEvent::Done => break,
            SseEvent::Delta {
                content,
                finish_reason,
            } => (content, finish_reason),
        };

        if let Some(content) = content.filter(|c| !c.is_empty()) {
            // Some models emit <think>...</think> reasoning; never speak it.
            if content.contains("<think>") {
                in_think_block = true;
                continue;
            }
            if content.contains("</think>") {
                in_think_block = false;
                continue;
            }
            if in_think_block {
                continue;
            }

            if let Some((spoken, phrase)) = split_at_stop_phrase(&content, &params.stop_phrases) {
                debug!("stop phrase {phrase:?} in stream");
                if !spoken.is_empty() {
                    text.push_str(spoken);
                    let _ = tokens.send(spoken.to_owned());
                }
                return finish(text, EndpointReason::StopPhrase);
            }

            text.push_str(&content);
            fragments += 1;
            // The pipeline may have stopped listening; keep the text anyway.
            let _ = tokens.send(content);

            if fragments >= params.token_cap {
                return finish(text, EndpointReason::TokenLimit);
            }
        }

        match finish_reason.as_deref() {
            Some("length") => return finish(text, EndpointReason::TokenLimit),
            Some(_) => return finish(text, EndpointReason::NaturalStop),
            None => {}
        }
    }

    if interrupt.is_raised() {
        return finish(text, EndpointReason::Interrupted);
    }
    finish(text, EndpointReason::NaturalStop)
}

fn finish(text: String, endpoint: EndpointReason) -> Result<GeneratedText> {
    Ok(GeneratedText { text, endpoint })
}

/// Split `fragment` before the first stop phrase it contains.
fn split_at_stop_phrase<'a>(
    fragment: &'a str,
    stop_phrases: &'a [String],
) -> Option<(&'a str, &'a str)> {
    stop_phrases
        .iter()
        .filter(|p| !p.is_empty())
        .filter_map(|p| fragment.find(p.as_str()).map(|pos| (pos, p.as_str())))
        .min_by_key(|(pos, _)| *pos)
        .map(|(pos, phrase)| (&fragment[..pos], phrase))
}

/// Join `path` onto an OpenAI-style base URL with or without `/v1`.
pub(crate) fn endpoint_url(api_url: &str, path: &str) -> String {
    let base = api_url.trim_end_matches('/');
    let base = base.strip_suffix("/v1").unwrap_or(base);
    format!("{base}/v1/{path}")
}
