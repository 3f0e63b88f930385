//! OpenAI-compatible chat completion and audio transcription client.
//!
//! Works against any server exposing `/v1/chat/completions` and
//! `/v1/audio/transcriptions` with Bearer auth.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{Instrument, debug, info, info_span};

use parley_core::traits::{CompletionProvider, Transcriber};
use parley_core::types::{Completion, Message, TokenUsage};

use crate::retry::send_with_retry;

pub const DEFAULT_API_BASE: &str = "https://api.openai.com";
pub const DEFAULT_TRANSCRIPTION_MODEL: &str = "whisper-1";

/// Chat completion + transcription client.
pub struct OpenAiProvider {
    client: Client,
    api_key: String,
    api_base: String,
    transcription_model: String,
}

impl OpenAiProvider {
    pub fn new(api_key: String, api_base: &str, transcription_model: &str) -> Result<Self> {
        debug!(api_base, transcription_model, "creating openai provider");

        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(300))
            .build()
            .context("failed to create HTTP client")?;

        Ok(Self {
            client,
            api_key,
            api_base: api_base.trim_end_matches('/').to_owned(),
            transcription_model: transcription_model.to_owned(),
        })
    }

    /// Create from the given environment variable, using the public endpoint.
    pub fn from_env(key_env: &str) -> Result<Self> {
        let api_key =
            std::env::var(key_env).with_context(|| format!("{key_env} environment variable not set"))?;
        Self::new(api_key, DEFAULT_API_BASE, DEFAULT_TRANSCRIPTION_MODEL)
    }

    fn completions_url(&self) -> String {
        format!("{}/v1/chat/completions", self.api_base)
    }

    fn transcriptions_url(&self) -> String {
        format!("{}/v1/audio/transcriptions", self.api_base)
    }

    fn build_body(model: &str, messages: &[Message]) -> Value {
        let messages: Vec<Value> = messages
            .iter()
            .map(|m| {
                json!({
                    "role": m.role.as_str(),
                    "content": m.content,
                })
            })
            .collect();

        json!({
            "model": model,
            "messages": messages,
        })
    }

    fn parse_response(response: ChatResponse) -> Result<Completion> {
        let text = response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .context("completion response contained no choices")?;

        let usage = response
            .usage
            .map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens))
            .unwrap_or_default();

        Ok(Completion { text, usage })
    }
}

impl std::fmt::Debug for OpenAiProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiProvider")
            .field("api_base", &self.api_base)
            .field("transcription_model", &self.transcription_model)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl CompletionProvider for OpenAiProvider {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn complete(&self, model: &str, messages: &[Message]) -> Result<Completion> {
        let span = info_span!(
            "openai_request",
            model,
            method = "complete",
            message_count = messages.len(),
        );

        async {
            let body = Self::build_body(model, messages);
            let url = self.completions_url();

            let response = send_with_retry("OpenAI", || {
                self.client
                    .post(&url)
                    .bearer_auth(&self.api_key)
                    .json(&body)
            })
            .await?;

            let api_response: ChatResponse = response
                .json()
                .await
                .context("failed to parse OpenAI response")?;

            let completion = Self::parse_response(api_response)?;

            info!(
                prompt_tokens = completion.usage.prompt_tokens,
                completion_tokens = completion.usage.completion_tokens,
                "openai response"
            );

            Ok(completion)
        }
        .instrument(span)
        .await
    }
}

#[async_trait]
impl Transcriber for OpenAiProvider {
    async fn transcribe(&self, audio: Vec<u8>) -> Result<String> {
        let span = info_span!(
            "openai_request",
            model = %self.transcription_model,
            method = "transcribe",
            audio_bytes = audio.len(),
        );

        async {
            let url = self.transcriptions_url();

            let response = send_with_retry("OpenAI", || {
                let form = Form::new()
                    .part("file", Part::bytes(audio.clone()).file_name("voice.ogg"))
                    .text("model", self.transcription_model.clone());
                self.client
                    .post(&url)
                    .bearer_auth(&self.api_key)
                    .multipart(form)
            })
            .await?;

            let transcription: TranscriptionResponse = response
                .json()
                .await
                .context("failed to parse transcription response")?;

            info!(chars = transcription.text.len(), "transcription complete");
            Ok(transcription.text)
        }
        .instrument(span)
        .await
    }
}

// --- OpenAI API response types ---

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    text: String,
}
