//! ElevenLabs-compatible text-to-speech client.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use tracing::{Instrument, debug, info, info_span};

use parley_core::traits::SpeechSynthesizer;

pub const DEFAULT_API_BASE: &str = "https://api.elevenlabs.io";
pub const DEFAULT_VOICE_ID: &str = "21m00Tcm4TlvDq8ikWAM";
pub const DEFAULT_MODEL_ID: &str = "eleven_multilingual_v2";

pub struct ElevenLabsSynthesizer {
    client: Client,
    api_key: String,
    api_base: String,
    voice_id: String,
    model_id: String,
}

impl ElevenLabsSynthesizer {
    pub fn new(api_key: String, api_base: &str, voice_id: &str, model_id: &str) -> Result<Self> {
        debug!(api_base, voice_id, model_id, "creating elevenlabs synthesizer");

        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .context("failed to create HTTP client")?;

        Ok(Self {
            client,
            api_key,
            api_base: api_base.trim_end_matches('/').to_owned(),
            voice_id: voice_id.to_owned(),
            model_id: model_id.to_owned(),
        })
    }

    fn url(&self) -> String {
        format!(
            "{}/v1/text-to-speech/{}?optimize_streaming_latency=0&output_format=mp3_44100_128",
            self.api_base, self.voice_id
        )
    }

    fn build_body(&self, text: &str) -> Value {
        json!({
            "text": text,
            "model_id": self.model_id,
            "voice_settings": {
                "stability": 0.5,
                "similarity_boost": 0,
                "style": 0,
                "use_speaker_boost": true,
            },
        })
    }
}

impl std::fmt::Debug for ElevenLabsSynthesizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ElevenLabsSynthesizer")
            .field("api_base", &self.api_base)
            .field("voice_id", &self.voice_id)
            .field("model_id", &self.model_id)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl SpeechSynthesizer for ElevenLabsSynthesizer {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>> {
        let span = info_span!("elevenlabs_request", voice = %self.voice_id, chars = text.len());

        async {
            // Transport failure first, then status.
            let response = self
                .client
                .post(self.url())
                .header("xi-api-key", &self.api_key)
                .header("accept", "audio/mpeg")
                .json(&self.build_body(text))
                .send()
                .await
                .context("failed to send request to ElevenLabs")?;

            let status = response.status();
            if !status.is_success() {
                let error_text = response.text().await.unwrap_or_default();
                anyhow::bail!("unexpected status code: {status} - {error_text}");
            }

            let audio = response
                .bytes()
                .await
                .context("failed to read ElevenLabs audio")?;

            info!(audio_bytes = audio.len(), "speech synthesized");
            Ok(audio.to_vec())
        }
        .instrument(span)
        .await
    }
}
