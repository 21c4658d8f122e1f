//! Speech-to-text upload.
//!
//! Batch transcription against an OpenAI-compatible endpoint: the captured
//! PCM goes up as a multipart WAV blob, the response comes back as
//! `{"text": ...}`. Streaming STT is deliberately absent; this is the whole
//! surface.

use std::time::Instant;

use reqwest::multipart;
use serde::Deserialize;
use tracing::{debug, info};

use crate::audio::wav::encode_wav;
use crate::cancel::CancelFlag;
use crate::config::Config;
use crate::error::{Result, VoiceError};

/// A completed transcription.
#[derive(Debug, Clone)]
pub struct Transcription {
    pub text: String,
    pub latency_s: f64,
    pub provider_id: String,
}

#[derive(Deserialize)]
struct TranscriptionResponse {
    #[serde(default)]
    text: String,
}

pub struct SttClient<'a> {
    client: &'a reqwest::Client,
    config: &'a Config,
}

impl<'a> SttClient<'a> {
    pub fn new(client: &'a reqwest::Client, config: &'a Config) -> Self {
        Self { client, config }
    }

    /// Upload PCM to `base_url` and return the transcribed text.
    pub async fn transcribe(
        &self,
        provider_id: &str,
        base_url: &str,
        pcm: &[i16],
        sample_rate: u32,
        cancel: &CancelFlag,
    ) -> Result<Transcription> {
        cancel.check("stt upload")?;

        let wav = encode_wav(pcm, sample_rate);
        debug!(
            provider = %provider_id,
            bytes = wav.len(),
            duration_s = pcm.len() as f64 / sample_rate as f64,
            "stt upload"
        );

        let file_part = multipart::Part::bytes(wav)
            .file_name("audio.wav")
            .mime_str("audio/wav")
            .map_err(|e| VoiceError::transient(format!("multipart build failed: {e}")))?;

        let mut form = multipart::Form::new()
            .text("model", self.config.stt_model.clone())
            .part("file", file_part);
        if let Some(lang) = &self.config.stt_language {
            form = form.text("language", lang.clone());
        }

        let mut req = self
            .client
            .post(format!("{base_url}/audio/transcriptions"))
            .multipart(form);
        if let Some(key) = &self.config.api_key {
            req = req.bearer_auth(key);
        }

        let started = Instant::now();
        let resp = req
            .send()
            .await
            .map_err(|e| VoiceError::from_http("stt request", e))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(VoiceError::from_status(status.as_u16(), body));
        }

        let parsed: TranscriptionResponse = resp
            .json()
            .await
            .map_err(|e| VoiceError::transient(format!("stt response parse failed: {e}")))?;
        let latency_s = started.elapsed().as_secs_f64();

        let text = parsed.text.trim().to_string();
        info!(provider = %provider_id, latency_s, chars = text.len(), "transcription complete");

        Ok(Transcription {
            text,
            latency_s,
            provider_id: provider_id.to_string(),
        })
    }
}
