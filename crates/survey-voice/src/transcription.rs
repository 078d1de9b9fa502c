//! **TranscriptionClient**: Convert captured `EncodedAudio` into text.
//!
//! Implement `Transcriber` for any speech-to-text backend. The orchestrator never
//! sends empty audio here; it treats an empty window as silence on its own.

use crate::capture::EncodedAudio;
use crate::config::BackendConfig;
use crate::error::{is_quota_failure, TranscriptionError};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Speech-to-text capability
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Transcribe one window. `language` is a hint such as "en" or "es".
    /// Returns an empty string if nothing was said.
    async fn transcribe(
        &self,
        audio: &EncodedAudio,
        language: &str,
    ) -> Result<String, TranscriptionError>;
}

/// Placeholder STT: returns a fixed string. Use for running the call loop without an API.
#[derive(Debug, Default)]
pub struct PlaceholderTranscriber {
    /// If set, return this instead of the default message.
    pub response: Option<String>,
}

impl PlaceholderTranscriber {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_response(s: impl Into<String>) -> Self {
        Self {
            response: Some(s.into()),
        }
    }
}

#[async_trait]
impl Transcriber for PlaceholderTranscriber {
    async fn transcribe(
        &self,
        audio: &EncodedAudio,
        language: &str,
    ) -> Result<String, TranscriptionError> {
        if let Some(ref r) = self.response {
            return Ok(r.clone());
        }
        Ok(format!(
            "[STT placeholder: {} bytes, {:.1}s, {}]",
            audio.bytes.len(),
            audio.duration.as_secs_f32(),
            language
        ))
    }
}

/// Production STT: OpenAI-compatible `/audio/transcriptions` (Whisper, gpt-4o-transcribe, etc.).
#[derive(Debug, Clone)]
pub struct OpenAiTranscriber {
    /// Base URL without trailing slash (e.g. https://api.openai.com/v1).
    pub base_url: String,
    /// Bearer API key.
    pub api_key: String,
    pub model: String,
    client: reqwest::Client,
}

impl OpenAiTranscriber {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Result<Self, TranscriptionError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| TranscriptionError::Backend(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into(),
            api_key: api_key.into().trim().to_string(),
            model: model.into(),
            client,
        })
    }
}

#[async_trait]
impl Transcriber for OpenAiTranscriber {
    async fn transcribe(
        &self,
        audio: &EncodedAudio,
        language: &str,
    ) -> Result<String, TranscriptionError> {
        if audio.is_empty() {
            return Ok(String::new());
        }
        let url = format!("{}/audio/transcriptions", self.base_url.trim_end_matches('/'));
        let mime = if audio.mime_type.is_empty() {
            "audio/wav"
        } else {
            audio.mime_type.as_str()
        };
        let part = reqwest::multipart::Part::bytes(audio.bytes.clone())
            .file_name(audio.file_name())
            .mime_str(mime)
            .map_err(|e| TranscriptionError::Backend(e.to_string()))?;
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", self.model.clone())
            .text("language", language.to_string());
        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|e| TranscriptionError::Backend(e.to_string()))?;
        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            let message = format!("STT API error {}: {}", status, body);
            return Err(if is_quota_failure(status.as_u16(), &body) {
                TranscriptionError::QuotaExceeded(message)
            } else {
                TranscriptionError::Backend(message)
            });
        }
        let json: serde_json::Value = res
            .json()
            .await
            .map_err(|e| TranscriptionError::Backend(e.to_string()))?;
        Ok(json
            .get("text")
            .and_then(|t| t.as_str())
            .unwrap_or("")
            .trim()
            .to_string())
    }
}

/// Pick the best available transcriber: the HTTP API if a key is configured,
/// otherwise the placeholder.
pub fn create_best_transcriber(backend: &BackendConfig) -> Arc<dyn Transcriber> {
    if let Some(key) = backend.resolved_api_key() {
        match OpenAiTranscriber::new(&backend.api_base, key, &backend.stt_model) {
            Ok(stt) => {
                info!(model = %backend.stt_model, "using HTTP transcription");
                return Arc::new(stt);
            }
            Err(e) => warn!(error = %e, "HTTP transcription unavailable"),
        }
    }
    Arc::new(PlaceholderTranscriber::new())
}
