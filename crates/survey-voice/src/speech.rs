//! **SpeechOutput**: Agent text to audio, with a local fallback synthesizer.
//!
//! The primary path synthesizes through a remote TTS API and plays the clip on an
//! `AudioSink`. Any failure on that path (request or playback) hands the same text to
//! the `LocalSynthesizer` exactly once. Every call resolves once: primary, fallback,
//! silent (fallback failed too), or aborted by cancellation.

use crate::config::BackendConfig;
use crate::error::{is_quota_failure, LocalSpeechError, PlaybackError, SynthesisError};
use crate::survey::Language;
use async_trait::async_trait;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Synthesized audio ready for playback
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AudioClip {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

impl AudioClip {
    pub fn new(bytes: Vec<u8>, mime_type: impl Into<String>) -> Self {
        Self {
            bytes,
            mime_type: mime_type.into(),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Remote voice id plus the locale the local synthesizer should use
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceProfile {
    pub voice: String,
    pub locale: String,
}

impl VoiceProfile {
    pub fn new(voice: impl Into<String>, locale: impl Into<String>) -> Self {
        Self {
            voice: voice.into(),
            locale: locale.into(),
        }
    }

    pub fn for_language(lang: Language) -> Self {
        Self::new(lang.voice(), lang.locale())
    }
}

/// Remote text-to-speech capability
#[async_trait]
pub trait RemoteSynthesizer: Send + Sync {
    /// Return audio bytes for `text`. An empty clip means nothing to play.
    async fn synthesize(&self, text: &str, voice: &VoiceProfile) -> Result<AudioClip, SynthesisError>;
}

/// Plays synthesized clips on the output device
#[async_trait]
pub trait AudioSink: Send + Sync {
    /// Resolve when the clip has finished playing.
    async fn play(&self, clip: &AudioClip) -> Result<(), PlaybackError>;

    /// Stop playback immediately and clear anything queued.
    fn stop(&self);

    /// Make the sink ready for playback again after `stop`.
    fn resume(&self) {}
}

/// On-device synthesizer used when the remote path fails
#[async_trait]
pub trait LocalSynthesizer: Send + Sync {
    /// Speak `text` and resolve when done.
    async fn speak(&self, text: &str, locale: &str) -> Result<(), LocalSpeechError>;

    /// Interrupt an in-progress `speak`.
    fn stop(&self);
}

/// Result of the synthesis phase
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rendition {
    Remote(AudioClip),
    /// Remote synthesis failed; the reason is kept for logging.
    Fallback(String),
}

/// How a `speak` resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Primary,
    Fallback,
    /// Both paths failed. Nothing was heard.
    Silent(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpeechOutcome {
    Completed(Completion),
    /// Cancelled before completion; no completion is reported.
    Aborted,
}

type SinkFactory = Box<dyn Fn() -> Result<Arc<dyn AudioSink>, PlaybackError> + Send + Sync>;

/// Owns the output context and runs the primary/fallback sequence.
pub struct SpeechOutput {
    remote: Arc<dyn RemoteSynthesizer>,
    local: Arc<dyn LocalSynthesizer>,
    open_sink: SinkFactory,
    sink: Mutex<Option<Arc<dyn AudioSink>>>,
}

impl SpeechOutput {
    /// `open_sink` is called lazily, the first time a clip needs to be played.
    pub fn new(
        remote: Arc<dyn RemoteSynthesizer>,
        local: Arc<dyn LocalSynthesizer>,
        open_sink: impl Fn() -> Result<Arc<dyn AudioSink>, PlaybackError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            remote,
            local,
            open_sink: Box::new(open_sink),
            sink: Mutex::new(None),
        }
    }

    /// Use an already-open sink.
    pub fn with_sink(
        remote: Arc<dyn RemoteSynthesizer>,
        local: Arc<dyn LocalSynthesizer>,
        sink: Arc<dyn AudioSink>,
    ) -> Self {
        Self::new(remote, local, move || Ok(sink.clone()))
    }

    fn slot(&self) -> MutexGuard<'_, Option<Arc<dyn AudioSink>>> {
        self.sink.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn output(&self) -> Result<Arc<dyn AudioSink>, PlaybackError> {
        let mut slot = self.slot();
        if let Some(sink) = slot.as_ref() {
            return Ok(sink.clone());
        }
        let sink = (self.open_sink)()?;
        info!("speech output context created");
        *slot = Some(sink.clone());
        Ok(sink)
    }

    /// Phase one: ask the remote synthesizer for audio.
    pub async fn synthesize(&self, text: &str, voice: &VoiceProfile) -> Rendition {
        match self.remote.synthesize(text, voice).await {
            Ok(clip) => Rendition::Remote(clip),
            Err(e) => {
                warn!(error = %e, "remote synthesis failed, using local voice");
                Rendition::Fallback(e.to_string())
            }
        }
    }

    /// Phase two: play the rendition, falling back to the local synthesizer on failure.
    pub async fn play(
        &self,
        text: &str,
        rendition: Rendition,
        voice: &VoiceProfile,
        cancel: &CancellationToken,
    ) -> SpeechOutcome {
        if cancel.is_cancelled() {
            return SpeechOutcome::Aborted;
        }
        let clip = match rendition {
            Rendition::Remote(clip) => clip,
            Rendition::Fallback(_) => return self.fallback(text, voice, cancel).await,
        };
        if clip.is_empty() {
            debug!("empty clip, nothing to play");
            return SpeechOutcome::Completed(Completion::Primary);
        }
        let sink = match self.output() {
            Ok(sink) => sink,
            Err(e) => {
                warn!(error = %e, "no output context, using local voice");
                return self.fallback(text, voice, cancel).await;
            }
        };

        let played = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                sink.stop();
                return SpeechOutcome::Aborted;
            }
            played = sink.play(&clip) => played,
        };
        match played {
            Ok(()) => SpeechOutcome::Completed(Completion::Primary),
            Err(e) => {
                warn!(error = %e, "playback failed, using local voice");
                sink.stop();
                self.fallback(text, voice, cancel).await
            }
        }
    }

    /// Synthesize and play in one step.
    pub async fn speak(
        &self,
        text: &str,
        voice: &VoiceProfile,
        cancel: &CancellationToken,
    ) -> SpeechOutcome {
        let rendition = tokio::select! {
            biased;
            _ = cancel.cancelled() => return SpeechOutcome::Aborted,
            r = self.synthesize(text, voice) => r,
        };
        self.play(text, rendition, voice, cancel).await
    }

    async fn fallback(
        &self,
        text: &str,
        voice: &VoiceProfile,
        cancel: &CancellationToken,
    ) -> SpeechOutcome {
        let spoken = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.local.stop();
                return SpeechOutcome::Aborted;
            }
            spoken = self.local.speak(text, &voice.locale) => spoken,
        };
        match spoken {
            Ok(()) => SpeechOutcome::Completed(Completion::Fallback),
            Err(e) => {
                warn!(error = %e, "local synthesis failed");
                SpeechOutcome::Completed(Completion::Silent(e.to_string()))
            }
        }
    }

    /// Called on call start.
    pub fn resume(&self) {
        if let Some(sink) = self.slot().as_ref() {
            sink.resume();
        }
    }

    /// Silence both paths immediately.
    pub fn abort(&self) {
        if let Some(sink) = self.slot().as_ref() {
            sink.stop();
        }
        self.local.stop();
    }

    /// Abort and drop the output context.
    pub fn shutdown(&self) {
        self.abort();
        if self.slot().take().is_some() {
            info!("speech output context released");
        }
    }

    pub fn has_output(&self) -> bool {
        self.slot().is_some()
    }
}

#[derive(serde::Serialize)]
struct SpeechRequest<'a> {
    model: &'a str,
    input: &'a str,
    voice: &'a str,
}

/// Production TTS: OpenAI-compatible `/audio/speech`.
#[derive(Debug, Clone)]
pub struct OpenAiSpeech {
    /// Base URL without trailing slash (e.g. https://api.openai.com/v1).
    pub base_url: String,
    pub api_key: String,
    /// tts-1 (fast) or tts-1-hd.
    pub model: String,
    client: reqwest::Client,
}

impl OpenAiSpeech {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Result<Self, SynthesisError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| SynthesisError::Backend(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into(),
            api_key: api_key.into().trim().to_string(),
            model: model.into(),
            client,
        })
    }
}

#[async_trait]
impl RemoteSynthesizer for OpenAiSpeech {
    async fn synthesize(&self, text: &str, voice: &VoiceProfile) -> Result<AudioClip, SynthesisError> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(AudioClip::empty());
        }
        let url = format!("{}/audio/speech", self.base_url.trim_end_matches('/'));
        let body = SpeechRequest {
            model: &self.model,
            input: text,
            voice: &voice.voice,
        };
        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| SynthesisError::Backend(e.to_string()))?;
        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            let message = format!("TTS API error {}: {}", status, body);
            return Err(if is_quota_failure(status.as_u16(), &body) {
                SynthesisError::QuotaExceeded(message)
            } else {
                SynthesisError::Backend(message)
            });
        }
        let bytes = res
            .bytes()
            .await
            .map_err(|e| SynthesisError::Backend(e.to_string()))?;
        Ok(AudioClip::new(bytes.to_vec(), "audio/mpeg"))
    }
}

/// Placeholder TTS: returns empty audio so nothing plays.
#[derive(Debug, Default)]
pub struct PlaceholderSynthesizer;

#[async_trait]
impl RemoteSynthesizer for PlaceholderSynthesizer {
    async fn synthesize(&self, _text: &str, _voice: &VoiceProfile) -> Result<AudioClip, SynthesisError> {
        Ok(AudioClip::empty())
    }
}

/// Sink that discards clips and completes immediately.
#[derive(Debug, Default)]
pub struct NullSink;

#[async_trait]
impl AudioSink for NullSink {
    async fn play(&self, _clip: &AudioClip) -> Result<(), PlaybackError> {
        Ok(())
    }

    fn stop(&self) {}
}

/// Local synthesizer that shells out to an espeak-compatible command.
#[derive(Debug)]
pub struct CommandSynthesizer {
    program: String,
    interrupt: Notify,
}

impl CommandSynthesizer {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            interrupt: Notify::new(),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

impl Default for CommandSynthesizer {
    fn default() -> Self {
        Self::new("espeak-ng")
    }
}

/// espeak voice names: "en-us" for English, the bare language subtag otherwise.
fn espeak_voice(locale: &str) -> String {
    let locale = locale.to_ascii_lowercase().replace('_', "-");
    if locale.starts_with("en") {
        return locale;
    }
    locale.split('-').next().unwrap_or("en").to_string()
}

#[async_trait]
impl LocalSynthesizer for CommandSynthesizer {
    async fn speak(&self, text: &str, locale: &str) -> Result<(), LocalSpeechError> {
        let mut child = Command::new(&self.program)
            .arg("-v")
            .arg(espeak_voice(locale))
            .arg(text)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| LocalSpeechError::EngineUnavailable(format!("{}: {}", self.program, e)))?;

        tokio::select! {
            status = child.wait() => match status {
                Ok(s) if s.success() => Ok(()),
                Ok(s) => Err(LocalSpeechError::EngineUnavailable(format!("{} exited with {}", self.program, s))),
                Err(e) => Err(LocalSpeechError::EngineUnavailable(e.to_string())),
            },
            _ = self.interrupt.notified() => {
                let _ = child.kill().await;
                Ok(())
            }
        }
    }

    fn stop(&self) {
        self.interrupt.notify_waiters();
    }
}

/// HTTP TTS if a key is configured, otherwise the placeholder.
pub fn create_best_synthesizer(backend: &BackendConfig) -> Arc<dyn RemoteSynthesizer> {
    if let Some(key) = backend.resolved_api_key() {
        match OpenAiSpeech::new(&backend.api_base, key, &backend.tts_model) {
            Ok(tts) => {
                info!(model = %backend.tts_model, "using HTTP speech synthesis");
                return Arc::new(tts);
            }
            Err(e) => warn!(error = %e, "HTTP speech synthesis unavailable"),
        }
    }
    Arc::new(PlaceholderSynthesizer)
}
