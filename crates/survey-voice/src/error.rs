//! Error types for the survey call system

use crate::session::{Activity, CallStatus};
use thiserror::Error;

/// Result type alias for orchestrator operations
pub type CallResult<T> = Result<T, CallError>;

/// Errors returned to the caller of a `CallOrchestrator` operation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error("cannot {operation} while call is {status} ({activity})")]
    InvalidState {
        operation: &'static str,
        status: CallStatus,
        activity: Activity,
    },

    #[error("Survey not found: {0}")]
    SurveyNotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<config::ConfigError> for CallError {
    fn from(err: config::ConfigError) -> Self {
        CallError::Config(err.to_string())
    }
}

/// Failures of the capture device
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("Audio device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("A listening window is already open")]
    AlreadyCapturing,

    #[error("No listening window is open for this handle")]
    NotCapturing,
}

/// Failures of the speech-to-text capability
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TranscriptionError {
    #[error("STT error: {0}")]
    Backend(String),

    #[error("STT quota exceeded: {0}")]
    QuotaExceeded(String),
}

/// Failures of the text-generation capability
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GenerationError {
    #[error("Generation quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Generation failed: {0}")]
    Transient(String),
}

/// Failures of the remote speech synthesis capability
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SynthesisError {
    #[error("TTS error: {0}")]
    Backend(String),

    #[error("TTS quota exceeded: {0}")]
    QuotaExceeded(String),
}

/// Audio playback failure
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Audio playback error: {0}")]
pub struct PlaybackError(pub String);

/// Failures of the local fallback synthesizer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LocalSpeechError {
    #[error("Local speech engine unavailable: {0}")]
    EngineUnavailable(String),
}

/// Classify an HTTP failure from an OpenAI-compatible API as a quota condition.
///
/// 402 (payment required) is a quota failure, as is any body that mentions exhausted
/// credits or quota. A plain 429 rate limit is not; it takes the transient path.
pub(crate) fn is_quota_failure(status: u16, body: &str) -> bool {
    if status == 402 {
        return true;
    }
    let body = body.to_ascii_lowercase();
    body.contains("insufficient credits")
        || body.contains("insufficient_quota")
        || body.contains("quota exceeded")
}
