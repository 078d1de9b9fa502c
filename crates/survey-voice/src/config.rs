//! Configuration for the call orchestrator and its HTTP backends.
//!
//! Priority (highest first):
//! 1. Environment variables: `SURVEY_VOICE__CALL__LISTEN_WINDOW_MS=8000`,
//!    `SURVEY_VOICE__BACKEND__API_KEY=...`
//! 2. TOML file at `SURVEY_VOICE_CONFIG` (default `config/survey-voice.toml`), if present
//! 3. Built-in defaults

use crate::error::{CallError, CallResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub call: CallConfig,
    pub backend: BackendConfig,
    /// TOML file of `[[surveys]]` read by the CLI.
    pub surveys_path: PathBuf,
}

/// Turn-taking timings and retry policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// Simulated ring time between Dialing and Connected.
    pub connect_delay_ms: u64,
    /// A listening window stops on its own after this long.
    pub listen_window_ms: u64,
    /// Pause before reopening the window after silence.
    pub silence_pause_ms: u64,
    /// Silent windows tolerated before the call is ended. The next one hangs up.
    pub max_silence_retries: u32,
    /// Consecutive quota failures that end the call.
    pub max_quota_failures: u32,
    /// Token budget per agent turn.
    pub max_tokens: u32,
    /// Open the next listening window as soon as the agent stops speaking.
    pub auto_listen: bool,
    /// Buffered snapshots per status feed subscriber.
    pub feed_capacity: usize,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            connect_delay_ms: 2000,
            listen_window_ms: 6000,
            silence_pause_ms: 1500,
            max_silence_retries: 3,
            max_quota_failures: 2,
            max_tokens: 150,
            auto_listen: true,
            feed_capacity: 64,
        }
    }
}

impl CallConfig {
    pub fn connect_delay(&self) -> Duration {
        Duration::from_millis(self.connect_delay_ms)
    }

    pub fn listen_window(&self) -> Duration {
        Duration::from_millis(self.listen_window_ms)
    }

    pub fn silence_pause(&self) -> Duration {
        Duration::from_millis(self.silence_pause_ms)
    }
}

/// OpenAI-compatible API endpoints and models
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Base URL without trailing slash.
    pub api_base: String,
    /// Falls back to `OPENAI_API_KEY` when unset.
    pub api_key: Option<String>,
    pub chat_model: String,
    pub stt_model: String,
    pub tts_model: String,
    /// Program used for local fallback speech.
    pub local_tts_command: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.openai.com/v1".to_string(),
            api_key: None,
            chat_model: "gpt-4o-mini".to_string(),
            stt_model: "whisper-1".to_string(),
            tts_model: "tts-1".to_string(),
            local_tts_command: "espeak-ng".to_string(),
        }
    }
}

impl BackendConfig {
    /// Configured key, else `OPENAI_API_KEY`. Blank values count as unset.
    pub fn resolved_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
    }
}

impl AppConfig {
    /// Load defaults, then the optional TOML file, then environment overrides.
    pub fn load() -> CallResult<Self> {
        let path = std::env::var("SURVEY_VOICE_CONFIG")
            .unwrap_or_else(|_| "config/survey-voice.toml".to_string());
        Self::load_from(&path)
    }

    pub fn load_from(path: &str) -> CallResult<Self> {
        let built = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name(path).required(false))
            .add_source(
                config::Environment::with_prefix("SURVEY_VOICE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        let cfg: AppConfig = built.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> CallResult<()> {
        if self.call.listen_window_ms == 0 {
            return Err(CallError::Config("listen_window_ms must be greater than 0".to_string()));
        }
        if self.call.max_tokens == 0 {
            return Err(CallError::Config("max_tokens must be greater than 0".to_string()));
        }
        if self.call.feed_capacity == 0 {
            return Err(CallError::Config("feed_capacity must be greater than 0".to_string()));
        }
        if self.backend.api_base.trim().is_empty() {
            return Err(CallError::Config("backend.api_base cannot be empty".to_string()));
        }
        Ok(())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            call: CallConfig::default(),
            backend: BackendConfig::default(),
            surveys_path: PathBuf::from("config/surveys.toml"),
        }
    }
}
