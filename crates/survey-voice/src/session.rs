//! Call session state: lifecycle status, turn activity, and the snapshot fed to observers.

use crate::dialogue::ConversationTurn;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Lifecycle status of the call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Idle,
    Dialing,
    Connected,
    Terminated,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Idle => "idle",
            CallStatus::Dialing => "dialing",
            CallStatus::Connected => "connected",
            CallStatus::Terminated => "terminated",
        }
    }

    /// Dialing and Connected are the only states that hold the call line.
    pub fn is_live(&self) -> bool {
        matches!(self, CallStatus::Dialing | CallStatus::Connected)
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sub-step of the turn cycle. Orthogonal to `CallStatus`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Activity {
    None,
    Capturing,
    Transcribing,
    Generating,
    Synthesizing,
    Playing,
}

impl Activity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Activity::None => "none",
            Activity::Capturing => "capturing",
            Activity::Transcribing => "transcribing",
            Activity::Generating => "generating",
            Activity::Synthesizing => "synthesizing",
            Activity::Playing => "playing",
        }
    }
}

impl fmt::Display for Activity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Category of an operator-visible notice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    /// Billing/credits condition on one of the AI capabilities.
    QuotaExceeded,
    TranscriptionFailed,
    GenerationFailed,
    /// Silence retry ceiling reached.
    NoResponse,
    DeviceUnavailable,
    SpeechUnavailable,
}

/// Operator-visible notice raised by the turn cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notice {
    pub kind: NoticeKind,
    pub message: String,
    pub raised_at: DateTime<Utc>,
}

impl Notice {
    pub fn new(kind: NoticeKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            raised_at: Utc::now(),
        }
    }

    pub fn quota() -> Self {
        Self::new(
            NoticeKind::QuotaExceeded,
            "AI credits exhausted. Add credits to continue the survey.",
        )
    }

    pub fn transcription_failed() -> Self {
        Self::new(NoticeKind::TranscriptionFailed, "Transcription failed.")
    }

    pub fn generation_failed() -> Self {
        Self::new(NoticeKind::GenerationFailed, "AI processing failed.")
    }

    pub fn no_response() -> Self {
        Self::new(
            NoticeKind::NoResponse,
            "No response from the respondent. Ending the call.",
        )
    }
}

/// Immutable view of the call emitted on every state change
#[derive(Debug, Clone, Serialize)]
pub struct CallSnapshot {
    pub call_id: Uuid,
    pub survey_id: Option<String>,
    pub status: CallStatus,
    pub activity: Activity,
    /// Live caption line (listening prompt, latest transcription, silence hint).
    pub transcript_so_far: String,
    pub history: Vec<ConversationTurn>,
    pub notice: Option<Notice>,
    /// Consecutive silent windows in this call.
    pub silence_retries: u32,
    pub epoch: u64,
    pub started_at: Option<DateTime<Utc>>,
}

/// Manual listening commands forwarded from the operator to the running call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ListenCommand {
    Start,
    Stop,
}

/// The single live call. Owned by the orchestrator behind its session lock.
pub(crate) struct CallSession {
    pub id: Uuid,
    pub survey_id: Option<String>,
    pub status: CallStatus,
    pub activity: Activity,
    pub history: Vec<ConversationTurn>,
    pub epoch: u64,
    pub caption: String,
    pub silence_retries: u32,
    pub quota_failures: u32,
    pub notice: Option<Notice>,
    pub started_at: Option<DateTime<Utc>>,
    pub cancel: CancellationToken,
    pub commands: Option<mpsc::UnboundedSender<ListenCommand>>,
}

impl CallSession {
    pub fn idle() -> Self {
        Self {
            id: Uuid::nil(),
            survey_id: None,
            status: CallStatus::Idle,
            activity: Activity::None,
            history: Vec::new(),
            epoch: 0,
            caption: String::new(),
            silence_retries: 0,
            quota_failures: 0,
            notice: None,
            started_at: None,
            cancel: CancellationToken::new(),
            commands: None,
        }
    }

    /// Replace the previous call with a fresh one in `Dialing`. Bumps the epoch.
    pub fn begin(
        &mut self,
        survey_id: &str,
        system_turn: ConversationTurn,
        commands: mpsc::UnboundedSender<ListenCommand>,
    ) -> CancellationToken {
        self.epoch += 1;
        self.id = Uuid::new_v4();
        self.survey_id = Some(survey_id.to_string());
        self.status = CallStatus::Dialing;
        self.activity = Activity::None;
        self.history = vec![system_turn];
        self.caption = "Establishing connection...".to_string();
        self.silence_retries = 0;
        self.quota_failures = 0;
        self.notice = None;
        self.started_at = Some(Utc::now());
        self.cancel = CancellationToken::new();
        self.commands = Some(commands);
        self.cancel.clone()
    }

    /// Move to `Terminated`, invalidate in-flight steps, and wake them up.
    pub fn terminate(&mut self) {
        self.status = CallStatus::Terminated;
        self.activity = Activity::None;
        self.epoch += 1;
        self.cancel.cancel();
        self.commands = None;
    }

    pub fn invalid(&self, operation: &'static str) -> crate::error::CallError {
        crate::error::CallError::InvalidState {
            operation,
            status: self.status,
            activity: self.activity,
        }
    }

    pub fn snapshot(&self) -> CallSnapshot {
        CallSnapshot {
            call_id: self.id,
            survey_id: self.survey_id.clone(),
            status: self.status,
            activity: self.activity,
            transcript_so_far: self.caption.clone(),
            history: self.history.clone(),
            notice: self.notice.clone(),
            silence_retries: self.silence_retries,
            epoch: self.epoch,
            started_at: self.started_at,
        }
    }
}
