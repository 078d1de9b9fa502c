//! Call Orchestrator - the turn-taking state machine
//!
//! Owns the single call session and drives it through
//! listen → transcribe → generate → synthesize → play → listen.
//! Each call runs on its own task. Every step captures the call epoch when it is
//! scheduled and re-checks it under the session lock before it mutates anything;
//! `end_call` bumps the epoch and cancels the call token, so a stale step either
//! wakes up and exits or finds the epoch changed and drops its result.

use crate::capture::{AudioCaptureSession, EncodedAudio, Recorder};
use crate::config::CallConfig;
use crate::dialogue::{system_turn, ConversationTurn, DialogueEngine, Role, TextGenerator};
use crate::error::{CallError, CallResult, CaptureError, GenerationError, TranscriptionError};
use crate::session::{
    Activity, CallSession, CallSnapshot, CallStatus, ListenCommand, Notice, NoticeKind,
};
use crate::speech::{Completion, SpeechOutcome, SpeechOutput, VoiceProfile};
use crate::survey::{Language, SurveyCatalog};
use crate::transcription::Transcriber;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// The capabilities a call is built from
pub struct Capabilities {
    pub recorder: Arc<dyn Recorder>,
    pub transcriber: Arc<dyn Transcriber>,
    pub generator: Arc<dyn TextGenerator>,
    pub speech: SpeechOutput,
}

/// Handle to the orchestrator. Cheap to clone; all clones drive the same call.
#[derive(Clone)]
pub struct CallOrchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    config: CallConfig,
    surveys: Arc<dyn SurveyCatalog>,
    capture: AudioCaptureSession,
    transcriber: Arc<dyn Transcriber>,
    dialogue: DialogueEngine,
    speech: SpeechOutput,
    // Never held across a device or capability await.
    session: Mutex<CallSession>,
    feed: broadcast::Sender<CallSnapshot>,
}

/// Why the turn loop stopped
enum Halt {
    /// The call was ended or replaced; do nothing more.
    Stale,
    /// The loop decided to end the call.
    Hangup(Notice),
}

/// What the loop does before the next listening window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Next {
    Listen,
    /// Silence pause; a manual start cuts it short.
    Pause,
    /// Wait for `manual_start_listening`.
    Idle,
}

/// Per-call state owned by the driver task
struct CallRun {
    call_id: Uuid,
    epoch: u64,
    cancel: CancellationToken,
    lang: Language,
    voice: VoiceProfile,
    commands: mpsc::UnboundedReceiver<ListenCommand>,
}

impl CallOrchestrator {
    pub fn new(config: CallConfig, surveys: Arc<dyn SurveyCatalog>, caps: Capabilities) -> Self {
        let (feed, _) = broadcast::channel(config.feed_capacity.max(1));
        let capture = AudioCaptureSession::new(caps.recorder, config.listen_window());
        let dialogue = DialogueEngine::new(caps.generator, config.max_tokens);
        Self {
            inner: Arc::new(Inner {
                config,
                surveys,
                capture,
                transcriber: caps.transcriber,
                dialogue,
                speech: caps.speech,
                session: Mutex::new(CallSession::idle()),
                feed,
            }),
        }
    }

    /// Status feed. Every state change is delivered in order, starting after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<CallSnapshot> {
        self.inner.feed.subscribe()
    }

    pub async fn snapshot(&self) -> CallSnapshot {
        self.inner.session.lock().await.snapshot()
    }

    /// Dial the respondent for `survey_id`. Returns the new call id.
    pub async fn start_call(&self, survey_id: &str) -> CallResult<Uuid> {
        let inner = &self.inner;
        let mut session = inner.session.lock().await;
        if session.status.is_live() {
            return Err(session.invalid("start a call"));
        }
        let survey = inner
            .surveys
            .find(survey_id)
            .ok_or_else(|| CallError::SurveyNotFound(survey_id.to_string()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = session.begin(&survey.id, system_turn(&survey), tx);
        let lang = survey.lang();
        let run = CallRun {
            call_id: session.id,
            epoch: session.epoch,
            cancel,
            lang,
            voice: VoiceProfile::for_language(lang),
            commands: rx,
        };
        inner.speech.resume();
        inner.publish(&session);
        drop(session);

        info!(call_id = %run.call_id, epoch = run.epoch, survey = %survey.id, "📞 Dialing respondent");
        let call_id = run.call_id;
        tokio::spawn(inner.clone().drive(run));
        Ok(call_id)
    }

    /// Hang up. Safe to call in any state and any number of times.
    pub async fn end_call(&self) {
        let inner = &self.inner;
        let mut session = inner.session.lock().await;
        let changed = session.status != CallStatus::Terminated || session.activity != Activity::None;
        session.terminate();
        let released = inner.capture.release().await;
        inner.speech.abort();
        if changed {
            info!(call_id = %session.id, epoch = session.epoch, released, "📴 Call ended");
            inner.publish(&session);
        }
    }

    /// Open a listening window now. Only while connected and idle.
    pub async fn manual_start_listening(&self) -> CallResult<()> {
        let session = self.inner.session.lock().await;
        if session.status != CallStatus::Connected || session.activity != Activity::None {
            return Err(session.invalid("start listening"));
        }
        if let Some(tx) = session.commands.as_ref() {
            let _ = tx.send(ListenCommand::Start);
        }
        Ok(())
    }

    /// Close the open listening window now.
    pub async fn manual_stop_listening(&self) -> CallResult<()> {
        let session = self.inner.session.lock().await;
        if session.status != CallStatus::Connected || session.activity != Activity::Capturing {
            return Err(session.invalid("stop listening"));
        }
        if let Some(tx) = session.commands.as_ref() {
            let _ = tx.send(ListenCommand::Stop);
        }
        Ok(())
    }

    /// End any call and release the speech output context.
    pub async fn shutdown(&self) {
        self.end_call().await;
        self.inner.speech.shutdown();
    }
}

impl Inner {
    fn publish(&self, session: &CallSession) {
        // No subscribers is fine.
        let _ = self.feed.send(session.snapshot());
    }

    /// Apply `f` to the session if `epoch` is still the live call, and publish.
    async fn commit<T>(
        &self,
        epoch: u64,
        f: impl FnOnce(&mut CallSession) -> T,
    ) -> Result<T, Halt> {
        let mut session = self.session.lock().await;
        if session.epoch != epoch || !session.status.is_live() {
            return Err(Halt::Stale);
        }
        let out = f(&mut session);
        self.publish(&session);
        Ok(out)
    }

    async fn drive(self: Arc<Self>, mut run: CallRun) {
        match self.run_call(&mut run).await {
            Ok(()) | Err(Halt::Stale) => {
                debug!(call_id = %run.call_id, epoch = run.epoch, "call driver stopped");
            }
            Err(Halt::Hangup(notice)) => self.hang_up(&run, notice).await,
        }
    }

    async fn hang_up(&self, run: &CallRun, notice: Notice) {
        let mut session = self.session.lock().await;
        if session.epoch != run.epoch {
            return;
        }
        error!(call_id = %run.call_id, kind = ?notice.kind, "{}", notice.message);
        session.caption = notice.message.clone();
        session.notice = Some(notice);
        session.terminate();
        self.capture.release().await;
        self.speech.abort();
        self.publish(&session);
    }

    async fn run_call(&self, run: &mut CallRun) -> Result<(), Halt> {
        self.wait(run, self.config.connect_delay()).await?;
        self.commit(run.epoch, |s| {
            s.status = CallStatus::Connected;
            s.caption = "Connected".to_string();
        })
        .await?;
        info!(call_id = %run.call_id, epoch = run.epoch, "✅ Call connected");

        let history = self.commit(run.epoch, begin_generating).await?;
        let mut next = self.agent_turn(run, history, run.lang.opening_prompt()).await?;
        loop {
            match next {
                Next::Listen => {}
                Next::Pause => self.pause(run).await?,
                Next::Idle => self.await_start(run).await?,
            }
            let audio = self.listen(run).await?;
            next = self.handle_utterance(run, audio).await?;
        }
    }

    async fn wait(&self, run: &CallRun, duration: Duration) -> Result<(), Halt> {
        tokio::select! {
            biased;
            _ = run.cancel.cancelled() => Err(Halt::Stale),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    async fn pause(&self, run: &mut CallRun) -> Result<(), Halt> {
        let sleep = tokio::time::sleep(self.config.silence_pause());
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                biased;
                _ = run.cancel.cancelled() => return Err(Halt::Stale),
                cmd = run.commands.recv() => match cmd {
                    Some(ListenCommand::Start) => return Ok(()),
                    Some(ListenCommand::Stop) => continue,
                    None => return Err(Halt::Stale),
                },
                _ = &mut sleep => return Ok(()),
            }
        }
    }

    async fn await_start(&self, run: &mut CallRun) -> Result<(), Halt> {
        debug!(call_id = %run.call_id, "waiting for manual start");
        loop {
            tokio::select! {
                biased;
                _ = run.cancel.cancelled() => return Err(Halt::Stale),
                cmd = run.commands.recv() => match cmd {
                    Some(ListenCommand::Start) => return Ok(()),
                    Some(ListenCommand::Stop) => continue,
                    None => return Err(Halt::Stale),
                },
            }
        }
    }

    /// Open a window, wait for a manual stop or the ceiling, and close it.
    ///
    /// The session lock is not held while the device opens or finishes, so `end_call`
    /// stays prompt on a slow microphone.
    async fn listen(&self, run: &mut CallRun) -> Result<EncodedAudio, Halt> {
        // Commands issued before this window opened do not apply to it.
        while run.commands.try_recv().is_ok() {}
        let started = tokio::select! {
            biased;
            _ = run.cancel.cancelled() => return Err(Halt::Stale),
            r = self.capture.start() => r,
        };
        let handle = match started {
            Ok(handle) => handle,
            Err(_) if run.cancel.is_cancelled() => return Err(Halt::Stale),
            Err(e) => {
                if e == CaptureError::AlreadyCapturing {
                    self.capture.release().await;
                }
                return Err(device_unavailable(e));
            }
        };
        let opened = self
            .commit(run.epoch, |s| {
                s.activity = Activity::Capturing;
                s.caption = "Listening...".to_string();
            })
            .await;
        if let Err(halt) = opened {
            self.capture.release().await;
            return Err(halt);
        }
        debug!(call_id = %run.call_id, %handle, "listening");

        let ceiling = tokio::time::sleep(self.capture.max_window());
        tokio::pin!(ceiling);
        loop {
            tokio::select! {
                biased;
                _ = run.cancel.cancelled() => return Err(Halt::Stale),
                cmd = run.commands.recv() => match cmd {
                    Some(ListenCommand::Stop) => break,
                    Some(ListenCommand::Start) => continue,
                    None => return Err(Halt::Stale),
                },
                _ = &mut ceiling => {
                    debug!(call_id = %run.call_id, "listening window reached its ceiling");
                    break;
                }
            }
        }

        let stopped = tokio::select! {
            biased;
            _ = run.cancel.cancelled() => return Err(Halt::Stale),
            r = self.capture.stop(handle) => r,
        };
        let audio = match stopped {
            Ok(audio) => audio,
            // end_call already released the device.
            Err(_) if run.cancel.is_cancelled() => return Err(Halt::Stale),
            Err(e) => {
                self.capture.release().await;
                return Err(device_unavailable(e));
            }
        };
        // An empty window is published once, by the silence path.
        if !audio.is_empty() {
            self.commit(run.epoch, |s| {
                s.activity = Activity::Transcribing;
                s.caption = "Transcribing...".to_string();
            })
            .await?;
        }
        Ok(audio)
    }

    async fn handle_utterance(&self, run: &CallRun, audio: EncodedAudio) -> Result<Next, Halt> {
        if audio.is_empty() {
            debug!(call_id = %run.call_id, "empty window, skipping transcription");
            return self.silence(run).await;
        }

        let transcribed = tokio::select! {
            biased;
            _ = run.cancel.cancelled() => return Err(Halt::Stale),
            r = self.transcriber.transcribe(&audio, run.lang.code()) => r,
        };
        let text = match transcribed {
            Ok(text) => text,
            Err(TranscriptionError::QuotaExceeded(e)) => {
                warn!(call_id = %run.call_id, error = %e, "transcription quota exceeded");
                return self.recover(run, Notice::quota()).await;
            }
            Err(TranscriptionError::Backend(e)) => {
                warn!(call_id = %run.call_id, error = %e, "transcription failed");
                return self.recover(run, Notice::transcription_failed()).await;
            }
        };
        let text = text.trim();
        if text.is_empty() {
            return self.silence(run).await;
        }

        debug!(call_id = %run.call_id, chars = text.len(), "respondent spoke");
        let history = self
            .commit(run.epoch, |s| {
                let before = s.history.clone();
                s.history.push(ConversationTurn::new(Role::User, text));
                s.caption = text.to_string();
                s.silence_retries = 0;
                s.activity = Activity::Generating;
                before
            })
            .await?;
        self.agent_turn(run, history, text).await
    }

    /// Generate, synthesize and play the agent's reply to `prompt`.
    /// `history` is the log without `prompt`.
    async fn agent_turn(
        &self,
        run: &CallRun,
        history: Vec<ConversationTurn>,
        prompt: &str,
    ) -> Result<Next, Halt> {
        let reply = tokio::select! {
            biased;
            _ = run.cancel.cancelled() => return Err(Halt::Stale),
            r = self.dialogue.next_turn(&history, prompt) => r,
        };
        let text = match reply {
            Ok(text) => text,
            Err(GenerationError::QuotaExceeded(e)) => {
                warn!(call_id = %run.call_id, error = %e, "generation quota exceeded");
                return self.recover(run, Notice::quota()).await;
            }
            Err(GenerationError::Transient(e)) => {
                warn!(call_id = %run.call_id, error = %e, "generation failed");
                return self.recover(run, Notice::generation_failed()).await;
            }
        };

        self.commit(run.epoch, |s| {
            s.history.push(ConversationTurn::new(Role::Agent, text.as_str()));
            s.quota_failures = 0;
            s.activity = Activity::Synthesizing;
        })
        .await?;

        let rendition = tokio::select! {
            biased;
            _ = run.cancel.cancelled() => return Err(Halt::Stale),
            r = self.speech.synthesize(&text, &run.voice) => r,
        };
        self.commit(run.epoch, |s| s.activity = Activity::Playing).await?;

        match self.speech.play(&text, rendition, &run.voice, &run.cancel).await {
            SpeechOutcome::Aborted => Err(Halt::Stale),
            SpeechOutcome::Completed(Completion::Silent(reason)) => Err(Halt::Hangup(Notice::new(
                NoticeKind::SpeechUnavailable,
                format!("Speech output unavailable: {}", reason),
            ))),
            SpeechOutcome::Completed(completion) => {
                debug!(call_id = %run.call_id, ?completion, "agent finished speaking");
                self.commit(run.epoch, |s| s.activity = Activity::None).await?;
                Ok(self.after_turn())
            }
        }
    }

    /// Count a silent window; past the ceiling the call is over.
    async fn silence(&self, run: &CallRun) -> Result<Next, Halt> {
        let max = self.config.max_silence_retries;
        let retries = self
            .commit(run.epoch, |s| {
                s.activity = Activity::None;
                s.silence_retries += 1;
                s.caption = "Silence detected. Try again.".to_string();
                s.silence_retries
            })
            .await?;
        if retries > max {
            return Err(Halt::Hangup(Notice::no_response()));
        }
        debug!(call_id = %run.call_id, retries, max, "silence, reopening");
        Ok(Next::Pause)
    }

    /// Abort the failed turn and go back to listening, unless quota failures pile up.
    async fn recover(&self, run: &CallRun, notice: Notice) -> Result<Next, Halt> {
        let max = self.config.max_quota_failures;
        let quota = notice.kind == NoticeKind::QuotaExceeded;
        let exhausted = self
            .commit(run.epoch, |s| {
                s.activity = Activity::None;
                s.caption = notice.message.clone();
                s.notice = Some(notice.clone());
                if quota {
                    s.quota_failures += 1;
                }
                quota && max > 0 && s.quota_failures >= max
            })
            .await?;
        if exhausted {
            return Err(Halt::Hangup(notice));
        }
        Ok(self.after_turn())
    }

    fn after_turn(&self) -> Next {
        if self.config.auto_listen {
            Next::Listen
        } else {
            Next::Idle
        }
    }
}

fn device_unavailable(e: CaptureError) -> Halt {
    Halt::Hangup(Notice::new(
        NoticeKind::DeviceUnavailable,
        format!("Microphone unavailable: {}", e),
    ))
}

/// Move to Generating for the opening turn and hand back the history so far.
fn begin_generating(session: &mut CallSession) -> Vec<ConversationTurn> {
    session.activity = Activity::Generating;
    session.caption = "Thinking...".to_string();
    session.history.clone()
}
