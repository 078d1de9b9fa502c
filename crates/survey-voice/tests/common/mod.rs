//! Scripted capabilities for driving the orchestrator in tests.
//!
//! Every fake pops its next result from a queue and falls back to a default once the
//! queue is empty. Setting `pending` makes the call hang until the call is cancelled.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use survey_voice::{
    AudioClip, AudioSink, CallConfig, CallOrchestrator, CallSnapshot, Capabilities, CaptureError,
    ConversationTurn, EncodedAudio, GenerationError, InMemoryCatalog, LocalSpeechError,
    LocalSynthesizer, PlaybackError, Recorder, Recording, RemoteSynthesizer, SpeechOutput, Survey,
    SynthesisError, TextGenerator, Transcriber, TranscriptionError, VoiceProfile,
};
use tokio::sync::broadcast;

fn pop<T>(queue: &Mutex<VecDeque<T>>) -> Option<T> {
    queue.lock().unwrap().pop_front()
}

pub fn speech_audio() -> EncodedAudio {
    EncodedAudio::new(vec![1, 2, 3, 4], "audio/wav", Duration::from_secs(2))
}

#[derive(Default)]
pub struct ScriptedRecorder {
    windows: Mutex<VecDeque<Result<EncodedAudio, CaptureError>>>,
    pub opened: AtomicUsize,
    pub finished: AtomicUsize,
    pub discarded: Arc<AtomicUsize>,
    pub pending: AtomicBool,
}

impl ScriptedRecorder {
    pub fn push(&self, window: Result<EncodedAudio, CaptureError>) {
        self.windows.lock().unwrap().push_back(window);
    }

    pub fn push_speech(&self) {
        self.push(Ok(speech_audio()));
    }
}

struct ScriptedRecording {
    audio: EncodedAudio,
    discarded: Arc<AtomicUsize>,
}

#[async_trait]
impl Recording for ScriptedRecording {
    async fn finish(&mut self) -> Result<EncodedAudio, CaptureError> {
        Ok(std::mem::take(&mut self.audio))
    }

    fn discard(&mut self) {
        self.discarded.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Recorder for ScriptedRecorder {
    async fn open(&self) -> Result<Box<dyn Recording>, CaptureError> {
        if self.pending.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let audio = pop(&self.windows).unwrap_or(Ok(EncodedAudio::empty()))?;
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedRecording {
            audio,
            discarded: self.discarded.clone(),
        }))
    }
}

#[derive(Default)]
pub struct ScriptedTranscriber {
    replies: Mutex<VecDeque<Result<String, TranscriptionError>>>,
    pub calls: AtomicUsize,
    pub languages: Mutex<Vec<String>>,
    pub pending: AtomicBool,
}

impl ScriptedTranscriber {
    pub fn push(&self, reply: Result<String, TranscriptionError>) {
        self.replies.lock().unwrap().push_back(reply);
    }
}

#[async_trait]
impl Transcriber for ScriptedTranscriber {
    async fn transcribe(
        &self,
        _audio: &EncodedAudio,
        language: &str,
    ) -> Result<String, TranscriptionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.languages.lock().unwrap().push(language.to_string());
        if self.pending.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        pop(&self.replies).unwrap_or(Ok(String::new()))
    }
}

#[derive(Default)]
pub struct ScriptedGenerator {
    replies: Mutex<VecDeque<Result<String, GenerationError>>>,
    pub requests: Mutex<Vec<Vec<ConversationTurn>>>,
    pub pending: AtomicBool,
}

impl ScriptedGenerator {
    pub fn push(&self, reply: Result<String, GenerationError>) {
        self.replies.lock().unwrap().push_back(reply);
    }

    pub fn request(&self, i: usize) -> Vec<ConversationTurn> {
        self.requests.lock().unwrap()[i].clone()
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl TextGenerator for ScriptedGenerator {
    async fn generate(
        &self,
        turns: &[ConversationTurn],
        _max_tokens: u32,
    ) -> Result<String, GenerationError> {
        self.requests.lock().unwrap().push(turns.to_vec());
        if self.pending.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        pop(&self.replies).unwrap_or_else(|| Ok("Thank you for your time.".to_string()))
    }
}

#[derive(Default)]
pub struct ScriptedSynth {
    replies: Mutex<VecDeque<Result<AudioClip, SynthesisError>>>,
    pub calls: AtomicUsize,
    pub voices: Mutex<Vec<String>>,
    pub pending: AtomicBool,
}

impl ScriptedSynth {
    pub fn push(&self, reply: Result<AudioClip, SynthesisError>) {
        self.replies.lock().unwrap().push_back(reply);
    }

    pub fn fail_always(&self, times: usize) {
        for _ in 0..times {
            self.push(Err(SynthesisError::Backend("tts down".to_string())));
        }
    }
}

#[async_trait]
impl RemoteSynthesizer for ScriptedSynth {
    async fn synthesize(&self, _text: &str, voice: &VoiceProfile) -> Result<AudioClip, SynthesisError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.voices.lock().unwrap().push(voice.voice.clone());
        if self.pending.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        pop(&self.replies).unwrap_or_else(|| Ok(AudioClip::new(vec![9; 8], "audio/mpeg")))
    }
}

#[derive(Default)]
pub struct FakeSink {
    pub played: AtomicUsize,
    pub stopped: AtomicUsize,
    pub resumed: AtomicUsize,
    pub pending: AtomicBool,
    pub fail: AtomicBool,
}

#[async_trait]
impl AudioSink for FakeSink {
    async fn play(&self, _clip: &AudioClip) -> Result<(), PlaybackError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(PlaybackError("device lost".to_string()));
        }
        if self.pending.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
        self.played.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) {
        self.stopped.fetch_add(1, Ordering::SeqCst);
    }

    fn resume(&self) {
        self.resumed.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct FakeLocal {
    pub spoken: AtomicUsize,
    pub stopped: AtomicUsize,
    pub locales: Mutex<Vec<String>>,
    pub fail: AtomicBool,
}

#[async_trait]
impl LocalSynthesizer for FakeLocal {
    async fn speak(&self, _text: &str, locale: &str) -> Result<(), LocalSpeechError> {
        self.spoken.fetch_add(1, Ordering::SeqCst);
        self.locales.lock().unwrap().push(locale.to_string());
        if self.fail.load(Ordering::SeqCst) {
            return Err(LocalSpeechError::EngineUnavailable("espeak-ng missing".to_string()));
        }
        Ok(())
    }

    fn stop(&self) {
        self.stopped.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct Harness {
    pub orch: CallOrchestrator,
    pub recorder: Arc<ScriptedRecorder>,
    pub transcriber: Arc<ScriptedTranscriber>,
    pub generator: Arc<ScriptedGenerator>,
    pub synth: Arc<ScriptedSynth>,
    pub sink: Arc<FakeSink>,
    pub local: Arc<FakeLocal>,
}

pub fn test_config() -> CallConfig {
    CallConfig {
        feed_capacity: 1024,
        ..CallConfig::default()
    }
}

pub fn catalog() -> InMemoryCatalog {
    InMemoryCatalog::new([
        Survey::new("s1", "Satisfaction", "Ask about satisfaction", "en"),
        Survey::new("es1", "Encuesta", "Pregunta por el servicio", "es"),
    ])
}

impl Harness {
    pub fn new(config: CallConfig) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("survey_voice=debug")
            .with_test_writer()
            .try_init();
        let recorder = Arc::new(ScriptedRecorder::default());
        let transcriber = Arc::new(ScriptedTranscriber::default());
        let generator = Arc::new(ScriptedGenerator::default());
        let synth = Arc::new(ScriptedSynth::default());
        let sink = Arc::new(FakeSink::default());
        let local = Arc::new(FakeLocal::default());
        let caps = Capabilities {
            recorder: recorder.clone(),
            transcriber: transcriber.clone(),
            generator: generator.clone(),
            speech: SpeechOutput::with_sink(synth.clone(), local.clone(), sink.clone()),
        };
        let orch = CallOrchestrator::new(config, Arc::new(catalog()), caps);
        Self {
            orch,
            recorder,
            transcriber,
            generator,
            synth,
            sink,
            local,
        }
    }
}

/// Read the feed until `pred` matches.
pub async fn wait_for(
    rx: &mut broadcast::Receiver<CallSnapshot>,
    pred: impl Fn(&CallSnapshot) -> bool,
) -> CallSnapshot {
    collect_until(rx, pred).await.pop().unwrap()
}

/// Every snapshot up to and including the first one matching `pred`.
pub async fn collect_until(
    rx: &mut broadcast::Receiver<CallSnapshot>,
    pred: impl Fn(&CallSnapshot) -> bool,
) -> Vec<CallSnapshot> {
    let mut seen = Vec::new();
    tokio::time::timeout(Duration::from_secs(3600), async {
        loop {
            let snap = rx.recv().await.expect("status feed closed or lagged");
            let done = pred(&snap);
            seen.push(snap);
            if done {
                return;
            }
        }
    })
    .await
    .expect("timed out waiting for a matching snapshot");
    seen
}

/// Activities in order with consecutive repeats collapsed.
pub fn activity_trace(snaps: &[CallSnapshot]) -> Vec<survey_voice::Activity> {
    let mut trace: Vec<survey_voice::Activity> = Vec::new();
    for s in snaps {
        if trace.last() != Some(&s.activity) {
            trace.push(s.activity);
        }
    }
    trace
}

/// Let spawned tasks run and timers fire for `d` of virtual time.
pub async fn idle(d: Duration) {
    tokio::time::sleep(d).await;
}
