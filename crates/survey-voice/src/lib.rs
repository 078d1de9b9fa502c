//! # Survey Voice - Simulated Outbound Survey Calls
//!
//! This crate runs one spoken survey call at a time: a synthetic agent and a human
//! take turns through listening, speech-to-text, dialogue generation and
//! text-to-speech playback. Every step can be cancelled by hanging up.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      Call Orchestrator                        │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐        │
//! │  │   Capture    │→ │ Transcriber  │→ │   Dialogue   │        │
//! │  │ (cpal/none)  │  │  (HTTP STT)  │  │ (chat API)   │        │
//! │  └──────────────┘  └──────────────┘  └──────────────┘        │
//! │         ↑                                    ↓                │
//! │         │          ┌─────────────────────────────────┐        │
//! │         └──────────│ SpeechOutput: HTTP TTS → sink,  │        │
//! │                    │ local fallback (espeak-ng)      │        │
//! │                    └─────────────────────────────────┘        │
//! │   epoch + CancellationToken per call ── status feed (bcast)   │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod capture;
pub mod config;
pub mod dialogue;
pub mod error;
pub mod orchestrator;
pub mod session;
pub mod speech;
pub mod survey;
pub mod transcription;

pub use audio::pcm_f32_to_wav;
#[cfg(feature = "device")]
pub use audio::{CpalRecorder, RodioSink};
pub use capture::{AudioCaptureSession, CaptureHandle, EncodedAudio, PlaceholderRecorder, Recorder, Recording};
pub use config::{AppConfig, BackendConfig, CallConfig};
pub use dialogue::{
    create_best_generator, system_turn, ChatCompletionsGenerator, ConversationTurn, DialogueEngine,
    PlaceholderGenerator, Role, TextGenerator,
};
pub use error::{
    CallError, CallResult, CaptureError, GenerationError, LocalSpeechError, PlaybackError,
    SynthesisError, TranscriptionError,
};
pub use orchestrator::{CallOrchestrator, Capabilities};
pub use session::{Activity, CallSnapshot, CallStatus, Notice, NoticeKind};
pub use speech::{
    create_best_synthesizer, AudioClip, AudioSink, CommandSynthesizer, Completion,
    LocalSynthesizer, NullSink, OpenAiSpeech, PlaceholderSynthesizer, RemoteSynthesizer,
    Rendition, SpeechOutcome, SpeechOutput, VoiceProfile,
};
pub use survey::{InMemoryCatalog, Language, Survey, SurveyCatalog};
pub use transcription::{
    create_best_transcriber, OpenAiTranscriber, PlaceholderTranscriber, Transcriber,
};
