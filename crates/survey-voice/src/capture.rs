//! **AudioCaptureSession**: Exclusive ownership of the recording device.
//!
//! One listening window at a time. `start()` opens the device and returns a handle;
//! `stop(handle)` closes it and yields the encoded audio. `release()` forcibly discards
//! whatever is open and is safe to call any number of times.

use crate::error::CaptureError;
use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info};

/// Audio captured during one listening window
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncodedAudio {
    pub bytes: Vec<u8>,
    /// e.g. "audio/wav"
    pub mime_type: String,
    pub duration: Duration,
}

impl EncodedAudio {
    pub fn new(bytes: Vec<u8>, mime_type: impl Into<String>, duration: Duration) -> Self {
        Self {
            bytes,
            mime_type: mime_type.into(),
            duration,
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// No payload worth transcribing.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// File extension for multipart uploads.
    pub fn file_name(&self) -> &'static str {
        match self.mime_type.as_str() {
            "audio/webm" => "audio.webm",
            "audio/ogg" => "audio.ogg",
            "audio/mpeg" => "audio.mp3",
            _ => "audio.wav",
        }
    }
}

/// An open recording on the device. Dropping it without `finish` must release the device.
#[async_trait]
pub trait Recording: Send {
    /// Stop recording and return what was captured.
    async fn finish(&mut self) -> Result<EncodedAudio, CaptureError>;

    /// Stop recording and throw the audio away.
    fn discard(&mut self);
}

/// Recording device backend
#[async_trait]
pub trait Recorder: Send + Sync {
    async fn open(&self) -> Result<Box<dyn Recording>, CaptureError>;
}

/// Identifies one listening window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CaptureHandle(u64);

impl fmt::Display for CaptureHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "window-{}", self.0)
    }
}

struct OpenWindow {
    handle: CaptureHandle,
    recording: Box<dyn Recording>,
}

/// Device slot. `Opening` reserves the device while `Recorder::open` is in flight.
enum Slot {
    Idle,
    Opening(CaptureHandle),
    Open(OpenWindow),
}

/// Frees an `Opening` reservation if `start` fails or is dropped mid-open.
struct Reservation<'a> {
    slot: &'a StdMutex<Slot>,
    handle: CaptureHandle,
    armed: bool,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut slot = lock(self.slot);
        if matches!(*slot, Slot::Opening(h) if h == self.handle) {
            *slot = Slot::Idle;
        }
    }
}

fn lock(slot: &StdMutex<Slot>) -> MutexGuard<'_, Slot> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Serializes access to a `Recorder`: at most one open window.
///
/// The slot lock is never held across an await, so `release()` stays prompt even
/// while the device is still opening or a recording is being finished.
pub struct AudioCaptureSession {
    recorder: Arc<dyn Recorder>,
    max_window: Duration,
    slot: StdMutex<Slot>,
    next_id: AtomicU64,
}

impl AudioCaptureSession {
    pub fn new(recorder: Arc<dyn Recorder>, max_window: Duration) -> Self {
        Self {
            recorder,
            max_window,
            slot: StdMutex::new(Slot::Idle),
            next_id: AtomicU64::new(1),
        }
    }

    /// Ceiling after which the caller must stop an open window.
    pub fn max_window(&self) -> Duration {
        self.max_window
    }

    pub async fn is_capturing(&self) -> bool {
        !matches!(*lock(&self.slot), Slot::Idle)
    }

    /// Open a listening window.
    ///
    /// Fails with `NotCapturing` if `release()` ran while the device was opening; the
    /// late recording is discarded.
    pub async fn start(&self) -> Result<CaptureHandle, CaptureError> {
        let handle = {
            let mut slot = lock(&self.slot);
            if !matches!(*slot, Slot::Idle) {
                return Err(CaptureError::AlreadyCapturing);
            }
            let handle = CaptureHandle(self.next_id.fetch_add(1, Ordering::Relaxed));
            *slot = Slot::Opening(handle);
            handle
        };
        let mut reservation = Reservation {
            slot: &self.slot,
            handle,
            armed: true,
        };

        let mut recording = self.recorder.open().await?;

        let mut slot = lock(&self.slot);
        reservation.armed = false;
        if !matches!(*slot, Slot::Opening(h) if h == handle) {
            drop(slot);
            recording.discard();
            debug!(%handle, "window released while the device was opening");
            return Err(CaptureError::NotCapturing);
        }
        *slot = Slot::Open(OpenWindow { handle, recording });
        debug!(%handle, "listening window opened");
        Ok(handle)
    }

    /// Close the window identified by `handle` and return its audio.
    pub async fn stop(&self, handle: CaptureHandle) -> Result<EncodedAudio, CaptureError> {
        let mut window = {
            let mut slot = lock(&self.slot);
            match std::mem::replace(&mut *slot, Slot::Idle) {
                Slot::Open(window) if window.handle == handle => window,
                other => {
                    *slot = other;
                    return Err(CaptureError::NotCapturing);
                }
            }
        };
        let audio = window.recording.finish().await?;
        debug!(%handle, bytes = audio.bytes.len(), "listening window closed");
        Ok(audio)
    }

    /// Discard any open or opening window and free the device. Returns whether one was held.
    pub async fn release(&self) -> bool {
        let taken = std::mem::replace(&mut *lock(&self.slot), Slot::Idle);
        match taken {
            Slot::Open(mut window) => {
                window.recording.discard();
                info!(handle = %window.handle, "🎙️ Capture device released");
                true
            }
            Slot::Opening(handle) => {
                info!(%handle, "🎙️ Capture device released while opening");
                true
            }
            Slot::Idle => false,
        }
    }
}

/// Recorder that captures nothing. Every window yields empty audio.
#[derive(Debug, Default)]
pub struct PlaceholderRecorder;

struct PlaceholderRecording;

#[async_trait]
impl Recording for PlaceholderRecording {
    async fn finish(&mut self) -> Result<EncodedAudio, CaptureError> {
        Ok(EncodedAudio::empty())
    }

    fn discard(&mut self) {}
}

#[async_trait]
impl Recorder for PlaceholderRecorder {
    async fn open(&self) -> Result<Box<dyn Recording>, CaptureError> {
        Ok(Box::new(PlaceholderRecording))
    }
}
