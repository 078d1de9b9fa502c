//! Audio device backends using CPAL and Rodio
//!
//! WAV encoding is always available. The microphone recorder and speaker sink need
//! the `device` feature (ALSA/CoreAudio/WASAPI).

use std::time::Duration;

/// Encode f32 PCM (mono) to 16-bit WAV bytes for API upload.
pub fn pcm_f32_to_wav(samples: &[f32], sample_rate: u32) -> Vec<u8> {
    let data_len = (samples.len() * 2) as u32;
    let mut buf = Vec::with_capacity(44 + data_len as usize);
    // RIFF header
    buf.extend_from_slice(b"RIFF");
    buf.extend_from_slice(&(36 + data_len).to_le_bytes());
    buf.extend_from_slice(b"WAVE");
    // fmt subchunk
    buf.extend_from_slice(b"fmt ");
    buf.extend_from_slice(&16u32.to_le_bytes());
    buf.extend_from_slice(&1u16.to_le_bytes()); // PCM
    buf.extend_from_slice(&1u16.to_le_bytes()); // mono
    buf.extend_from_slice(&sample_rate.to_le_bytes());
    buf.extend_from_slice(&(sample_rate * 2).to_le_bytes()); // byte rate
    buf.extend_from_slice(&2u16.to_le_bytes()); // block align
    buf.extend_from_slice(&16u16.to_le_bytes()); // bits per sample
    // data subchunk
    buf.extend_from_slice(b"data");
    buf.extend_from_slice(&data_len.to_le_bytes());
    for &s in samples {
        let i = (s.clamp(-1.0, 1.0) * 32767.0).round() as i16;
        buf.extend_from_slice(&i.to_le_bytes());
    }
    buf
}

/// Duration of `samples` mono frames at `sample_rate`.
pub fn pcm_duration(samples: usize, sample_rate: u32) -> Duration {
    if sample_rate == 0 {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(samples as f64 / sample_rate as f64)
}

#[cfg(feature = "device")]
pub use device::{CpalRecorder, RodioSink};

#[cfg(feature = "device")]
mod device {
    use super::{pcm_duration, pcm_f32_to_wav};
    use crate::capture::{EncodedAudio, Recorder, Recording};
    use crate::error::{CaptureError, PlaybackError};
    use crate::speech::{AudioClip, AudioSink};
    use async_trait::async_trait;
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use rodio::{OutputStream, Sink, Source};
    use std::io::Cursor;
    use std::sync::{mpsc, Arc, Mutex};
    use std::thread;
    use tokio::sync::oneshot;
    use tracing::{info, warn};

    /// Microphone recorder on the default input device.
    ///
    /// Each window owns a dedicated thread that keeps the (non-Send) cpal stream alive
    /// until the window is finished or discarded.
    #[derive(Debug, Default)]
    pub struct CpalRecorder;

    struct CpalRecording {
        samples: Arc<Mutex<Vec<f32>>>,
        sample_rate: u32,
        stop_tx: Option<mpsc::Sender<()>>,
    }

    impl CpalRecording {
        fn halt(&mut self) {
            if let Some(tx) = self.stop_tx.take() {
                let _ = tx.send(());
            }
        }
    }

    impl Drop for CpalRecording {
        fn drop(&mut self) {
            self.halt();
        }
    }

    #[async_trait]
    impl Recording for CpalRecording {
        async fn finish(&mut self) -> Result<EncodedAudio, CaptureError> {
            self.halt();
            let samples = match self.samples.lock() {
                Ok(mut s) => std::mem::take(&mut *s),
                Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
            };
            if samples.is_empty() {
                return Ok(EncodedAudio::empty());
            }
            let duration = pcm_duration(samples.len(), self.sample_rate);
            Ok(EncodedAudio::new(
                pcm_f32_to_wav(&samples, self.sample_rate),
                "audio/wav",
                duration,
            ))
        }

        fn discard(&mut self) {
            self.halt();
            if let Ok(mut s) = self.samples.lock() {
                s.clear();
            }
        }
    }

    #[async_trait]
    impl Recorder for CpalRecorder {
        async fn open(&self) -> Result<Box<dyn Recording>, CaptureError> {
            let samples = Arc::new(Mutex::new(Vec::new()));
            let (ready_tx, ready_rx) = oneshot::channel::<Result<u32, CaptureError>>();
            let (stop_tx, stop_rx) = mpsc::channel::<()>();
            let buffer = samples.clone();

            thread::spawn(move || {
                let unavailable = |e: String| CaptureError::DeviceUnavailable(e);
                let opened = (|| -> Result<(cpal::Stream, u32), CaptureError> {
                    let device = cpal::default_host()
                        .default_input_device()
                        .ok_or_else(|| unavailable("No input device available".to_string()))?;
                    let supported = device
                        .default_input_config()
                        .map_err(|e| unavailable(e.to_string()))?;
                    let config: cpal::StreamConfig = supported.into();
                    let channels = config.channels.max(1) as usize;
                    let sample_rate = config.sample_rate.0;
                    let stream = device
                        .build_input_stream(
                            &config,
                            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                                if let Ok(mut buf) = buffer.lock() {
                                    // Downmix to mono
                                    buf.extend(
                                        data.chunks(channels)
                                            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32),
                                    );
                                }
                            },
                            |err| warn!("Audio stream error: {}", err),
                            None,
                        )
                        .map_err(|e| unavailable(e.to_string()))?;
                    stream.play().map_err(|e| unavailable(e.to_string()))?;
                    Ok((stream, sample_rate))
                })();

                match opened {
                    Ok((stream, sample_rate)) => {
                        let _ = ready_tx.send(Ok(sample_rate));
                        let _ = stop_rx.recv();
                        drop(stream);
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                }
            });

            let sample_rate = ready_rx.await.map_err(|_| {
                CaptureError::DeviceUnavailable("capture thread exited".to_string())
            })??;
            info!(sample_rate, "microphone open");
            Ok(Box::new(CpalRecording {
                samples,
                sample_rate,
                stop_tx: Some(stop_tx),
            }))
        }
    }

    /// Speaker sink on the default output device.
    pub struct RodioSink {
        sink: Arc<Sink>,
        // Dropping this ends the thread that owns the OutputStream.
        _close: mpsc::Sender<()>,
    }

    impl RodioSink {
        pub fn open() -> Result<Self, PlaybackError> {
            let (ready_tx, ready_rx) = mpsc::channel::<Result<Arc<Sink>, PlaybackError>>();
            let (close_tx, close_rx) = mpsc::channel::<()>();

            thread::spawn(move || {
                let (stream, handle) = match OutputStream::try_default() {
                    Ok(pair) => pair,
                    Err(e) => {
                        let _ = ready_tx.send(Err(PlaybackError(e.to_string())));
                        return;
                    }
                };
                match Sink::try_new(&handle) {
                    Ok(sink) => {
                        let _ = ready_tx.send(Ok(Arc::new(sink)));
                        let _ = close_rx.recv();
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(PlaybackError(e.to_string())));
                    }
                }
                drop(stream);
            });

            let sink = ready_rx
                .recv()
                .map_err(|_| PlaybackError("output thread exited".to_string()))??;
            info!("RodioSink: ready for playback");
            Ok(Self {
                sink,
                _close: close_tx,
            })
        }
    }

    #[async_trait]
    impl AudioSink for RodioSink {
        async fn play(&self, clip: &AudioClip) -> Result<(), PlaybackError> {
            if clip.is_empty() {
                return Ok(());
            }
            let source = rodio::Decoder::new(Cursor::new(clip.bytes.clone()))
                .map_err(|e| PlaybackError(format!("Decode failed: {}", e)))?;
            self.sink.append(source.convert_samples::<f32>());
            self.sink.play();
            let sink = self.sink.clone();
            tokio::task::spawn_blocking(move || sink.sleep_until_end())
                .await
                .map_err(|e| PlaybackError(e.to_string()))
        }

        fn stop(&self) {
            self.sink.stop();
        }

        fn resume(&self) {
            self.sink.play();
        }
    }
}
