//! Microphone capture feeding a speech decoder.
//!
//! [`CpalMicrophone`] captures at the device's native rate, down-mixes and
//! resamples to the configured input rate, and groups 16-bit PCM into fixed
//! frames. [`SpeechCaptureWorker`] pulls frames until the decoder reports a
//! non-empty utterance.

use crate::audio::convert::{StreamResampler, to_mono, to_pcm16};
use crate::config::AudioConfig;
use crate::error::{AssistantError, Result};
use crate::stt::{DecodeEvent, SpeechDecoder};
use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::any::Any;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Frames buffered between the audio callback and the decoder.
const FRAME_QUEUE_DEPTH: usize = 32;

/// How long the worker waits for a frame before re-checking cancellation.
const FRAME_WAIT: Duration = Duration::from_millis(100);

/// An open frame source. Frames flow until this value is dropped.
pub struct OpenedSource {
    frames: Receiver<Vec<i16>>,
    _keep_alive: Box<dyn Any>,
}

impl OpenedSource {
    /// Wrap a frame receiver plus whatever must stay alive while frames flow.
    pub fn new(frames: Receiver<Vec<i16>>, keep_alive: impl Any) -> Self {
        Self {
            frames,
            _keep_alive: Box::new(keep_alive),
        }
    }
}

/// Producer of fixed-size mono PCM frames at the decoder's input rate.
pub trait FrameSource: Send + 'static {
    /// Start producing frames.
    ///
    /// # Errors
    ///
    /// Returns an error if the device cannot be opened.
    fn open(&self) -> Result<OpenedSource>;
}

/// Microphone input via cpal.
#[derive(Debug, Clone)]
pub struct CpalMicrophone {
    device_name: Option<String>,
    target_sample_rate: u32,
    frame_size: usize,
}

impl CpalMicrophone {
    pub fn new(config: &AudioConfig) -> Self {
        Self {
            device_name: config.input_device.clone(),
            target_sample_rate: config.input_sample_rate,
            frame_size: config.frame_size.max(1),
        }
    }

    /// List available input devices.
    ///
    /// # Errors
    ///
    /// Returns an error if devices cannot be enumerated.
    pub fn list_input_devices() -> Result<Vec<String>> {
        let host = cpal::default_host();
        let devices = host
            .input_devices()
            .map_err(|e| AssistantError::Audio(format!("cannot enumerate devices: {e}")))?;

        let mut names = Vec::new();
        for device in devices {
            if let Ok(desc) = device.description() {
                names.push(desc.name().to_owned());
            }
        }
        Ok(names)
    }

    fn device(&self) -> Result<cpal::Device> {
        let host = cpal::default_host();
        if let Some(ref name) = self.device_name {
            host.input_devices()
                .map_err(|e| AssistantError::Audio(format!("cannot enumerate devices: {e}")))?
                .find(|d| {
                    d.description()
                        .ok()
                        .map(|desc| desc.name() == name)
                        .unwrap_or(false)
                })
                .ok_or_else(|| AssistantError::Audio(format!("input device '{name}' not found")))
        } else {
            host.default_input_device()
                .ok_or_else(|| AssistantError::Audio("no default input device".into()))
        }
    }
}

impl FrameSource for CpalMicrophone {
    fn open(&self) -> Result<OpenedSource> {
        let device = self.device()?;
        let device_name = device
            .description()
            .map(|d| d.name().to_owned())
            .unwrap_or_else(|_| "<unknown>".into());
        info!("using input device: {device_name}");

        let default_config = device
            .default_input_config()
            .map_err(|e| AssistantError::Audio(format!("no default input config: {e}")))?;
        let native_rate = default_config.sample_rate();
        let native_channels = default_config.channels();

        let stream_config = StreamConfig {
            channels: native_channels,
            sample_rate: native_rate,
            buffer_size: cpal::BufferSize::Default,
        };

        let target_rate = self.target_sample_rate;
        let frame_size = self.frame_size;
        let (tx, rx) = crossbeam_channel::bounded(FRAME_QUEUE_DEPTH);
        let mut pending: Vec<i16> = Vec::with_capacity(frame_size * 2);
        let mut resampler = StreamResampler::new(native_rate, target_rate);

        let stream = device
            .build_input_stream(
                &stream_config,
                move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                    let mono = to_mono(data, native_channels);
                    let samples = resampler.process(&mono);
                    pending.extend(to_pcm16(&samples));

                    while pending.len() >= frame_size {
                        let frame: Vec<i16> = pending.drain(..frame_size).collect();
                        // Never block the audio thread.
                        if tx.try_send(frame).is_err() {
                            debug!("frame queue full, dropping frame");
                        }
                    }
                },
                move |err| {
                    error!("audio input stream error: {err}");
                },
                None,
            )
            .map_err(|e| AssistantError::Audio(format!("failed to build input stream: {e}")))?;

        stream
            .play()
            .map_err(|e| AssistantError::Audio(format!("failed to start input stream: {e}")))?;

        info!(
            "audio capture started: native {}Hz x{} -> {}Hz mono, {} samples/frame",
            native_rate, native_channels, target_rate, frame_size
        );

        Ok(OpenedSource::new(rx, stream))
    }
}

/// Blocking speech capture: frames in, one utterance out.
///
/// The worker owns its decoder, so it is moved into the blocking task for the
/// duration of a capture and handed back afterwards.
pub struct SpeechCaptureWorker {
    source: Box<dyn FrameSource>,
    decoder: Box<dyn SpeechDecoder>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for SpeechCaptureWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpeechCaptureWorker")
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl SpeechCaptureWorker {
    pub fn new(
        source: impl FrameSource,
        decoder: impl SpeechDecoder + 'static,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            source: Box::new(source),
            decoder: Box::new(decoder),
            cancel,
        }
    }

    /// Capture until an utterance with text is recognized.
    ///
    /// Returns an empty string on any failure or when cancelled; callers treat
    /// that as "no input recognized".
    pub fn capture(&mut self) -> String {
        match self.try_capture() {
            Ok(text) => text,
            Err(e) => {
                warn!("speech capture failed: {e}");
                String::new()
            }
        }
    }

    fn try_capture(&mut self) -> Result<String> {
        let opened = self.source.open()?;
        self.decoder.reset();

        loop {
            if self.cancel.is_cancelled() {
                info!("speech capture cancelled");
                return Ok(String::new());
            }

            let frame = match opened.frames.recv_timeout(FRAME_WAIT) {
                Ok(frame) => frame,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(AssistantError::Channel("microphone stream closed".into()));
                }
            };

            match self.decoder.accept_frame(&frame)? {
                DecodeEvent::Utterance(text) if !text.trim().is_empty() => {
                    info!("recognized: \"{}\"", text.trim());
                    return Ok(text.trim().to_owned());
                }
                DecodeEvent::Utterance(_) => debug!("empty utterance, still listening"),
                DecodeEvent::Partial => {}
            }
        }
    }
}

/// What a finished capture hands back: the worker for reuse and its transcript.
#[derive(Debug)]
pub struct CaptureReport {
    pub worker: SpeechCaptureWorker,
    pub transcript: String,
}
