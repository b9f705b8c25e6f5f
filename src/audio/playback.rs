//! Single-flight playback of synthesized speech files.
//!
//! [`AudioPlaybackController`] plays at most one file at a time. A new
//! [`play`](AudioPlaybackController::play) stops the current stream before the
//! next one is loaded, and every state transition runs under one mutex so two
//! playback attempts never interleave.
//!
//! The controller owns each file it receives. A file is deleted by exactly one
//! path: whoever removes it from the current slot (a superseding `play`, a
//! `stop`, or the watcher after natural completion).

use crate::audio::decode::{DecodedAudio, decode_file};
use crate::config::AudioConfig;
use crate::error::{AssistantError, Result};
use crate::pipeline::messages::PlaybackRequest;
use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// A stream that has been loaded and started.
pub trait ActiveStream: Send {
    /// Stop output immediately.
    fn stop(&mut self);
    /// Whether the stream reached its end on its own.
    fn is_finished(&self) -> bool;
}

/// Audio backend able to load and start an audio file.
pub trait AudioOutput: Send + Sync + 'static {
    /// Load `path` and start playing it.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be decoded or the device refuses the stream.
    fn start(&self, path: &Path) -> Result<Box<dyn ActiveStream>>;
}

struct CurrentPlayback {
    id: u64,
    path: PathBuf,
    stream: Box<dyn ActiveStream>,
}

#[derive(Default)]
struct PlaybackState {
    current: Option<CurrentPlayback>,
    next_id: u64,
}

struct Shared {
    output: Box<dyn AudioOutput>,
    state: Mutex<PlaybackState>,
    poll_interval: Duration,
}

impl Shared {
    fn lock_state(&self) -> MutexGuard<'_, PlaybackState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Plays at most one audio file at a time. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct AudioPlaybackController {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for AudioPlaybackController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioPlaybackController")
            .field("playing", &self.is_playing())
            .field("poll_interval", &self.shared.poll_interval)
            .finish()
    }
}

impl AudioPlaybackController {
    /// Create a controller over `output`; the completion watcher checks every `poll_interval`.
    pub fn new(output: impl AudioOutput, poll_interval: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                output: Box::new(output),
                state: Mutex::new(PlaybackState::default()),
                poll_interval,
            }),
        }
    }

    /// Stop whatever is playing, then load and start `request.path`.
    ///
    /// Failures are logged and swallowed; the file is deleted either way.
    pub fn play(&self, request: PlaybackRequest) {
        self.play_if(request, || true);
    }

    /// Like [`play`](Self::play), but first evaluates `still_wanted` under the
    /// playback lock. When it returns false nothing is stopped and the file is
    /// deleted unplayed.
    pub fn play_if(&self, request: PlaybackRequest, still_wanted: impl FnOnce() -> bool) {
        let path = request.path;
        let mut state = self.shared.lock_state();

        if !still_wanted() {
            debug!("dropping unwanted playback of {}", path.display());
            remove_audio_file(&path);
            return;
        }

        if let Some(previous) = state.current.take() {
            info!("superseding playback of {}", previous.path.display());
            discard(previous);
        }

        match self.shared.output.start(&path) {
            Ok(stream) => {
                state.next_id += 1;
                let id = state.next_id;
                debug!(id, "playing {}", path.display());
                state.current = Some(CurrentPlayback { id, path, stream });
                drop(state);
                self.spawn_watcher(id);
            }
            Err(e) => {
                warn!("failed to play {}: {e}", path.display());
                remove_audio_file(&path);
            }
        }
    }

    /// Stop the current stream, if any, and delete its file.
    pub fn stop(&self) {
        let mut state = self.shared.lock_state();
        if let Some(current) = state.current.take() {
            info!("playback stopped: {}", current.path.display());
            discard(current);
        }
    }

    #[must_use]
    pub fn is_playing(&self) -> bool {
        self.shared.lock_state().current.is_some()
    }

    fn spawn_watcher(&self, id: u64) {
        let shared = Arc::clone(&self.shared);
        let spawned = std::thread::Builder::new()
            .name("cithia-playback-watch".into())
            .spawn(move || watch_until_finished(&shared, id));
        if let Err(e) = spawned {
            // The stream keeps playing; the next play/stop reclaims the file.
            warn!("failed to spawn playback watcher: {e}");
        }
    }
}

fn watch_until_finished(shared: &Shared, id: u64) {
    loop {
        std::thread::sleep(shared.poll_interval);
        let mut state = shared.lock_state();
        let finished = match state.current.as_ref() {
            Some(current) if current.id == id => current.stream.is_finished(),
            // Superseded or stopped; that path already deleted the file.
            _ => return,
        };
        if finished {
            if let Some(done) = state.current.take() {
                debug!(id, "playback finished: {}", done.path.display());
                remove_audio_file(&done.path);
            }
            return;
        }
    }
}

fn discard(mut playback: CurrentPlayback) {
    playback.stream.stop();
    remove_audio_file(&playback.path);
}

fn remove_audio_file(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("error removing audio file {}: {e}", path.display()),
    }
}

/// Audio output to system speakers via cpal.
///
/// Each stream lives on its own thread because cpal streams are not `Send`.
#[derive(Debug, Clone, Default)]
pub struct CpalOutput {
    device_name: Option<String>,
}

impl CpalOutput {
    pub fn new(config: &AudioConfig) -> Self {
        Self {
            device_name: config.output_device.clone(),
        }
    }

    /// List available output devices.
    ///
    /// # Errors
    ///
    /// Returns an error if devices cannot be enumerated.
    pub fn list_output_devices() -> Result<Vec<String>> {
        let host = cpal::default_host();
        let devices = host
            .output_devices()
            .map_err(|e| AssistantError::Audio(format!("cannot enumerate devices: {e}")))?;

        let mut names = Vec::new();
        for device in devices {
            if let Ok(desc) = device.description() {
                names.push(desc.name().to_owned());
            }
        }
        Ok(names)
    }
}

impl AudioOutput for CpalOutput {
    fn start(&self, path: &Path) -> Result<Box<dyn ActiveStream>> {
        let audio = decode_file(path)?;
        info!(
            "loaded {} ({:.1}s at {}Hz)",
            path.display(),
            audio.seconds(),
            audio.sample_rate
        );

        let stop = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<Result<()>>(1);
        let (released_tx, released_rx) = crossbeam_channel::bounded::<()>(0);

        let device_name = self.device_name.clone();
        let thread_stop = Arc::clone(&stop);
        let thread_finished = Arc::clone(&finished);
        std::thread::Builder::new()
            .name("cithia-audio-out".into())
            .spawn(move || {
                run_output_stream(
                    device_name.as_deref(),
                    audio,
                    &thread_stop,
                    &thread_finished,
                    &ready_tx,
                    released_tx,
                );
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Box::new(CpalStream {
                stop,
                finished,
                released: released_rx,
            })),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(AssistantError::Audio(
                "output thread exited before starting".into(),
            )),
        }
    }
}

/// Upper bound on how long `stop` waits for the output thread to release the device.
const RELEASE_TIMEOUT: Duration = Duration::from_millis(500);

/// How often the output thread checks for stop or completion.
const OUTPUT_POLL: Duration = Duration::from_millis(10);

struct CpalStream {
    stop: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
    /// Disconnects once the output thread has dropped its cpal stream.
    released: crossbeam_channel::Receiver<()>,
}

impl ActiveStream for CpalStream {
    /// Silence the callback, then block until the device stream is dropped.
    fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        match self.released.recv_timeout(RELEASE_TIMEOUT) {
            Ok(()) | Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {}
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                warn!("output thread did not release the stream in time");
            }
        }
    }

    fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Relaxed)
    }
}

impl Drop for CpalStream {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

/// Internal buffer for tracking playback progress.
struct PlaybackBuffer {
    samples: Vec<f32>,
    position: usize,
}

fn run_output_stream(
    device_name: Option<&str>,
    audio: DecodedAudio,
    stop: &Arc<AtomicBool>,
    finished: &Arc<AtomicBool>,
    ready: &crossbeam_channel::Sender<Result<()>>,
    released: crossbeam_channel::Sender<()>,
) {
    let built = build_output_stream(device_name, audio, Arc::clone(stop), Arc::clone(finished));
    let stream = match built {
        Ok(stream) => stream,
        Err(e) => {
            finished.store(true, Ordering::Relaxed);
            let _ = ready.send(Err(e));
            return;
        }
    };

    if let Err(e) = stream.play() {
        finished.store(true, Ordering::Relaxed);
        let _ = ready.send(Err(AssistantError::Audio(format!(
            "failed to start output stream: {e}"
        ))));
        return;
    }
    let _ = ready.send(Ok(()));

    hold_until_done(stream, stop, finished, released);
}

/// Keep `stream` alive until it is stopped or finishes, then drop it and
/// disconnect `released` so a waiting `stop` can return.
fn hold_until_done<T>(
    stream: T,
    stop: &AtomicBool,
    finished: &AtomicBool,
    released: crossbeam_channel::Sender<()>,
) {
    while !stop.load(Ordering::Relaxed) && !finished.load(Ordering::Relaxed) {
        std::thread::sleep(OUTPUT_POLL);
    }

    drop(stream);
    finished.store(true, Ordering::Relaxed);
    drop(released);
}

fn build_output_stream(
    device_name: Option<&str>,
    audio: DecodedAudio,
    stop: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
) -> Result<cpal::Stream> {
    let host = cpal::default_host();

    let device = if let Some(name) = device_name {
        host.output_devices()
            .map_err(|e| AssistantError::Audio(format!("cannot enumerate devices: {e}")))?
            .find(|d| {
                d.description()
                    .ok()
                    .map(|desc| desc.name() == name)
                    .unwrap_or(false)
            })
            .ok_or_else(|| AssistantError::Audio(format!("output device '{name}' not found")))?
    } else {
        host.default_output_device()
            .ok_or_else(|| AssistantError::Audio("no default output device".into()))?
    };

    let default_config = device
        .default_output_config()
        .map_err(|e| AssistantError::Audio(format!("no default output config: {e}")))?;
    let device_rate = default_config.sample_rate();
    let channels = default_config.channels();

    let stream_config = StreamConfig {
        channels,
        sample_rate: device_rate,
        buffer_size: cpal::BufferSize::Default,
    };

    let samples = super::convert::resample(&audio.samples, audio.sample_rate, device_rate);
    let buffer = Arc::new(Mutex::new(PlaybackBuffer {
        samples,
        position: 0,
    }));
    let frame_len = channels.max(1) as usize;

    device
        .build_output_stream(
            &stream_config,
            move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                if stop.load(Ordering::Relaxed) {
                    data.fill(0.0);
                    return;
                }
                let mut buf = match buffer.lock() {
                    Ok(b) => b,
                    Err(_) => return,
                };

                for frame in data.chunks_mut(frame_len) {
                    let sample = if buf.position < buf.samples.len() {
                        let s = buf.samples[buf.position];
                        buf.position += 1;
                        s
                    } else {
                        finished.store(true, Ordering::Relaxed);
                        0.0
                    };
                    frame.fill(sample);
                }
            },
            move |err| {
                error!("audio output stream error: {err}");
            },
            None,
        )
        .map_err(|e| AssistantError::Audio(format!("failed to build output stream: {e}")))
}
