//! Text-to-speech: synthesize to a temporary audio file, then hand it to playback.

use crate::audio::playback::AudioPlaybackController;
use crate::config::TtsConfig;
use crate::error::{AssistantError, Result};
use crate::pipeline::messages::PlaybackRequest;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

/// Turns text into an audio file the playback controller can load.
pub trait SpeechSynthesizer: Send + Sync + 'static {
    /// Synthesize `text` and return the path of the new audio file.
    ///
    /// The caller owns the returned file.
    ///
    /// # Errors
    ///
    /// Returns an error if synthesis fails or produces no file.
    fn synthesize(&self, text: &str) -> Result<PathBuf>;
}

/// Synthesizer backed by an external executable such as `espeak-ng`.
///
/// Arguments are taken from a template where `{text}` and `{output}` are
/// substituted per call.
#[derive(Debug, Clone)]
pub struct CommandSynthesizer {
    command: String,
    args: Vec<String>,
    output_dir: PathBuf,
}

impl CommandSynthesizer {
    pub fn new(config: &TtsConfig) -> Self {
        Self {
            command: config.command.clone(),
            args: config.args.clone(),
            output_dir: std::env::temp_dir(),
        }
    }

    /// Write synthesized files into `dir` instead of the system temp directory.
    #[must_use]
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    fn output_path(&self) -> PathBuf {
        self.output_dir
            .join(format!("cithia-response-{}.wav", uuid::Uuid::new_v4()))
    }
}

/// Substitute `{text}` and `{output}` in each template argument.
pub fn expand_args(template: &[String], text: &str, output: &Path) -> Vec<String> {
    let output = output.to_string_lossy();
    template
        .iter()
        .map(|arg| arg.replace("{output}", &output).replace("{text}", text))
        .collect()
}

impl SpeechSynthesizer for CommandSynthesizer {
    fn synthesize(&self, text: &str) -> Result<PathBuf> {
        let program = which::which(&self.command).map_err(|e| {
            AssistantError::Tts(format!("synthesizer `{}` not found: {e}", self.command))
        })?;

        let output_path = self.output_path();
        let args = expand_args(&self.args, text, &output_path);
        debug!("running {} for {} chars", program.display(), text.len());

        let output = Command::new(&program)
            .args(&args)
            .output()
            .map_err(|e| AssistantError::Tts(format!("failed to run synthesizer: {e}")))?;

        if !output.status.success() {
            let _ = std::fs::remove_file(&output_path);
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_owned();
            return Err(AssistantError::Tts(format!(
                "synthesizer exited with {}: {stderr}",
                output.status
            )));
        }

        if !output_path.is_file() {
            return Err(AssistantError::Tts(format!(
                "synthesizer produced no file at {}",
                output_path.display()
            )));
        }

        Ok(output_path)
    }
}

/// Shared on/off switch plus an interrupt counter.
///
/// A queued synthesis only reaches playback if speech is still enabled and no
/// interrupt happened since it was queued.
#[derive(Debug)]
struct SpeechGate {
    enabled: AtomicBool,
    generation: AtomicU64,
}

impl SpeechGate {
    fn admits(&self, generation: u64) -> bool {
        self.enabled.load(Ordering::Acquire)
            && self.generation.load(Ordering::Acquire) == generation
    }
}

/// Speaks finalized responses: synthesis on the blocking pool, then playback.
///
/// Clones share the same gate and playback controller.
#[derive(Clone)]
pub struct Speaker {
    synthesizer: Arc<dyn SpeechSynthesizer>,
    playback: AudioPlaybackController,
    runtime: Handle,
    gate: Arc<SpeechGate>,
}

impl std::fmt::Debug for Speaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Speaker")
            .field("enabled", &self.is_enabled())
            .field("playback", &self.playback)
            .finish_non_exhaustive()
    }
}

impl Speaker {
    pub fn new(
        synthesizer: impl SpeechSynthesizer,
        playback: AudioPlaybackController,
        runtime: Handle,
        enabled: bool,
    ) -> Self {
        Self {
            synthesizer: Arc::new(synthesizer),
            playback,
            runtime,
            gate: Arc::new(SpeechGate {
                enabled: AtomicBool::new(enabled),
                generation: AtomicU64::new(0),
            }),
        }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.gate.enabled.load(Ordering::Acquire)
    }

    /// Turning speech off also cancels every synthesis still in flight.
    pub fn set_enabled(&mut self, enabled: bool) {
        info!("speech output {}", if enabled { "on" } else { "off" });
        self.gate.enabled.store(enabled, Ordering::Release);
        if !enabled {
            self.interrupt();
        }
    }

    /// Cancel speech queued so far; its synthesized files are deleted unplayed.
    ///
    /// Does not touch the stream already playing.
    pub fn interrupt(&self) {
        self.gate.generation.fetch_add(1, Ordering::AcqRel);
    }

    pub fn playback(&self) -> &AudioPlaybackController {
        &self.playback
    }

    /// Speak `text` in the background. No-op when disabled or blank.
    ///
    /// Failures are logged and never reach the caller.
    pub fn speak(&self, text: &str) {
        if !self.is_enabled() || text.trim().is_empty() {
            return;
        }

        let synthesizer = Arc::clone(&self.synthesizer);
        let playback = self.playback.clone();
        let gate = Arc::clone(&self.gate);
        let generation = gate.generation.load(Ordering::Acquire);
        let text = text.to_owned();
        self.runtime.spawn_blocking(move || match synthesizer.synthesize(&text) {
            Ok(path) => playback.play_if(PlaybackRequest::new(path), || gate.admits(generation)),
            Err(e) => warn!("speech synthesis failed: {e}"),
        });
    }
}
