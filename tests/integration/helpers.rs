//! Shared helpers for integration tests.

use cithia::audio::playback::{ActiveStream, AudioOutput, AudioPlaybackController};
use cithia::pipeline::messages::StreamToken;
use cithia::pipeline::task::{TaskHandle, TaskPoll};
use cithia::tts::{Speaker, SpeechSynthesizer};
use cithia::{AssistantConfig, Orchestrator, PresentationSurface, Role};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Everything the orchestrator did to the surface, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SurfaceEvent {
    Append(Role, String),
    Replace(String),
    Image(PathBuf),
    Controls(bool),
}

#[derive(Debug, Default)]
pub(crate) struct RecordingSurface {
    pub events: Vec<SurfaceEvent>,
}

impl RecordingSurface {
    /// Text of every appended message with `role`.
    pub(crate) fn appended(&self, role: Role) -> Vec<&str> {
        self.events
            .iter()
            .filter_map(|e| match e {
                SurfaceEvent::Append(r, text) if *r == role => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Text the last message shows after all replacements.
    pub(crate) fn last_message_text(&self) -> Option<&str> {
        self.events.iter().rev().find_map(|e| match e {
            SurfaceEvent::Append(_, text) | SurfaceEvent::Replace(text) => Some(text.as_str()),
            _ => None,
        })
    }

    pub(crate) fn count(&self, event: &SurfaceEvent) -> usize {
        self.events.iter().filter(|e| *e == event).count()
    }
}

impl PresentationSurface for RecordingSurface {
    fn append_message(&mut self, role: Role, text: &str) {
        self.events.push(SurfaceEvent::Append(role, text.to_owned()));
    }

    fn replace_last_message(&mut self, text: &str) {
        self.events.push(SurfaceEvent::Replace(text.to_owned()));
    }

    fn show_image(&mut self, path: &Path) {
        self.events.push(SurfaceEvent::Image(path.to_path_buf()));
    }

    fn set_controls_enabled(&mut self, enabled: bool) {
        self.events.push(SurfaceEvent::Controls(enabled));
    }
}

/// Writes a small file per utterance and records what was spoken.
///
/// Owns its scratch directory so it stays valid for as long as the speaker does.
#[derive(Clone)]
pub(crate) struct RecordingSynth {
    dir: Arc<tempfile::TempDir>,
    delay: Duration,
    pub spoken: Arc<Mutex<Vec<String>>>,
}

impl RecordingSynth {
    pub(crate) fn new() -> Self {
        Self {
            dir: Arc::new(tempfile::tempdir().expect("create temp dir")),
            delay: Duration::ZERO,
            spoken: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Take `delay` before producing each file, like a real synthesizer would.
    pub(crate) fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::new()
        }
    }

    /// Path of the `index`-th synthesized file.
    pub(crate) fn file(&self, index: usize) -> PathBuf {
        self.dir.path().join(format!("speech-{index}.wav"))
    }

    pub(crate) fn spoken(&self) -> Vec<String> {
        self.spoken.lock().unwrap().clone()
    }
}

impl SpeechSynthesizer for RecordingSynth {
    fn synthesize(&self, text: &str) -> cithia::Result<PathBuf> {
        std::thread::sleep(self.delay);
        let mut spoken = self.spoken.lock().unwrap();
        let path = self.file(spoken.len());
        std::fs::write(&path, text)?;
        spoken.push(text.to_owned());
        Ok(path)
    }
}

/// Audio output whose streams run until the test finishes them.
///
/// Every start and stop is logged as `"start <file>"` / `"stop <file>"`.
#[derive(Clone, Default)]
pub(crate) struct ScriptedOutput {
    pub log: Arc<Mutex<Vec<String>>>,
    finished: Arc<Mutex<HashSet<PathBuf>>>,
    fail: Arc<Mutex<HashSet<PathBuf>>>,
}

impl ScriptedOutput {
    /// Mark the stream for `path` as having played to the end.
    pub(crate) fn finish(&self, path: &Path) {
        self.finished.lock().unwrap().insert(path.to_path_buf());
    }

    /// Make `start` fail for `path`.
    pub(crate) fn fail_on(&self, path: &Path) {
        self.fail.lock().unwrap().insert(path.to_path_buf());
    }

    pub(crate) fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

impl AudioOutput for ScriptedOutput {
    fn start(&self, path: &Path) -> cithia::Result<Box<dyn ActiveStream>> {
        if self.fail.lock().unwrap().contains(path) {
            return Err(cithia::AssistantError::Audio("unsupported file".into()));
        }
        self.log
            .lock()
            .unwrap()
            .push(format!("start {}", file_name(path)));
        Ok(Box::new(ScriptedStream {
            path: path.to_path_buf(),
            log: Arc::clone(&self.log),
            finished: Arc::clone(&self.finished),
        }))
    }
}

struct ScriptedStream {
    path: PathBuf,
    log: Arc<Mutex<Vec<String>>>,
    finished: Arc<Mutex<HashSet<PathBuf>>>,
}

impl ActiveStream for ScriptedStream {
    fn stop(&mut self) {
        self.log
            .lock()
            .unwrap()
            .push(format!("stop {}", file_name(&self.path)));
    }

    fn is_finished(&self) -> bool {
        self.finished.lock().unwrap().contains(&self.path)
    }
}

/// Poll `cond` until it holds or `timeout` elapses.
pub(crate) fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    cond()
}

/// Tick the orchestrator until `done` holds.
pub(crate) fn tick_until<S: PresentationSurface>(
    orchestrator: &mut Orchestrator<S>,
    mut done: impl FnMut(&Orchestrator<S>) -> bool,
) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        orchestrator.tick();
        if done(orchestrator) {
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("orchestrator did not reach the expected state");
}

/// Drain a chat stream from async code until its terminal token.
pub(crate) async fn collect_tokens(handle: &mut TaskHandle<StreamToken>) -> Vec<StreamToken> {
    let mut tokens = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        match handle.try_next() {
            TaskPoll::Ready(token) => {
                let terminal = token.is_terminal();
                tokens.push(token);
                if terminal {
                    // Nothing may follow the terminal token.
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    while let TaskPoll::Ready(extra) = handle.try_next() {
                        tokens.push(extra);
                    }
                    return tokens;
                }
            }
            TaskPoll::Pending => tokio::time::sleep(Duration::from_millis(5)).await,
            TaskPoll::Closed => return tokens,
        }
    }
    tokens
}

/// A line-delimited generate response streaming `fragments` then `done`.
pub(crate) fn ndjson_body(fragments: &[&str]) -> String {
    let mut body = String::new();
    for fragment in fragments {
        body.push_str(&serde_json::json!({"response": fragment, "done": false}).to_string());
        body.push('\n');
    }
    body.push_str(&serde_json::json!({"response": "", "done": true}).to_string());
    body.push('\n');
    body
}

/// Write an executable shell script standing in for the image backend.
#[cfg(unix)]
pub(crate) fn fake_image_backend(dir: &Path, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("fake-image-backend");
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Backend script that records its prompt next to the image and writes a PNG stub.
#[cfg(unix)]
pub(crate) const WRITING_BACKEND: &str = r#"
while [ $# -gt 0 ]; do
  case "$1" in
    --prompt) prompt="$2"; shift 2 ;;
    --output-path) out="$2"; shift 2 ;;
    *) shift ;;
  esac
done
printf '%s' "$prompt" > "$(dirname "$out")/prompt.txt"
printf 'PNG' > "$out"
"#;

/// Everything a full orchestrator test needs, kept alive together.
pub(crate) struct Harness {
    pub orchestrator: Orchestrator<RecordingSurface>,
    pub synth: RecordingSynth,
    pub output: ScriptedOutput,
    pub dir: tempfile::TempDir,
    // Dropped last so background tasks outlive the orchestrator.
    pub runtime: tokio::runtime::Runtime,
}

/// Build an orchestrator with recording speech output and scripted audio.
///
/// Takes the runtime so callers can start mock servers on it first.
pub(crate) fn harness(runtime: tokio::runtime::Runtime, config: AssistantConfig) -> Harness {
    harness_with_synth(runtime, config, RecordingSynth::new())
}

pub(crate) fn harness_with_synth(
    runtime: tokio::runtime::Runtime,
    mut config: AssistantConfig,
    synth: RecordingSynth,
) -> Harness {
    let dir = tempfile::tempdir().expect("create temp dir");
    if config.image.output_dir.is_none() {
        config.image.output_dir = Some(dir.path().to_path_buf());
    }

    let output = ScriptedOutput::default();
    let playback = AudioPlaybackController::new(output.clone(), Duration::from_millis(5));
    let speaker = Speaker::new(synth.clone(), playback, runtime.handle().clone(), true);
    let orchestrator = Orchestrator::new(
        config,
        runtime.handle().clone(),
        RecordingSurface::default(),
        speaker,
    )
    .expect("build orchestrator");

    Harness {
        orchestrator,
        synth,
        output,
        dir,
        runtime,
    }
}
