//! Tick-driven orchestrator tying user actions to background tasks.
//!
//! The orchestrator lives on the presentation thread. User actions start at
//! most one task per [`TaskKind`]; each task publishes on its own queue, and
//! [`Orchestrator::tick`] drains those queues without blocking and applies the
//! results to the surface, the conversation memory and speech output.

use crate::audio::capture::{CaptureReport, FrameSource, SpeechCaptureWorker};
use crate::config::AssistantConfig;
use crate::error::Result;
use crate::image::{ImageGenerationTask, ImageTaskHandle};
use crate::llm::{ChatStreamTask, build_client};
use crate::memory::{ConversationMemory, Role, Turn};
use crate::pipeline::messages::{ImageOutcome, StreamToken, TaskKind};
use crate::pipeline::surface::{PresentationSurface, UserAction};
use crate::pipeline::task::{TaskHandle, TaskPoll};
use crate::stt::SpeechDecoder;
use crate::tts::Speaker;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const IMAGE_PREFIX: &str = "generate image:";

pub const EMPTY_IMAGE_PROMPT_REPLY: &str = "Please provide a prompt after 'generate image:'.";
pub const IMAGE_STARTED_REPLY: &str = "Generating image based on your prompt...";
pub const IMAGE_TIPS_QUESTION: &str =
    "Would you like some tips to refine your prompt for better image results?";
pub const IMAGE_FAILED_REPLY: &str = "Failed to generate image.";
pub const IMAGE_SAVE_HINT: &str = "You can save the image with the save command.";
pub const PROMPT_ADVICE: &str = "Sure! To create a more detailed and vivid image, consider adding \
specifics such as colors, lighting, environment, emotions, and any unique elements you want to \
include. For example, instead of 'a cat', you might say 'a fluffy white cat lounging on a sunlit \
windowsill with a playful expression.'";
pub const STOPPED_SPEAKING: &str = "Stopped speaking.";
pub const NO_IMAGE_TO_SAVE: &str = "There is no image to save.";

/// What [`Orchestrator::submit_text`] did with the input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    /// Blank input; nothing happened.
    Ignored,
    /// A chat stream was started.
    ChatStarted,
    /// An image generation run was started.
    ImageStarted,
    /// Answered immediately without a background task.
    Answered,
    /// A task of this kind is already running; the input was not accepted.
    Rejected(TaskKind),
}

struct ActiveChat {
    handle: TaskHandle<StreamToken>,
    text: String,
}

/// Owns the session: memory, speech output, the surface and every task slot.
pub struct Orchestrator<S: PresentationSurface> {
    config: AssistantConfig,
    runtime: Handle,
    client: reqwest::Client,
    memory: ConversationMemory,
    speaker: Speaker,
    surface: S,
    chat: Option<ActiveChat>,
    image: Option<ImageTaskHandle>,
    capture: Option<TaskHandle<CaptureReport>>,
    capture_worker: Option<SpeechCaptureWorker>,
    last_image: Option<PathBuf>,
    cancel: CancellationToken,
}

impl<S: PresentationSurface> Orchestrator<S> {
    /// Create an orchestrator. Voice input stays unavailable until
    /// [`with_speech_capture`](Self::with_speech_capture) is called.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(
        config: AssistantConfig,
        runtime: Handle,
        surface: S,
        speaker: Speaker,
    ) -> Result<Self> {
        let client = build_client(&config.llm)?;
        Ok(Self {
            config,
            runtime,
            client,
            memory: ConversationMemory::new(),
            speaker,
            surface,
            chat: None,
            image: None,
            capture: None,
            capture_worker: None,
            last_image: None,
            cancel: CancellationToken::new(),
        })
    }

    /// Enable voice input from `source`, recognized by `decoder`.
    pub fn with_speech_capture(
        mut self,
        source: impl FrameSource,
        decoder: impl SpeechDecoder + 'static,
    ) -> Self {
        self.capture_worker = Some(SpeechCaptureWorker::new(
            source,
            decoder,
            self.cancel.child_token(),
        ));
        self
    }

    pub fn memory(&self) -> &ConversationMemory {
        &self.memory
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }

    pub fn surface_mut(&mut self) -> &mut S {
        &mut self.surface
    }

    pub fn speaker(&self) -> &Speaker {
        &self.speaker
    }

    /// Path of the most recent successfully generated image.
    pub fn last_image(&self) -> Option<&Path> {
        self.last_image.as_deref()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Whether a task of `kind` is in flight.
    pub fn is_running(&self, kind: TaskKind) -> bool {
        match kind {
            TaskKind::ChatStreaming => self.chat.is_some(),
            TaskKind::ImageGeneration => self.image.is_some(),
            TaskKind::SpeechCapture => self.capture.is_some(),
        }
    }

    /// Route one line of user input.
    pub fn submit_text(&mut self, text: &str) -> Submission {
        let text = text.trim();
        if text.is_empty() {
            return Submission::Ignored;
        }

        if let Some(prompt) = strip_image_prefix(text) {
            return self.submit_image(text, prompt.trim());
        }

        if is_prompt_help_request(text) {
            self.record_user(text);
            self.reply(PROMPT_ADVICE);
            return Submission::Answered;
        }

        self.submit_chat(text)
    }

    fn submit_chat(&mut self, text: &str) -> Submission {
        if self.chat.is_some() {
            info!("chat stream busy, rejecting new message");
            self.surface.append_message(
                Role::System,
                "Still answering the previous message. Please wait for it to finish.",
            );
            return Submission::Rejected(TaskKind::ChatStreaming);
        }

        // Render before appending so the new message is not sent twice.
        let context = self.memory.render_context();
        self.record_user(text);
        self.surface.append_message(Role::Bot, "");

        let handle = ChatStreamTask::start(
            &self.runtime,
            self.client.clone(),
            &self.config.llm,
            &self.config.llm.model,
            &context,
            text,
        );
        self.chat = Some(ActiveChat {
            handle,
            text: String::new(),
        });
        Submission::ChatStarted
    }

    fn submit_image(&mut self, text: &str, prompt: &str) -> Submission {
        if prompt.is_empty() {
            self.record_user(text);
            self.reply(EMPTY_IMAGE_PROMPT_REPLY);
            return Submission::Answered;
        }

        if self.image.is_some() {
            info!("image generation busy, rejecting new prompt");
            self.surface.append_message(
                Role::System,
                "An image is already being generated. Please wait for it to finish.",
            );
            return Submission::Rejected(TaskKind::ImageGeneration);
        }

        self.record_user(text);
        self.announce(IMAGE_STARTED_REPLY);
        self.surface.set_controls_enabled(false);

        info!("starting image generation: \"{prompt}\"");
        self.image = Some(ImageGenerationTask::start(
            &self.runtime,
            &self.config.image,
            prompt,
        ));

        self.reply(IMAGE_TIPS_QUESTION);
        Submission::ImageStarted
    }

    /// Start listening on the microphone. Returns `false` if voice input is
    /// unavailable or a capture is already running.
    pub fn request_voice_input(&mut self) -> bool {
        if self.capture.is_some() {
            debug!("speech capture already running");
            return false;
        }
        let Some(mut worker) = self.capture_worker.take() else {
            self.surface
                .append_message(Role::System, "Voice input is not available.");
            return false;
        };

        let (tx, rx) = mpsc::unbounded_channel();
        self.runtime.spawn_blocking(move || {
            let transcript = worker.capture();
            let _ = tx.send(CaptureReport { worker, transcript });
        });
        self.capture = Some(TaskHandle::new(TaskKind::SpeechCapture, rx));
        self.surface.append_message(Role::System, "Listening...");
        true
    }

    /// Stop any speech output immediately.
    pub fn stop_playback(&mut self) {
        self.speaker.interrupt();
        self.speaker.playback().stop();
        self.surface.append_message(Role::System, STOPPED_SPEAKING);
    }

    pub fn set_speech_output(&mut self, enabled: bool) {
        self.speaker.set_enabled(enabled);
        if !enabled {
            self.speaker.playback().stop();
        }
    }

    pub fn speech_output_enabled(&self) -> bool {
        self.speaker.is_enabled()
    }

    /// Copy the most recent image to `destination`.
    pub fn save_last_image(&mut self, destination: &Path) -> bool {
        let Some(source) = self.last_image.clone().filter(|p| p.is_file()) else {
            self.notify(NO_IMAGE_TO_SAVE);
            return false;
        };

        match std::fs::copy(&source, destination) {
            Ok(_) => {
                info!("saved {} to {}", source.display(), destination.display());
                self.notify(&format!("Image saved to {}", destination.display()));
                true
            }
            Err(e) => {
                warn!("failed to save image: {e}");
                self.notify(&format!("Failed to save image: {e}"));
                false
            }
        }
    }

    /// Dispatch an action emitted by the surface.
    pub fn handle(&mut self, action: UserAction) {
        match action {
            UserAction::SubmitText(text) => {
                self.submit_text(&text);
            }
            UserAction::RequestVoiceInput => {
                self.request_voice_input();
            }
            UserAction::RequestStopPlayback => self.stop_playback(),
            UserAction::RequestSaveLastImage { destination } => {
                self.save_last_image(&destination);
            }
            UserAction::SetSpeechOutput(enabled) => self.set_speech_output(enabled),
        }
    }

    /// One non-blocking pass over every task queue.
    pub fn tick(&mut self) {
        self.drain_chat();
        self.drain_image();
        self.drain_capture();
    }

    /// Drive the orchestrator from `actions`, ticking at `interval`, until the
    /// sender side is dropped.
    pub fn run(&mut self, actions: &crossbeam_channel::Receiver<UserAction>, interval: Duration) {
        loop {
            match actions.recv_timeout(interval) {
                Ok(action) => self.handle(action),
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
            }
            self.tick();
        }
        self.shutdown();
    }

    /// Stop listening and speaking. In-flight chat and image tasks run to completion.
    pub fn shutdown(&mut self) {
        self.cancel.cancel();
        self.speaker.interrupt();
        self.speaker.playback().stop();
    }

    fn drain_chat(&mut self) {
        let Some(chat) = self.chat.as_mut() else {
            return;
        };

        let mut updated = false;
        let mut finished: Option<Option<String>> = None;
        loop {
            match chat.handle.try_next() {
                TaskPoll::Ready(StreamToken::Fragment(fragment)) => {
                    chat.text.push_str(&fragment);
                    updated = true;
                }
                TaskPoll::Ready(StreamToken::End) => {
                    finished = Some(None);
                    break;
                }
                TaskPoll::Ready(StreamToken::Failed(reason)) => {
                    finished = Some(Some(reason));
                    break;
                }
                TaskPoll::Pending => break,
                TaskPoll::Closed => {
                    finished = Some(Some("stream ended without a terminal marker".to_owned()));
                    break;
                }
            }
        }

        if updated {
            self.surface.replace_last_message(&chat.text);
        }

        let Some(failure) = finished else {
            return;
        };
        let Some(chat) = self.chat.take() else {
            return;
        };

        let text = chat.text.trim();
        if !text.is_empty() {
            if let Some(reason) = failure {
                warn!("keeping partial response after failure: {reason}");
            }
            self.memory.append(Turn::bot(text));
            self.speaker.speak(text);
        } else if let Some(reason) = failure {
            self.surface.replace_last_message(&format!("Error: {reason}"));
        } else {
            debug!("chat stream ended with an empty response");
        }
    }

    fn drain_image(&mut self) {
        let Some(image) = self.image.as_mut() else {
            return;
        };

        let mut statuses = Vec::new();
        while let TaskPoll::Ready(status) = image.poll_status() {
            statuses.push(status);
        }

        let outcome = match image.poll_result() {
            TaskPoll::Ready(outcome) => Some(outcome),
            TaskPoll::Pending => None,
            TaskPoll::Closed => Some(ImageOutcome::Failed(
                "image task ended without a result".to_owned(),
            )),
        };

        if outcome.is_some() {
            while let TaskPoll::Ready(status) = image.poll_status() {
                statuses.push(status);
            }
        }

        for status in statuses {
            self.announce(&status);
        }

        let Some(outcome) = outcome else {
            return;
        };
        self.image = None;

        match outcome {
            ImageOutcome::Ready(path) => {
                self.surface.show_image(&path);
                self.last_image = Some(path);
                self.announce(IMAGE_SAVE_HINT);
            }
            ImageOutcome::Failed(reason) => {
                debug!("image generation failed: {reason}");
                self.announce(IMAGE_FAILED_REPLY);
            }
        }
        self.surface.set_controls_enabled(true);
    }

    fn drain_capture(&mut self) {
        let Some(capture) = self.capture.as_mut() else {
            return;
        };

        let report = match capture.try_next() {
            TaskPoll::Ready(report) => report,
            TaskPoll::Pending => return,
            TaskPoll::Closed => {
                warn!("speech capture task ended without a report; voice input disabled");
                self.capture = None;
                return;
            }
        };

        self.capture = None;
        self.capture_worker = Some(report.worker);

        if report.transcript.is_empty() {
            debug!("no speech recognized");
            return;
        }
        self.submit_text(&report.transcript);
    }

    /// Show and store the user's message.
    fn record_user(&mut self, text: &str) {
        self.surface.append_message(Role::User, text);
        self.memory.append(Turn::user(text));
    }

    /// Show, store and speak a bot reply.
    fn reply(&mut self, text: &str) {
        self.surface.append_message(Role::Bot, text);
        self.memory.append(Turn::bot(text));
        self.speaker.speak(text);
    }

    /// Show and speak a bot status line without storing it.
    fn announce(&mut self, text: &str) {
        self.surface.append_message(Role::Bot, text);
        self.speaker.speak(text);
    }

    /// Show and speak a system notice.
    fn notify(&mut self, text: &str) {
        self.surface.append_message(Role::System, text);
        self.speaker.speak(text);
    }
}

/// The prompt after a case-insensitive `generate image:` prefix.
fn strip_image_prefix(text: &str) -> Option<&str> {
    let head = text.get(..IMAGE_PREFIX.len())?;
    if head.eq_ignore_ascii_case(IMAGE_PREFIX) {
        text.get(IMAGE_PREFIX.len()..)
    } else {
        None
    }
}

fn is_prompt_help_request(text: &str) -> bool {
    let lower = text.to_lowercase();
    lower.contains("improve prompt") || lower.contains("refine prompt")
}
