//! The presentation surface the orchestrator drives, and the actions it emits.

use crate::memory::Role;
use std::path::{Path, PathBuf};

/// Single-threaded presentation layer (console, window, test recorder).
///
/// Only the orchestrator's thread calls these methods.
pub trait PresentationSurface {
    /// Append a new message line.
    fn append_message(&mut self, role: Role, text: &str);
    /// Replace the text of the most recently appended message.
    fn replace_last_message(&mut self, text: &str);
    /// Display a generated image.
    fn show_image(&mut self, path: &Path);
    /// Enable or disable the input controls.
    fn set_controls_enabled(&mut self, enabled: bool);
}

/// Something the user asked for through the surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserAction {
    SubmitText(String),
    RequestVoiceInput,
    RequestStopPlayback,
    RequestSaveLastImage { destination: PathBuf },
    SetSpeechOutput(bool),
}
