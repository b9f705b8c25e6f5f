//! Message types passed from background tasks to the orchestrator.

use std::fmt;
use std::path::PathBuf;

/// Kinds of background work; single-flight is enforced per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    ChatStreaming,
    ImageGeneration,
    SpeechCapture,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ChatStreaming => "chat-streaming",
            Self::ImageGeneration => "image-generation",
            Self::SpeechCapture => "speech-capture",
        };
        f.write_str(name)
    }
}

/// An entry on a chat stream's queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamToken {
    /// Decoded text fragment, in send order.
    Fragment(String),
    /// The backend closed the stream normally.
    End,
    /// Transport or protocol failure; no further tokens follow.
    Failed(String),
}

impl StreamToken {
    /// Whether this token ends the stream.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::End | Self::Failed(_))
    }
}

/// Final outcome of one image generation run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageOutcome {
    /// The backend wrote an image at this path.
    Ready(PathBuf),
    /// No image was produced.
    Failed(String),
}

/// An audio file handed to the playback controller, which owns it from then on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackRequest {
    pub path: PathBuf,
}

impl PlaybackRequest {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}
