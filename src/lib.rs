//! Cithia: a voice-enabled chat and image generation assistant.
//!
//! A single [`Orchestrator`] runs on the presentation thread and fans user
//! actions out to background tasks:
//!
//! - **Chat**: streams a reply from a line-delimited JSON generate endpoint
//! - **Image generation**: runs an external image backend as a subprocess
//! - **Speech capture**: records from the microphone via `cpal` and transcribes
//!   with NVIDIA Parakeet
//! - **Speech output**: synthesizes replies and plays them one at a time
//!
//! Each task publishes on its own queue; [`Orchestrator::tick`] drains them
//! without blocking.

pub mod audio;
pub mod config;
pub mod error;
pub mod image;
pub mod llm;
pub mod memory;
pub mod pipeline;
pub mod stt;
pub mod tts;
pub mod vad;

pub use config::AssistantConfig;
pub use error::{AssistantError, Result};
pub use memory::{ConversationMemory, Role, Turn};
pub use pipeline::orchestrator::{Orchestrator, Submission};
pub use pipeline::surface::{PresentationSurface, UserAction};
