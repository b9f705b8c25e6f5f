//! Orchestration of chat, image and speech-capture tasks.

pub mod messages;
pub mod orchestrator;
pub mod surface;
pub mod task;
