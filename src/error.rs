//! Error types for the assistant.

/// Top-level error type for the assistant's background operations.
#[derive(Debug, thiserror::Error)]
pub enum AssistantError {
    /// Audio device, stream or file decoding error.
    #[error("audio error: {0}")]
    Audio(String),

    /// Speech-to-text capture or decoding error.
    #[error("STT error: {0}")]
    Stt(String),

    /// Language model transport or protocol error.
    #[error("LLM error: {0}")]
    Llm(String),

    /// Text-to-speech synthesis error.
    #[error("TTS error: {0}")]
    Tts(String),

    /// Image generation backend error.
    #[error("image error: {0}")]
    Image(String),

    /// Model download or loading error.
    #[error("model error: {0}")]
    Model(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, AssistantError>;
