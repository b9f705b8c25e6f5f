//! Configuration types for the assistant.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration for the assistant.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AssistantConfig {
    /// Language model backend settings.
    pub llm: LlmConfig,
    /// Image generation backend settings.
    pub image: ImageConfig,
    /// Audio capture/playback settings.
    pub audio: AudioConfig,
    /// Text-to-speech settings.
    pub tts: TtsConfig,
    /// Speech-to-text settings.
    pub stt: SttConfig,
    /// Presentation loop settings.
    pub ui: UiConfig,
}

/// Language model backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Base URL of the generate endpoint host (e.g. Ollama).
    pub api_url: String,
    /// Model name sent with every request.
    pub model: String,
    /// Seconds to wait for the backend to accept the connection.
    pub connect_timeout_secs: u64,
    /// Seconds without response data before a chat stream is abandoned.
    pub idle_timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:11434".to_owned(),
            model: "llama3.1:latest".to_owned(),
            connect_timeout_secs: 10,
            idle_timeout_secs: 30,
        }
    }
}

impl LlmConfig {
    /// Full URL of the streaming generate endpoint.
    pub fn generate_url(&self) -> String {
        format!("{}/api/generate", self.api_url.trim_end_matches('/'))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// Image generation backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    /// Executable invoked for every generation (looked up on `PATH`).
    pub executable: String,
    /// Value passed as `--model-version`.
    pub model_version: String,
    /// Value passed as `--steps`.
    pub steps: u32,
    /// Directory generated images are written to (None = current directory).
    pub output_dir: Option<PathBuf>,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            executable: "diffusionkit-cli".to_owned(),
            model_version: "argmaxinc/mlx-FLUX.1-schnell".to_owned(),
            steps: 15,
            output_dir: None,
        }
    }
}

impl ImageConfig {
    /// Directory generated images land in.
    pub fn effective_output_dir(&self) -> PathBuf {
        match self.output_dir {
            Some(ref dir) => dir.clone(),
            None => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }
}

/// Audio I/O configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Sample rate fed to the speech decoder in Hz.
    pub input_sample_rate: u32,
    /// Number of samples per frame handed to the speech decoder.
    pub frame_size: usize,
    /// Input device name (None = system default).
    pub input_device: Option<String>,
    /// Output device name (None = system default).
    pub output_device: Option<String>,
    /// How often the playback watcher checks for natural completion.
    pub watcher_poll_ms: u64,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            input_sample_rate: 16_000,
            frame_size: 8_000,
            input_device: None,
            output_device: None,
            watcher_poll_ms: 100,
        }
    }
}

/// Text-to-speech configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsConfig {
    /// Whether finalized responses are spoken aloud.
    pub enabled: bool,
    /// Synthesizer executable.
    pub command: String,
    /// Argument template; `{text}` and `{output}` are substituted per call.
    pub args: Vec<String>,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            command: "espeak-ng".to_owned(),
            args: vec!["-w".to_owned(), "{output}".to_owned(), "{text}".to_owned()],
        }
    }
}

/// Speech-to-text configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SttConfig {
    /// HuggingFace model ID for the STT model.
    pub model_id: String,
    /// Local directory holding the model files (skips the download when set).
    pub model_dir: Option<PathBuf>,
    /// RMS energy above which a frame counts as speech.
    pub vad_threshold: f32,
    /// Trailing silence that closes an utterance, in ms.
    pub min_silence_ms: u32,
    /// Utterances shorter than this are discarded, in ms.
    pub min_speech_ms: u32,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            // ONNX export; the upstream NVIDIA repo only ships .nemo.
            model_id: "istupakov/parakeet-tdt-0.6b-v3-onnx".to_owned(),
            model_dir: None,
            vad_threshold: 0.01,
            min_silence_ms: 1000,
            min_speech_ms: 300,
        }
    }
}

/// Presentation loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UiConfig {
    /// Interval between drain ticks in ms.
    pub tick_interval_ms: u64,
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 100,
        }
    }
}

impl UiConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }
}

impl AssistantConfig {
    /// Load configuration from a TOML file, falling back to defaults for missing fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| crate::error::AssistantError::Config(e.to_string()))
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &std::path::Path) -> crate::error::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::error::AssistantError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path: `~/.config/cithia/config.toml`.
    pub fn default_config_path() -> PathBuf {
        if let Some(config) = std::env::var_os("XDG_CONFIG_HOME") {
            PathBuf::from(config).join("cithia").join("config.toml")
        } else if let Some(config) = dirs::config_dir() {
            config.join("cithia").join("config.toml")
        } else {
            PathBuf::from("/tmp/cithia-config/config.toml")
        }
    }

    /// Directory the binary writes its rolling log files to.
    pub fn log_dir() -> PathBuf {
        match dirs::data_local_dir() {
            Some(dir) => dir.join("cithia").join("logs"),
            None => std::env::temp_dir().join("cithia-logs"),
        }
    }
}
