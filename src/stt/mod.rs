//! Speech-to-text decoding of microphone frames.
//!
//! [`SpeechDecoder`] is the seam the capture worker talks to: it accepts
//! 16-bit PCM frames and reports when an utterance is complete.
//! [`ParakeetDecoder`] segments frames with [`EnergyVad`] and transcribes each
//! utterance with NVIDIA Parakeet TDT via `parakeet-rs`.

use crate::audio::convert::from_pcm16;
use crate::config::SttConfig;
use crate::error::{AssistantError, Result};
use crate::vad::EnergyVad;
use parakeet_rs::{ParakeetTDT, TimestampMode, Transcriber};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::info;

/// Result of feeding one frame to a decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeEvent {
    /// More audio is needed.
    Partial,
    /// An utterance ended; the text may be empty.
    Utterance(String),
}

/// Incremental speech recognizer over fixed-size PCM frames.
pub trait SpeechDecoder: Send {
    /// Accept one frame of mono 16-bit PCM at the configured input rate.
    ///
    /// # Errors
    ///
    /// Returns an error if the model cannot be loaded or transcription fails.
    fn accept_frame(&mut self, frame: &[i16]) -> Result<DecodeEvent>;

    /// Drop any partially accumulated utterance.
    fn reset(&mut self) {}
}

/// Model files required by Parakeet TDT.
const ENCODER_ONNX: &str = "encoder-model.onnx";
const ENCODER_DATA: &str = "encoder-model.onnx.data";
const DECODER_ONNX: &str = "decoder_joint-model.onnx";
const VOCAB_TXT: &str = "vocab.txt";

const MODEL_FILES: [&str; 4] = [ENCODER_ONNX, ENCODER_DATA, DECODER_ONNX, VOCAB_TXT];

/// Energy VAD + Parakeet TDT decoder. The model is loaded on first utterance.
pub struct ParakeetDecoder {
    vad: EnergyVad,
    model: Option<ParakeetTDT>,
    model_id: String,
    model_dir: Option<PathBuf>,
    sample_rate: u32,
}

impl std::fmt::Debug for ParakeetDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParakeetDecoder")
            .field("model_id", &self.model_id)
            .field("loaded", &self.model.is_some())
            .field("sample_rate", &self.sample_rate)
            .finish()
    }
}

impl ParakeetDecoder {
    pub fn new(config: &SttConfig, sample_rate: u32) -> Self {
        info!("STT configured with model: {}", config.model_id);
        Self {
            vad: EnergyVad::new(config, sample_rate),
            model: None,
            model_id: config.model_id.clone(),
            model_dir: config.model_dir.clone(),
            sample_rate,
        }
    }

    /// Eagerly load the model instead of waiting for the first utterance.
    ///
    /// # Errors
    ///
    /// Returns an error if the model files cannot be fetched or loaded.
    pub fn ensure_loaded(&mut self) -> Result<()> {
        if self.model.is_none() {
            let dir = match self.model_dir {
                Some(ref dir) => dir.clone(),
                None => fetch_model_files(&self.model_id)?,
            };
            self.model = Some(load_model(&dir)?);
        }
        Ok(())
    }

    fn transcribe(&mut self, samples: Vec<f32>) -> Result<String> {
        self.ensure_loaded()?;
        let model = self
            .model
            .as_mut()
            .ok_or_else(|| AssistantError::Stt("model not initialized".into()))?;

        let started = Instant::now();
        let duration_s = samples.len() as f32 / self.sample_rate.max(1) as f32;
        let result = model
            .transcribe_samples(samples, self.sample_rate, 1, Some(TimestampMode::Sentences))
            .map_err(|e| AssistantError::Stt(format!("transcription failed: {e}")))?;

        info!(
            "transcribed {duration_s:.1}s in {:.0}ms: \"{}\"",
            started.elapsed().as_millis(),
            result.text
        );
        Ok(result.text.trim().to_owned())
    }
}

impl SpeechDecoder for ParakeetDecoder {
    fn accept_frame(&mut self, frame: &[i16]) -> Result<DecodeEvent> {
        let samples = from_pcm16(frame);
        match self.vad.push(&samples) {
            Some(utterance) => Ok(DecodeEvent::Utterance(self.transcribe(utterance)?)),
            None => Ok(DecodeEvent::Partial),
        }
    }

    fn reset(&mut self) {
        self.vad.reset();
    }
}

fn load_model(dir: &Path) -> Result<ParakeetTDT> {
    for name in MODEL_FILES {
        if !dir.join(name).is_file() {
            return Err(AssistantError::Model(format!(
                "missing {name} in {}",
                dir.display()
            )));
        }
    }
    info!("loading STT model from {}", dir.display());
    let model = ParakeetTDT::from_pretrained(dir, None)
        .map_err(|e| AssistantError::Stt(format!("failed to load Parakeet TDT: {e}")))?;
    info!("STT model loaded successfully");
    Ok(model)
}

/// Download (or reuse from the hf-hub cache) every model file and return
/// the snapshot directory holding them.
fn fetch_model_files(repo_id: &str) -> Result<PathBuf> {
    let api = hf_hub::api::sync::Api::new()
        .map_err(|e| AssistantError::Model(format!("failed to create HF API: {e}")))?;
    let repo = api.model(repo_id.to_owned());

    let mut dir = None;
    for name in MODEL_FILES {
        let path = repo.get(name).map_err(|e| {
            AssistantError::Model(format!("failed to download {name} from {repo_id}: {e}"))
        })?;
        if dir.is_none() {
            dir = path.parent().map(Path::to_path_buf);
        }
    }

    dir.ok_or_else(|| {
        AssistantError::Model(format!("could not determine model directory for {repo_id}"))
    })
}
