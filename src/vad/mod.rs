//! Voice activity detection using energy-based analysis.
//!
//! Uses RMS energy thresholding to split a stream of frames into utterances.

use crate::config::SttConfig;
use tracing::{debug, info};

/// Voice activity detector using RMS energy thresholding.
#[derive(Debug)]
pub struct EnergyVad {
    /// Accumulated samples for the current utterance.
    speech_buffer: Vec<f32>,
    /// Whether we are currently inside an utterance.
    in_speech: bool,
    /// Consecutive silent samples seen since the last speech frame.
    silent_samples: usize,
    /// Silent samples that close an utterance.
    silence_limit: usize,
    /// RMS energy above which a frame counts as speech.
    threshold: f32,
    /// Minimum utterance length in samples.
    min_speech_samples: usize,
}

impl EnergyVad {
    pub fn new(config: &SttConfig, sample_rate: u32) -> Self {
        let silence_limit = ms_to_samples(config.min_silence_ms, sample_rate);
        let min_speech_samples = ms_to_samples(config.min_speech_ms, sample_rate);

        info!(
            "VAD initialized: threshold={}, silence={}ms, min_speech={}ms",
            config.vad_threshold, config.min_silence_ms, config.min_speech_ms
        );

        Self {
            speech_buffer: Vec::new(),
            in_speech: false,
            silent_samples: 0,
            silence_limit,
            threshold: config.vad_threshold,
            min_speech_samples,
        }
    }

    /// Feed one frame; returns the utterance samples once trailing silence closes it.
    pub fn push(&mut self, frame: &[f32]) -> Option<Vec<f32>> {
        let energy = compute_rms_energy(frame);

        if energy > self.threshold {
            if !self.in_speech {
                debug!(energy, "speech started");
                self.in_speech = true;
                self.speech_buffer.clear();
            }
            self.silent_samples = 0;
            self.speech_buffer.extend_from_slice(frame);
            return None;
        }

        if !self.in_speech {
            return None;
        }

        // Keep trailing silence so word endings are not clipped.
        self.silent_samples += frame.len();
        self.speech_buffer.extend_from_slice(frame);

        if self.silent_samples < self.silence_limit {
            return None;
        }

        self.in_speech = false;
        self.silent_samples = 0;
        let voiced = self.speech_buffer.len().saturating_sub(self.silence_limit);
        if voiced >= self.min_speech_samples {
            Some(std::mem::take(&mut self.speech_buffer))
        } else {
            debug!(samples = voiced, "discarding short utterance");
            self.speech_buffer.clear();
            None
        }
    }

    /// Whether an utterance is currently open.
    #[must_use]
    pub fn in_speech(&self) -> bool {
        self.in_speech
    }

    pub fn reset(&mut self) {
        self.speech_buffer.clear();
        self.in_speech = false;
        self.silent_samples = 0;
    }
}

fn ms_to_samples(ms: u32, sample_rate: u32) -> usize {
    (ms as usize * sample_rate as usize) / 1000
}

/// Compute RMS energy of audio samples.
fn compute_rms_energy(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
    (sum_sq / samples.len() as f32).sqrt()
}
