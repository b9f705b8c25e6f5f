//! Sample format helpers shared by capture and playback.

/// Convert interleaved multi-channel audio to mono by averaging channels.
pub fn to_mono(data: &[f32], channels: u16) -> Vec<f32> {
    let ch = channels.max(1) as usize;
    if ch == 1 {
        return data.to_vec();
    }
    data.chunks_exact(ch)
        .map(|frame| frame.iter().sum::<f32>() / ch as f32)
        .collect()
}

/// Simple linear-interpolation resampler for mono audio.
///
/// Good enough for speech in both directions (48kHz → 16kHz capture,
/// 22.05kHz → 48kHz playback).
pub fn resample(samples: &[f32], src_rate: u32, dst_rate: u32) -> Vec<f32> {
    if src_rate == dst_rate || samples.is_empty() || src_rate == 0 || dst_rate == 0 {
        return samples.to_vec();
    }

    let ratio = src_rate as f64 / dst_rate as f64;
    let out_len = (samples.len() as f64 / ratio) as usize;
    let mut output = Vec::with_capacity(out_len);

    for i in 0..out_len {
        let src_pos = i as f64 * ratio;
        let idx = src_pos as usize;
        let frac = src_pos - idx as f64;

        let sample = if idx + 1 < samples.len() {
            samples[idx] as f64 * (1.0 - frac) + samples[idx + 1] as f64 * frac
        } else {
            samples[idx.min(samples.len() - 1)] as f64
        };

        output.push(sample as f32);
    }

    output
}

/// Linear resampler for audio that arrives in chunks, such as device callbacks.
///
/// The read position and the last input sample carry over between calls, so
/// output timing does not depend on how the input was split.
#[derive(Debug, Clone)]
pub struct StreamResampler {
    step: f64,
    position: f64,
    carry: Option<f32>,
}

impl StreamResampler {
    pub fn new(src_rate: u32, dst_rate: u32) -> Self {
        let step = if src_rate == 0 || dst_rate == 0 {
            1.0
        } else {
            f64::from(src_rate) / f64::from(dst_rate)
        };
        Self {
            step,
            position: 0.0,
            carry: None,
        }
    }

    /// Resample the next chunk. The final input sample is held back until the
    /// following chunk arrives.
    pub fn process(&mut self, chunk: &[f32]) -> Vec<f32> {
        if chunk.is_empty() {
            return Vec::new();
        }

        let mut buf = Vec::with_capacity(chunk.len() + 1);
        buf.extend(self.carry);
        buf.extend_from_slice(chunk);

        let last = (buf.len() - 1) as f64;
        let mut output = Vec::with_capacity((last / self.step) as usize + 1);
        while self.position < last {
            let idx = self.position as usize;
            let frac = self.position - idx as f64;
            let sample = f64::from(buf[idx]) * (1.0 - frac) + f64::from(buf[idx + 1]) * frac;
            output.push(sample as f32);
            self.position += self.step;
        }

        self.position -= last;
        self.carry = buf.last().copied();
        output
    }
}

/// Convert f32 samples in \[-1, 1\] to 16-bit PCM.
pub fn to_pcm16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|s| (s.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16)
        .collect()
}

/// Convert 16-bit PCM to f32 samples in \[-1, 1\].
pub fn from_pcm16(samples: &[i16]) -> Vec<f32> {
    samples
        .iter()
        .map(|&s| s as f32 / i16::MAX as f32)
        .collect()
}
