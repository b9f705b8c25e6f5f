//! Audio file decoding via symphonia.

use crate::error::{AssistantError, Result};
use std::path::Path;

/// Decoded audio, down-mixed to mono.
#[derive(Debug, Clone)]
pub struct DecodedAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl DecodedAudio {
    /// Duration in seconds.
    #[must_use]
    pub fn seconds(&self) -> f32 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f32 / self.sample_rate as f32
    }
}

/// Decode an audio file (mp3, wav, aac, mp4) to mono f32 samples.
///
/// # Errors
///
/// Returns an error if the file cannot be opened, probed or decoded.
pub fn decode_file(path: &Path) -> Result<DecodedAudio> {
    use symphonia::core::audio::SampleBuffer;
    use symphonia::core::codecs::DecoderOptions;
    use symphonia::core::errors::Error as SymphError;
    use symphonia::core::formats::FormatOptions;
    use symphonia::core::io::MediaSourceStream;
    use symphonia::core::meta::MetadataOptions;
    use symphonia::core::probe::Hint;

    let file = std::fs::File::open(path)?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| AssistantError::Audio(format!("failed to probe audio: {e}")))?;

    let mut format = probed.format;
    let track = format
        .default_track()
        .ok_or_else(|| AssistantError::Audio("no default audio track".into()))?;
    let track_id = track.id;
    let codec_params = track.codec_params.clone();

    let sample_rate = codec_params
        .sample_rate
        .ok_or_else(|| AssistantError::Audio("unknown sample rate".into()))?;

    let mut decoder = symphonia::default::get_codecs()
        .make(&codec_params, &DecoderOptions::default())
        .map_err(|e| AssistantError::Audio(format!("failed to create decoder: {e}")))?;

    let mut out: Vec<f32> = Vec::new();
    let mut sample_buf: Option<SampleBuffer<f32>> = None;

    loop {
        let packet = match format.next_packet() {
            Ok(p) => p,
            Err(SymphError::IoError(e)) => {
                if e.kind() == std::io::ErrorKind::UnexpectedEof {
                    break;
                }
                return Err(AssistantError::Audio(format!("audio read error: {e}")));
            }
            Err(e) => return Err(AssistantError::Audio(format!("audio read error: {e}"))),
        };

        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(d) => d,
            Err(SymphError::DecodeError(_)) => continue,
            Err(e) => return Err(AssistantError::Audio(format!("audio decode error: {e}"))),
        };

        let spec = *decoded.spec();
        let channels = spec.channels.count();
        let frames = decoded.frames() as u64;

        let frames_usize = usize::try_from(frames).unwrap_or(usize::MAX);
        let required = frames_usize.saturating_mul(channels);
        let needs_new = match sample_buf.as_ref() {
            Some(b) => b.capacity() < required,
            None => true,
        };

        if needs_new {
            sample_buf = Some(SampleBuffer::<f32>::new(frames, spec));
        } else if let Some(b) = sample_buf.as_mut() {
            b.clear();
        }

        if let Some(b) = sample_buf.as_mut() {
            b.copy_interleaved_ref(decoded);
        }

        let data = match sample_buf.as_ref() {
            Some(b) => b.samples(),
            None => &[],
        };
        let channels = u16::try_from(channels).unwrap_or(u16::MAX);
        out.extend(super::convert::to_mono(data, channels));
    }

    Ok(DecodedAudio {
        samples: out,
        sample_rate,
    })
}
