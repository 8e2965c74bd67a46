use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use std::time::Duration;

/// Sample rate of the speech payloads returned by the TTS model.
pub(crate) const SPEECH_SAMPLE_RATE: u32 = 24_000;

/// Speech payloads are mono.
pub(crate) const SPEECH_CHANNELS: u16 = 1;

const PCM16_SCALE: f32 = 32768.0;

#[derive(Debug, thiserror::Error)]
pub enum PcmError {
    #[error("Invalid PCM format: {sample_rate}Hz, {channels} channels")]
    InvalidFormat { sample_rate: u32, channels: u16 },
    #[error("Audio payload is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// Decoded audio, one plane per channel.
///
/// Every plane has the same length. Samples are normalized to `[-1.0, 1.0)`.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioSampleBuffer {
    sample_rate: u32,
    channels: Vec<Vec<f32>>,
}

impl AudioSampleBuffer {
    /// Wrap already separated planes. Longer planes are cut to the shortest.
    pub(crate) fn from_planes(sample_rate: u32, mut channels: Vec<Vec<f32>>) -> Self {
        let frames = channels.iter().map(|c| c.len()).min().unwrap_or(0);
        for plane in channels.iter_mut() {
            plane.truncate(frames);
        }
        Self { sample_rate, channels }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn frame_count(&self) -> usize {
        self.channels.first().map(|c| c.len()).unwrap_or(0)
    }

    pub fn channel(&self, index: usize) -> Option<&[f32]> {
        self.channels.get(index).map(|c| c.as_slice())
    }

    pub fn channels(&self) -> &[Vec<f32>] {
        &self.channels
    }

    pub fn is_empty(&self) -> bool {
        self.frame_count() == 0
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.frame_count() as f64 / self.sample_rate as f64)
    }

    /// Frame-major copy of the planes (L R L R ...), the layout cpal writes.
    pub fn interleaved(&self) -> Vec<f32> {
        let channel_count = self.channel_count();
        let frames = self.frame_count();
        let mut out = Vec::with_capacity(frames * channel_count);
        for frame in 0..frames {
            for plane in &self.channels {
                out.push(plane[frame]);
            }
        }
        out
    }
}

/// Decode interleaved 16-bit little-endian signed PCM.
///
/// A trailing odd byte or partial frame is dropped rather than rejected, the
/// way a raw PCM stream cut mid-frame is usually handled.
pub fn decode_pcm16(
    bytes: &[u8],
    sample_rate: u32,
    channel_count: u16,
) -> Result<AudioSampleBuffer, PcmError> {
    if sample_rate == 0 || channel_count == 0 {
        return Err(PcmError::InvalidFormat { sample_rate, channels: channel_count });
    }

    let channel_count = channel_count as usize;
    let frame_bytes = 2 * channel_count;
    let frames = bytes.len() / frame_bytes;

    let mut channels: Vec<Vec<f32>> = (0..channel_count)
        .map(|_| Vec::with_capacity(frames))
        .collect();
    for frame in bytes.chunks_exact(frame_bytes) {
        for (plane, sample) in channels.iter_mut().zip(frame.chunks_exact(2)) {
            let value = i16::from_le_bytes([sample[0], sample[1]]);
            plane.push(value as f32 / PCM16_SCALE);
        }
    }

    Ok(AudioSampleBuffer { sample_rate, channels })
}

/// Decode a base64 payload of 16-bit PCM, as returned inline by the TTS model.
pub fn decode_base64_pcm16(
    payload: &str,
    sample_rate: u32,
    channel_count: u16,
) -> Result<AudioSampleBuffer, PcmError> {
    let bytes = STANDARD.decode(payload.trim())?;
    decode_pcm16(&bytes, sample_rate, channel_count)
}
