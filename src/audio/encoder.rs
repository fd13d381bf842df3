//! PCM16 wire codec for the live session.
//!
//! Outbound microphone windows are clamped, converted to little-endian 16-bit PCM
//! and base64-encoded; inbound speech payloads take the reverse path.

use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

use crate::error::DecodeError;

/// Sample rate of inbound speech when the payload does not declare one.
pub const DEFAULT_PLAYBACK_RATE: u32 = 24000;

/// A decoded mono audio buffer ready for scheduling.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    samples: Arc<[f32]>,
    sample_rate: u32,
}

impl AudioBuffer {
    pub fn new(samples: impl Into<Arc<[f32]>>, sample_rate: u32) -> Self {
        Self { samples: samples.into(), sample_rate }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Length of the buffer in seconds.
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// MIME type announcing raw PCM16 at `rate`.
pub fn pcm_mime_type(rate: u32) -> String {
    format!("audio/pcm;rate={rate}")
}

/// Extract the `rate=` parameter from a PCM MIME type such as `audio/pcm;rate=24000`.
pub fn parse_pcm_rate(mime_type: &str) -> Option<u32> {
    mime_type
        .split(';')
        .skip(1)
        .filter_map(|param| param.trim().split_once('='))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case("rate"))
        .and_then(|(_, value)| value.trim().parse().ok())
        .filter(|rate| *rate > 0)
}

/// Convert float samples to little-endian 16-bit PCM.
///
/// Samples are clamped to [-1, 1] before scaling so out-of-range input saturates
/// instead of wrapping around.
pub fn float_to_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        let clamped = if sample.is_nan() { 0.0 } else { sample.clamp(-1.0, 1.0) };
        let scaled = if clamped < 0.0 { clamped * 32768.0 } else { clamped * 32767.0 };
        bytes.extend_from_slice(&(scaled as i16).to_le_bytes());
    }
    bytes
}

/// Encode one capture window into its transport payload.
///
/// Empty input yields an empty payload.
pub fn encode_chunk(samples: &[f32]) -> String {
    if samples.is_empty() {
        return String::new();
    }
    BASE64.encode(float_to_pcm16(samples))
}

/// Decode a base64 PCM16 payload into a playable buffer.
pub fn decode_payload(payload: &str, sample_rate: u32) -> Result<AudioBuffer, DecodeError> {
    let bytes = BASE64.decode(payload.trim())?;
    if bytes.is_empty() {
        return Err(DecodeError::Empty);
    }
    if bytes.len() % 2 != 0 {
        return Err(DecodeError::OddLength(bytes.len()));
    }

    let samples: Vec<f32> = bytes
        .chunks_exact(2)
        .map(|pair| f32::from(i16::from_le_bytes([pair[0], pair[1]])) / 32768.0)
        .collect();

    Ok(AudioBuffer::new(samples, sample_rate))
}
