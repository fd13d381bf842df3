//! Sample-rate conversion with rubato's FFT resampler.
//!
//! `StreamResampler` converts the microphone stream chunk by chunk inside the
//! capture callback; `resample` converts one whole inbound speech buffer to the
//! output device rate, compensating for the resampler's delay so back-to-back
//! buffers stay aligned on the output timeline.

use std::sync::Arc;

use anyhow::{Context, Result};
use audioadapter_buffers::direct::InterleavedSlice;
use parking_lot::Mutex;
use rubato::{Fft, FixedSync, Resampler};

/// Input frames consumed per resampler call.
const CHUNK_SIZE: usize = 1024;

/// FFT sub-chunks per call (higher = better quality, more CPU).
const SUB_CHUNKS: usize = 2;

fn mono_fft(from_rate: u32, to_rate: u32) -> Result<Fft<f32>> {
    Fft::<f32>::new(from_rate as usize, to_rate as usize, CHUNK_SIZE, SUB_CHUNKS, 1, FixedSync::Input)
        .with_context(|| format!("Failed to create resampler {from_rate} Hz -> {to_rate} Hz"))
}

/// Run one full `CHUNK_SIZE` input chunk through the resampler, appending to `out`.
fn process_chunk(resampler: &mut Fft<f32>, chunk: &[f32], scratch: &mut [f32], out: &mut Vec<f32>) -> Result<()> {
    let frames_max = scratch.len();
    let input = InterleavedSlice::new(chunk, 1, CHUNK_SIZE).context("Failed to wrap resampler input")?;
    let mut output = InterleavedSlice::new_mut(scratch, 1, frames_max).context("Failed to wrap resampler output")?;

    let (_, written) = resampler
        .process_into_buffer(&input, &mut output, None)
        .map_err(|e| anyhow::anyhow!("Resampling error: {}", e))?;
    out.extend_from_slice(&scratch[..written]);
    Ok(())
}

/// Streaming resampler for the capture path.
///
/// Callback buffers of any size are accumulated until a full chunk is available.
pub struct StreamResampler {
    resampler: Fft<f32>,
    pending: Vec<f32>,
    scratch: Vec<f32>,
}

impl StreamResampler {
    /// Shared so the cpal callback can own a handle.
    pub fn new(from_rate: u32, to_rate: u32) -> Result<Arc<Mutex<Self>>> {
        let resampler = mono_fft(from_rate, to_rate)?;
        let scratch = vec![0.0f32; resampler.output_frames_max()];
        Ok(Arc::new(Mutex::new(Self { resampler, pending: Vec::with_capacity(CHUNK_SIZE * 2), scratch })))
    }

    /// Feed callback samples; returns converted samples once at least one chunk was processed.
    pub fn process(&mut self, samples: &[f32]) -> Option<Vec<f32>> {
        self.pending.extend_from_slice(samples);

        let mut converted = Vec::new();
        while self.pending.len() >= CHUNK_SIZE {
            let chunk: Vec<f32> = self.pending.drain(..CHUNK_SIZE).collect();
            if let Err(e) = process_chunk(&mut self.resampler, &chunk, &mut self.scratch, &mut converted) {
                tracing::warn!("Dropping capture chunk: {:#}", e);
            }
        }

        if converted.is_empty() { None } else { Some(converted) }
    }
}

/// Convert a complete buffer from `from_rate` to `to_rate`.
///
/// The output has exactly `len * to_rate / from_rate` samples (rounded) and starts
/// without the resampler's leading delay.
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>> {
    if from_rate == to_rate || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    let mut resampler = mono_fft(from_rate, to_rate)?;
    let delay = resampler.output_delay();
    let expected = (samples.len() as f64 * to_rate as f64 / from_rate as f64).round() as usize;

    let mut scratch = vec![0.0f32; resampler.output_frames_max()];
    let mut output = Vec::with_capacity(expected + delay + CHUNK_SIZE);
    let mut padded = vec![0.0f32; CHUNK_SIZE];

    // Keep feeding (zero-padded) chunks until the delayed tail has been flushed out
    let mut pos = 0;
    while output.len() < expected + delay {
        let end = (pos + CHUNK_SIZE).min(samples.len());
        padded.fill(0.0);
        if pos < end {
            padded[..end - pos].copy_from_slice(&samples[pos..end]);
        }
        process_chunk(&mut resampler, &padded, &mut scratch, &mut output)?;
        pos = end;
    }

    output.drain(..delay.min(output.len()));
    output.truncate(expected);
    Ok(output)
}
