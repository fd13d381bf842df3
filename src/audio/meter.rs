//! Loudness metering for the input and output timelines.
//!
//! `SpectrumAnalyser` turns the most recent samples of a timeline into a byte
//! frequency snapshot; `VolumeMeter` reduces a snapshot to a single scalar for the UI.

use std::f32::consts::PI;

/// FFT size of the analyser (yields `FFT_SIZE / 2` magnitude bins).
pub const FFT_SIZE: usize = 256;

/// Calibration constant: a mean bin value of 128 reads as volume 1.0.
const VOLUME_REFERENCE: f32 = 128.0;

/// Weight of the previous magnitude when smoothing successive snapshots.
const SMOOTHING: f32 = 0.8;

/// Decibel range mapped onto byte values 0..=255.
const MIN_DECIBELS: f32 = -100.0;
const MAX_DECIBELS: f32 = -30.0;

/// Normalized loudness derived from frequency snapshots.
///
/// Readings can exceed 1.0 on loud input; clamping is left to display code.
#[derive(Debug, Default, Clone)]
pub struct VolumeMeter {
    level: f32,
}

impl VolumeMeter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compute the volume for one frequency snapshot and remember it.
    pub fn sample(&mut self, snapshot: &[u8]) -> f32 {
        self.level = if snapshot.is_empty() {
            0.0
        } else {
            let sum: u32 = snapshot.iter().map(|&bin| u32::from(bin)).sum();
            (sum as f32 / snapshot.len() as f32) / VOLUME_REFERENCE
        };
        self.level
    }

    /// Last computed volume.
    pub fn level(&self) -> f32 {
        self.level
    }

    pub fn reset(&mut self) {
        self.level = 0.0;
    }
}

/// Byte frequency analyser over the most recent `FFT_SIZE` samples of a stream.
pub struct SpectrumAnalyser {
    history: Vec<f32>,  // Most recent samples, oldest first
    window: Vec<f32>,   // Blackman window coefficients
    cos_table: Vec<f32>,
    sin_table: Vec<f32>,
    smoothed: Vec<f32>, // Smoothed linear magnitudes per bin
}

impl SpectrumAnalyser {
    pub fn new() -> Self {
        let n = FFT_SIZE as f32;
        let window = (0..FFT_SIZE)
            .map(|i| {
                let x = i as f32 / n;
                0.42 - 0.5 * (2.0 * PI * x).cos() + 0.08 * (4.0 * PI * x).cos()
            })
            .collect();
        let cos_table = (0..FFT_SIZE).map(|i| (2.0 * PI * i as f32 / n).cos()).collect();
        let sin_table = (0..FFT_SIZE).map(|i| (2.0 * PI * i as f32 / n).sin()).collect();

        Self { history: vec![0.0; FFT_SIZE], window, cos_table, sin_table, smoothed: vec![0.0; FFT_SIZE / 2] }
    }

    /// Append samples to the analysed stream, keeping only the newest `FFT_SIZE`.
    pub fn push(&mut self, samples: &[f32]) {
        if samples.len() >= FFT_SIZE {
            self.history.copy_from_slice(&samples[samples.len() - FFT_SIZE..]);
        } else {
            self.history.drain(..samples.len());
            self.history.extend_from_slice(samples);
        }
    }

    /// Current byte frequency data (`FFT_SIZE / 2` bins).
    pub fn snapshot(&mut self) -> Vec<u8> {
        let windowed: Vec<f32> = self.history.iter().zip(&self.window).map(|(s, w)| s * w).collect();
        let scale = 1.0 / FFT_SIZE as f32;
        let range = MAX_DECIBELS - MIN_DECIBELS;

        self.smoothed
            .iter_mut()
            .enumerate()
            .map(|(k, smoothed)| {
                let (mut re, mut im) = (0.0f32, 0.0f32);
                for (n, &x) in windowed.iter().enumerate() {
                    let idx = (k * n) % FFT_SIZE;
                    re += x * self.cos_table[idx];
                    im -= x * self.sin_table[idx];
                }
                let magnitude = (re * re + im * im).sqrt() * scale;
                *smoothed = SMOOTHING * *smoothed + (1.0 - SMOOTHING) * magnitude;

                if *smoothed <= 0.0 || !smoothed.is_finite() {
                    return 0;
                }
                let db = 20.0 * smoothed.log10();
                ((db - MIN_DECIBELS) / range * 255.0).clamp(0.0, 255.0) as u8
            })
            .collect()
    }
}

impl Default for SpectrumAnalyser {
    fn default() -> Self {
        Self::new()
    }
}
