//! cpal helpers shared by the capture and playback streams.

use anyhow::Result;
use cpal::traits::DeviceTrait;
use cpal::{Device, SampleFormat, SupportedStreamConfig, SupportedStreamConfigRange};

/// Human-readable device name, or "Unknown".
pub fn device_name(device: &Device) -> String {
    device.description().ok().map(|desc| desc.name().to_string()).unwrap_or_else(|| "Unknown".to_string())
}

/// Pick an F32 mono/stereo configuration, preferring one that runs at `target_rate`.
///
/// Among matching ranges mono wins over stereo. When no range covers the target,
/// the first candidate is clamped to its closest supported rate.
pub fn find_f32_config(configs: impl Iterator<Item = SupportedStreamConfigRange>, target_rate: u32) -> Result<SupportedStreamConfig> {
    let mut candidates: Vec<SupportedStreamConfigRange> =
        configs.filter(|c| c.channels() <= 2 && c.sample_format() == SampleFormat::F32).collect();

    if candidates.is_empty() {
        anyhow::bail!("No F32 mono or stereo audio configuration available");
    }

    candidates.sort_by_key(|c| c.channels());

    if let Some(config) = candidates.iter().find(|c| (c.min_sample_rate()..=c.max_sample_rate()).contains(&target_rate)) {
        return Ok((*config).with_sample_rate(target_rate));
    }

    let config = &candidates[0];
    let rate = target_rate.clamp(config.min_sample_rate(), config.max_sample_rate());
    Ok((*config).with_sample_rate(rate))
}

/// Average interleaved frames down to a single channel.
pub fn downmix(data: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return data.to_vec();
    }
    data.chunks(channels).map(|frame| frame.iter().sum::<f32>() / channels as f32).collect()
}
