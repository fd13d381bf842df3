//! Timeline-based audio output using cpal.
//!
//! The output callback owns a small mixer of scheduled voices and a frame counter
//! that defines the output timeline. The event loop talks to it only through
//! lock-free ring buffers: commands in, mixed samples out (the analysis tap), and
//! a completion channel reporting units that finished on their own. Flushing bumps
//! a shared epoch instead of queueing commands, so it works even with a full ring.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Stream, StreamConfig};
use ringbuf::HeapRb;
use ringbuf::traits::{Consumer, Producer, Split};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::encoder::AudioBuffer;
use super::resampler::resample;
use super::scheduler::{PlaybackSink, UnitId};
use super::util::{device_name, find_f32_config};

/// Pending mixer commands (a few seconds of typical 40 ms speech chunks).
const COMMAND_QUEUE_SIZE: usize = 512;

/// Mixed output kept for metering (a few analyser windows at 48 kHz).
const TAP_SIZE: usize = 8192;

enum MixerCommand {
    Start { id: UnitId, samples: Vec<f32>, start_frame: u64, epoch: u64 },
    Stop(UnitId),
}

/// A unit being rendered by the output callback.
struct Voice {
    id: UnitId,
    samples: Vec<f32>,
    start_frame: u64,
    position: usize,
    epoch: u64,
}

/// Callback-side mixer state.
struct Mixer {
    commands: ringbuf::HeapCons<MixerCommand>,
    tap: ringbuf::HeapProd<f32>,
    completions: mpsc::UnboundedSender<UnitId>,
    voices: Vec<Voice>,
    frames: Arc<AtomicU64>,
    epoch: Arc<AtomicU64>,
    channels: usize,
}

impl Mixer {
    fn render(&mut self, data: &mut [f32]) {
        let epoch = self.epoch.load(Ordering::Acquire);
        while let Some(command) = self.commands.try_pop() {
            match command {
                MixerCommand::Start { id, samples, start_frame, epoch: started } => {
                    if started == epoch {
                        self.voices.push(Voice { id, samples, start_frame, position: 0, epoch });
                    }
                }
                MixerCommand::Stop(id) => self.voices.retain(|voice| voice.id != id),
            }
        }
        // Voices from before the last flush are silenced without a completion
        self.voices.retain(|voice| voice.epoch == epoch);

        let base = self.frames.load(Ordering::Relaxed);
        let mut rendered = 0u64;

        for (offset, frame) in data.chunks_mut(self.channels).enumerate() {
            let now = base + offset as u64;
            let mut mixed = 0.0f32;
            for voice in self.voices.iter_mut() {
                if now >= voice.start_frame && voice.position < voice.samples.len() {
                    mixed += voice.samples[voice.position];
                    voice.position += 1;
                }
            }
            let mixed = mixed.clamp(-1.0, 1.0);
            frame.fill(mixed);
            let _ = self.tap.try_push(mixed);
            rendered += 1;
        }

        self.frames.fetch_add(rendered, Ordering::Relaxed);

        let completions = &self.completions;
        self.voices.retain(|voice| {
            if voice.position >= voice.samples.len() {
                let _ = completions.send(voice.id);
                false
            } else {
                true
            }
        });
    }
}

/// Output device whose frame counter is the playback timeline.
pub struct Player {
    stream: Stream,
    device_rate: u32,
    frames: Arc<AtomicU64>,
    epoch: Arc<AtomicU64>,
    commands: ringbuf::HeapProd<MixerCommand>,
    tap: ringbuf::HeapCons<f32>,
    completions: mpsc::UnboundedSender<UnitId>,
    released: bool,
}

impl Player {
    /// Open the default output device and start its timeline at zero.
    ///
    /// The device is asked to run at `preferred_rate` (the inbound speech rate) so
    /// buffers play without conversion; otherwise each buffer is resampled before it
    /// is queued.
    ///
    /// # Errors
    /// Returns an error if no output device is available or the stream cannot be started.
    pub fn new(preferred_rate: u32, completions: mpsc::UnboundedSender<UnitId>) -> Result<Self> {
        let host = cpal::default_host();
        let device = host.default_output_device().context("No output device available")?;

        info!("Using output device: {}", device_name(&device));

        let supported = device.supported_output_configs().context("Failed to query output configurations")?;
        let config = find_f32_config(supported, preferred_rate)?;
        let device_rate = config.sample_rate();
        let channels = config.channels() as usize;

        if device_rate != preferred_rate {
            info!("Output device runs at {} Hz, speech will be resampled from {} Hz", device_rate, preferred_rate);
        }
        debug!("Output config: {} Hz, {} channel(s), {:?}", device_rate, channels, config.sample_format());

        let (commands, command_rx) = HeapRb::<MixerCommand>::new(COMMAND_QUEUE_SIZE).split();
        let (tap_tx, tap) = HeapRb::<f32>::new(TAP_SIZE).split();
        let frames = Arc::new(AtomicU64::new(0));
        let epoch = Arc::new(AtomicU64::new(0));

        let mut mixer = Mixer {
            commands: command_rx,
            tap: tap_tx,
            completions: completions.clone(),
            voices: Vec::with_capacity(64),
            frames: frames.clone(),
            epoch: epoch.clone(),
            channels,
        };

        let stream_config: StreamConfig = config.config();
        let stream = device
            .build_output_stream(
                &stream_config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| mixer.render(data),
                |err| tracing::error!("Audio playback error: {}", err),
                None,
            )
            .context("Failed to open speaker stream")?;

        stream.play().context("Failed to start speaker stream")?;

        info!("Audio playback started at {} Hz", device_rate);

        Ok(Self { stream, device_rate, frames, epoch, commands, tap, completions, released: false })
    }
}

impl PlaybackSink for Player {
    fn current_time(&self) -> f64 {
        self.frames.load(Ordering::Relaxed) as f64 / self.device_rate as f64
    }

    fn start(&mut self, id: UnitId, buffer: &AudioBuffer, start: f64) {
        if self.released {
            return;
        }
        let samples = match resample(buffer.samples(), buffer.sample_rate(), self.device_rate) {
            Ok(samples) => samples,
            Err(e) => {
                warn!("Resampling failed ({:#}), playing unit {} unconverted", e, id);
                buffer.samples().to_vec()
            }
        };
        let start_frame = (start * self.device_rate as f64).round() as u64;
        let epoch = self.epoch.load(Ordering::Acquire);
        if self.commands.try_push(MixerCommand::Start { id, samples, start_frame, epoch }).is_err() {
            warn!("Playback command queue full, unit {} skipped", id);
            let _ = self.completions.send(id);
        }
    }

    fn stop(&mut self, id: UnitId) {
        if !self.released && self.commands.try_push(MixerCommand::Stop(id)).is_err() {
            warn!("Playback command queue full, stop of unit {} dropped", id);
        }
    }

    fn stop_all(&mut self, _ids: &[UnitId]) {
        if !self.released {
            self.epoch.fetch_add(1, Ordering::AcqRel);
        }
    }

    fn drain_tap(&mut self, out: &mut Vec<f32>) {
        while let Some(sample) = self.tap.try_pop() {
            out.push(sample);
        }
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(e) = self.stream.pause() {
            debug!("Failed to pause speaker stream: {}", e);
        }
        while self.tap.try_pop().is_some() {}
        info!("Audio playback stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mixer(channels: usize) -> (Mixer, ringbuf::HeapProd<MixerCommand>, ringbuf::HeapCons<f32>, mpsc::UnboundedReceiver<UnitId>) {
        let (commands, command_rx) = HeapRb::<MixerCommand>::new(16).split();
        let (tap_tx, tap) = HeapRb::<f32>::new(1024).split();
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        let mixer = Mixer {
            commands: command_rx,
            tap: tap_tx,
            completions: done_tx,
            voices: Vec::new(),
            frames: Arc::new(AtomicU64::new(0)),
            epoch: Arc::new(AtomicU64::new(0)),
            channels,
        };
        (mixer, commands, tap, done_rx)
    }

    #[test]
    fn test_voice_starts_on_its_frame() {
        let (mut mixer, mut commands, _tap, mut done) = mixer(1);
        let _ = commands.try_push(MixerCommand::Start { id: 7, samples: vec![0.5; 2], start_frame: 3, epoch: 0 });

        let mut out = [1.0f32; 6];
        mixer.render(&mut out);
        assert_eq!(out, [0.0, 0.0, 0.0, 0.5, 0.5, 0.0]);
        assert_eq!(mixer.frames.load(Ordering::Relaxed), 6);
        assert_eq!(done.try_recv().unwrap(), 7);
    }

    #[test]
    fn test_back_to_back_voices_do_not_overlap() {
        let (mut mixer, mut commands, _tap, _done) = mixer(2);
        let _ = commands.try_push(MixerCommand::Start { id: 0, samples: vec![0.25; 2], start_frame: 0, epoch: 0 });
        let _ = commands.try_push(MixerCommand::Start { id: 1, samples: vec![0.5; 2], start_frame: 2, epoch: 0 });

        let mut out = [0.0f32; 8];
        mixer.render(&mut out);
        assert_eq!(out, [0.25, 0.25, 0.25, 0.25, 0.5, 0.5, 0.5, 0.5]);
    }

    #[test]
    fn test_stop_silences_voice_without_completion() {
        let (mut mixer, mut commands, _tap, mut done) = mixer(1);
        let _ = commands.try_push(MixerCommand::Start { id: 1, samples: vec![0.5; 100], start_frame: 0, epoch: 0 });
        let mut out = [0.0f32; 4];
        mixer.render(&mut out);

        let _ = commands.try_push(MixerCommand::Stop(1));
        // Stopping an unknown id is harmless
        let _ = commands.try_push(MixerCommand::Stop(99));
        mixer.render(&mut out);
        assert_eq!(out, [0.0; 4]);
        assert!(done.try_recv().is_err());
    }

    #[test]
    fn test_epoch_bump_silences_playing_and_queued_voices() {
        let (mut mixer, mut commands, _tap, mut done) = mixer(1);
        let _ = commands.try_push(MixerCommand::Start { id: 1, samples: vec![0.5; 100], start_frame: 0, epoch: 0 });
        let mut out = [0.0f32; 4];
        mixer.render(&mut out);
        assert_eq!(out, [0.5; 4]);

        // Queued before the flush but not yet picked up by the callback
        let _ = commands.try_push(MixerCommand::Start { id: 2, samples: vec![0.25; 100], start_frame: 4, epoch: 0 });
        mixer.epoch.fetch_add(1, Ordering::AcqRel);
        let _ = commands.try_push(MixerCommand::Start { id: 3, samples: vec![0.125; 2], start_frame: 4, epoch: 1 });

        mixer.render(&mut out);
        assert_eq!(out, [0.125, 0.125, 0.0, 0.0]);
        assert_eq!(mixer.voices.len(), 0);
        assert_eq!(done.try_recv().unwrap(), 3);
        assert!(done.try_recv().is_err());
    }

    #[test]
    fn test_tap_receives_mixed_output() {
        let (mut mixer, mut commands, mut tap, _done) = mixer(2);
        let _ = commands.try_push(MixerCommand::Start { id: 0, samples: vec![0.5, -0.5], start_frame: 0, epoch: 0 });
        let mut out = [0.0f32; 4];
        mixer.render(&mut out);

        let mut tapped = Vec::new();
        while let Some(s) = tap.try_pop() {
            tapped.push(s);
        }
        assert_eq!(tapped, vec![0.5, -0.5]);
    }
}
