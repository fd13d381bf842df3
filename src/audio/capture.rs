//! Microphone capture using cpal.
//!
//! The cpal callback downmixes (and resamples when the device rate differs from the
//! capture rate) into a lock-free ring buffer. A drain thread cuts the stream into
//! fixed-size windows and hands each one to the event loop without ever blocking:
//! if the loop is behind, the window is dropped.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Stream, StreamConfig};
use ringbuf::HeapRb;
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

use super::backend::InputHandle;
use super::resampler::StreamResampler;
use super::util::{device_name, downmix, find_f32_config};

/// Ring buffer capacity in samples (~4 seconds at 16 kHz).
const RING_SIZE: usize = 65536;

/// Microphone stream that emits fixed-size windows at the capture rate.
pub struct Capturer {
    stream: Stream,
    window: usize,
    running: Arc<AtomicBool>,                  // Callback gate
    shutdown: Arc<AtomicBool>,                 // Drain thread exit flag
    consumer: Option<ringbuf::HeapCons<f32>>,  // Moved into the drain thread on start
    windows: Option<mpsc::Sender<Vec<f32>>>,   // Moved into the drain thread on start
    drain_handle: Option<JoinHandle<()>>,
    released: bool,
}

impl Capturer {
    /// Open the default input device.
    ///
    /// # Arguments
    /// * `sample_rate` - Capture rate of the emitted windows (16000 for the live service)
    /// * `window` - Samples per emitted window
    /// * `windows` - Channel receiving each completed window
    ///
    /// # Errors
    /// Returns an error if no input device is available, no F32 configuration is
    /// supported, or the stream cannot be built (e.g. microphone access denied).
    pub fn new(sample_rate: u32, window: usize, windows: mpsc::Sender<Vec<f32>>) -> Result<Self> {
        let host = cpal::default_host();
        let device = host.default_input_device().context("No input device available")?;

        info!("Using input device: {}", device_name(&device));

        let supported = device.supported_input_configs().context("Failed to query input configurations")?;
        let config = find_f32_config(supported, sample_rate)?;
        let device_rate = config.sample_rate();
        let channels = config.channels() as usize;

        let resampler = if device_rate != sample_rate {
            info!("Input device runs at {} Hz, resampling to {} Hz", device_rate, sample_rate);
            Some(StreamResampler::new(device_rate, sample_rate)?)
        } else {
            None
        };

        // cpal exposes no echo-cancellation or noise-suppression switches; those come
        // from the platform audio stack (PipeWire/PulseAudio filters, voice processing I/O).
        debug!("Input config: {} Hz, {} channel(s), {:?}", device_rate, channels, config.sample_format());

        let running = Arc::new(AtomicBool::new(false));
        let running_cb = running.clone();
        let stream_config: StreamConfig = config.config();

        let (mut producer, consumer) = HeapRb::<f32>::new(RING_SIZE).split();

        let stream = device
            .build_input_stream(
                &stream_config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    if !running_cb.load(Ordering::Relaxed) {
                        return;
                    }
                    let mono = downmix(data, channels);
                    let samples = match &resampler {
                        Some(state) => match state.lock().process(&mono) {
                            Some(converted) => converted,
                            None => return,
                        },
                        None => mono,
                    };

                    let written = producer.push_slice(&samples);
                    if written < samples.len() {
                        static OVERRUNS: AtomicU64 = AtomicU64::new(0);
                        let count = OVERRUNS.fetch_add(1, Ordering::Relaxed);
                        if count.is_multiple_of(100) {
                            warn!("Capture ring buffer full, dropped samples ({} overruns)", count + 1);
                        }
                    }
                },
                |err| tracing::error!("Audio capture error: {}", err),
                None,
            )
            .context("Failed to open microphone stream")?;

        info!("Audio capture configured: {} Hz -> {} Hz, {} samples per window", device_rate, sample_rate, window);

        Ok(Self {
            stream,
            window,
            running,
            shutdown: Arc::new(AtomicBool::new(false)),
            consumer: Some(consumer),
            windows: Some(windows),
            drain_handle: None,
            released: false,
        })
    }

    fn spawn_drain(&mut self) -> Result<()> {
        let mut consumer = self.consumer.take().context("Capture already started")?;
        let windows = self.windows.take().context("Capture already started")?;
        let shutdown = self.shutdown.clone();
        let window = self.window;

        let handle = std::thread::Builder::new()
            .name("capture-drain".into())
            .spawn(move || {
                let mut pending: Vec<f32> = Vec::with_capacity(window * 2);
                let mut read_buffer = vec![0.0f32; window];
                let mut dropped: u64 = 0;

                while !shutdown.load(Ordering::Relaxed) {
                    if consumer.is_empty() {
                        std::thread::sleep(Duration::from_millis(2));
                        continue;
                    }

                    let read = consumer.pop_slice(&mut read_buffer);
                    pending.extend_from_slice(&read_buffer[..read]);

                    while pending.len() >= window {
                        let chunk: Vec<f32> = pending.drain(..window).collect();
                        match windows.try_send(chunk) {
                            Ok(()) => {}
                            Err(TrySendError::Full(_)) => {
                                dropped += 1;
                                debug!("Event loop behind, dropped capture window ({} total)", dropped);
                            }
                            Err(TrySendError::Closed(_)) => {
                                debug!("Window channel closed, drain thread exiting");
                                return;
                            }
                        }
                    }
                }
                debug!("Drain thread shutting down");
            })
            .context("Failed to spawn capture drain thread")?;

        self.drain_handle = Some(handle);
        Ok(())
    }
}

impl InputHandle for Capturer {
    fn start(&mut self) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);
        self.stream.play().context("Failed to start microphone stream")?;
        if self.drain_handle.is_none() {
            self.spawn_drain()?;
        }
        info!("Audio capture started");
        Ok(())
    }

    fn stop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.shutdown.store(true, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
        if let Err(e) = self.stream.pause() {
            debug!("Failed to pause microphone stream: {}", e);
        }
        drop(self.windows.take());

        if let Some(handle) = self.drain_handle.take()
            && handle.join().is_err()
        {
            warn!("Capture drain thread panicked");
        }
        info!("Audio capture stopped");
    }
}

impl Drop for Capturer {
    fn drop(&mut self) {
        self.stop();
    }
}
