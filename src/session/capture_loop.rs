//! Per-window work on the input timeline: meter, encode, dispatch.

use tracing::trace;

use crate::audio::encoder::{encode_chunk, pcm_mime_type};
use crate::audio::{SpectrumAnalyser, VolumeMeter};
use crate::live::{Blob, MediaInput, SessionHandle};

pub struct CaptureLoop {
    mime_type: String,
    analyser: SpectrumAnalyser,
    meter: VolumeMeter,
}

impl CaptureLoop {
    pub fn new(sample_rate: u32) -> Self {
        Self { mime_type: pcm_mime_type(sample_rate), analyser: SpectrumAnalyser::new(), meter: VolumeMeter::new() }
    }

    /// Handle one capture window.
    ///
    /// Without a session the window is discarded untouched and `None` is returned.
    /// Otherwise the input volume is updated and the encoded chunk is queued on the
    /// session without waiting; the new volume is returned either way.
    pub fn tick(&mut self, window: &[f32], session: Option<&SessionHandle>) -> Option<f32> {
        let session = session?;

        self.analyser.push(window);
        let volume = self.meter.sample(&self.analyser.snapshot());

        let data = encode_chunk(window);
        if data.is_empty() {
            return Some(volume);
        }

        let queued = session.send(MediaInput { media: Blob { mime_type: self.mime_type.clone(), data } });
        trace!("Capture window of {} samples, volume {:.3}, queued: {}", window.len(), volume, queued);

        Some(volume)
    }
}
