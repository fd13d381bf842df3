//! Device acquisition seam between the session controller and the audio hardware.

use anyhow::Result;
use tokio::sync::mpsc;

use super::capture::Capturer;
use super::playback::Player;
use super::scheduler::{PlaybackSink, UnitId};

/// A started-or-startable microphone stream.
pub trait InputHandle {
    /// Begin emitting capture windows.
    fn start(&mut self) -> Result<()>;

    /// Stop capturing and release the device. Idempotent.
    fn stop(&mut self);
}

/// Opens the per-session input and output devices.
pub trait AudioBackend {
    type Input: InputHandle;
    type Output: PlaybackSink;

    /// Open the output device, preferring `sample_rate`; finished units are reported on `completions`.
    fn open_output(&mut self, sample_rate: u32, completions: mpsc::UnboundedSender<UnitId>) -> Result<Self::Output>;

    /// Open the input device without starting it.
    fn open_input(&mut self, sample_rate: u32, window: usize, windows: mpsc::Sender<Vec<f32>>) -> Result<Self::Input>;
}

/// The default host's devices through cpal.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalBackend;

impl AudioBackend for CpalBackend {
    type Input = Capturer;
    type Output = Player;

    fn open_output(&mut self, sample_rate: u32, completions: mpsc::UnboundedSender<UnitId>) -> Result<Player> {
        Player::new(sample_rate, completions)
    }

    fn open_input(&mut self, sample_rate: u32, window: usize, windows: mpsc::Sender<Vec<f32>>) -> Result<Capturer> {
        Capturer::new(sample_rate, window, windows)
    }
}
