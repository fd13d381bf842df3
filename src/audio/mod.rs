//! Audio pipeline: device I/O, PCM codec, metering and playback scheduling.
//!
//! Capture and playback use cpal, with rubato resampling wherever the hardware
//! cannot run at the rates the live service expects.

mod backend;
mod capture;
pub mod encoder;
pub mod meter;
mod playback;
pub mod resampler;
pub mod scheduler;
pub mod util;

pub use backend::{AudioBackend, CpalBackend, InputHandle};
pub use encoder::AudioBuffer;
pub use meter::{SpectrumAnalyser, VolumeMeter};
pub use scheduler::{PlaybackScheduler, PlaybackSink, PlaybackUnit, UnitId};
