//! Gapless playback scheduling on the output timeline.
//!
//! The scheduler keeps a cursor pointing at the next free instant of the output
//! device's clock. Each decoded buffer starts at `max(now, cursor)` and pushes the
//! cursor forward by its duration, so chunks arriving with jitter still play back
//! to back, in arrival order, without overlapping. `flush` implements barge-in:
//! everything scheduled is stopped and the cursor snaps back to `now`.

use tracing::debug;

use super::encoder::AudioBuffer;

/// Identifier of a scheduled unit; doubles as the handle used to stop it early.
pub type UnitId = u64;

/// The output device as seen by the scheduler.
pub trait PlaybackSink {
    /// Current position of the output timeline, in seconds.
    fn current_time(&self) -> f64;

    /// Begin playing `buffer` at exactly `start` seconds on the output timeline.
    fn start(&mut self, id: UnitId, buffer: &AudioBuffer, start: f64);

    /// Stop a unit early. Units that already finished are ignored.
    fn stop(&mut self, id: UnitId);

    /// Stop every unit in `ids` at once.
    fn stop_all(&mut self, ids: &[UnitId]) {
        for &id in ids {
            self.stop(id);
        }
    }

    /// Move any samples captured by the output analysis tap into `out`.
    fn drain_tap(&mut self, _out: &mut Vec<f32>) {}

    /// Release the output stream and its analysis tap.
    fn release(&mut self);
}

/// A buffer scheduled on the output timeline.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackUnit {
    pub id: UnitId,
    pub start: f64,
    pub duration: f64,
}

/// Owner of the output timeline cursor and the active unit set.
pub struct PlaybackScheduler<S: PlaybackSink> {
    sink: Option<S>,            // None once torn down
    cursor: f64,                // Next free start time
    active: Vec<PlaybackUnit>,  // Scheduled or playing, in arrival order
    next_id: UnitId,
}

impl<S: PlaybackSink> PlaybackScheduler<S> {
    pub fn new(sink: S) -> Self {
        Self { sink: Some(sink), cursor: 0.0, active: Vec::new(), next_id: 0 }
    }

    /// Schedule a buffer right after everything already queued.
    ///
    /// Returns the new unit, or `None` after teardown.
    pub fn schedule(&mut self, buffer: &AudioBuffer) -> Option<&PlaybackUnit> {
        let sink = self.sink.as_mut()?;

        let now = sink.current_time();
        let start = now.max(self.cursor);
        let duration = buffer.duration();
        let id = self.next_id;
        self.next_id += 1;

        sink.start(id, buffer, start);
        self.cursor = start + duration;

        debug!("Scheduled unit {} at {:.3}s for {:.3}s (cursor {:.3}s)", id, start, duration, self.cursor);

        self.active.push(PlaybackUnit { id, start, duration });
        self.active.last()
    }

    /// Remove a unit that finished playing on its own.
    ///
    /// Unknown ids (already flushed) are ignored.
    pub fn complete(&mut self, id: UnitId) -> bool {
        let before = self.active.len();
        self.active.retain(|unit| unit.id != id);
        before != self.active.len()
    }

    /// Stop everything immediately and rewind the cursor to the current time.
    pub fn flush(&mut self) {
        let Some(sink) = self.sink.as_mut() else {
            return;
        };

        let ids: Vec<UnitId> = self.active.drain(..).map(|unit| unit.id).collect();
        sink.stop_all(&ids);
        self.cursor = sink.current_time();
        debug!("Playback flushed, cursor reset to {:.3}s", self.cursor);
    }

    /// Flush and release the output device. Safe to call more than once.
    pub fn teardown(&mut self) {
        self.flush();
        if let Some(mut sink) = self.sink.take() {
            sink.release();
        }
        self.cursor = 0.0;
    }

    #[cfg(test)]
    pub fn cursor(&self) -> f64 {
        self.cursor
    }

    pub fn active(&self) -> &[PlaybackUnit] {
        &self.active
    }

    pub fn sink_mut(&mut self) -> Option<&mut S> {
        self.sink.as_mut()
    }
}
