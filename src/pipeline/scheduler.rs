//! Gapless playback scheduling on the output clock.
//!
//! Each inbound chunk starts at `max(next_start_time, now)` and pushes
//! `next_start_time` forward by its duration, so consecutive chunks play
//! back to back without overlap. An interrupt silences everything already
//! queued and pulls the timeline back to the current clock.

use crate::audio::device::OutputDevice;
use crate::error::{Result, VoiceError};
use crate::pipeline::types::{AudioChunk, ScheduledSource, SourceId};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

/// Fired on every speaking edge (`true` when the first source starts, `false`
/// when the last one finishes or is interrupted).
pub type SpeakingCallback = Arc<dyn Fn(bool) + Send + Sync>;

struct SchedulerState {
    output: Box<dyn OutputDevice>,
    next_start_time: f64,
    live: BTreeMap<SourceId, ScheduledSource>,
    generation: u64,
    next_id: u64,
    speaking: bool,
    released: bool,
}

impl SchedulerState {
    fn set_speaking(&mut self, speaking: bool, on_speaking: &SpeakingCallback) {
        if self.speaking != speaking {
            self.speaking = speaking;
            on_speaking(speaking);
        }
    }

    fn silence(&mut self, on_speaking: &SpeakingCallback) {
        self.output.stop_all();
        self.live.clear();
        self.generation += 1;
        self.next_start_time = self.output.now();
        self.set_speaking(false, on_speaking);
    }
}

struct SchedulerInner {
    state: Mutex<SchedulerState>,
    on_speaking: SpeakingCallback,
}

impl SchedulerInner {
    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn finished(&self, id: SourceId, generation: u64) {
        let mut state = self.lock();
        // A completion from before the last interrupt refers to a source that
        // is already gone.
        if state.generation != generation {
            return;
        }
        if state.live.remove(&id).is_some() && state.live.is_empty() {
            state.set_speaking(false, &self.on_speaking);
        }
    }
}

/// Placement of a scheduled chunk on the output clock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledStart {
    pub id: SourceId,
    pub start_time: f64,
    pub end_time: f64,
}

/// Owns the output device and the playback timeline.
pub struct PlaybackScheduler {
    inner: Arc<SchedulerInner>,
}

impl PlaybackScheduler {
    /// Wrap an already-acquired output device.
    pub fn new(output: Box<dyn OutputDevice>, on_speaking: SpeakingCallback) -> Self {
        let next_start_time = output.now();
        Self {
            inner: Arc::new(SchedulerInner {
                state: Mutex::new(SchedulerState {
                    output,
                    next_start_time,
                    live: BTreeMap::new(),
                    generation: 0,
                    next_id: 1,
                    speaking: false,
                    released: false,
                }),
                on_speaking,
            }),
        }
    }

    /// Queue `chunk` right after everything already scheduled.
    ///
    /// # Errors
    /// Returns `VoiceError::Device` if the scheduler has been shut down or the
    /// output rejects the chunk. The timeline is left untouched on error.
    pub fn schedule(&self, chunk: AudioChunk) -> Result<ScheduledStart> {
        let mut state = self.inner.lock();
        if state.released {
            return Err(VoiceError::device("playback output already released"));
        }

        let now = state.output.now();
        let start_time = state.next_start_time.max(now);
        let duration = chunk.duration_secs();
        let id = SourceId(state.next_id);
        let generation = state.generation;

        let weak: Weak<SchedulerInner> = Arc::downgrade(&self.inner);
        let on_complete = Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.finished(id, generation);
            }
        });

        state.output.play_at(id, chunk, start_time, on_complete)?;

        state.next_id += 1;
        state.next_start_time = start_time + duration;
        state.live.insert(
            id,
            ScheduledSource {
                id,
                start_time,
                duration,
            },
        );
        state.set_speaking(true, &self.inner.on_speaking);

        tracing::trace!(
            "scheduled {id} at {start_time:.3}s for {duration:.3}s (now {now:.3}s)"
        );

        Ok(ScheduledStart {
            id,
            start_time,
            end_time: start_time + duration,
        })
    }

    /// Silence all queued and playing audio and reset the timeline to now.
    pub fn interrupt(&self) {
        let mut state = self.inner.lock();
        if state.released {
            return;
        }
        let dropped = state.live.len();
        state.silence(&self.inner.on_speaking);
        tracing::debug!("playback interrupted, {dropped} source(s) dropped");
    }

    /// Return to the initial idle state without releasing the device.
    pub fn reset(&self) {
        self.interrupt();
    }

    /// Silence everything and release the output device. Idempotent.
    pub fn shutdown(&self) {
        let mut state = self.inner.lock();
        if state.released {
            return;
        }
        state.silence(&self.inner.on_speaking);
        state.output.release();
        state.released = true;
    }

    /// Time at which the next scheduled chunk would start if the clock stood still.
    pub fn next_start_time(&self) -> f64 {
        self.inner.lock().next_start_time
    }

    /// Number of sources scheduled and not yet finished.
    pub fn live_count(&self) -> usize {
        self.inner.lock().live.len()
    }

    pub fn is_speaking(&self) -> bool {
        self.inner.lock().speaking
    }

    /// Current output-clock time.
    pub fn now(&self) -> f64 {
        self.inner.lock().output.now()
    }

    pub fn is_released(&self) -> bool {
        self.inner.lock().released
    }
}

impl Drop for PlaybackScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
