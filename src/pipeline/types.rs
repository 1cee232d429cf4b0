//! Data types shared by the capture and playback halves of a session.

use std::fmt;

/// A block of interleaved 16-bit PCM audio.
///
/// Immutable once built; handing a chunk to the transport or the scheduler
/// moves it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    samples: Vec<i16>,
    sample_rate: u32,
    channels: u16,
}

impl AudioChunk {
    /// Creates a chunk from interleaved samples.
    pub fn new(samples: Vec<i16>, sample_rate: u32, channels: u16) -> Self {
        Self {
            samples,
            sample_rate,
            channels: channels.max(1),
        }
    }

    /// Creates a chunk of `frames` frames of silence.
    pub fn silence(frames: usize, sample_rate: u32, channels: u16) -> Self {
        let channels = channels.max(1);
        Self::new(vec![0; frames * channels as usize], sample_rate, channels)
    }

    /// Interleaved PCM samples.
    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Number of frames (samples per channel).
    pub fn frame_count(&self) -> usize {
        self.samples.len() / self.channels as usize
    }

    /// Playback duration in seconds (`frames / sample_rate`).
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frame_count() as f64 / self.sample_rate as f64
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Samples scaled back to `[-1.0, 1.0)` for playback.
    pub fn to_f32(&self) -> Vec<f32> {
        self.samples.iter().map(|&s| s as f32 / 32768.0).collect()
    }

    /// Consumes the chunk and returns its samples.
    pub fn into_samples(self) -> Vec<i16> {
        self.samples
    }
}

/// Opaque handle of a scheduled playback source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(pub(crate) u64);

impl SourceId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "src#{}", self.0)
    }
}

/// A chunk placed on the output timeline.
#[derive(Debug, Clone)]
pub struct ScheduledSource {
    pub id: SourceId,
    /// Start time in seconds on the output clock.
    pub start_time: f64,
    /// Duration of the chunk in seconds.
    pub duration: f64,
}

impl ScheduledSource {
    /// Output-clock time at which this source finishes.
    pub fn end_time(&self) -> f64 {
        self.start_time + self.duration
    }
}
