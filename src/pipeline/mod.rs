//! Session audio pipeline.
//!
//! The capture half runs on its own thread and pushes encoded blocks into a
//! [`ChunkSink`]; the playback half lays inbound chunks out gaplessly on the
//! output clock.

pub mod capture;
pub mod error;
pub mod scheduler;
pub mod types;

pub use capture::{CaptureConfig, CapturePipeline, ChunkSink};
pub use error::{ErrorReporter, LogReporter};
pub use scheduler::{PlaybackScheduler, ScheduledStart, SpeakingCallback};
pub use types::{AudioChunk, ScheduledSource, SourceId};
