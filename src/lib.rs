//! renova-live - Real-time duplex voice sessions
//!
//! Streams microphone audio to a live voice service and plays the spoken
//! replies back gaplessly, stopping instantly when the user barges in.

// Enforce error handling discipline
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::let_underscore_must_use)]

pub mod audio;
#[cfg(feature = "cli")]
pub mod cli;
pub mod config;
pub mod defaults;
pub mod error;
pub mod pipeline;
pub mod session;
pub mod transport;

// Composition root - needs real devices and the CLI stack
#[cfg(all(feature = "cpal-audio", feature = "cli"))]
pub mod app;

// Device and transport seams
pub use audio::device::{AudioBackend, Microphone, OutputDevice};
pub use transport::{Transport, TransportEvent, TransportSession};

// Session
pub use session::{SessionCallbacks, SessionOptions, SessionState, VoiceSession};

// Error handling
pub use error::{Result, VoiceError};

// Config
pub use config::Config;

// Audio pipeline (for advanced users)
pub use pipeline::error::{ErrorReporter, LogReporter};
pub use pipeline::{AudioChunk, CapturePipeline, PlaybackScheduler};

/// Build version string with optional git commit hash.
///
/// Returns `"0.1.0+abc1234"` when git hash is available, `"0.1.0"` otherwise.
pub fn version_string() -> String {
    let version = env!("CARGO_PKG_VERSION");
    match option_env!("GIT_HASH") {
        Some(hash) if !hash.is_empty() => format!("{}+{}", version, hash),
        _ => version.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_string_starts_with_cargo_version() {
        let ver = version_string();
        assert!(
            ver.starts_with(env!("CARGO_PKG_VERSION")),
            "version_string should start with CARGO_PKG_VERSION, got: {}",
            ver
        );
    }

    #[test]
    fn version_string_contains_plus_when_git_hash_present() {
        let ver = version_string();
        if option_env!("GIT_HASH").is_some_and(|h| !h.is_empty()) {
            let hash_part = ver.split('+').nth(1).unwrap_or("");
            assert_eq!(hash_part.len(), 7, "Git hash should be 7 chars, got: {}", ver);
        } else {
            assert_eq!(ver, env!("CARGO_PKG_VERSION"));
        }
    }
}
