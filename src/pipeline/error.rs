//! Error reporting for session components.

use crate::error::VoiceError;

/// Trait for reporting errors raised by a session component.
pub trait ErrorReporter: Send + Sync {
    /// Reports an error from `component` (e.g. "capture", "playback").
    fn report(&self, component: &str, error: &VoiceError);
}

/// Reporter that forwards to `tracing`.
///
/// Recoverable errors are logged as warnings, everything else as errors.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogReporter;

impl ErrorReporter for LogReporter {
    fn report(&self, component: &str, error: &VoiceError) {
        if error.is_recoverable() {
            tracing::warn!(component, "{}", error);
        } else {
            tracing::error!(component, "{}", error);
        }
    }
}

/// Print a message to stderr, clearing any active level meter line first.
pub fn eprintln_clear(msg: &str) {
    eprint!("\r{:60}\r", "");
    eprintln!("{}", msg);
}
