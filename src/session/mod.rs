//! Voice session controller and its state model.

pub mod controller;
pub mod state;

pub use controller::VoiceSession;
pub use state::{SessionCallbacks, SessionOptions, SessionState, StatusCallback};
