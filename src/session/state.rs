//! Session state, UI callbacks and per-session options.

use crate::audio::meter::{MeterConfig, VolumeCallback};
use crate::config::Config;
use crate::defaults;
use crate::pipeline::capture::CaptureConfig;
use crate::pipeline::scheduler::SpeakingCallback;
use crate::transport::protocol::SessionSetup;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Lifecycle state of a voice session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl SessionState {
    /// Lower-case name reported to the UI.
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Error => "error",
        }
    }

    /// Whether devices or a connection may be held in this state.
    pub fn is_active(self) -> bool {
        matches!(self, SessionState::Connecting | SessionState::Connected)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type StatusCallback = Arc<dyn Fn(SessionState) + Send + Sync>;

/// Observers of a session. Each may be called from any session thread.
#[derive(Clone)]
pub struct SessionCallbacks {
    pub on_status: StatusCallback,
    /// Input loudness in `[0, 255]`, every meter tick while connected.
    pub on_volume: VolumeCallback,
    /// Edge-triggered: true when the assistant starts speaking.
    pub on_speaking: SpeakingCallback,
}

impl SessionCallbacks {
    pub fn new() -> Self {
        Self {
            on_status: Arc::new(|_| {}),
            on_volume: Arc::new(|_| {}),
            on_speaking: Arc::new(|_| {}),
        }
    }

    pub fn on_status(mut self, f: impl Fn(SessionState) + Send + Sync + 'static) -> Self {
        self.on_status = Arc::new(f);
        self
    }

    pub fn on_volume(mut self, f: impl Fn(f32) + Send + Sync + 'static) -> Self {
        self.on_volume = Arc::new(f);
        self
    }

    pub fn on_speaking(mut self, f: impl Fn(bool) + Send + Sync + 'static) -> Self {
        self.on_speaking = Arc::new(f);
        self
    }
}

impl Default for SessionCallbacks {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SessionCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCallbacks").finish_non_exhaustive()
    }
}

/// Everything a session needs besides its collaborators.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub setup: SessionSetup,
    pub capture: CaptureConfig,
    pub meter: MeterConfig,
    /// Rate of inbound audio whose mime type carries none.
    pub inbound_sample_rate: u32,
    /// How often the event thread checks whether its session is still current.
    pub event_poll: Duration,
}

impl SessionOptions {
    pub fn from_config(config: &Config) -> Self {
        let setup = SessionSetup::new(&config.service.model, &config.service.voice)
            .with_system_instruction(&config.service.system_instruction);
        Self {
            setup,
            capture: CaptureConfig {
                block_frames: config.audio.block_frames,
                ..CaptureConfig::default()
            },
            meter: MeterConfig {
                interval: Duration::from_millis(config.audio.meter_interval_ms),
                fft_size: config.audio.fft_size,
                ..MeterConfig::default()
            },
            inbound_sample_rate: config.audio.output_sample_rate,
            event_poll: Duration::from_millis(100),
        }
    }
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            setup: SessionSetup::default(),
            capture: CaptureConfig::default(),
            meter: MeterConfig::default(),
            inbound_sample_rate: defaults::OUTPUT_SAMPLE_RATE,
            event_poll: Duration::from_millis(100),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_names() {
        assert_eq!(SessionState::Disconnected.to_string(), "disconnected");
        assert_eq!(SessionState::Connecting.to_string(), "connecting");
        assert_eq!(SessionState::Connected.to_string(), "connected");
        assert_eq!(SessionState::Error.to_string(), "error");
        assert_eq!(SessionState::default(), SessionState::Disconnected);
    }

    #[test]
    fn test_active_states() {
        assert!(SessionState::Connecting.is_active());
        assert!(SessionState::Connected.is_active());
        assert!(!SessionState::Disconnected.is_active());
        assert!(!SessionState::Error.is_active());
    }

    #[test]
    fn test_options_from_config() {
        let mut config = Config::default();
        config.service.voice = "Puck".to_string();
        config.audio.block_frames = 1024;
        config.audio.meter_interval_ms = 40;
        config.audio.output_sample_rate = 22050;

        let options = SessionOptions::from_config(&config);
        assert_eq!(options.setup.voice_name(), "Puck");
        assert_eq!(options.capture.block_frames, 1024);
        assert_eq!(options.meter.interval, Duration::from_millis(40));
        assert_eq!(options.inbound_sample_rate, 22050);
    }

    #[test]
    fn test_callbacks_builder() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let seen = Arc::new(AtomicBool::new(false));
        let flag = seen.clone();
        let callbacks = SessionCallbacks::new().on_speaking(move |s| flag.store(s, Ordering::SeqCst));

        (callbacks.on_speaking)(true);
        assert!(seen.load(Ordering::SeqCst));
        (callbacks.on_status)(SessionState::Connected);
        (callbacks.on_volume)(12.0);
    }
}
