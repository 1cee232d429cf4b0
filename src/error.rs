//! Error types for renova-live.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum VoiceError {
    // Configuration errors
    #[error("Configuration file not found at {path}")]
    ConfigFileNotFound { path: String },

    #[error("Invalid configuration value for {key}: {message}")]
    ConfigInvalidValue { key: String, message: String },

    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    // Audio device errors
    #[error("Audio device not found: {device}")]
    DeviceNotFound { device: String },

    #[error("Audio device error: {message}")]
    Device { message: String },

    // Transport errors
    #[error("Failed to connect to voice service: {message}")]
    Connect { message: String },

    #[error("Voice service transport error: {message}")]
    Transport { message: String },

    #[error("Voice service protocol error: {message}")]
    Protocol { message: String },

    // Payload errors
    #[error("Failed to decode audio payload: {message}")]
    Decode { message: String },

    // General I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Generic error for cases not covered above
    #[error("{0}")]
    Other(String),
}

impl VoiceError {
    /// Shorthand for a [`VoiceError::Device`] with the given message.
    pub fn device(message: impl Into<String>) -> Self {
        Self::Device {
            message: message.into(),
        }
    }

    /// Shorthand for a [`VoiceError::Decode`] with the given message.
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    /// Whether a session can keep running after this error.
    ///
    /// Only a single malformed payload is recoverable; everything else ends the session.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Decode { .. })
    }
}

// Type alias for convenience
pub type Result<T> = std::result::Result<T, VoiceError>;
