use crate::defaults;
use crate::error::{Result, VoiceError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub audio: AudioConfig,
    pub service: ServiceConfig,
}

/// Audio device and stream configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AudioConfig {
    /// Input device name (substring match); system default when unset.
    pub device: Option<String>,
    /// Output device name (substring match); system default when unset.
    pub output_device: Option<String>,
    /// Rate assumed for inbound audio that does not announce one.
    pub output_sample_rate: u32,
    pub block_frames: usize,
    pub meter_interval_ms: u64,
    pub fft_size: usize,
}

/// Remote voice service configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServiceConfig {
    /// `host:port` or `unix:/path` of the voice gateway.
    pub endpoint: String,
    pub model: String,
    pub voice: String,
    pub system_instruction: String,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            device: None,
            output_device: None,
            output_sample_rate: defaults::OUTPUT_SAMPLE_RATE,
            block_frames: defaults::BLOCK_FRAMES,
            meter_interval_ms: defaults::METER_INTERVAL_MS,
            fft_size: defaults::FFT_SIZE,
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            endpoint: defaults::DEFAULT_ENDPOINT.to_string(),
            model: defaults::DEFAULT_MODEL.to_string(),
            voice: defaults::DEFAULT_VOICE.to_string(),
            system_instruction: defaults::DEFAULT_SYSTEM_INSTRUCTION.to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Returns an error if the file contains invalid TOML.
    /// Missing fields will use default values.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from a file or return defaults if file doesn't exist
    ///
    /// Only returns defaults if the file is missing.
    /// Returns errors for invalid TOML.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        match Self::load(path) {
            Ok(config) => Ok(config),
            Err(e) => {
                if e.downcast_ref::<std::io::Error>()
                    .is_some_and(|io_err| io_err.kind() == std::io::ErrorKind::NotFound)
                {
                    Ok(Self::default())
                } else {
                    Err(e.context(format!("Failed to load config from {}", path.display())))
                }
            }
        }
    }

    /// Apply environment variable overrides
    ///
    /// Supported environment variables:
    /// - RENOVA_ENDPOINT → service.endpoint
    /// - RENOVA_MODEL → service.model
    /// - RENOVA_VOICE → service.voice
    /// - RENOVA_AUDIO_DEVICE → audio.device
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(endpoint) = std::env::var("RENOVA_ENDPOINT")
            && !endpoint.is_empty()
        {
            self.service.endpoint = endpoint;
        }

        if let Ok(model) = std::env::var("RENOVA_MODEL")
            && !model.is_empty()
        {
            self.service.model = model;
        }

        if let Ok(voice) = std::env::var("RENOVA_VOICE")
            && !voice.is_empty()
        {
            self.service.voice = voice;
        }

        if let Ok(device) = std::env::var("RENOVA_AUDIO_DEVICE")
            && !device.is_empty()
        {
            self.audio.device = Some(device);
        }

        self
    }

    /// Reject values the audio pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        let invalid = |key: &str, message: &str| VoiceError::ConfigInvalidValue {
            key: key.to_string(),
            message: message.to_string(),
        };

        if self.audio.output_sample_rate == 0 {
            return Err(invalid("audio.output_sample_rate", "must be positive"));
        }
        if self.audio.block_frames == 0 {
            return Err(invalid("audio.block_frames", "must be positive"));
        }
        if self.audio.meter_interval_ms == 0 {
            return Err(invalid("audio.meter_interval_ms", "must be positive"));
        }
        if self.audio.fft_size < 32 || !self.audio.fft_size.is_power_of_two() {
            return Err(invalid(
                "audio.fft_size",
                "must be a power of two of at least 32",
            ));
        }
        if self.service.endpoint.trim().is_empty() {
            return Err(invalid("service.endpoint", "must not be empty"));
        }
        if self.service.model.trim().is_empty() {
            return Err(invalid("service.model", "must not be empty"));
        }
        Ok(())
    }

    /// Get the default configuration file path
    ///
    /// Returns ~/.config/renova-live/config.toml on Linux
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join("renova-live")
            .join("config.toml")
    }
}
