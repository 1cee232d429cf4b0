//! Audio backends handing out fresh devices for every session.

use crate::audio::device::{AudioBackend, Microphone, OutputDevice};
use crate::error::Result;
use std::path::PathBuf;

#[cfg(feature = "cpal-audio")]
use crate::audio::capture::CpalMicrophone;
#[cfg(feature = "cpal-audio")]
use crate::audio::output::CpalOutput;
#[cfg(feature = "cpal-audio")]
use crate::audio::wav::WavMicrophone;

/// Real microphone and speakers through CPAL.
#[derive(Debug, Clone, Default)]
pub struct CpalBackend {
    input_device: Option<String>,
    output_device: Option<String>,
}

impl CpalBackend {
    /// Device names are matched exactly first, then by case-insensitive
    /// substring. `None` picks the best default.
    pub fn new(input_device: Option<String>, output_device: Option<String>) -> Self {
        Self {
            input_device,
            output_device,
        }
    }
}

#[cfg(feature = "cpal-audio")]
impl AudioBackend for CpalBackend {
    fn microphone(&self) -> Result<Box<dyn Microphone>> {
        Ok(Box::new(CpalMicrophone::new(self.input_device.as_deref())?))
    }

    fn output(&self) -> Result<Box<dyn OutputDevice>> {
        Ok(Box::new(CpalOutput::new(self.output_device.as_deref())?))
    }
}

/// Reads the user's side of the conversation from a WAV file and plays the
/// assistant through the speakers.
#[derive(Debug, Clone)]
pub struct WavBackend {
    path: PathBuf,
    output_device: Option<String>,
}

impl WavBackend {
    pub fn new(path: PathBuf, output_device: Option<String>) -> Self {
        Self {
            path,
            output_device,
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

#[cfg(feature = "cpal-audio")]
impl AudioBackend for WavBackend {
    fn microphone(&self) -> Result<Box<dyn Microphone>> {
        Ok(Box::new(WavMicrophone::open(&self.path)?))
    }

    fn output(&self) -> Result<Box<dyn OutputDevice>> {
        Ok(Box::new(CpalOutput::new(self.output_device.as_deref())?))
    }
}

#[cfg(all(test, feature = "cpal-audio"))]
mod tests {
    use super::*;
    use crate::error::VoiceError;

    #[test]
    fn test_wav_backend_missing_file_is_device_error() {
        let backend = WavBackend::new(PathBuf::from("/nonexistent/input.wav"), None);
        let result = backend.microphone();
        assert!(matches!(result, Err(VoiceError::Device { .. })));
    }

    #[test]
    fn test_wav_backend_opens_fresh_microphone_each_time() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hello.wav");
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 16000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        for _ in 0..160 {
            writer.write_sample(0i16).unwrap();
        }
        writer.finalize().unwrap();

        let backend = WavBackend::new(path, None);
        let first = backend.microphone().unwrap();
        let second = backend.microphone().unwrap();
        assert_eq!(first.sample_rate(), 16000);
        assert_eq!(second.sample_rate(), 16000);
    }

    #[test]
    #[ignore] // Requires audio hardware
    fn test_cpal_backend_default_devices() {
        let backend = CpalBackend::default();
        assert!(backend.microphone().is_ok());
        assert!(backend.output().is_ok());
    }
}
