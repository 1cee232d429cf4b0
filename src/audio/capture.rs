//! Microphone capture using CPAL (Cross-Platform Audio Library).

use crate::audio::codec;
use crate::audio::device::{Microphone, StreamFault};
use crate::defaults;
use crate::error::{Result, VoiceError};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Run a closure with stderr temporarily redirected to /dev/null.
///
/// This suppresses noisy ALSA/JACK/PipeWire messages that CPAL triggers
/// when probing audio backends. The messages are harmless but confusing to users.
///
/// # Safety
/// Uses `libc::dup`/`libc::dup2` to save and restore file descriptor 2 (stderr).
/// Safe as long as no other thread is concurrently manipulating fd 2.
pub(crate) fn with_suppressed_stderr<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    unsafe {
        let saved_fd = libc::dup(2);
        let devnull = libc::open(c"/dev/null".as_ptr(), libc::O_WRONLY);
        if saved_fd >= 0 && devnull >= 0 {
            libc::dup2(devnull, 2);
            libc::close(devnull);
        }

        let result = f();

        if saved_fd >= 0 {
            libc::dup2(saved_fd, 2);
            libc::close(saved_fd);
        }

        result
    }
}

/// Suppress noisy JACK/ALSA error messages that occur during audio backend probing.
///
/// # Safety
/// This modifies environment variables which is safe when called before spawning threads.
pub fn suppress_audio_warnings() {
    // SAFETY: Called at startup before any threads are spawned
    unsafe {
        std::env::set_var("JACK_NO_START_SERVER", "1");
        std::env::set_var("JACK_NO_AUDIO_RESERVATION", "1");
        std::env::set_var("PIPEWIRE_DEBUG", "0");
        std::env::set_var("ALSA_DEBUG", "0");
        std::env::set_var("PW_LOG", "0");
    }
}

/// Preferred device names for PipeWire/PulseAudio desktops.
const PREFERRED_DEVICES: &[&str] = &["pipewire", "pulse", "PulseAudio"];

/// Device name patterns to filter out (not useful for a voice conversation).
const FILTERED_PATTERNS: &[&str] = &[
    "surround",
    "front:",
    "rear:",
    "center:",
    "side:",
    "Digital Output",
    "HDMI",
    "S/PDIF",
];

pub(crate) fn should_filter_device(name: &str) -> bool {
    let lower = name.to_lowercase();
    FILTERED_PATTERNS
        .iter()
        .any(|pattern| lower.contains(&pattern.to_lowercase()))
}

pub(crate) fn is_preferred_device(name: &str) -> bool {
    let lower = name.to_lowercase();
    PREFERRED_DEVICES
        .iter()
        .any(|pref| lower.contains(&pref.to_lowercase()))
}

/// Pick a device by exact name, then by case-insensitive substring.
pub(crate) fn select_device<I>(devices: I, wanted: &str) -> Option<cpal::Device>
where
    I: Iterator<Item = cpal::Device>,
{
    let named: Vec<(String, cpal::Device)> = devices
        .filter_map(|d| d.name().ok().map(|name| (name, d)))
        .collect();
    let wanted_lower = wanted.to_lowercase();

    let exact = named.iter().position(|(name, _)| name == wanted);
    let partial = || {
        named
            .iter()
            .position(|(name, _)| name.to_lowercase().contains(&wanted_lower))
    };
    let index = exact.or_else(partial)?;
    named.into_iter().nth(index).map(|(_, d)| d)
}

/// List all available audio input devices with filtering and recommendations.
///
/// # Returns
/// A vector of device names, with preferred devices marked with "\[recommended\]".
/// Filters out obviously unusable devices (surround channels, HDMI, etc.).
///
/// # Errors
/// Returns `VoiceError::Device` if device enumeration fails.
pub fn list_devices() -> Result<Vec<String>> {
    let (host, devices) = with_suppressed_stderr(|| {
        let host = cpal::default_host();
        let devices = host.input_devices();
        (host, devices)
    });
    let devices =
        devices.map_err(|e| VoiceError::device(format!("Failed to enumerate input devices: {}", e)))?;

    let mut device_names = Vec::new();
    for device in devices {
        if let Ok(name) = device.name() {
            if should_filter_device(&name) {
                continue;
            }
            if is_preferred_device(&name) {
                device_names.push(format!("{} [recommended]", name));
            } else {
                device_names.push(name);
            }
        }
    }
    // Host must outlive the device iterator on some backends
    drop(host);

    Ok(device_names)
}

/// Best default input device, preferring PipeWire/PulseAudio.
fn get_best_default_device() -> Result<cpal::Device> {
    with_suppressed_stderr(|| {
        let host = cpal::default_host();

        if let Ok(devices) = host.input_devices() {
            for device in devices {
                if let Ok(name) = device.name()
                    && is_preferred_device(&name)
                {
                    return Ok(device);
                }
            }
        }

        host.default_input_device()
            .ok_or_else(|| VoiceError::DeviceNotFound {
                device: "default".to_string(),
            })
    })
}

/// Wrapper for cpal::Stream to make it Send.
///
/// SAFETY: the stream is only touched through `&mut self` on the owning
/// microphone, never concurrently.
struct SendableStream(cpal::Stream);

unsafe impl Send for SendableStream {}

/// Microphone backed by a CPAL input stream.
///
/// Delivers normalized mono samples at 16kHz. Tries f32/16kHz/mono and
/// i16/16kHz/mono first, then falls back to the device's native config with
/// software channel mixing and resampling.
pub struct CpalMicrophone {
    device: cpal::Device,
    stream: Option<SendableStream>,
    buffer: Arc<Mutex<Vec<f32>>>,
    callback_count: Arc<AtomicU64>,
    fault: StreamFault,
    sample_rate: u32,
}

impl CpalMicrophone {
    /// Open an input device.
    ///
    /// # Arguments
    /// * `device_name` - Optional device name (exact or substring). If None,
    ///   uses the best default input device.
    ///
    /// # Errors
    /// Returns `VoiceError::DeviceNotFound` if no matching device exists.
    pub fn new(device_name: Option<&str>) -> Result<Self> {
        let device = with_suppressed_stderr(|| match device_name {
            Some(name) => {
                let host = cpal::default_host();
                let devices = host
                    .input_devices()
                    .map_err(|e| VoiceError::device(format!("Failed to enumerate devices: {}", e)))?;
                select_device(devices, name).ok_or_else(|| VoiceError::DeviceNotFound {
                    device: name.to_string(),
                })
            }
            None => get_best_default_device(),
        })?;

        Ok(Self {
            device,
            stream: None,
            buffer: Arc::new(Mutex::new(Vec::new())),
            callback_count: Arc::new(AtomicU64::new(0)),
            fault: StreamFault::new(),
            sample_rate: defaults::INPUT_SAMPLE_RATE,
        })
    }

    /// Name of the underlying device, if the backend reports one.
    pub fn device_name(&self) -> Option<String> {
        self.device.name().ok()
    }

    fn build_stream(&self) -> Result<cpal::Stream> {
        let preferred_config = cpal::StreamConfig {
            channels: 1,
            sample_rate: self.sample_rate,
            buffer_size: cpal::BufferSize::Default,
        };

        let buffer = Arc::clone(&self.buffer);
        let counter = Arc::clone(&self.callback_count);
        if let Ok(stream) = self.device.build_input_stream(
            &preferred_config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                counter.fetch_add(1, Ordering::Relaxed);
                if let Ok(mut buf) = buffer.lock() {
                    buf.extend(data.iter().map(|&s| s.clamp(-1.0, 1.0)));
                }
            },
            record_stream_error(self.fault.clone(), "input"),
            None,
        ) {
            return Ok(stream);
        }

        let buffer = Arc::clone(&self.buffer);
        let counter = Arc::clone(&self.callback_count);
        if let Ok(stream) = self.device.build_input_stream(
            &preferred_config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                counter.fetch_add(1, Ordering::Relaxed);
                if let Ok(mut buf) = buffer.lock() {
                    buf.extend(data.iter().map(|&s| s as f32 / 32768.0));
                }
            },
            record_stream_error(self.fault.clone(), "input"),
            None,
        ) {
            return Ok(stream);
        }

        self.build_stream_native()
    }

    /// Capture at the device's native config, converting in software.
    fn build_stream_native(&self) -> Result<cpal::Stream> {
        use cpal::SampleFormat;

        let default_config = self.device.default_input_config().map_err(|e| {
            VoiceError::device(format!("Failed to query default input config: {}", e))
        })?;

        let native_rate = default_config.sample_rate();
        let native_channels = default_config.channels() as usize;
        let target_rate = self.sample_rate;
        let stream_config: cpal::StreamConfig = default_config.clone().into();

        tracing::info!(
            "using native input format ({}ch/{}Hz/{:?}), converting in software",
            native_channels,
            native_rate,
            default_config.sample_format(),
        );

        let buffer = Arc::clone(&self.buffer);
        let counter = Arc::clone(&self.callback_count);

        match default_config.sample_format() {
            SampleFormat::F32 => self
                .device
                .build_input_stream(
                    &stream_config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        counter.fetch_add(1, Ordering::Relaxed);
                        let converted =
                            to_mono_at_rate(data, native_channels, native_rate, target_rate);
                        if let Ok(mut buf) = buffer.lock() {
                            buf.extend_from_slice(&converted);
                        }
                    },
                    record_stream_error(self.fault.clone(), "input"),
                    None,
                )
                .map_err(|e| VoiceError::device(format!("Failed to build native f32 stream: {}", e))),
            SampleFormat::I16 => self
                .device
                .build_input_stream(
                    &stream_config,
                    move |data: &[i16], _: &cpal::InputCallbackInfo| {
                        counter.fetch_add(1, Ordering::Relaxed);
                        let floats: Vec<f32> = data.iter().map(|&s| s as f32 / 32768.0).collect();
                        let converted =
                            to_mono_at_rate(&floats, native_channels, native_rate, target_rate);
                        if let Ok(mut buf) = buffer.lock() {
                            buf.extend_from_slice(&converted);
                        }
                    },
                    record_stream_error(self.fault.clone(), "input"),
                    None,
                )
                .map_err(|e| VoiceError::device(format!("Failed to build native i16 stream: {}", e))),
            fmt => Err(VoiceError::device(format!(
                "Unsupported native sample format: {:?}. Try specifying a device with --device.",
                fmt
            ))),
        }
    }
}

/// Error callback that records the failure for the owning device.
pub(crate) fn record_stream_error(
    fault: StreamFault,
    stream: &'static str,
) -> impl FnMut(cpal::StreamError) + Send + 'static {
    move |err| {
        tracing::warn!("Audio {} stream error: {}", stream, err);
        fault.record(err.to_string());
    }
}

/// Mix multi-channel audio to mono and resample to the target rate.
fn to_mono_at_rate(samples: &[f32], channels: usize, source_rate: u32, target_rate: u32) -> Vec<f32> {
    let mono = codec::mix_to_mono(samples, channels);
    codec::resample_f32(&mono, source_rate, target_rate)
}

impl Microphone for CpalMicrophone {
    fn acquire(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        self.fault.clear();
        let stream = self.build_stream()?;
        stream
            .play()
            .map_err(|e| VoiceError::device(format!("Failed to start audio stream: {}", e)))?;

        // Some PipeWire-ALSA setups accept non-native configs but never deliver data.
        std::thread::sleep(std::time::Duration::from_millis(200));

        let stream = if self.callback_count.load(Ordering::Relaxed) == 0 {
            drop(stream);
            if let Ok(mut buf) = self.buffer.lock() {
                buf.clear();
            }
            self.fault.clear();
            let native = self.build_stream_native()?;
            native.play().map_err(|e| {
                VoiceError::device(format!("Failed to start native audio stream: {}", e))
            })?;
            native
        } else {
            stream
        };

        self.stream = Some(SendableStream(stream));
        Ok(())
    }

    fn read_block(&mut self) -> Result<Vec<f32>> {
        if self.stream.is_none() {
            return Err(VoiceError::device("microphone not acquired"));
        }
        self.fault.check("input")?;
        let mut buffer = self
            .buffer
            .lock()
            .map_err(|e| VoiceError::device(format!("Failed to lock audio buffer: {}", e)))?;
        Ok(std::mem::take(&mut *buffer))
    }

    fn release(&mut self) {
        if let Some(stream) = self.stream.take()
            && let Err(e) = stream.0.pause()
        {
            tracing::debug!("pausing input stream failed: {}", e);
        }
        if let Ok(mut buf) = self.buffer.lock() {
            buf.clear();
        }
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

impl Drop for CpalMicrophone {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_filter_device() {
        assert!(should_filter_device("surround51"));
        assert!(should_filter_device("front:CARD=PCH"));
        assert!(should_filter_device("HDMI Output"));
        assert!(should_filter_device("Digital Output S/PDIF"));
        assert!(!should_filter_device("pipewire"));
        assert!(!should_filter_device("PulseAudio"));
        assert!(!should_filter_device("Built-in Audio"));
    }

    #[test]
    fn test_is_preferred_device() {
        assert!(is_preferred_device("pipewire"));
        assert!(is_preferred_device("PipeWire"));
        assert!(is_preferred_device("pulse"));
        assert!(!is_preferred_device("hw:0,0"));
        assert!(!is_preferred_device("default"));
    }

    #[test]
    fn test_stream_error_callback_records_device_loss() {
        let fault = StreamFault::new();
        let mut on_error = record_stream_error(fault.clone(), "input");

        on_error(cpal::StreamError::DeviceNotAvailable);

        assert!(matches!(
            fault.check("input"),
            Err(VoiceError::Device { .. })
        ));
    }

    #[test]
    fn test_to_mono_at_rate_mixes_and_resamples() {
        // Stereo 32 kHz → mono 16 kHz
        let stereo = vec![0.5f32; 640];
        let mono = to_mono_at_rate(&stereo, 2, 32000, 16000);
        assert_eq!(mono.len(), 160);
        assert!(mono.iter().all(|&s| (s - 0.5).abs() < 1e-6));
    }

    #[test]
    #[ignore] // Requires audio hardware
    fn test_list_devices_filters_unusable_devices() {
        let devices = list_devices().expect("Failed to list devices");
        for device in &devices {
            assert!(!device.to_lowercase().contains("surround"), "{}", device);
            assert!(!device.to_lowercase().contains("hdmi"), "{}", device);
        }
    }

    #[test]
    #[ignore] // Requires audio hardware
    fn test_acquire_read_release() {
        let mut mic = CpalMicrophone::new(None).expect("Failed to open microphone");
        mic.acquire().expect("Failed to acquire");
        std::thread::sleep(std::time::Duration::from_millis(100));
        assert!(mic.read_block().is_ok());
        mic.release();
        assert!(mic.read_block().is_err());
    }

    #[test]
    #[ignore] // Requires audio hardware
    fn test_create_with_invalid_device_name() {
        match CpalMicrophone::new(Some("NonExistentDevice12345")) {
            Err(VoiceError::DeviceNotFound { device }) => {
                assert_eq!(device, "NonExistentDevice12345");
            }
            _ => panic!("Expected DeviceNotFound error"),
        }
    }
}
