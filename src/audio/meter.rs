//! Input loudness metering.
//!
//! The capture pipeline writes every sample into an [`InputTap`]; a
//! [`VolumeMeter`] ticker samples the tap on its own cadence, runs a spectrum
//! snapshot and reports the mean bin magnitude on a 0–255 scale.

use crate::defaults;
use crate::error::{Result, VoiceError};
use crossbeam_channel::{Sender, bounded, select, tick};
use std::collections::VecDeque;
use std::f32::consts::PI;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Callback receiving loudness values in `[0, 255]`.
pub type VolumeCallback = Arc<dyn Fn(f32) + Send + Sync>;

/// Bounded ring of the most recent input samples.
///
/// Cheap to clone; all clones share the ring.
#[derive(Debug, Clone)]
pub struct InputTap {
    ring: Arc<Mutex<VecDeque<f32>>>,
    capacity: usize,
}

impl InputTap {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    /// Append samples, keeping only the newest `capacity`.
    pub fn push(&self, samples: &[f32]) {
        let tail = &samples[samples.len().saturating_sub(self.capacity)..];
        if let Ok(mut ring) = self.ring.lock() {
            let overflow = (ring.len() + tail.len()).saturating_sub(self.capacity);
            ring.drain(..overflow);
            ring.extend(tail);
        }
    }

    /// The newest `capacity` samples, zero-padded at the front if fewer were seen.
    pub fn snapshot(&self) -> Vec<f32> {
        let mut out = vec![0.0; self.capacity];
        if let Ok(ring) = self.ring.lock() {
            let offset = self.capacity - ring.len();
            for (slot, &sample) in out[offset..].iter_mut().zip(ring.iter()) {
                *slot = sample;
            }
        }
        out
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Spectrum snapshot producer with analyser-node semantics.
///
/// Blackman-windowed DFT over `fft_size` samples, `fft_size / 2` bins,
/// exponential smoothing between snapshots and a decibel window mapped onto
/// bytes.
pub struct SpectrumAnalyser {
    fft_size: usize,
    smoothing: f32,
    min_db: f32,
    max_db: f32,
    window: Vec<f32>,
    cos_table: Vec<f32>,
    sin_table: Vec<f32>,
    smoothed: Vec<f32>,
}

impl SpectrumAnalyser {
    pub fn new(fft_size: usize) -> Self {
        Self::with_smoothing(fft_size, defaults::METER_SMOOTHING)
    }

    pub fn with_smoothing(fft_size: usize, smoothing: f32) -> Self {
        let fft_size = fft_size.max(2);
        let n = fft_size as f32;

        // Blackman window, alpha = 0.16
        let window = (0..fft_size)
            .map(|i| {
                let x = i as f32 / n;
                0.42 - 0.5 * (2.0 * PI * x).cos() + 0.08 * (4.0 * PI * x).cos()
            })
            .collect();
        let cos_table = (0..fft_size)
            .map(|i| (2.0 * PI * i as f32 / n).cos())
            .collect();
        let sin_table = (0..fft_size)
            .map(|i| (2.0 * PI * i as f32 / n).sin())
            .collect();

        Self {
            fft_size,
            smoothing: smoothing.clamp(0.0, 1.0),
            min_db: defaults::METER_MIN_DB,
            max_db: defaults::METER_MAX_DB,
            window,
            cos_table,
            sin_table,
            smoothed: vec![0.0; fft_size / 2],
        }
    }

    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    pub fn frequency_bin_count(&self) -> usize {
        self.fft_size / 2
    }

    /// Byte-scaled spectrum of the newest `fft_size` samples of `time_data`.
    pub fn byte_frequency_data(&mut self, time_data: &[f32]) -> Vec<u8> {
        let n = self.fft_size;
        let start = time_data.len().saturating_sub(n);
        let frame = &time_data[start..];
        let pad = n - frame.len();

        let windowed: Vec<f32> = (0..n)
            .map(|i| {
                if i < pad {
                    0.0
                } else {
                    frame[i - pad] * self.window[i]
                }
            })
            .collect();

        let range = self.max_db - self.min_db;
        let mut bytes = Vec::with_capacity(self.frequency_bin_count());
        for k in 0..self.frequency_bin_count() {
            let (mut re, mut im) = (0.0f32, 0.0f32);
            for (i, &x) in windowed.iter().enumerate() {
                let idx = (k * i) % n;
                re += x * self.cos_table[idx];
                im -= x * self.sin_table[idx];
            }
            let magnitude = (re * re + im * im).sqrt() / n as f32;
            let value = self.smoothing * self.smoothed[k] + (1.0 - self.smoothing) * magnitude;
            self.smoothed[k] = value;

            let db = 20.0 * value.log10();
            let scaled = 255.0 / range * (db - self.min_db);
            bytes.push(if scaled.is_finite() {
                scaled.clamp(0.0, 255.0) as u8
            } else {
                0
            });
        }
        bytes
    }

    /// Mean of the byte spectrum, in `[0, 255]`.
    pub fn loudness(&mut self, time_data: &[f32]) -> f32 {
        let bytes = self.byte_frequency_data(time_data);
        if bytes.is_empty() {
            return 0.0;
        }
        bytes.iter().map(|&b| b as f32).sum::<f32>() / bytes.len() as f32
    }

    /// Loudness of the tap's current contents; 0 when no tap is attached.
    pub fn sample(&mut self, tap: Option<&InputTap>) -> f32 {
        match tap {
            Some(tap) => self.loudness(&tap.snapshot()),
            None => 0.0,
        }
    }
}

/// Configuration for the volume meter.
#[derive(Debug, Clone)]
pub struct MeterConfig {
    pub interval: Duration,
    pub fft_size: usize,
    pub smoothing: f32,
}

impl Default for MeterConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(defaults::METER_INTERVAL_MS),
            fft_size: defaults::FFT_SIZE,
            smoothing: defaults::METER_SMOOTHING,
        }
    }
}

/// Periodic loudness reporter running on its own thread.
pub struct VolumeMeter {
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl VolumeMeter {
    /// Start ticking. Each tick samples `tap` and hands the value to `on_volume`.
    pub fn start(
        tap: Option<InputTap>,
        config: MeterConfig,
        on_volume: VolumeCallback,
    ) -> Result<Self> {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let ticker = tick(config.interval);
        let mut analyser = SpectrumAnalyser::with_smoothing(config.fft_size, config.smoothing);

        let handle = thread::Builder::new()
            .name("volume-meter".to_string())
            .spawn(move || {
                loop {
                    select! {
                        recv(stop_rx) -> _ => break,
                        recv(ticker) -> _ => {
                            let value = analyser.sample(tap.as_ref());
                            on_volume(value);
                        }
                    }
                }
            })
            .map_err(|e| VoiceError::Other(format!("Failed to spawn volume meter: {}", e)))?;

        Ok(Self {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        })
    }

    /// Stop ticking and wait for the ticker thread. Idempotent.
    ///
    /// After this returns the callback is never invoked again, unless called
    /// from the callback itself, in which case the thread exits after it returns.
    pub fn stop(&mut self) {
        // Dropping the sender disconnects the stop channel and wakes the select.
        self.stop_tx.take();
        if let Some(handle) = self.handle.take() {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                tracing::warn!("volume meter thread panicked");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }
}

impl Drop for VolumeMeter {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn sine(frequency: f32, amplitude: f32, len: usize, rate: f32) -> Vec<f32> {
        (0..len)
            .map(|i| (2.0 * PI * frequency * i as f32 / rate).sin() * amplitude)
            .collect()
    }

    #[test]
    fn tap_keeps_only_newest_samples() {
        let tap = InputTap::new(4);
        tap.push(&[1.0, 2.0, 3.0]);
        tap.push(&[4.0, 5.0]);
        assert_eq!(tap.snapshot(), vec![2.0, 3.0, 4.0, 5.0]);

        tap.push(&[6.0, 7.0, 8.0, 9.0, 10.0]);
        assert_eq!(tap.snapshot(), vec![7.0, 8.0, 9.0, 10.0]);
    }

    #[test]
    fn tap_snapshot_zero_pads_front() {
        let tap = InputTap::new(4);
        tap.push(&[0.5]);
        assert_eq!(tap.snapshot(), vec![0.0, 0.0, 0.0, 0.5]);
    }

    #[test]
    fn analyser_has_half_as_many_bins_as_window() {
        let analyser = SpectrumAnalyser::new(256);
        assert_eq!(analyser.fft_size(), 256);
        assert_eq!(analyser.frequency_bin_count(), 128);
    }

    #[test]
    fn silence_is_zero_loudness() {
        let mut analyser = SpectrumAnalyser::with_smoothing(256, 0.0);
        assert_eq!(analyser.loudness(&[0.0; 256]), 0.0);
    }

    #[test]
    fn no_tap_reports_zero() {
        let mut analyser = SpectrumAnalyser::new(256);
        assert_eq!(analyser.sample(None), 0.0);
    }

    #[test]
    fn louder_input_reads_higher() {
        let mut quiet = SpectrumAnalyser::with_smoothing(256, 0.0);
        let mut loud = SpectrumAnalyser::with_smoothing(256, 0.0);

        let quiet_level = quiet.loudness(&sine(440.0, 0.01, 256, 16000.0));
        let loud_level = loud.loudness(&sine(440.0, 0.8, 256, 16000.0));

        assert!(quiet_level >= 0.0 && loud_level <= 255.0);
        assert!(
            loud_level > quiet_level,
            "loud {} should exceed quiet {}",
            loud_level,
            quiet_level
        );
    }

    #[test]
    fn full_scale_bin_saturates() {
        let mut analyser = SpectrumAnalyser::with_smoothing(256, 0.0);
        // Exactly on bin 16 (16 cycles per window)
        let bytes = analyser.byte_frequency_data(&sine(16.0, 1.0, 256, 256.0));
        assert_eq!(bytes[16], 255);
    }

    #[test]
    fn smoothing_decays_gradually() {
        let mut analyser = SpectrumAnalyser::with_smoothing(256, 0.8);
        let loud = sine(1000.0, 0.9, 256, 16000.0);
        let first = analyser.loudness(&loud);
        let after_silence = analyser.loudness(&[0.0; 256]);

        assert!(first > 0.0);
        assert!(
            after_silence > 0.0,
            "smoothed spectrum should not drop to zero immediately"
        );
        assert!(after_silence < first);
    }

    #[test]
    fn short_input_is_zero_padded() {
        let mut analyser = SpectrumAnalyser::with_smoothing(256, 0.0);
        let level = analyser.loudness(&sine(1000.0, 0.9, 64, 16000.0));
        assert!(level > 0.0);
    }

    #[test]
    fn meter_reports_on_cadence_and_stops() {
        let tap = InputTap::new(256);
        tap.push(&sine(440.0, 0.5, 256, 16000.0));
        let (tx, rx) = mpsc::channel();
        let config = MeterConfig {
            interval: Duration::from_millis(10),
            ..Default::default()
        };

        let mut meter = VolumeMeter::start(
            Some(tap),
            config,
            Arc::new(move |v| {
                let _ = tx.send(v);
            }),
        )
        .unwrap();

        let first = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(first > 0.0 && first <= 255.0);

        meter.stop();
        assert!(!meter.is_running());

        // Drain anything sent before stop returned; nothing may follow.
        while rx.try_recv().is_ok() {}
        thread::sleep(Duration::from_millis(50));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn meter_without_tap_reports_zero() {
        let (tx, rx) = mpsc::channel();
        let mut meter = VolumeMeter::start(
            None,
            MeterConfig {
                interval: Duration::from_millis(10),
                ..Default::default()
            },
            Arc::new(move |v| {
                let _ = tx.send(v);
            }),
        )
        .unwrap();

        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 0.0);
        meter.stop();
    }

    #[test]
    fn meter_stop_is_idempotent() {
        let mut meter =
            VolumeMeter::start(None, MeterConfig::default(), Arc::new(|_| {})).unwrap();
        meter.stop();
        meter.stop();
        assert!(!meter.is_running());
    }
}
