//! WAV file microphone for headless sessions.

use crate::audio::codec;
use crate::audio::device::Microphone;
use crate::defaults::INPUT_SAMPLE_RATE;
use crate::error::{Result, VoiceError};
use std::io::Read;
use std::path::Path;
use std::time::Instant;

/// Microphone that plays back a WAV file.
///
/// Supports arbitrary sample rates and channels, resampling to 16kHz mono.
/// By default samples are released in real time as if spoken into a
/// microphone, followed by silence once the file is exhausted.
pub struct WavMicrophone {
    samples: Vec<f32>,
    position: usize,
    chunk_size: usize,
    paced: bool,
    started: Option<Instant>,
    /// Samples of trailing silence already handed out.
    silence_emitted: usize,
}

impl WavMicrophone {
    /// Create from any reader (for testing/flexibility).
    pub fn from_reader(reader: Box<dyn Read + Send>) -> Result<Self> {
        let mut wav_reader = hound::WavReader::new(reader)
            .map_err(|e| VoiceError::device(format!("Failed to parse WAV file: {}", e)))?;

        let spec = wav_reader.spec();
        let source_rate = spec.sample_rate;
        let source_channels = spec.channels as usize;

        let raw: Vec<f32> = match spec.sample_format {
            hound::SampleFormat::Float => wav_reader
                .samples::<f32>()
                .collect::<std::result::Result<Vec<_>, _>>(),
            hound::SampleFormat::Int => {
                let scale = (1i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
                wav_reader
                    .samples::<i32>()
                    .map(|s| s.map(|v| v as f32 / scale))
                    .collect::<std::result::Result<Vec<_>, _>>()
            }
        }
        .map_err(|e| VoiceError::device(format!("Failed to read WAV samples: {}", e)))?;

        let mono = codec::mix_to_mono(&raw, source_channels);
        let samples = codec::resample_f32(&mono, source_rate, INPUT_SAMPLE_RATE);

        Ok(Self {
            samples,
            position: 0,
            // 100ms chunks at 16kHz
            chunk_size: 1600,
            paced: true,
            started: None,
            silence_emitted: 0,
        })
    }

    /// Open a WAV file from disk.
    pub fn open(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path).map_err(|e| {
            VoiceError::device(format!("Failed to open {}: {}", path.display(), e))
        })?;
        Self::from_reader(Box::new(std::io::BufReader::new(file)))
    }

    /// Release samples as fast as they are read, and stop at end of file.
    pub fn unpaced(mut self) -> Self {
        self.paced = false;
        self
    }

    /// Length of the file at 16kHz, in seconds.
    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / INPUT_SAMPLE_RATE as f64
    }

    pub fn is_exhausted(&self) -> bool {
        self.position >= self.samples.len()
    }

    fn read_unpaced(&mut self) -> Vec<f32> {
        let end = (self.position + self.chunk_size).min(self.samples.len());
        let chunk = self.samples[self.position..end].to_vec();
        self.position = end;
        chunk
    }

    fn read_paced(&mut self, started: Instant) -> Vec<f32> {
        let due = (started.elapsed().as_secs_f64() * INPUT_SAMPLE_RATE as f64) as usize;
        let emitted = self.position + self.silence_emitted;
        if due <= emitted {
            return Vec::new();
        }

        let mut out = Vec::with_capacity(due - emitted);
        let end = due.min(self.samples.len());
        if self.position < end {
            out.extend_from_slice(&self.samples[self.position..end]);
            self.position = end;
        }
        let silence = due.saturating_sub(self.position + self.silence_emitted);
        out.resize(out.len() + silence, 0.0);
        self.silence_emitted += silence;
        out
    }
}

impl Microphone for WavMicrophone {
    fn acquire(&mut self) -> Result<()> {
        if self.started.is_none() {
            self.started = Some(Instant::now());
        }
        Ok(())
    }

    fn read_block(&mut self) -> Result<Vec<f32>> {
        let Some(started) = self.started else {
            return Err(VoiceError::device("microphone not acquired"));
        };
        if self.paced {
            Ok(self.read_paced(started))
        } else {
            Ok(self.read_unpaced())
        }
    }

    fn release(&mut self) {
        self.started = None;
    }

    fn sample_rate(&self) -> u32 {
        INPUT_SAMPLE_RATE
    }
}
