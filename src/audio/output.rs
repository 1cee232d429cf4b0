//! Speaker output using CPAL.
//!
//! The output stream callback is the clock: it counts rendered frames, and a
//! scheduled chunk starts on the exact frame its start time maps to. Chunks
//! are mixed in software, so back-to-back chunks join without a gap.

use crate::audio::capture::{record_stream_error, select_device, with_suppressed_stderr};
use crate::audio::codec;
use crate::audio::device::{CompletionCallback, OutputDevice, StreamFault};
use crate::error::{Result, VoiceError};
use crate::pipeline::types::{AudioChunk, SourceId};
use cpal::Sample;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{Sender, unbounded};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

/// A chunk placed on the output timeline, resampled to the device rate.
struct Voice {
    id: SourceId,
    start_frame: u64,
    samples: Vec<f32>,
    on_complete: Option<CompletionCallback>,
}

impl Voice {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }
}

#[derive(Default)]
struct Mixer {
    voices: Vec<Voice>,
}

/// Render one device buffer: mix every voice overlapping
/// `[clock, clock + frames)`, hand finished completions to `done` and advance
/// the clock.
fn render<T>(
    data: &mut [T],
    channels: usize,
    mixer: &Mutex<Mixer>,
    clock: &AtomicU64,
    done: &Sender<CompletionCallback>,
) where
    T: cpal::SizedSample + cpal::FromSample<f32>,
{
    let channels = channels.max(1);
    let frames = data.len() / channels;
    let first = clock.load(Ordering::Acquire);
    let last = first + frames as u64;
    let mut mixed = vec![0.0f32; frames];

    if let Ok(mut mixer) = mixer.lock() {
        for voice in &mixer.voices {
            let from = voice.start_frame.max(first);
            let to = voice.end_frame().min(last);
            for frame in from..to {
                mixed[(frame - first) as usize] += voice.samples[(frame - voice.start_frame) as usize];
            }
        }

        let mut index = 0;
        while index < mixer.voices.len() {
            if mixer.voices[index].end_frame() <= last {
                let mut voice = mixer.voices.swap_remove(index);
                if let Some(callback) = voice.on_complete.take()
                    && done.send(callback).is_err()
                {
                    tracing::trace!("completion for {} dropped after release", voice.id);
                }
            } else {
                index += 1;
            }
        }
    }

    for (slot, value) in data.iter_mut().zip(codec::spread_mono(&mixed, channels)) {
        *slot = T::from_sample(value.clamp(-1.0, 1.0));
    }
    clock.fetch_add(frames as u64, Ordering::Release);
}

/// Wrapper for cpal::Stream to make it Send.
///
/// SAFETY: the stream is only touched through `&mut self` on the owning
/// output, never concurrently.
struct SendableStream(cpal::Stream);

unsafe impl Send for SendableStream {}

/// Output device backed by a CPAL output stream.
pub struct CpalOutput {
    device: cpal::Device,
    stream: Option<SendableStream>,
    mixer: Arc<Mutex<Mixer>>,
    clock: Arc<AtomicU64>,
    fault: StreamFault,
    device_rate: u32,
    channels: usize,
}

impl CpalOutput {
    /// Open an output device by name (exact or substring), or the default.
    ///
    /// # Errors
    /// Returns `VoiceError::DeviceNotFound` if no matching device exists.
    pub fn new(device_name: Option<&str>) -> Result<Self> {
        let device = with_suppressed_stderr(|| {
            let host = cpal::default_host();
            match device_name {
                Some(name) => {
                    let devices = host.output_devices().map_err(|e| {
                        VoiceError::device(format!("Failed to enumerate output devices: {}", e))
                    })?;
                    select_device(devices, name).ok_or_else(|| VoiceError::DeviceNotFound {
                        device: name.to_string(),
                    })
                }
                None => host
                    .default_output_device()
                    .ok_or_else(|| VoiceError::DeviceNotFound {
                        device: "default output".to_string(),
                    }),
            }
        })?;

        Ok(Self {
            device,
            stream: None,
            mixer: Arc::new(Mutex::new(Mixer::default())),
            clock: Arc::new(AtomicU64::new(0)),
            fault: StreamFault::new(),
            device_rate: 0,
            channels: 1,
        })
    }

    fn build<T>(
        &self,
        config: &cpal::StreamConfig,
        done: Sender<CompletionCallback>,
    ) -> Result<cpal::Stream>
    where
        T: cpal::SizedSample + cpal::FromSample<f32>,
    {
        let mixer = Arc::clone(&self.mixer);
        let clock = Arc::clone(&self.clock);
        let channels = self.channels;
        self.device
            .build_output_stream(
                config,
                move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                    render(data, channels, &mixer, &clock, &done);
                },
                record_stream_error(self.fault.clone(), "output"),
                None,
            )
            .map_err(|e| VoiceError::device(format!("Failed to build output stream: {}", e)))
    }

    fn lock_mixer(&self) -> Result<std::sync::MutexGuard<'_, Mixer>> {
        self.mixer
            .lock()
            .map_err(|e| VoiceError::device(format!("Failed to lock output mixer: {}", e)))
    }
}

impl OutputDevice for CpalOutput {
    fn acquire(&mut self) -> Result<()> {
        use cpal::SampleFormat;

        if self.stream.is_some() {
            return Ok(());
        }

        let default_config = self.device.default_output_config().map_err(|e| {
            VoiceError::device(format!("Failed to query default output config: {}", e))
        })?;
        self.device_rate = default_config.sample_rate();
        self.channels = default_config.channels() as usize;
        self.clock.store(0, Ordering::Release);
        self.fault.clear();
        let config: cpal::StreamConfig = default_config.clone().into();

        // Completions run off the audio thread; the thread ends when the
        // stream (and with it the last sender) is dropped.
        let (done_tx, done_rx) = unbounded::<CompletionCallback>();
        thread::Builder::new()
            .name("playback-complete".to_string())
            .spawn(move || {
                for callback in done_rx {
                    callback();
                }
            })
            .map_err(|e| VoiceError::Other(format!("Failed to spawn completion thread: {}", e)))?;

        let stream = match default_config.sample_format() {
            SampleFormat::F32 => self.build::<f32>(&config, done_tx)?,
            SampleFormat::I16 => self.build::<i16>(&config, done_tx)?,
            SampleFormat::U16 => self.build::<u16>(&config, done_tx)?,
            fmt => {
                return Err(VoiceError::device(format!(
                    "Unsupported output sample format: {:?}",
                    fmt
                )));
            }
        };
        stream
            .play()
            .map_err(|e| VoiceError::device(format!("Failed to start output stream: {}", e)))?;

        tracing::debug!(
            "output stream running at {}Hz, {} channel(s)",
            self.device_rate,
            self.channels
        );
        self.stream = Some(SendableStream(stream));
        Ok(())
    }

    fn now(&self) -> f64 {
        if self.device_rate == 0 {
            return 0.0;
        }
        self.clock.load(Ordering::Acquire) as f64 / self.device_rate as f64
    }

    fn play_at(
        &mut self,
        id: SourceId,
        chunk: AudioChunk,
        start_time: f64,
        on_complete: CompletionCallback,
    ) -> Result<()> {
        if self.stream.is_none() {
            return Err(VoiceError::device("output not acquired"));
        }
        self.fault.check("output")?;

        let mono = codec::mix_to_mono(&chunk.to_f32(), chunk.channels() as usize);
        let samples = codec::resample_f32(&mono, chunk.sample_rate(), self.device_rate);
        let start_frame = (start_time.max(0.0) * self.device_rate as f64).round() as u64;

        self.lock_mixer()?.voices.push(Voice {
            id,
            start_frame,
            samples,
            on_complete: Some(on_complete),
        });
        Ok(())
    }

    fn stop_all(&mut self) {
        if let Ok(mut mixer) = self.mixer.lock() {
            mixer.voices.clear();
        }
    }

    fn release(&mut self) {
        if let Some(stream) = self.stream.take()
            && let Err(e) = stream.0.pause()
        {
            tracing::debug!("pausing output stream failed: {}", e);
        }
        self.stop_all();
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    fn voice(id: u64, start_frame: u64, len: usize, value: f32) -> Voice {
        Voice {
            id: SourceId::new(id),
            start_frame,
            samples: vec![value; len],
            on_complete: None,
        }
    }

    #[test]
    fn test_render_places_voice_on_its_start_frame() {
        let mixer = Mutex::new(Mixer {
            voices: vec![voice(1, 4, 100, 0.5)],
        });
        let clock = AtomicU64::new(0);
        let (done, _rx) = unbounded();
        let mut data = vec![0.0f32; 8];

        render(&mut data, 1, &mixer, &clock, &done);

        assert_eq!(&data[..4], &[0.0; 4]);
        assert_eq!(&data[4..], &[0.5; 4]);
        assert_eq!(clock.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn test_render_back_to_back_voices_have_no_gap() {
        let mixer = Mutex::new(Mixer {
            voices: vec![voice(1, 0, 3, 0.25), voice(2, 3, 3, 0.75)],
        });
        let clock = AtomicU64::new(0);
        let (done, _rx) = unbounded();
        let mut data = vec![0.0f32; 6];

        render(&mut data, 1, &mixer, &clock, &done);

        assert_eq!(data, vec![0.25, 0.25, 0.25, 0.75, 0.75, 0.75]);
    }

    #[test]
    fn test_render_duplicates_across_channels() {
        let mixer = Mutex::new(Mixer {
            voices: vec![voice(1, 0, 2, 0.5)],
        });
        let clock = AtomicU64::new(0);
        let (done, _rx) = unbounded();
        let mut data = vec![0.0f32; 4];

        render(&mut data, 2, &mixer, &clock, &done);

        assert_eq!(data, vec![0.5, 0.5, 0.5, 0.5]);
        assert_eq!(clock.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_render_dispatches_completion_when_voice_ends() {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let mut finishing = voice(1, 0, 6, 0.1);
        finishing.on_complete = Some(Box::new(move || flag.store(true, Ordering::SeqCst)));
        let mixer = Mutex::new(Mixer {
            voices: vec![finishing],
        });
        let clock = AtomicU64::new(0);
        let (done, rx) = unbounded();

        let mut data = vec![0.0f32; 4];
        render(&mut data, 1, &mixer, &clock, &done);
        assert!(rx.try_recv().is_err(), "still playing");

        render(&mut data, 1, &mixer, &clock, &done);
        let callback = rx.try_recv().expect("completion dispatched");
        assert!(!fired.load(Ordering::SeqCst), "not run on the audio thread");
        callback();
        assert!(fired.load(Ordering::SeqCst));
        assert!(mixer.lock().unwrap().voices.is_empty());
    }

    #[test]
    fn test_render_converts_to_integer_formats() {
        let mixer = Mutex::new(Mixer {
            voices: vec![voice(1, 0, 2, 0.5)],
        });
        let clock = AtomicU64::new(0);
        let (done, _rx) = unbounded();
        let mut data = vec![0i16; 2];

        render(&mut data, 1, &mixer, &clock, &done);

        assert!(data.iter().all(|&s| s > 16000 && s < 16500));
    }

    #[test]
    #[ignore] // Requires audio hardware
    fn test_output_clock_advances() {
        let mut output = CpalOutput::new(None).expect("Failed to open output");
        output.acquire().expect("Failed to acquire output");
        std::thread::sleep(std::time::Duration::from_millis(200));
        assert!(output.now() > 0.0);
        output.release();
    }
}
