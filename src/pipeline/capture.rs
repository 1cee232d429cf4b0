//! Capture pipeline: microphone → fixed-size blocks → encoded chunks → sink.

use crate::audio::codec;
use crate::audio::device::Microphone;
use crate::audio::meter::InputTap;
use crate::defaults;
use crate::error::{Result, VoiceError};
use crate::pipeline::types::AudioChunk;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Receiver of outbound audio chunks.
pub trait ChunkSink: Send + Sync {
    /// Take ownership of one encoded capture block.
    fn accept(&self, chunk: AudioChunk);
}

/// Called once from the capture thread when the microphone fails for good.
pub type FaultCallback = Box<dyn Fn(VoiceError) + Send + Sync>;

/// Configuration for the capture pipeline.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Frames per emitted block.
    pub block_frames: usize,
    /// Sleep between reads when the device has nothing new.
    pub poll_interval: Duration,
    /// Read failures in a row before the device is considered lost.
    pub max_consecutive_errors: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            block_frames: defaults::BLOCK_FRAMES,
            poll_interval: Duration::from_millis(16),
            max_consecutive_errors: 10,
        }
    }
}

/// Running capture thread.
///
/// Owns the microphone while running and hands it back from [`CapturePipeline::stop`]
/// so the session can release it.
pub struct CapturePipeline {
    active: Arc<AtomicBool>,
    blocks_emitted: Arc<AtomicU64>,
    handle: Option<JoinHandle<Box<dyn Microphone>>>,
}

impl CapturePipeline {
    /// Start reading from an already-acquired microphone.
    pub fn start(
        mut microphone: Box<dyn Microphone>,
        sink: Arc<dyn ChunkSink>,
        tap: Option<InputTap>,
        config: CaptureConfig,
        on_fault: FaultCallback,
    ) -> Result<Self> {
        let active = Arc::new(AtomicBool::new(true));
        let blocks_emitted = Arc::new(AtomicU64::new(0));

        let thread_active = active.clone();
        let thread_blocks = blocks_emitted.clone();
        let block_len = config.block_frames.max(1);
        let sample_rate = microphone.sample_rate();

        let handle = thread::Builder::new()
            .name("capture".to_string())
            .spawn(move || {
                let mut pending: Vec<f32> = Vec::with_capacity(block_len * 2);
                let mut consecutive_errors: u32 = 0;

                'capture: while thread_active.load(Ordering::SeqCst) {
                    let samples = match microphone.read_block() {
                        Ok(s) => {
                            consecutive_errors = 0;
                            s
                        }
                        Err(e) => {
                            consecutive_errors += 1;
                            if consecutive_errors >= config.max_consecutive_errors {
                                tracing::error!(
                                    "microphone failed {consecutive_errors} times in a row: {e}"
                                );
                                // Only report if nobody stopped us in the meantime.
                                if thread_active.swap(false, Ordering::SeqCst) {
                                    on_fault(e);
                                }
                                break;
                            }
                            thread::sleep(config.poll_interval);
                            continue;
                        }
                    };

                    if samples.is_empty() {
                        thread::sleep(config.poll_interval);
                        continue;
                    }

                    if let Some(ref tap) = tap {
                        tap.push(&samples);
                    }
                    pending.extend_from_slice(&samples);

                    while pending.len() >= block_len {
                        // The device may keep delivering during teardown.
                        if !thread_active.load(Ordering::SeqCst) {
                            break 'capture;
                        }
                        let chunk = codec::chunk_from_f32(
                            &pending[..block_len],
                            sample_rate,
                            defaults::CHANNELS,
                        );
                        pending.drain(..block_len);
                        sink.accept(chunk);
                        thread_blocks.fetch_add(1, Ordering::Relaxed);
                    }
                }

                microphone
            })
            .map_err(|e| VoiceError::Other(format!("Failed to spawn capture thread: {}", e)))?;

        Ok(Self {
            active,
            blocks_emitted,
            handle: Some(handle),
        })
    }

    /// Stop emitting without waiting for the thread.
    pub fn deactivate(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    /// Stop the capture thread and return the microphone.
    ///
    /// Idempotent: later calls return `None`.
    pub fn stop(&mut self) -> Option<Box<dyn Microphone>> {
        self.deactivate();
        let handle = self.handle.take()?;
        match handle.join() {
            Ok(microphone) => Some(microphone),
            Err(_) => {
                tracing::error!("capture thread panicked; microphone dropped");
                None
            }
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Number of blocks handed to the sink so far.
    pub fn blocks_emitted(&self) -> u64 {
        self.blocks_emitted.load(Ordering::Relaxed)
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        if let Some(mut microphone) = self.stop() {
            microphone.release();
        }
    }
}
