use crate::error::{Result, VoiceError};
use crate::pipeline::types::{AudioChunk, SourceId};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Notification fired by an output device when a source finishes playing.
pub type CompletionCallback = Box<dyn FnOnce() + Send + 'static>;

/// Trait for microphone devices.
///
/// This trait allows swapping implementations (real audio device vs mock).
pub trait Microphone: Send {
    /// Take exclusive hold of the device and start capturing.
    fn acquire(&mut self) -> Result<()>;

    /// Read the mono samples captured since the previous call.
    ///
    /// Samples are normalized to `[-1.0, 1.0]` at [`Microphone::sample_rate`].
    /// An empty vector means nothing new is available yet.
    fn read_block(&mut self) -> Result<Vec<f32>>;

    /// Stop capturing and give the device back. Releasing twice is a no-op.
    fn release(&mut self);

    /// Sample rate of the samples returned by [`Microphone::read_block`].
    fn sample_rate(&self) -> u32;
}

/// Trait for audio output devices.
///
/// The device owns the output clock: [`OutputDevice::now`] is the position of
/// the playback cursor in seconds since the device was acquired.
///
/// Implementations must never invoke a completion callback from inside
/// `play_at` or `stop_all`; `stop_all` drops pending callbacks unfired.
pub trait OutputDevice: Send {
    /// Take exclusive hold of the device and start the output clock.
    fn acquire(&mut self) -> Result<()>;

    /// Current output-clock time in seconds.
    fn now(&self) -> f64;

    /// Queue `chunk` to start at `start_time` on the output clock.
    fn play_at(
        &mut self,
        id: SourceId,
        chunk: AudioChunk,
        start_time: f64,
        on_complete: CompletionCallback,
    ) -> Result<()>;

    /// Silence every queued and playing source immediately.
    fn stop_all(&mut self);

    /// Close the device. Releasing twice is a no-op.
    fn release(&mut self);
}

/// Factory handing out fresh devices for each session.
pub trait AudioBackend: Send + Sync {
    fn microphone(&self) -> Result<Box<dyn Microphone>>;
    fn output(&self) -> Result<Box<dyn OutputDevice>>;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// First error reported by a running audio stream.
///
/// Stream error callbacks run on the backend's audio thread and cannot
/// return anything; they record here, and the owning device turns the
/// record into a `Device` error on its next call. Clones share the slot.
#[derive(Debug, Clone, Default)]
pub struct StreamFault {
    slot: Arc<Mutex<Option<String>>>,
}

impl StreamFault {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a stream failure. Later failures keep the first message.
    pub fn record(&self, message: impl Into<String>) {
        let mut slot = lock(&self.slot);
        if slot.is_none() {
            *slot = Some(message.into());
        }
    }

    pub fn is_set(&self) -> bool {
        lock(&self.slot).is_some()
    }

    /// Forget any recorded failure, for a freshly built stream.
    pub fn clear(&self) {
        lock(&self.slot).take();
    }

    /// Fail with `VoiceError::Device` once a failure has been recorded.
    pub fn check(&self, stream: &str) -> Result<()> {
        match lock(&self.slot).as_ref() {
            Some(message) => Err(VoiceError::device(format!(
                "{} stream failed: {}",
                stream, message
            ))),
            None => Ok(()),
        }
    }
}

/// Settable output clock for tests.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    bits: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::SeqCst))
    }

    pub fn set(&self, seconds: f64) {
        self.bits.store(seconds.to_bits(), Ordering::SeqCst);
    }

    pub fn advance(&self, seconds: f64) {
        self.set(self.now() + seconds);
    }
}

#[derive(Debug, Default)]
struct MockMicrophoneState {
    acquired: bool,
    acquire_count: usize,
    release_count: usize,
    read_count: usize,
    blocks: VecDeque<Vec<f32>>,
    repeat: Option<Vec<f32>>,
    fail_acquire: bool,
    fail_read: bool,
}

/// Mock microphone for testing.
///
/// Clones share state, so a test can keep one handle while the session owns
/// another.
#[derive(Debug, Clone)]
pub struct MockMicrophone {
    state: Arc<Mutex<MockMicrophoneState>>,
    fault: StreamFault,
    sample_rate: u32,
    error_message: String,
}

impl MockMicrophone {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockMicrophoneState::default())),
            fault: StreamFault::new(),
            sample_rate: crate::defaults::INPUT_SAMPLE_RATE,
            error_message: "mock microphone error".to_string(),
        }
    }

    /// Queue blocks returned by successive reads.
    pub fn with_blocks(self, blocks: Vec<Vec<f32>>) -> Self {
        lock(&self.state).blocks.extend(blocks);
        self
    }

    /// Return `block` on every read once the queue is empty.
    pub fn with_repeating_block(self, block: Vec<f32>) -> Self {
        lock(&self.state).repeat = Some(block);
        self
    }

    pub fn with_acquire_failure(self) -> Self {
        lock(&self.state).fail_acquire = true;
        self
    }

    pub fn with_read_failure(self) -> Self {
        lock(&self.state).fail_read = true;
        self
    }

    pub fn with_sample_rate(mut self, sample_rate: u32) -> Self {
        self.sample_rate = sample_rate;
        self
    }

    /// Simulate the device disappearing while its stream runs.
    pub fn revoke(&self, message: &str) {
        self.fault.record(message);
    }

    pub fn is_acquired(&self) -> bool {
        lock(&self.state).acquired
    }

    pub fn acquire_count(&self) -> usize {
        lock(&self.state).acquire_count
    }

    pub fn release_count(&self) -> usize {
        lock(&self.state).release_count
    }

    /// Number of `read_block` calls that returned data or an error.
    pub fn read_count(&self) -> usize {
        lock(&self.state).read_count
    }
}

impl Default for MockMicrophone {
    fn default() -> Self {
        Self::new()
    }
}

impl Microphone for MockMicrophone {
    fn acquire(&mut self) -> Result<()> {
        let mut state = lock(&self.state);
        if state.fail_acquire {
            return Err(VoiceError::device(self.error_message.clone()));
        }
        state.acquired = true;
        state.acquire_count += 1;
        Ok(())
    }

    fn read_block(&mut self) -> Result<Vec<f32>> {
        let mut state = lock(&self.state);
        if !state.acquired {
            return Err(VoiceError::device("microphone not acquired"));
        }
        if let Err(error) = self.fault.check("input") {
            state.read_count += 1;
            return Err(error);
        }
        if state.fail_read {
            state.read_count += 1;
            return Err(VoiceError::device(self.error_message.clone()));
        }
        let block = match state.blocks.pop_front() {
            Some(block) => Some(block),
            None => state.repeat.clone(),
        };
        match block {
            Some(block) => {
                state.read_count += 1;
                Ok(block)
            }
            None => Ok(Vec::new()),
        }
    }

    fn release(&mut self) {
        let mut state = lock(&self.state);
        if state.acquired {
            state.acquired = false;
            state.release_count += 1;
        }
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

/// One `play_at` call seen by [`MockOutput`].
#[derive(Debug, Clone, PartialEq)]
pub struct PlayRecord {
    pub id: SourceId,
    pub start_time: f64,
    pub duration: f64,
}

#[derive(Default)]
struct MockOutputState {
    acquired: bool,
    acquire_count: usize,
    release_count: usize,
    stop_all_count: usize,
    played: Vec<PlayRecord>,
    pending: Vec<(SourceId, CompletionCallback)>,
    fail_acquire: bool,
    fail_play: bool,
}

/// Mock output device for testing.
///
/// Playback never completes on its own: tests drive completions with
/// [`MockOutput::complete`] and time with the shared [`ManualClock`].
#[derive(Clone)]
pub struct MockOutput {
    state: Arc<Mutex<MockOutputState>>,
    fault: StreamFault,
    clock: ManualClock,
}

impl MockOutput {
    pub fn new() -> Self {
        Self::with_clock(ManualClock::new())
    }

    pub fn with_clock(clock: ManualClock) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockOutputState::default())),
            fault: StreamFault::new(),
            clock,
        }
    }

    pub fn with_acquire_failure(self) -> Self {
        lock(&self.state).fail_acquire = true;
        self
    }

    pub fn with_play_failure(self) -> Self {
        lock(&self.state).fail_play = true;
        self
    }

    /// Simulate the device disappearing while its stream runs.
    pub fn revoke(&self, message: &str) {
        self.fault.record(message);
    }

    pub fn clock(&self) -> &ManualClock {
        &self.clock
    }

    pub fn is_acquired(&self) -> bool {
        lock(&self.state).acquired
    }

    pub fn acquire_count(&self) -> usize {
        lock(&self.state).acquire_count
    }

    pub fn release_count(&self) -> usize {
        lock(&self.state).release_count
    }

    pub fn stop_all_count(&self) -> usize {
        lock(&self.state).stop_all_count
    }

    /// Every source ever handed to `play_at`, in call order.
    pub fn played(&self) -> Vec<PlayRecord> {
        lock(&self.state).played.clone()
    }

    /// Sources still waiting for their completion notification.
    pub fn pending_count(&self) -> usize {
        lock(&self.state).pending.len()
    }

    /// Fire the completion of `id`. Returns false if it is not pending.
    pub fn complete(&self, id: SourceId) -> bool {
        let callback = {
            let mut state = lock(&self.state);
            let index = state.pending.iter().position(|(pending, _)| *pending == id);
            index.map(|i| state.pending.remove(i).1)
        };
        match callback {
            Some(callback) => {
                callback();
                true
            }
            None => false,
        }
    }

    /// Fire every pending completion in playback order.
    pub fn complete_all(&self) -> usize {
        let callbacks: Vec<_> = lock(&self.state).pending.drain(..).collect();
        let count = callbacks.len();
        for (_, callback) in callbacks {
            callback();
        }
        count
    }

    /// Take the pending callbacks without firing them (for stale-callback tests).
    pub fn take_pending(&self) -> Vec<(SourceId, CompletionCallback)> {
        lock(&self.state).pending.drain(..).collect()
    }
}

impl Default for MockOutput {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputDevice for MockOutput {
    fn acquire(&mut self) -> Result<()> {
        let mut state = lock(&self.state);
        if state.fail_acquire {
            return Err(VoiceError::device("mock output unavailable"));
        }
        state.acquired = true;
        state.acquire_count += 1;
        Ok(())
    }

    fn now(&self) -> f64 {
        self.clock.now()
    }

    fn play_at(
        &mut self,
        id: SourceId,
        chunk: AudioChunk,
        start_time: f64,
        on_complete: CompletionCallback,
    ) -> Result<()> {
        self.fault.check("output")?;
        let mut state = lock(&self.state);
        if state.fail_play || !state.acquired {
            return Err(VoiceError::device("mock output rejected playback"));
        }
        state.played.push(PlayRecord {
            id,
            start_time,
            duration: chunk.duration_secs(),
        });
        state.pending.push((id, on_complete));
        Ok(())
    }

    fn stop_all(&mut self) {
        let mut state = lock(&self.state);
        state.stop_all_count += 1;
        state.pending.clear();
    }

    fn release(&mut self) {
        let mut state = lock(&self.state);
        if state.acquired {
            state.acquired = false;
            state.release_count += 1;
            state.pending.clear();
        }
    }
}

/// Backend handing out clones of one mock microphone and one mock output.
#[derive(Clone)]
pub struct MockBackend {
    pub microphone: MockMicrophone,
    pub output: MockOutput,
}

impl MockBackend {
    pub fn new(microphone: MockMicrophone, output: MockOutput) -> Self {
        Self { microphone, output }
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new(MockMicrophone::new(), MockOutput::new())
    }
}

impl AudioBackend for MockBackend {
    fn microphone(&self) -> Result<Box<dyn Microphone>> {
        Ok(Box::new(self.microphone.clone()))
    }

    fn output(&self) -> Result<Box<dyn OutputDevice>> {
        Ok(Box::new(self.output.clone()))
    }
}
