//! Voice session lifecycle.
//!
//! A [`VoiceSession`] moves through `Disconnected → Connecting → Connected`
//! and back, wiring microphone capture to the transport uplink and inbound
//! transport audio to the playback scheduler. Every session is tagged with a
//! generation number; events, faults and completions from an older
//! generation are ignored, so a late callback can never touch a newer
//! session or resurrect a torn-down one.

use crate::audio::codec;
use crate::audio::device::{AudioBackend, Microphone};
use crate::audio::meter::{InputTap, VolumeMeter};
use crate::defaults;
use crate::error::{Result, VoiceError};
use crate::pipeline::capture::{CapturePipeline, ChunkSink};
use crate::pipeline::error::{ErrorReporter, LogReporter};
use crate::pipeline::scheduler::PlaybackScheduler;
use crate::pipeline::types::AudioChunk;
use crate::session::state::{SessionCallbacks, SessionOptions, SessionState};
use crate::transport::protocol::sample_rate_from_mime;
use crate::transport::{EventCallback, Transport, TransportEvent, TransportSession};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Work item for the inbound-event thread.
enum SessionEvent {
    Transport(TransportEvent),
    Fault {
        component: &'static str,
        error: VoiceError,
    },
    Stop,
}

/// Outbound side of the connection. Drops every chunk while inactive.
struct Uplink {
    active: AtomicBool,
    session: Mutex<Option<Box<dyn TransportSession>>>,
    events: Sender<SessionEvent>,
}

impl Uplink {
    fn new(events: Sender<SessionEvent>) -> Self {
        Self {
            active: AtomicBool::new(false),
            session: Mutex::new(None),
            events,
        }
    }

    fn attach(&self, session: Box<dyn TransportSession>) {
        *lock(&self.session) = Some(session);
    }

    fn activate(&self) {
        self.active.store(true, Ordering::SeqCst);
    }

    fn deactivate(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    fn close(&self) {
        self.deactivate();
        if let Some(mut session) = lock(&self.session).take() {
            session.close();
        }
    }
}

impl ChunkSink for Uplink {
    fn accept(&self, chunk: AudioChunk) {
        if !self.active.load(Ordering::SeqCst) {
            return;
        }
        let bytes = codec::chunk_to_bytes(&chunk);
        let mut guard = lock(&self.session);
        let Some(session) = guard.as_mut() else {
            return;
        };
        if let Err(error) = session.send(&bytes, chunk.sample_rate()) {
            self.deactivate();
            let fault = SessionEvent::Fault {
                component: "transport",
                error,
            };
            if self.events.send(fault).is_err() {
                tracing::debug!("uplink failed after its session ended");
            }
        }
    }
}

/// Resources held for one session generation.
struct LiveSession {
    /// Acquired at connect, handed to the capture pipeline once the transport opens.
    microphone: Option<Box<dyn Microphone>>,
    capture: Option<CapturePipeline>,
    meter: Option<VolumeMeter>,
    scheduler: Arc<PlaybackScheduler>,
    uplink: Arc<Uplink>,
    events: Sender<SessionEvent>,
    inbound: Option<JoinHandle<()>>,
}

impl LiveSession {
    /// Release everything, in dependency order. Safe to call from the inbound thread.
    fn teardown(mut self) {
        self.uplink.deactivate();

        if let Some(mut capture) = self.capture.take()
            && let Some(mut microphone) = capture.stop()
        {
            microphone.release();
        }
        if let Some(mut microphone) = self.microphone.take() {
            microphone.release();
        }
        if let Some(mut meter) = self.meter.take() {
            meter.stop();
        }

        self.scheduler.shutdown();
        self.uplink.close();

        if self.events.send(SessionEvent::Stop).is_err() {
            tracing::trace!("inbound thread already gone");
        }
        if let Some(handle) = self.inbound.take()
            && handle.thread().id() != thread::current().id()
            && handle.join().is_err()
        {
            tracing::warn!("inbound event thread panicked");
        }
    }
}

struct Inner {
    state: SessionState,
    generation: u64,
    live: Option<LiveSession>,
}

struct Shared {
    options: SessionOptions,
    backend: Arc<dyn AudioBackend>,
    transport: Arc<dyn Transport>,
    callbacks: SessionCallbacks,
    reporter: Arc<dyn ErrorReporter>,
    inner: Mutex<Inner>,
}

/// Real-time duplex voice session.
///
/// All methods take `&self` and may be called from any thread. UI callbacks
/// run on session threads; `on_volume` and `on_speaking` must not call back
/// into the session synchronously.
pub struct VoiceSession {
    shared: Arc<Shared>,
}

impl VoiceSession {
    pub fn new(
        backend: Arc<dyn AudioBackend>,
        transport: Arc<dyn Transport>,
        options: SessionOptions,
        callbacks: SessionCallbacks,
    ) -> Self {
        Self::with_reporter(backend, transport, options, callbacks, Arc::new(LogReporter))
    }

    pub fn with_reporter(
        backend: Arc<dyn AudioBackend>,
        transport: Arc<dyn Transport>,
        options: SessionOptions,
        callbacks: SessionCallbacks,
        reporter: Arc<dyn ErrorReporter>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                options,
                backend,
                transport,
                callbacks,
                reporter,
                inner: Mutex::new(Inner {
                    state: SessionState::Disconnected,
                    generation: 0,
                    live: None,
                }),
            }),
        }
    }

    /// Acquire devices and open the transport.
    ///
    /// Returns once the session is `Connecting`; it becomes `Connected` when
    /// the transport reports it is open. A no-op while already connecting or
    /// connected.
    ///
    /// # Errors
    /// Device and connection failures move the session to `Error` (with
    /// everything partially acquired released) and are returned.
    pub fn connect(&self) -> Result<()> {
        Shared::connect(&self.shared)
    }

    /// Tear the session down. Idempotent from any state.
    pub fn disconnect(&self) {
        self.shared.disconnect();
    }

    pub fn state(&self) -> SessionState {
        self.shared.lock().state
    }

    /// Whether assistant audio is currently scheduled or playing.
    pub fn is_speaking(&self) -> bool {
        self.shared
            .lock()
            .live
            .as_ref()
            .is_some_and(|live| live.scheduler.is_speaking())
    }
}

impl Drop for VoiceSession {
    fn drop(&mut self) {
        self.shared.disconnect();
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        lock(&self.inner)
    }

    fn notify(&self, state: SessionState) {
        tracing::debug!("session status: {}", state);
        (self.callbacks.on_status)(state);
    }

    fn connect(shared: &Arc<Shared>) -> Result<()> {
        let generation = {
            let mut inner = shared.lock();
            if inner.state.is_active() {
                return Ok(());
            }
            inner.generation += 1;
            inner.state = SessionState::Connecting;
            inner.generation
        };
        shared.notify(SessionState::Connecting);
        tracing::info!("connecting voice session (generation {})", generation);

        let (live, events) = match shared.establish() {
            Ok(established) => established,
            Err(error) => {
                let current = {
                    let mut inner = shared.lock();
                    let current = inner.generation == generation;
                    if current {
                        inner.state = SessionState::Error;
                    }
                    current
                };
                shared.reporter.report("session", &error);
                if current {
                    shared.notify(SessionState::Error);
                }
                return Err(error);
            }
        };

        let stale = {
            let mut inner = shared.lock();
            if inner.generation == generation && inner.state == SessionState::Connecting {
                inner.live = Some(live);
                None
            } else {
                Some(live)
            }
        };
        if let Some(live) = stale {
            tracing::debug!("session disconnected while connecting");
            live.teardown();
            return Ok(());
        }

        // The event thread starts only after the live session is stored, so
        // an early `Opened` always finds it.
        let thread_shared = shared.clone();
        let spawned = thread::Builder::new()
            .name("session-events".to_string())
            .spawn(move || thread_shared.run_events(generation, events));

        match spawned {
            Ok(handle) => {
                let mut inner = shared.lock();
                let current = inner.generation == generation;
                // If torn down meanwhile the thread exits on its own.
                if current && let Some(live) = inner.live.as_mut() {
                    live.inbound = Some(handle);
                }
                Ok(())
            }
            Err(e) => {
                let error = VoiceError::Other(format!("Failed to spawn event thread: {}", e));
                shared.end_session(generation, SessionState::Error, None);
                shared.reporter.report("session", &error);
                Err(error)
            }
        }
    }

    /// Acquire the microphone and output device, then open the transport.
    fn establish(&self) -> Result<(LiveSession, Receiver<SessionEvent>)> {
        let mut microphone = self.backend.microphone()?;
        microphone.acquire()?;

        let mut output = match self.backend.output() {
            Ok(output) => output,
            Err(e) => {
                microphone.release();
                return Err(e);
            }
        };
        if let Err(e) = output.acquire() {
            microphone.release();
            return Err(e);
        }

        let scheduler = Arc::new(PlaybackScheduler::new(
            output,
            self.callbacks.on_speaking.clone(),
        ));

        let (events_tx, events_rx) = unbounded();
        let uplink = Arc::new(Uplink::new(events_tx.clone()));

        let transport_tx = events_tx.clone();
        let on_event: EventCallback = Arc::new(move |event| {
            if transport_tx.send(SessionEvent::Transport(event)).is_err() {
                tracing::trace!("dropping transport event for a finished session");
            }
        });

        match self.transport.open(&self.options.setup, on_event) {
            Ok(session) => uplink.attach(session),
            Err(e) => {
                microphone.release();
                scheduler.shutdown();
                return Err(e);
            }
        }

        Ok((
            LiveSession {
                microphone: Some(microphone),
                capture: None,
                meter: None,
                scheduler,
                uplink,
                events: events_tx,
                inbound: None,
            },
            events_rx,
        ))
    }

    fn run_events(&self, generation: u64, events: Receiver<SessionEvent>) {
        loop {
            match events.recv_timeout(self.options.event_poll) {
                Ok(SessionEvent::Stop) => break,
                Ok(SessionEvent::Transport(event)) => self.on_transport_event(generation, event),
                Ok(SessionEvent::Fault { component, error }) => {
                    self.end_session(generation, SessionState::Error, Some((component, error)));
                }
                Err(RecvTimeoutError::Timeout) => {
                    if self.lock().generation != generation {
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        tracing::debug!("event thread for generation {} finished", generation);
    }

    fn on_transport_event(&self, generation: u64, event: TransportEvent) {
        match event {
            TransportEvent::Opened => self.on_opened(generation),
            TransportEvent::Audio { data, mime_type } => {
                self.on_audio(generation, &data, mime_type.as_deref());
            }
            TransportEvent::Interrupted => {
                if let Some(scheduler) = self.connected_scheduler(generation) {
                    scheduler.interrupt();
                }
            }
            TransportEvent::TurnComplete => tracing::debug!("model turn complete"),
            TransportEvent::Closed => {
                tracing::info!("voice service closed the session");
                self.end_session(generation, SessionState::Disconnected, None);
            }
            TransportEvent::Error(message) => {
                let error = if self.lock().state == SessionState::Connecting {
                    VoiceError::Connect { message }
                } else {
                    VoiceError::Transport { message }
                };
                self.end_session(generation, SessionState::Error, Some(("transport", error)));
            }
        }
    }

    fn on_opened(&self, generation: u64) {
        let started = {
            let mut inner = self.lock();
            if inner.generation != generation || inner.state != SessionState::Connecting {
                return;
            }
            let Some(live) = inner.live.as_mut() else {
                return;
            };
            let Some(microphone) = live.microphone.take() else {
                return;
            };

            live.uplink.activate();
            let tap = InputTap::new(self.options.meter.fft_size);
            let fault_tx = live.events.clone();
            let capture = CapturePipeline::start(
                microphone,
                live.uplink.clone(),
                Some(tap.clone()),
                self.options.capture.clone(),
                Box::new(move |error| {
                    let fault = SessionEvent::Fault {
                        component: "capture",
                        error,
                    };
                    if fault_tx.send(fault).is_err() {
                        tracing::debug!("capture fault after its session ended");
                    }
                }),
            );

            let result = capture.and_then(|capture| {
                live.capture = Some(capture);
                VolumeMeter::start(
                    Some(tap),
                    self.options.meter.clone(),
                    self.callbacks.on_volume.clone(),
                )
            });
            match result {
                Ok(meter) => {
                    live.meter = Some(meter);
                    inner.state = SessionState::Connected;
                    Ok(())
                }
                Err(e) => Err(e),
            }
        };

        match started {
            Ok(()) => {
                tracing::info!("voice session connected");
                self.notify(SessionState::Connected);
            }
            Err(error) => {
                self.end_session(generation, SessionState::Error, Some(("capture", error)));
            }
        }
    }

    fn on_audio(&self, generation: u64, data: &str, mime_type: Option<&str>) {
        let Some(scheduler) = self.connected_scheduler(generation) else {
            tracing::debug!("dropping inbound audio received while not connected");
            return;
        };

        let sample_rate = mime_type
            .and_then(sample_rate_from_mime)
            .unwrap_or(self.options.inbound_sample_rate);
        let decoded = codec::from_transport_text(data)
            .and_then(|bytes| codec::decode(&bytes, sample_rate, defaults::CHANNELS));
        let chunk = match decoded {
            Ok(chunk) => chunk,
            Err(error) => {
                // One bad message is dropped; the session carries on.
                self.reporter.report("playback", &error);
                return;
            }
        };
        if chunk.is_empty() {
            return;
        }

        if let Err(error) = scheduler.schedule(chunk) {
            self.end_session(generation, SessionState::Error, Some(("playback", error)));
        }
    }

    fn connected_scheduler(&self, generation: u64) -> Option<Arc<PlaybackScheduler>> {
        let inner = self.lock();
        if inner.generation != generation || inner.state != SessionState::Connected {
            return None;
        }
        inner.live.as_ref().map(|live| live.scheduler.clone())
    }

    /// End the session of `generation` in `final_state`. No-op if it already ended.
    fn end_session(
        &self,
        generation: u64,
        final_state: SessionState,
        error: Option<(&str, VoiceError)>,
    ) {
        let live = {
            let mut inner = self.lock();
            if inner.generation != generation || !inner.state.is_active() {
                return;
            }
            inner.generation += 1;
            inner.state = final_state;
            inner.live.take()
        };

        if let Some((component, error)) = error {
            self.reporter.report(component, &error);
        }
        if let Some(live) = live {
            live.teardown();
        }
        self.notify(final_state);
    }

    fn disconnect(&self) {
        let (live, changed) = {
            let mut inner = self.lock();
            inner.generation += 1;
            let changed = inner.state != SessionState::Disconnected;
            inner.state = SessionState::Disconnected;
            (inner.live.take(), changed)
        };

        if let Some(live) = live {
            live.teardown();
        }
        if changed {
            tracing::info!("voice session disconnected");
            self.notify(SessionState::Disconnected);
        }
    }
}
