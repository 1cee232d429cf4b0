//! Bidirectional connection to the remote voice service.
//!
//! A [`Transport`] opens one [`TransportSession`] per voice session. Inbound
//! traffic is delivered as [`TransportEvent`]s through a callback that may
//! run on any thread; outbound audio goes through [`TransportSession::send`].

pub mod protocol;
pub mod socket;

pub use protocol::{ClientMessage, ServerMessage, SessionSetup, sample_rate_from_mime};
pub use socket::{Endpoint, SocketTransport};

use crate::error::{Result, VoiceError};
use std::sync::{Arc, Mutex, MutexGuard};

/// Something that happened on the connection.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The service accepted the session; audio may flow.
    Opened,
    /// Base64 PCM from the model.
    Audio {
        data: String,
        mime_type: Option<String>,
    },
    /// The user barged in; queued playback must stop.
    Interrupted,
    /// The model finished its turn.
    TurnComplete,
    /// The service closed the connection.
    Closed,
    /// The connection failed.
    Error(String),
}

/// Receives inbound events. Must not block for long.
pub type EventCallback = Arc<dyn Fn(TransportEvent) + Send + Sync>;

/// Factory for voice service connections.
pub trait Transport: Send + Sync {
    /// Start connecting. `Opened` arrives through `on_event` once the session
    /// is usable.
    ///
    /// # Errors
    /// Returns `VoiceError::Connect` if the service cannot be reached.
    fn open(&self, setup: &SessionSetup, on_event: EventCallback)
    -> Result<Box<dyn TransportSession>>;
}

/// One open connection.
pub trait TransportSession: Send {
    /// Queue little-endian 16-bit mono PCM recorded at `sample_rate` for upload.
    fn send(&mut self, pcm: &[u8], sample_rate: u32) -> Result<()>;

    /// Close the connection. No events are delivered afterwards. Idempotent.
    fn close(&mut self);
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
struct MockTransportState {
    setups: Vec<SessionSetup>,
    sent: Vec<Vec<u8>>,
    sent_rates: Vec<u32>,
    close_count: usize,
    open_sessions: usize,
    on_event: Option<EventCallback>,
    fail_open: bool,
    fail_send: bool,
    auto_open: bool,
}

/// Mock transport for testing.
///
/// Records every open, send and close, and lets the test push inbound events
/// with [`MockTransport::emit`]. Clones share state.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockTransportState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every `open` with a connect error.
    pub fn with_open_failure(self) -> Self {
        lock(&self.state).fail_open = true;
        self
    }

    /// Fail every `send` with a transport error.
    pub fn with_send_failure(self) -> Self {
        lock(&self.state).fail_send = true;
        self
    }

    /// Emit `Opened` from inside `open`, like a service that accepts instantly.
    pub fn with_auto_open(self) -> Self {
        lock(&self.state).auto_open = true;
        self
    }

    pub fn set_send_failure(&self, fail: bool) {
        lock(&self.state).fail_send = fail;
    }

    /// Deliver an inbound event to the most recent session.
    ///
    /// Returns false if no session is open.
    pub fn emit(&self, event: TransportEvent) -> bool {
        let callback = {
            let state = lock(&self.state);
            if state.open_sessions == 0 {
                return false;
            }
            state.on_event.clone()
        };
        match callback {
            Some(callback) => {
                callback(event);
                true
            }
            None => false,
        }
    }

    /// Deliver an event regardless of whether the session was closed.
    pub fn emit_stale(&self, event: TransportEvent) {
        let callback = lock(&self.state).on_event.clone();
        if let Some(callback) = callback {
            callback(event);
        }
    }

    pub fn open_count(&self) -> usize {
        lock(&self.state).setups.len()
    }

    pub fn close_count(&self) -> usize {
        lock(&self.state).close_count
    }

    /// Sessions opened and not yet closed.
    pub fn open_sessions(&self) -> usize {
        lock(&self.state).open_sessions
    }

    pub fn setups(&self) -> Vec<SessionSetup> {
        lock(&self.state).setups.clone()
    }

    /// Every payload passed to `send`, in order.
    pub fn sent(&self) -> Vec<Vec<u8>> {
        lock(&self.state).sent.clone()
    }

    /// Sample rate announced with each payload passed to `send`.
    pub fn sent_rates(&self) -> Vec<u32> {
        lock(&self.state).sent_rates.clone()
    }

    pub fn sent_count(&self) -> usize {
        lock(&self.state).sent.len()
    }
}

impl Transport for MockTransport {
    fn open(
        &self,
        setup: &SessionSetup,
        on_event: EventCallback,
    ) -> Result<Box<dyn TransportSession>> {
        let auto_open = {
            let mut state = lock(&self.state);
            if state.fail_open {
                return Err(VoiceError::Connect {
                    message: "mock service unreachable".to_string(),
                });
            }
            state.setups.push(setup.clone());
            state.open_sessions += 1;
            state.on_event = Some(on_event.clone());
            state.auto_open
        };
        if auto_open {
            on_event(TransportEvent::Opened);
        }
        Ok(Box::new(MockTransportSession {
            state: self.state.clone(),
            closed: false,
        }))
    }
}

struct MockTransportSession {
    state: Arc<Mutex<MockTransportState>>,
    closed: bool,
}

impl TransportSession for MockTransportSession {
    fn send(&mut self, pcm: &[u8], sample_rate: u32) -> Result<()> {
        let mut state = lock(&self.state);
        if self.closed {
            return Err(VoiceError::Transport {
                message: "session closed".to_string(),
            });
        }
        if state.fail_send {
            return Err(VoiceError::Transport {
                message: "mock send failure".to_string(),
            });
        }
        state.sent.push(pcm.to_vec());
        state.sent_rates.push(sample_rate);
        Ok(())
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let mut state = lock(&self.state);
        state.close_count += 1;
        state.open_sessions = state.open_sessions.saturating_sub(1);
    }
}

impl Drop for MockTransportSession {
    fn drop(&mut self) {
        self.close();
    }
}
