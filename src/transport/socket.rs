//! JSON-lines transport over TCP or a Unix socket.
//!
//! The connection is established synchronously in [`Transport::open`] so a
//! refused connection surfaces as a `Connect` error; after that a task on the
//! tokio runtime owns the socket, writing queued outbound lines and turning
//! inbound lines into [`TransportEvent`]s.

use crate::defaults;
use crate::error::{Result, VoiceError};
use crate::transport::protocol::{ClientMessage, ServerMessage, SessionSetup};
use crate::transport::{EventCallback, Transport, TransportEvent, TransportSession};
use std::fmt;
use std::net::ToSocketAddrs;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::runtime::Handle;
use tokio::sync::mpsc;

/// Where the voice gateway listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// `host:port`
    Tcp(String),
    /// `unix:/path/to/socket`
    Unix(PathBuf),
}

impl Endpoint {
    /// Parse `host:port` or `unix:/path`.
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Some(path) = s.strip_prefix("unix:") {
            if path.is_empty() {
                return Err(VoiceError::ConfigInvalidValue {
                    key: "endpoint".to_string(),
                    message: "unix endpoint needs a socket path".to_string(),
                });
            }
            return Ok(Endpoint::Unix(PathBuf::from(path)));
        }
        match s.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
                Ok(Endpoint::Tcp(s.to_string()))
            }
            _ => Err(VoiceError::ConfigInvalidValue {
                key: "endpoint".to_string(),
                message: format!("expected host:port or unix:/path, got '{}'", s),
            }),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp(addr) => write!(f, "{}", addr),
            Endpoint::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

/// Connects to a voice gateway speaking the JSON-lines protocol.
#[derive(Debug, Clone)]
pub struct SocketTransport {
    endpoint: Endpoint,
    handle: Handle,
    connect_timeout: Duration,
    queue_capacity: usize,
}

impl SocketTransport {
    /// Create a transport that runs its I/O on the current tokio runtime.
    ///
    /// # Errors
    /// Returns an error if `endpoint` is malformed or no runtime is running.
    pub fn new(endpoint: &str) -> Result<Self> {
        let handle = Handle::try_current()
            .map_err(|e| VoiceError::Other(format!("No tokio runtime available: {}", e)))?;
        Ok(Self::with_handle(Endpoint::parse(endpoint)?, handle))
    }

    pub fn with_handle(endpoint: Endpoint, handle: Handle) -> Self {
        Self {
            endpoint,
            handle,
            connect_timeout: Duration::from_secs(10),
            queue_capacity: defaults::OUTBOUND_QUEUE,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn connect_error(&self, e: impl fmt::Display) -> VoiceError {
        VoiceError::Connect {
            message: format!("{}: {}", self.endpoint, e),
        }
    }

    fn connect_tcp(&self, addr: &str) -> Result<std::net::TcpStream> {
        let addrs = addr
            .to_socket_addrs()
            .map_err(|e| self.connect_error(e))?;

        let mut last_error = None;
        for addr in addrs {
            match std::net::TcpStream::connect_timeout(&addr, self.connect_timeout) {
                Ok(stream) => return Ok(stream),
                Err(e) => last_error = Some(e),
            }
        }
        Err(match last_error {
            Some(e) => self.connect_error(e),
            None => self.connect_error("address resolved to nothing"),
        })
    }
}

impl Transport for SocketTransport {
    fn open(
        &self,
        setup: &SessionSetup,
        on_event: EventCallback,
    ) -> Result<Box<dyn TransportSession>> {
        let setup_line = ClientMessage::Setup(setup.clone())
            .to_json()
            .map_err(|e| VoiceError::Protocol {
                message: format!("Failed to serialize setup: {}", e),
            })?;

        let (tx, rx) = mpsc::channel::<String>(self.queue_capacity.max(1));
        let closing = Arc::new(AtomicBool::new(false));
        let task_closing = closing.clone();

        match &self.endpoint {
            Endpoint::Tcp(addr) => {
                let stream = self.connect_tcp(addr)?;
                stream
                    .set_nonblocking(true)
                    .map_err(|e| self.connect_error(e))?;
                // Ignored on failure: only affects latency.
                if let Err(e) = stream.set_nodelay(true) {
                    tracing::debug!("set_nodelay failed: {}", e);
                }
                let _guard = self.handle.enter();
                let stream =
                    tokio::net::TcpStream::from_std(stream).map_err(|e| self.connect_error(e))?;
                self.handle
                    .spawn(run_connection(stream, setup_line, rx, on_event, task_closing));
            }
            Endpoint::Unix(path) => {
                let stream = std::os::unix::net::UnixStream::connect(path)
                    .map_err(|e| self.connect_error(e))?;
                stream
                    .set_nonblocking(true)
                    .map_err(|e| self.connect_error(e))?;
                let _guard = self.handle.enter();
                let stream =
                    tokio::net::UnixStream::from_std(stream).map_err(|e| self.connect_error(e))?;
                self.handle
                    .spawn(run_connection(stream, setup_line, rx, on_event, task_closing));
            }
        }

        tracing::debug!("connected to voice gateway at {}", self.endpoint);

        Ok(Box::new(SocketSession {
            outbound: Some(tx),
            closing,
            dropped: 0,
        }))
    }
}

struct SocketSession {
    outbound: Option<mpsc::Sender<String>>,
    closing: Arc<AtomicBool>,
    dropped: u64,
}

impl TransportSession for SocketSession {
    fn send(&mut self, pcm: &[u8], sample_rate: u32) -> Result<()> {
        let Some(outbound) = self.outbound.as_ref() else {
            return Err(VoiceError::Transport {
                message: "connection closed".to_string(),
            });
        };

        let line = ClientMessage::audio(pcm, &defaults::pcm_mime_type(sample_rate))
            .to_json()
            .map_err(|e| VoiceError::Protocol {
                message: format!("Failed to serialize audio: {}", e),
            })?;

        match outbound.try_send(line) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped += 1;
                tracing::warn!(
                    "outbound queue full, dropped audio chunk ({} so far)",
                    self.dropped
                );
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(VoiceError::Transport {
                message: "connection closed".to_string(),
            }),
        }
    }

    fn close(&mut self) {
        self.closing.store(true, Ordering::SeqCst);
        // Dropping the sender ends the connection task.
        self.outbound.take();
    }
}

impl Drop for SocketSession {
    fn drop(&mut self) {
        self.close();
    }
}

async fn write_line<W>(writer: &mut W, line: &str) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

fn emit(on_event: &EventCallback, closing: &AtomicBool, event: TransportEvent) {
    if !closing.load(Ordering::SeqCst) {
        on_event(event);
    }
}

fn handle_line(line: &str, on_event: &EventCallback, closing: &AtomicBool) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    let message = match ServerMessage::from_json(line) {
        Ok(message) => message,
        Err(e) => {
            tracing::warn!("dropping malformed message from gateway: {}", e);
            return;
        }
    };
    if message.setup_complete.is_some() {
        tracing::debug!("gateway acknowledged setup");
    }
    for event in message.into_events() {
        emit(on_event, closing, event);
    }
}

async fn run_connection<S>(
    stream: S,
    setup_line: String,
    mut outbound: mpsc::Receiver<String>,
    on_event: EventCallback,
    closing: Arc<AtomicBool>,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut lines = BufReader::new(reader).lines();

    if let Err(e) = write_line(&mut writer, &setup_line).await {
        emit(
            &on_event,
            &closing,
            TransportEvent::Error(format!("Failed to send setup: {}", e)),
        );
        return;
    }
    emit(&on_event, &closing, TransportEvent::Opened);

    loop {
        tokio::select! {
            outgoing = outbound.recv() => match outgoing {
                Some(line) => {
                    if let Err(e) = write_line(&mut writer, &line).await {
                        emit(&on_event, &closing, TransportEvent::Error(e.to_string()));
                        break;
                    }
                }
                None => {
                    if let Err(e) = writer.shutdown().await {
                        tracing::debug!("socket shutdown failed: {}", e);
                    }
                    break;
                }
            },
            incoming = lines.next_line() => match incoming {
                Ok(Some(line)) => handle_line(&line, &on_event, &closing),
                Ok(None) => {
                    emit(&on_event, &closing, TransportEvent::Closed);
                    break;
                }
                Err(e) => {
                    emit(&on_event, &closing, TransportEvent::Error(e.to_string()));
                    break;
                }
            },
        }
    }

    tracing::debug!("gateway connection task finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_endpoint_parse_tcp() {
        assert_eq!(
            Endpoint::parse("127.0.0.1:7070").unwrap(),
            Endpoint::Tcp("127.0.0.1:7070".to_string())
        );
        assert_eq!(
            Endpoint::parse(" localhost:80 ").unwrap(),
            Endpoint::Tcp("localhost:80".to_string())
        );
    }

    #[test]
    fn test_endpoint_parse_unix() {
        assert_eq!(
            Endpoint::parse("unix:/run/voice.sock").unwrap(),
            Endpoint::Unix(PathBuf::from("/run/voice.sock"))
        );
    }

    #[test]
    fn test_endpoint_parse_rejects_garbage() {
        for bad in ["", "localhost", ":7070", "host:notaport", "unix:"] {
            assert!(
                matches!(
                    Endpoint::parse(bad),
                    Err(VoiceError::ConfigInvalidValue { .. })
                ),
                "should reject {:?}",
                bad
            );
        }
    }

    #[test]
    fn test_endpoint_display_roundtrips() {
        for s in ["127.0.0.1:7070", "unix:/tmp/gw.sock"] {
            assert_eq!(Endpoint::parse(s).unwrap().to_string(), s);
        }
    }

    #[test]
    fn test_new_requires_runtime() {
        assert!(SocketTransport::new("127.0.0.1:7070").is_err());
    }

    #[test]
    fn test_handle_line_drops_malformed_and_emits_events() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let on_event: EventCallback = Arc::new(move |e| sink.lock().unwrap().push(e));
        let closing = AtomicBool::new(false);

        handle_line("garbage", &on_event, &closing);
        handle_line("   ", &on_event, &closing);
        handle_line(r#"{"serverContent":{"interrupted":true}}"#, &on_event, &closing);

        assert_eq!(*events.lock().unwrap(), vec![TransportEvent::Interrupted]);
    }

    #[test]
    fn test_no_events_once_closing() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let on_event: EventCallback = Arc::new(move |e| sink.lock().unwrap().push(e));
        let closing = AtomicBool::new(true);

        handle_line(r#"{"serverContent":{"interrupted":true}}"#, &on_event, &closing);
        emit(&on_event, &closing, TransportEvent::Closed);

        assert!(events.lock().unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_connect_refused_is_connect_error() {
        // Bind then drop to get a port nobody listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport = SocketTransport::new(&addr.to_string()).unwrap();
        let on_event: EventCallback = Arc::new(|_| {});
        let result = tokio::task::spawn_blocking(move || {
            transport
                .open(&SessionSetup::default(), on_event)
                .map(|_| ())
        })
        .await
        .unwrap();

        assert!(matches!(result, Err(VoiceError::Connect { .. })));
    }
}
