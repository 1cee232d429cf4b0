//! SocketTransport against an in-process JSON-lines gateway.

use renova_live::audio::device::{MockBackend, MockMicrophone, MockOutput};
use renova_live::session::{SessionCallbacks, SessionOptions, VoiceSession};
use renova_live::transport::protocol::ClientMessage;
use renova_live::transport::{
    EventCallback, SessionSetup, SocketTransport, Transport, TransportEvent, TransportSession,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::mpsc;
use tokio::time::timeout;

fn event_channel() -> (EventCallback, mpsc::UnboundedReceiver<TransportEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let callback: EventCallback = Arc::new(move |event| {
        tx.send(event).ok();
    });
    (callback, rx)
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> TransportEvent {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for transport event")
        .expect("event channel closed")
}

async fn open(
    transport: SocketTransport,
    setup: SessionSetup,
    on_event: EventCallback,
) -> Box<dyn TransportSession> {
    tokio::task::spawn_blocking(move || transport.open(&setup, on_event))
        .await
        .unwrap()
        .expect("open should succeed")
}

#[tokio::test(flavor = "multi_thread")]
async fn setup_first_then_audio_both_ways() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (to_gateway, mut gateway_lines) = mpsc::unbounded_channel::<String>();
    let (from_test, mut gateway_script) = mpsc::unbounded_channel::<String>();

    let gateway = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();
        loop {
            tokio::select! {
                line = lines.next_line() => match line.unwrap() {
                    Some(line) => { to_gateway.send(line).ok(); }
                    None => break,
                },
                script = gateway_script.recv() => match script {
                    Some(line) if line == "<hangup>" => break,
                    Some(line) => {
                        writer.write_all(line.as_bytes()).await.unwrap();
                        writer.write_all(b"\n").await.unwrap();
                    }
                    None => break,
                },
            }
        }
    });

    let transport = SocketTransport::new(&addr.to_string()).unwrap();
    let (on_event, mut events) = event_channel();
    let setup = SessionSetup::new("test-model", "Puck").with_system_instruction("Be brief.");
    let mut session = open(transport, setup.clone(), on_event).await;

    assert_eq!(next_event(&mut events).await, TransportEvent::Opened);
    let first = timeout(Duration::from_secs(2), gateway_lines.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        ClientMessage::from_json(&first).unwrap(),
        ClientMessage::Setup(setup)
    );
    assert!(first.contains(r#""prebuiltVoiceConfig":{"voiceName":"Puck"}"#));

    session.send(&[1, 0, 2, 0], 16000).unwrap();
    let audio = timeout(Duration::from_secs(2), gateway_lines.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        audio,
        r#"{"realtimeInput":{"mediaChunks":[{"mimeType":"audio/pcm;rate=16000","data":"AQACAA=="}]}}"#
    );

    from_test.send(r#"{"setupComplete":{}}"#.to_string()).unwrap();
    from_test
        .send(
            r#"{"serverContent":{"modelTurn":{"parts":[{"inlineData":{"mimeType":"audio/pcm;rate=24000","data":"AAA="}}]}}}"#
                .to_string(),
        )
        .unwrap();
    from_test.send("this is not json".to_string()).unwrap();
    from_test
        .send(r#"{"serverContent":{"interrupted":true}}"#.to_string())
        .unwrap();
    from_test
        .send(r#"{"serverContent":{"turnComplete":true}}"#.to_string())
        .unwrap();

    assert_eq!(
        next_event(&mut events).await,
        TransportEvent::Audio {
            data: "AAA=".to_string(),
            mime_type: Some("audio/pcm;rate=24000".to_string()),
        }
    );
    assert_eq!(next_event(&mut events).await, TransportEvent::Interrupted);
    assert_eq!(next_event(&mut events).await, TransportEvent::TurnComplete);

    from_test.send("<hangup>".to_string()).unwrap();
    gateway.await.unwrap();
    assert_eq!(next_event(&mut events).await, TransportEvent::Closed);
    session.close();
}

#[tokio::test(flavor = "multi_thread")]
async fn client_close_ends_connection_without_events() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let gateway = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut lines = BufReader::new(stream).lines();
        let mut count = 0;
        while let Some(_line) = lines.next_line().await.unwrap() {
            count += 1;
        }
        count
    });

    let transport = SocketTransport::new(&addr.to_string()).unwrap();
    let (on_event, mut events) = event_channel();
    let mut session = open(transport, SessionSetup::default(), on_event).await;
    assert_eq!(next_event(&mut events).await, TransportEvent::Opened);

    session.send(&[0, 0], 16000).unwrap();
    session.close();
    session.close();
    assert!(session.send(&[0, 0], 16000).is_err());

    let received = timeout(Duration::from_secs(2), gateway)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, 2, "setup and one audio line");

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(events.try_recv().is_err(), "no Closed after a local close");
}

#[tokio::test(flavor = "multi_thread")]
async fn unix_socket_endpoint() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("gateway.sock");
    let listener = UnixListener::bind(&path).unwrap();

    let gateway = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();
        let setup = lines.next_line().await.unwrap().unwrap();
        writer
            .write_all(b"{\"serverContent\":{\"interrupted\":true}}\n")
            .await
            .unwrap();
        setup
    });

    let endpoint = format!("unix:{}", path.display());
    let transport = SocketTransport::new(&endpoint).unwrap();
    let (on_event, mut events) = event_channel();
    let _session = open(transport, SessionSetup::default(), on_event).await;

    assert_eq!(next_event(&mut events).await, TransportEvent::Opened);
    assert_eq!(next_event(&mut events).await, TransportEvent::Interrupted);
    let setup = gateway.await.unwrap();
    assert!(setup.starts_with(r#"{"setup":"#));
    assert_eq!(next_event(&mut events).await, TransportEvent::Closed);
}

#[tokio::test(flavor = "multi_thread")]
async fn uplink_mime_type_follows_the_captured_audio() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let gateway = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut lines = BufReader::new(stream).lines();
        let _setup = lines.next_line().await.unwrap().unwrap();
        lines.next_line().await.unwrap().unwrap()
    });

    let backend = MockBackend::new(
        MockMicrophone::new()
            .with_repeating_block(vec![0.25; 4])
            .with_sample_rate(24000),
        MockOutput::new(),
    );
    let mut options = SessionOptions::default();
    options.capture.block_frames = 4;
    options.capture.poll_interval = Duration::from_millis(2);
    let session = Arc::new(VoiceSession::new(
        Arc::new(backend),
        Arc::new(SocketTransport::new(&addr.to_string()).unwrap()),
        options,
        SessionCallbacks::new(),
    ));

    let connecting = session.clone();
    tokio::task::spawn_blocking(move || connecting.connect())
        .await
        .unwrap()
        .unwrap();

    let audio = timeout(Duration::from_secs(2), gateway)
        .await
        .unwrap()
        .unwrap();
    assert!(audio.contains(r#""mimeType":"audio/pcm;rate=24000""#), "{}", audio);

    let closing = session.clone();
    tokio::task::spawn_blocking(move || closing.disconnect())
        .await
        .unwrap();
}
