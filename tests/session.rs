//! End-to-end session loop tests over a scripted in-memory transport

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::timeout;

use parley_voice::audio::{AudioSink, AudioSource, SourceFrame};
use parley_voice::delegation::{ReasoningAnswer, ReasoningGateway};
use parley_voice::relay::{CredentialProvider, RelayCredentials};
use parley_voice::transport::{Connector, Frame, Transport};
use parley_voice::{
    Collaborators, Config, ConnectionState, Result, Session, SessionEvent,
};

struct StaticCredentials;

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn fetch(&self) -> Result<RelayCredentials> {
        Ok(RelayCredentials {
            url: "wss://test.invalid/session".to_string(),
        })
    }
}

struct EchoGateway;

#[async_trait]
impl ReasoningGateway for EchoGateway {
    async fn answer(&self, query: &str, _context: &str) -> Result<ReasoningAnswer> {
        Ok(ReasoningAnswer {
            answer: format!("Deep answer to: {query}"),
            used_search: false,
        })
    }
}

/// Transport fed by the test through a channel; outbound frames are captured.
struct ChannelTransport {
    incoming: mpsc::Receiver<Frame>,
    loopback: mpsc::Sender<Frame>,
    sent: mpsc::UnboundedSender<String>,
    open: bool,
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&mut self, text: String) {
        if self.open {
            let _ = self.sent.send(text);
        }
    }

    async fn next_frame(&mut self) -> Frame {
        if !self.open {
            return Frame::Closed(None);
        }
        match self.incoming.recv().await {
            Some(frame) => {
                if matches!(frame, Frame::Closed(_)) {
                    self.open = false;
                }
                frame
            }
            None => {
                self.open = false;
                Frame::Closed(None)
            }
        }
    }

    async fn close(&mut self, code: u16) {
        // Echo the close handshake back like a well-behaved peer.
        let _ = self.loopback.send(Frame::Closed(Some(code))).await;
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

struct ChannelConnector {
    transport: Mutex<Option<ChannelTransport>>,
}

#[async_trait]
impl Connector for ChannelConnector {
    async fn connect(&self, _url: &str) -> Result<Box<dyn Transport>> {
        let transport = self
            .transport
            .lock()
            .unwrap()
            .take()
            .expect("single connect");
        Ok(Box::new(transport))
    }
}

struct NoSource;

impl AudioSource for NoSource {
    fn start(&mut self, _frames: mpsc::Sender<SourceFrame>) -> Result<()> {
        Ok(())
    }

    fn stop(&mut self) {}

    fn is_capturing(&self) -> bool {
        false
    }
}

struct NoSink;

impl AudioSink for NoSink {
    fn enqueue(&self, _pcm: &[i16]) {}

    fn stop(&self) {}
}

struct Harness {
    session: Session,
    server: mpsc::Sender<Frame>,
    sent: mpsc::UnboundedReceiver<String>,
}

fn harness() -> Harness {
    let (server, incoming) = mpsc::channel(32);
    let (sent_tx, sent) = mpsc::unbounded_channel();
    let transport = ChannelTransport {
        incoming,
        loopback: server.clone(),
        sent: sent_tx,
        open: true,
    };
    let collaborators = Collaborators {
        credentials: Arc::new(StaticCredentials),
        connector: Arc::new(ChannelConnector {
            transport: Mutex::new(Some(transport)),
        }),
        gateway: Arc::new(EchoGateway),
        context: None,
        source: Box::new(NoSource),
        sink: Arc::new(NoSink),
    };
    Harness {
        session: Session::new(Config::default(), collaborators),
        server,
        sent,
    }
}

async fn wait_for_state(
    events: &mut tokio::sync::broadcast::Receiver<SessionEvent>,
    want: ConnectionState,
) {
    let deadline = Duration::from_secs(5);
    loop {
        let event = timeout(deadline, events.recv())
            .await
            .expect("timed out waiting for state")
            .expect("event stream closed");
        if let SessionEvent::StateChanged(state) = event {
            if state == want {
                return;
            }
        }
    }
}

#[tokio::test]
async fn session_loop_runs_a_conversation_and_shuts_down() {
    let mut h = harness();
    let mut events = h.session.subscribe();
    let handle = h.session.handle();

    h.session.connect().await;
    assert_eq!(h.session.state(), ConnectionState::Connected);

    let first = h.sent.recv().await.expect("configuration frame");
    assert!(first.contains(r#""type":"session.update""#));

    let mut session = h.session;
    let runner = tokio::spawn(async move {
        session.run().await;
        session
    });

    h.server
        .send(Frame::Text(
            r#"{"type":"session.created","session":{"id":"sess_1"}}"#.to_string(),
        ))
        .await
        .unwrap();
    h.server
        .send(Frame::Text(
            r#"{"type":"input_audio_buffer.speech_started"}"#.to_string(),
        ))
        .await
        .unwrap();
    wait_for_state(&mut events, ConnectionState::Listening).await;

    h.server
        .send(Frame::Text(
            r#"{"type":"response.audio_transcript.delta","delta":"Hi there."}"#.to_string(),
        ))
        .await
        .unwrap();
    h.server
        .send(Frame::Text(
            r#"{"type":"response.audio_transcript.done","transcript":"Hi there."}"#.to_string(),
        ))
        .await
        .unwrap();
    h.server
        .send(Frame::Text(r#"{"type":"response.done"}"#.to_string()))
        .await
        .unwrap();
    wait_for_state(&mut events, ConnectionState::Connected).await;

    handle.disconnect().await;
    let session = timeout(Duration::from_secs(5), runner)
        .await
        .expect("session loop did not finish")
        .expect("session loop panicked");

    assert_eq!(session.state(), ConnectionState::Idle);
    assert!(session.error().is_none());
    let transcript = session.transcript();
    assert!(transcript.iter().any(|l| l == "[session started]"));
    assert!(transcript.iter().any(|l| l == "Assistant: Hi there."));
}

#[tokio::test]
async fn delegation_round_trip_through_the_loop() {
    let mut h = harness();
    let mut events = h.session.subscribe();
    let handle = h.session.handle();

    h.session.connect().await;
    let _config_frame = h.sent.recv().await.expect("configuration frame");

    let mut session = h.session;
    let runner = tokio::spawn(async move {
        session.run().await;
        session
    });

    h.server
        .send(Frame::Text(
            r#"{"type":"conversation.item.input_audio_transcription.completed","transcript":"why is the sky blue"}"#
                .to_string(),
        ))
        .await
        .unwrap();
    h.server
        .send(Frame::Text(
            r#"{"type":"response.audio_transcript.delta","delta":"Good one, let me think about that."}"#
                .to_string(),
        ))
        .await
        .unwrap();
    wait_for_state(&mut events, ConnectionState::Thinking).await;

    h.server
        .send(Frame::Text(r#"{"type":"response.done"}"#.to_string()))
        .await
        .unwrap();

    // The injected answer comes back out on the wire.
    let deadline = Duration::from_secs(5);
    let injected = loop {
        let frame = timeout(deadline, h.sent.recv())
            .await
            .expect("timed out waiting for injection")
            .expect("transport gone");
        if frame.contains(r#""type":"conversation.item.create""#) {
            break frame;
        }
    };
    assert!(injected.contains("Deep answer to: why is the sky blue"));
    wait_for_state(&mut events, ConnectionState::Speaking).await;

    handle.disconnect().await;
    let session = timeout(Duration::from_secs(5), runner)
        .await
        .expect("session loop did not finish")
        .expect("session loop panicked");
    assert_eq!(session.state(), ConnectionState::Idle);
}
