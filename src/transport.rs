//! Duplex message channel to the realtime service
//!
//! The orchestrator talks to the wire through the [`Transport`] trait so tests
//! can substitute a scripted channel. Sends are fire-and-forget: a send on a
//! channel that is not open silently no-ops, it never surfaces an error to the
//! dispatch logic.

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use crate::{Error, Result};

/// Close code for an intentional disconnect
pub const CLOSE_NORMAL: u16 = 1000;

/// One inbound frame from the channel
#[derive(Debug, Clone)]
pub enum Frame {
    /// A JSON text message
    Text(String),
    /// The channel closed, with the peer's close code if one was given
    Closed(Option<u16>),
}

/// A connected duplex message channel
#[async_trait]
pub trait Transport: Send {
    /// Send a text frame; silently drops the frame if the channel is not open.
    async fn send(&mut self, text: String);

    /// Wait for the next inbound frame. After returning [`Frame::Closed`] the
    /// channel is spent and keeps returning `Closed`.
    async fn next_frame(&mut self) -> Frame;

    /// Initiate a close handshake with the given code.
    async fn close(&mut self, code: u16);

    /// Whether the channel is currently open.
    fn is_open(&self) -> bool;
}

/// Opens a [`Transport`] from a connection URL
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect to the realtime service at `url`.
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>>;
}

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// WebSocket transport over tokio-tungstenite
pub struct WsTransport {
    sink: WsSink,
    stream: WsStream,
    open: bool,
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&mut self, text: String) {
        if !self.open {
            tracing::trace!("dropping frame, channel not open");
            return;
        }
        if let Err(e) = self.sink.send(Message::Text(text)).await {
            tracing::warn!(error = %e, "websocket send failed");
            self.open = false;
        }
    }

    async fn next_frame(&mut self) -> Frame {
        if !self.open {
            return Frame::Closed(None);
        }
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Frame::Text(text),
                Some(Ok(Message::Close(frame))) => {
                    self.open = false;
                    return Frame::Closed(frame.map(|f| u16::from(f.code)));
                }
                // Binary, ping and pong frames carry nothing for us.
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "websocket read failed");
                    self.open = false;
                    return Frame::Closed(None);
                }
                None => {
                    self.open = false;
                    return Frame::Closed(None);
                }
            }
        }
    }

    async fn close(&mut self, code: u16) {
        if !self.open {
            return;
        }
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: "".into(),
        };
        if let Err(e) = self.sink.send(Message::Close(Some(frame))).await {
            tracing::debug!(error = %e, "websocket close failed");
        }
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

/// Connector producing [`WsTransport`] channels
#[derive(Debug, Clone, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>> {
        tracing::debug!(url, "opening realtime channel");
        let (ws, _response) = connect_async(url)
            .await
            .map_err(|e| Error::Transport(format!("connect {url}: {e}")))?;
        let (sink, stream) = ws.split();
        tracing::info!("realtime channel open");
        Ok(Box::new(WsTransport {
            sink,
            stream,
            open: true,
        }))
    }
}
