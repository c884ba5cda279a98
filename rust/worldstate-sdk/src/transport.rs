//! Message transports.
//!
//! A [`Transport`] moves whole messages between the client and an indexer.
//! The connection actor owns exactly one transport and is the only caller.

use crate::error::{ClientError, Result};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    Text(String),
    Binary(Vec<u8>),
    /// Keepalive probe. The connection answers it with a `Pong` unless the
    /// transport handles pings itself.
    Ping(Vec<u8>),
    Pong(Vec<u8>),
}

impl WireMessage {
    pub fn payload(&self) -> &[u8] {
        match self {
            WireMessage::Text(t) => t.as_bytes(),
            WireMessage::Binary(b) | WireMessage::Ping(b) | WireMessage::Pong(b) => b,
        }
    }
}

#[async_trait]
pub trait Transport: Send + 'static {
    async fn send(&mut self, message: WireMessage) -> Result<()>;

    /// `None` once the peer has closed the stream.
    async fn recv(&mut self) -> Option<Result<WireMessage>>;

    async fn close(&mut self);
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

enum Inbound {
    Message(WireMessage),
    Skip,
    Closed,
}

/// tungstenite queues the reply to every ping on its own, so pings are not
/// surfaced.
fn inbound(msg: Message) -> Inbound {
    match msg {
        Message::Text(t) => Inbound::Message(WireMessage::Text(t)),
        Message::Binary(b) => Inbound::Message(WireMessage::Binary(b)),
        Message::Pong(p) => Inbound::Message(WireMessage::Pong(p)),
        Message::Ping(_) | Message::Frame(_) => Inbound::Skip,
        Message::Close(_) => Inbound::Closed,
    }
}

pub struct WebSocketTransport {
    sink: SplitSink<WsStream, Message>,
    stream: SplitStream<WsStream>,
}

impl WebSocketTransport {
    /// The socket-level message limit is left above `max_message_size` so
    /// that oversized payloads reach the client and are rejected per
    /// request instead of tearing down the connection.
    pub async fn connect(url: &str, max_message_size: usize) -> Result<Self> {
        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(max_message_size.saturating_mul(4).max(64 << 20));

        let (ws, _) = connect_async_with_config(url, Some(ws_config), false)
            .await
            .map_err(|e| ClientError::connection(format!("failed to connect to {}: {}", url, e)))?;
        debug!("WebSocket connected to {}", url);

        let (sink, stream) = ws.split();
        Ok(Self { sink, stream })
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&mut self, message: WireMessage) -> Result<()> {
        let msg = match message {
            WireMessage::Text(t) => Message::Text(t),
            WireMessage::Binary(b) => Message::Binary(b),
            WireMessage::Ping(p) => Message::Ping(p),
            WireMessage::Pong(p) => Message::Pong(p),
        };
        self.sink.send(msg).await.map_err(ClientError::from)
    }

    async fn recv(&mut self) -> Option<Result<WireMessage>> {
        loop {
            let msg = match self.stream.next().await? {
                Ok(msg) => msg,
                Err(e) => return Some(Err(e.into())),
            };
            match inbound(msg) {
                Inbound::Message(message) => return Some(Ok(message)),
                Inbound::Skip => continue,
                Inbound::Closed => return None,
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.sink.close().await;
    }
}
