//! WebSocket Transport
//!
//! `tokio-tungstenite` adapter for the [`FeedConnector`] port.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::application::ports::{
    FeedConnection, FeedConnector, FeedFrame, FeedSink, FeedSource, TransportError,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens real WebSocket connections.
#[derive(Debug, Default, Clone, Copy)]
pub struct TungsteniteConnector;

impl TungsteniteConnector {
    /// Create a connector.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl FeedConnector for TungsteniteConnector {
    async fn connect(&self, url: &str) -> Result<FeedConnection, TransportError> {
        let (stream, response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        tracing::debug!(status = %response.status(), "WebSocket handshake complete");

        let (write, read) = stream.split();
        Ok(FeedConnection {
            sink: Box::new(TungsteniteSink { write }),
            source: Box::new(TungsteniteSource { read }),
        })
    }
}

struct TungsteniteSink {
    write: SplitSink<WsStream, Message>,
}

#[async_trait]
impl FeedSink for TungsteniteSink {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.write
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn send_pong(&mut self, payload: Vec<u8>) -> Result<(), TransportError> {
        self.write
            .send(Message::Pong(payload.into()))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.write
            .close()
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }
}

struct TungsteniteSource {
    read: SplitStream<WsStream>,
}

#[async_trait]
impl FeedSource for TungsteniteSource {
    async fn next_frame(&mut self) -> Option<Result<FeedFrame, TransportError>> {
        loop {
            let message = match self.read.next().await? {
                Ok(message) => message,
                Err(e) => return Some(Err(TransportError::Receive(e.to_string()))),
            };

            let frame = match message {
                Message::Text(text) => FeedFrame::Text(text.to_string()),
                Message::Binary(bytes) => FeedFrame::Binary(bytes.to_vec()),
                Message::Ping(payload) => FeedFrame::Ping(payload.to_vec()),
                Message::Pong(payload) => FeedFrame::Pong(payload.to_vec()),
                Message::Close(frame) => FeedFrame::Close(frame.map(|f| f.reason.to_string())),
                Message::Frame(_) => continue,
            };
            return Some(Ok(frame));
        }
    }
}
