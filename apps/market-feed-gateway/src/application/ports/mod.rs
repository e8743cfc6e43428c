//! Port Interfaces
//!
//! Contracts between the feed client and the outside world.
//!
//! ## Driven Ports (Outbound)
//!
//! - [`FeedConnector`]: opens the upstream transport and hands back a
//!   [`FeedSink`]/[`FeedSource`] pair. The production adapter wraps
//!   `tokio-tungstenite`; tests plug in an in-memory connector.
//!
//! ## Driver Ports (Inbound)
//!
//! - [`RecordListener`]: invoked synchronously by the receive loop for every
//!   ingested record, in registration order.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::domain::market::MarketRecord;

// =============================================================================
// Transport
// =============================================================================

/// One frame read from the upstream transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedFrame {
    /// UTF-8 text payload.
    Text(String),
    /// Binary payload.
    Binary(Vec<u8>),
    /// Transport ping; must be answered with a pong.
    Ping(Vec<u8>),
    /// Transport pong.
    Pong(Vec<u8>),
    /// Close frame with optional reason.
    Close(Option<String>),
}

/// Transport-level failure. Always recoverable by reconnecting.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Could not open the connection.
    #[error("connect failed: {0}")]
    Connect(String),

    /// Opening the connection took too long.
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// Writing a frame failed.
    #[error("send failed: {0}")]
    Send(String),

    /// Reading a frame failed.
    #[error("receive failed: {0}")]
    Receive(String),

    /// The peer closed the connection.
    #[error("connection closed")]
    Closed,
}

/// Write half of an upstream connection.
#[async_trait]
pub trait FeedSink: Send {
    /// Send a text frame.
    async fn send_text(&mut self, text: String) -> Result<(), TransportError>;

    /// Answer a transport ping.
    async fn send_pong(&mut self, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Close the connection.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Read half of an upstream connection.
#[async_trait]
pub trait FeedSource: Send {
    /// Next frame, or `None` once the stream has ended.
    async fn next_frame(&mut self) -> Option<Result<FeedFrame, TransportError>>;
}

/// An open upstream connection.
pub struct FeedConnection {
    /// Write half.
    pub sink: Box<dyn FeedSink>,
    /// Read half.
    pub source: Box<dyn FeedSource>,
}

impl std::fmt::Debug for FeedConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedConnection").finish_non_exhaustive()
    }
}

/// Opens upstream connections.
#[async_trait]
pub trait FeedConnector: Send + Sync {
    /// Connect to `url`.
    async fn connect(&self, url: &str) -> Result<FeedConnection, TransportError>;
}

// =============================================================================
// Listeners
// =============================================================================

/// Receives every record the feed client ingests.
///
/// Called on the receive loop's task, so implementations must not block.
#[cfg_attr(test, mockall::automock)]
pub trait RecordListener: Send + Sync {
    /// Handle one record.
    fn on_record(&self, record: &Arc<MarketRecord>);
}

/// Shared listener handle.
pub type SharedListener = Arc<dyn RecordListener>;
