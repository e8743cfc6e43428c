//! Upstream Feed
//!
//! Client for the provider's WebSocket feed: wire messages, codec, login,
//! backoff and the `tokio-tungstenite` transport.

pub mod auth;
pub mod client;
pub mod codec;
pub mod messages;
pub mod reconnect;
pub mod transport;

pub use auth::{AuthError, Credentials};
pub use client::{
    DEFAULT_FEED_URL, FeedClient, FeedClientConfig, FeedError, FeedStatusSnapshot,
    UpstreamConnectionState,
};
pub use codec::{CodecError, FrameCodec};
pub use messages::UpstreamFrame;
pub use reconnect::{ReconnectConfig, ReconnectPolicy};
pub use transport::TungsteniteConnector;
