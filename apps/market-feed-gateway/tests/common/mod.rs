//! Shared test fixtures: an in-memory upstream provider.
//!
//! [`MockConnector`] hands the client channel-backed connections. Each
//! accepted connection produces a [`ServerHandle`] through which the test
//! plays the provider: it pushes frames to the client and reads whatever
//! the client sent.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use market_feed_gateway::{
    Credentials, FeedClientConfig, FeedConnection, FeedConnector, FeedFrame, FeedSink, FeedSource,
    ReconnectConfig, TransportError,
};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Login acknowledgement the provider sends on success.
pub const ACCEPT_ACK: &str = r#"{"event":"login","status":200,"message":"Authenticated"}"#;

/// How the next connect attempt is answered.
#[derive(Debug, Clone)]
pub enum ConnectPlan {
    /// Open the connection; queue `ack` (if any) as the first inbound frame.
    Accept {
        /// Login acknowledgement text.
        ack: Option<String>,
    },
    /// Fail the attempt.
    Refuse,
}

impl ConnectPlan {
    /// Accept and acknowledge the login.
    pub fn accept() -> Self {
        Self::Accept {
            ack: Some(ACCEPT_ACK.to_string()),
        }
    }

    /// Accept but never acknowledge the login.
    pub const fn silent() -> Self {
        Self::Accept { ack: None }
    }
}

/// The provider's side of one accepted connection.
pub struct ServerHandle {
    /// Frames delivered to the client. Dropping this ends the client's stream.
    pub inbound: mpsc::UnboundedSender<Result<FeedFrame, TransportError>>,
    /// Text frames the client sent.
    pub outbound: mpsc::UnboundedReceiver<String>,
    /// Pong payloads the client sent.
    pub pongs: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl ServerHandle {
    /// Push a text frame to the client.
    pub fn send(&self, text: impl Into<String>) {
        let _ = self.inbound.send(Ok(FeedFrame::Text(text.into())));
    }

    /// Push a JSON value to the client.
    pub fn send_json(&self, value: &Value) {
        self.send(value.to_string());
    }

    /// Everything the client has sent so far, parsed as JSON.
    pub fn drain_sent(&mut self) -> Vec<Value> {
        let mut sent = Vec::new();
        while let Ok(text) = self.outbound.try_recv() {
            sent.push(serde_json::from_str(&text).expect("client sent JSON"));
        }
        sent
    }

    /// Next text frame the client sends, parsed as JSON.
    pub async fn next_sent(&mut self) -> Value {
        let text = tokio::time::timeout(Duration::from_secs(5), self.outbound.recv())
            .await
            .expect("client frame in time")
            .expect("client connection open");
        serde_json::from_str(&text).expect("client sent JSON")
    }
}

/// In-memory [`FeedConnector`].
pub struct MockConnector {
    plans: Mutex<VecDeque<ConnectPlan>>,
    attempts: Mutex<Vec<Instant>>,
    servers: mpsc::UnboundedSender<ServerHandle>,
}

impl MockConnector {
    /// Connector that accepts every attempt once `plans` is used up.
    pub fn new(plans: Vec<ConnectPlan>) -> (Arc<Self>, mpsc::UnboundedReceiver<ServerHandle>) {
        let (servers, handles) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            plans: Mutex::new(plans.into()),
            attempts: Mutex::new(Vec::new()),
            servers,
        });
        (connector, handles)
    }

    /// Queue more plans.
    pub fn push_plans(&self, plans: impl IntoIterator<Item = ConnectPlan>) {
        self.plans.lock().extend(plans);
    }

    /// Number of connect attempts so far.
    pub fn attempt_count(&self) -> usize {
        self.attempts.lock().len()
    }

    /// When each connect attempt happened.
    pub fn attempt_times(&self) -> Vec<Instant> {
        self.attempts.lock().clone()
    }
}

#[async_trait]
impl FeedConnector for MockConnector {
    async fn connect(&self, _url: &str) -> Result<FeedConnection, TransportError> {
        self.attempts.lock().push(Instant::now());
        let plan = self
            .plans
            .lock()
            .pop_front()
            .unwrap_or_else(ConnectPlan::accept);

        let ack = match plan {
            ConnectPlan::Refuse => {
                return Err(TransportError::Connect("connection refused".to_string()));
            }
            ConnectPlan::Accept { ack } => ack,
        };

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (pong_tx, pong_rx) = mpsc::unbounded_channel();
        if let Some(ack) = ack {
            let _ = inbound_tx.send(Ok(FeedFrame::Text(ack)));
        }

        let _ = self.servers.send(ServerHandle {
            inbound: inbound_tx,
            outbound: outbound_rx,
            pongs: pong_rx,
        });

        Ok(FeedConnection {
            sink: Box::new(MockSink {
                tx: outbound_tx,
                pongs: pong_tx,
            }),
            source: Box::new(MockSource { rx: inbound_rx }),
        })
    }
}

struct MockSink {
    tx: mpsc::UnboundedSender<String>,
    pongs: mpsc::UnboundedSender<Vec<u8>>,
}

#[async_trait]
impl FeedSink for MockSink {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.tx
            .send(text)
            .map_err(|_| TransportError::Send("provider gone".to_string()))
    }

    async fn send_pong(&mut self, payload: Vec<u8>) -> Result<(), TransportError> {
        self.pongs
            .send(payload)
            .map_err(|_| TransportError::Send("provider gone".to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

struct MockSource {
    rx: mpsc::UnboundedReceiver<Result<FeedFrame, TransportError>>,
}

#[async_trait]
impl FeedSource for MockSource {
    async fn next_frame(&mut self) -> Option<Result<FeedFrame, TransportError>> {
        self.rx.recv().await
    }
}

/// Client config pointing at the mock with a key set.
pub fn feed_config() -> FeedClientConfig {
    FeedClientConfig {
        url: "ws://mock.invalid".to_string(),
        credentials: Some(Credentials::new("test-key").unwrap()),
        reconnect: ReconnectConfig::default(),
        ..FeedClientConfig::default()
    }
}

/// Trade frame for `symbol`.
pub fn trade(symbol: &str, price: f64) -> String {
    serde_json::json!({
        "s": symbol,
        "t": 1_700_000_000_000_i64,
        "type": "T",
        "lp": price,
        "ls": 100
    })
    .to_string()
}

/// Wait until `condition` holds, yielding to other tasks in between.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}
