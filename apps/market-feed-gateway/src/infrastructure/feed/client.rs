//! Upstream Feed Client
//!
//! Owns the single connection to the market-data provider.
//!
//! # Lifecycle
//!
//! 1. [`FeedClient::connect`] opens the transport, logs in and waits for the
//!    acknowledgement.
//! 2. [`FeedClient::subscribe`] / [`FeedClient::unsubscribe`] send control
//!    frames and maintain the upstream subscription set.
//! 3. [`FeedClient::start_receiving`] spawns the only reader of the transport.
//!    Each data frame becomes a [`MarketRecord`], is written to the cache and
//!    handed to every listener in registration order.
//! 4. When the transport drops, the receive loop reconnects with exponential
//!    backoff and re-subscribes the whole set in one frame. Once the attempts
//!    are exhausted the loop stops; a later `connect` + `start_receiving`
//!    brings it back.
//! 5. [`FeedClient::disconnect`] stops everything and is safe to repeat.
//!
//! The subscription set is sticky: nothing removes symbols from it except an
//! explicit unsubscribe.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::auth::{AuthError, AuthHandler, Credentials};
use super::codec::{CodecError, FrameCodec};
use super::messages::{DataFrame, SubscriptionRequest, UpstreamFrame};
use super::reconnect::{ReconnectConfig, ReconnectPolicy};
use crate::application::ports::{
    FeedConnection, FeedConnector, FeedFrame, FeedSink, FeedSource, SharedListener, TransportError,
};
use crate::domain::cache::SharedCache;
use crate::domain::market::{Symbol, normalize_symbols};
use crate::infrastructure::metrics::{self, UpstreamKind};

/// Default provider endpoint.
pub const DEFAULT_FEED_URL: &str = "wss://websockets.financialmodelingprep.com";

// =============================================================================
// Error Type
// =============================================================================

/// Errors surfaced by the feed client.
#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    /// Missing or unusable configuration. Never retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Transport failure.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Login failure.
    #[error(transparent)]
    Authentication(#[from] AuthError),

    /// Frame could not be encoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Operation requires an authenticated connection.
    #[error("upstream feed is not connected")]
    NotConnected,
}

impl FeedError {
    /// Whether retrying can never succeed without operator action.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_) | Self::Authentication(AuthError::MissingCredential)
        )
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Feed client settings.
#[derive(Debug, Clone)]
pub struct FeedClientConfig {
    /// Provider WebSocket URL.
    pub url: String,
    /// API key; `None` makes every connect fail with a configuration error.
    pub credentials: Option<Credentials>,
    /// Bound on opening the transport.
    pub connect_timeout: Duration,
    /// Bound on waiting for the login acknowledgement.
    pub login_ack_timeout: Duration,
    /// Treat a missing acknowledgement as success.
    pub lenient_login_ack: bool,
    /// Quiet period after which the receive loop logs and keeps waiting.
    pub idle_timeout: Duration,
    /// Backoff schedule.
    pub reconnect: ReconnectConfig,
}

impl Default for FeedClientConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_FEED_URL.to_string(),
            credentials: None,
            connect_timeout: Duration::from_secs(10),
            login_ack_timeout: Duration::from_secs(10),
            lenient_login_ack: false,
            idle_timeout: Duration::from_secs(30),
            reconnect: ReconnectConfig::default(),
        }
    }
}

// =============================================================================
// Connection State
// =============================================================================

/// Upstream connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamConnectionState {
    /// No transport.
    #[default]
    Disconnected,
    /// Opening the transport.
    Connecting,
    /// Login sent, waiting for the acknowledgement.
    Authenticating,
    /// Authenticated and usable.
    Connected,
}

impl UpstreamConnectionState {
    /// Lowercase label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Authenticating => "authenticating",
            Self::Connected => "connected",
        }
    }
}

/// Point-in-time view of the client.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedStatusSnapshot {
    /// Connection state.
    pub state: UpstreamConnectionState,
    /// Attempts in the current outage (0 while connected).
    pub reconnect_attempts: u32,
    /// Whether the receive loop is running.
    pub running: bool,
    /// Text frames received since start.
    pub messages_received: u64,
    /// Frames dropped as malformed.
    pub protocol_errors: u64,
    /// Last successful login.
    pub last_connected_at: Option<DateTime<Utc>>,
    /// Most recent failure, cleared on connect.
    pub last_error: Option<String>,
    /// Identifier of the current connection, for log correlation.
    pub connection_id: Option<Uuid>,
}

#[derive(Debug, Default)]
struct FeedStatus {
    state: parking_lot::RwLock<UpstreamConnectionState>,
    reconnect_attempts: AtomicU32,
    messages_received: AtomicU64,
    protocol_errors: AtomicU64,
    last_connected_at: parking_lot::RwLock<Option<DateTime<Utc>>>,
    last_error: parking_lot::RwLock<Option<String>>,
    connection_id: parking_lot::RwLock<Option<Uuid>>,
}

impl FeedStatus {
    fn set_state(&self, state: UpstreamConnectionState) {
        *self.state.write() = state;
        match state {
            UpstreamConnectionState::Connected => {
                *self.last_connected_at.write() = Some(Utc::now());
                *self.last_error.write() = None;
                *self.connection_id.write() = Some(Uuid::new_v4());
                self.reconnect_attempts.store(0, Ordering::Relaxed);
            }
            UpstreamConnectionState::Disconnected => {
                *self.connection_id.write() = None;
            }
            UpstreamConnectionState::Connecting | UpstreamConnectionState::Authenticating => {}
        }
    }

    fn state(&self) -> UpstreamConnectionState {
        *self.state.read()
    }

    fn set_error(&self, message: String) {
        *self.last_error.write() = Some(message);
    }

    fn snapshot(&self, running: bool) -> FeedStatusSnapshot {
        FeedStatusSnapshot {
            state: self.state(),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
            running,
            messages_received: self.messages_received.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            last_connected_at: *self.last_connected_at.read(),
            last_error: self.last_error.read().clone(),
            connection_id: *self.connection_id.read(),
        }
    }
}

enum DrainOutcome {
    Cancelled,
    Dropped(String),
}

// =============================================================================
// Feed Client
// =============================================================================

/// Client for the upstream market-data feed.
pub struct FeedClient {
    config: FeedClientConfig,
    connector: Arc<dyn FeedConnector>,
    codec: FrameCodec,
    cache: SharedCache,
    listeners: parking_lot::RwLock<Vec<SharedListener>>,
    status: FeedStatus,
    running: AtomicBool,
    subscriptions: parking_lot::RwLock<BTreeSet<Symbol>>,
    sink: tokio::sync::Mutex<Option<Box<dyn FeedSink>>>,
    source: tokio::sync::Mutex<Option<Box<dyn FeedSource>>>,
    connect_lock: tokio::sync::Mutex<()>,
    shutdown: CancellationToken,
    run_token: parking_lot::Mutex<CancellationToken>,
}

impl std::fmt::Debug for FeedClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedClient")
            .field("url", &self.config.url)
            .field("state", &self.status.state())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl FeedClient {
    /// Create a disconnected client.
    ///
    /// `shutdown` is the process-wide token; every receive loop runs under a
    /// child of it.
    #[must_use]
    pub fn new(
        config: FeedClientConfig,
        connector: Arc<dyn FeedConnector>,
        cache: SharedCache,
        shutdown: CancellationToken,
    ) -> Self {
        let run_token = shutdown.child_token();
        Self {
            config,
            connector,
            codec: FrameCodec::new(),
            cache,
            listeners: parking_lot::RwLock::new(Vec::new()),
            status: FeedStatus::default(),
            running: AtomicBool::new(false),
            subscriptions: parking_lot::RwLock::new(BTreeSet::new()),
            sink: tokio::sync::Mutex::new(None),
            source: tokio::sync::Mutex::new(None),
            connect_lock: tokio::sync::Mutex::new(()),
            shutdown,
            run_token: parking_lot::Mutex::new(run_token),
        }
    }

    /// Register a listener. Listeners run in registration order.
    pub fn add_listener(&self, listener: SharedListener) {
        self.listeners.write().push(listener);
    }

    /// Whether an API key is configured.
    #[must_use]
    pub const fn has_credentials(&self) -> bool {
        self.config.credentials.is_some()
    }

    /// Whether the connection is authenticated.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.status.state() == UpstreamConnectionState::Connected
    }

    /// Whether the receive loop is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Current connection state.
    #[must_use]
    pub fn connection_state(&self) -> UpstreamConnectionState {
        self.status.state()
    }

    /// Sorted snapshot of the upstream subscription set.
    #[must_use]
    pub fn subscribed_symbols(&self) -> Vec<Symbol> {
        self.subscriptions.read().iter().cloned().collect()
    }

    /// Status snapshot.
    #[must_use]
    pub fn status(&self) -> FeedStatusSnapshot {
        self.status.snapshot(self.is_running())
    }

    // -------------------------------------------------------------------------
    // Connect
    // -------------------------------------------------------------------------

    /// Open the transport and log in. A no-op when already connected.
    ///
    /// # Errors
    ///
    /// - [`FeedError::Configuration`] when no API key is configured
    /// - [`FeedError::Transport`] when the connection cannot be opened
    /// - [`FeedError::Authentication`] on rejection or ack timeout
    pub async fn connect(&self) -> Result<(), FeedError> {
        let _guard = self.connect_lock.lock().await;
        if self.is_connected() {
            return Ok(());
        }

        let Some(credentials) = self.config.credentials.clone() else {
            let error = FeedError::Configuration("FEED_API_KEY is not set".to_string());
            self.status.set_error(error.to_string());
            return Err(error);
        };

        match self.open(credentials).await {
            Ok(FeedConnection { sink, source }) => {
                *self.sink.lock().await = Some(sink);
                *self.source.lock().await = Some(source);
                self.status.set_state(UpstreamConnectionState::Connected);
                metrics::set_upstream_connected(true);
                tracing::info!(
                    url = %self.config.url,
                    connection_id = ?self.status.snapshot(false).connection_id,
                    "Connected to upstream feed"
                );
                Ok(())
            }
            Err(error) => {
                self.status.set_state(UpstreamConnectionState::Disconnected);
                self.status.set_error(error.to_string());
                Err(error)
            }
        }
    }

    async fn open(&self, credentials: Credentials) -> Result<FeedConnection, FeedError> {
        self.status.set_state(UpstreamConnectionState::Connecting);
        tracing::info!(url = %self.config.url, "Connecting to upstream feed");

        let mut connection = tokio::time::timeout(
            self.config.connect_timeout,
            self.connector.connect(&self.config.url),
        )
        .await
        .map_err(|_| TransportError::ConnectTimeout(self.config.connect_timeout))??;

        self.status.set_state(UpstreamConnectionState::Authenticating);
        let mut auth = AuthHandler::new(credentials);
        let login = self.codec.encode(&auth.create_login_request())?;

        let result = match connection.sink.send_text(login).await {
            Ok(()) => self.await_login_ack(&mut auth, &mut connection).await,
            Err(e) => Err(e.into()),
        };

        if let Err(error) = result {
            tracing::warn!(error = %error, "Upstream login failed");
            let _ = connection.sink.close().await;
            return Err(error);
        }
        Ok(connection)
    }

    async fn await_login_ack(
        &self,
        auth: &mut AuthHandler,
        connection: &mut FeedConnection,
    ) -> Result<(), FeedError> {
        let waited = self.config.login_ack_timeout;
        let deadline = tokio::time::Instant::now() + waited;

        loop {
            let next =
                match tokio::time::timeout_at(deadline, connection.source.next_frame()).await {
                    Ok(next) => next,
                    Err(_) => {
                        return auth
                            .on_timeout(waited, self.config.lenient_login_ack)
                            .map_err(Into::into);
                    }
                };

            match next {
                None | Some(Ok(FeedFrame::Close(_))) => return Err(TransportError::Closed.into()),
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(FeedFrame::Ping(payload))) => connection.sink.send_pong(payload).await?,
                Some(Ok(FeedFrame::Text(text))) => match self.codec.decode(&text) {
                    Ok(UpstreamFrame::LoginAck(ack)) => {
                        metrics::record_upstream_message(UpstreamKind::LoginAck);
                        auth.on_ack(&ack)?;
                        tracing::info!(message = ?ack.message, "Upstream login acknowledged");
                        return Ok(());
                    }
                    Ok(_) => tracing::debug!("Ignoring frame received before login ack"),
                    Err(e) => self.protocol_error(&e),
                },
                Some(Ok(FeedFrame::Binary(_) | FeedFrame::Pong(_))) => {}
            }
        }
    }

    // -------------------------------------------------------------------------
    // Subscriptions
    // -------------------------------------------------------------------------

    /// Subscribe upstream. Returns the normalized symbols that were sent.
    ///
    /// # Errors
    ///
    /// [`FeedError::NotConnected`] when not authenticated; transport errors
    /// if the frame cannot be written.
    pub async fn subscribe<S: AsRef<str> + Sync>(
        &self,
        symbols: &[S],
    ) -> Result<Vec<Symbol>, FeedError> {
        if !self.is_connected() {
            return Err(FeedError::NotConnected);
        }
        let symbols = normalize_symbols(symbols);
        if symbols.is_empty() {
            return Ok(symbols);
        }

        let frame = self.codec.encode(&SubscriptionRequest::subscribe(&symbols))?;
        self.send_text(frame).await?;

        let total = {
            let mut set = self.subscriptions.write();
            set.extend(symbols.iter().cloned());
            set.len()
        };
        metrics::set_subscribed_symbols(total);
        tracing::info!(count = symbols.len(), total, "Subscribed upstream");
        Ok(symbols)
    }

    /// Unsubscribe upstream. Returns the normalized symbols that were sent.
    ///
    /// # Errors
    ///
    /// Same as [`FeedClient::subscribe`].
    pub async fn unsubscribe<S: AsRef<str> + Sync>(
        &self,
        symbols: &[S],
    ) -> Result<Vec<Symbol>, FeedError> {
        if !self.is_connected() {
            return Err(FeedError::NotConnected);
        }
        let symbols = normalize_symbols(symbols);
        if symbols.is_empty() {
            return Ok(symbols);
        }

        let frame = self.codec.encode(&SubscriptionRequest::unsubscribe(&symbols))?;
        self.send_text(frame).await?;

        let total = {
            let mut set = self.subscriptions.write();
            for symbol in &symbols {
                set.remove(symbol);
            }
            set.len()
        };
        metrics::set_subscribed_symbols(total);
        tracing::info!(count = symbols.len(), total, "Unsubscribed upstream");
        Ok(symbols)
    }

    async fn restore_subscriptions(&self) -> Result<(), FeedError> {
        let symbols = self.subscribed_symbols();
        if symbols.is_empty() {
            return Ok(());
        }
        let frame = self.codec.encode(&SubscriptionRequest::subscribe(&symbols))?;
        self.send_text(frame).await?;
        tracing::info!(count = symbols.len(), "Restored upstream subscriptions");
        Ok(())
    }

    async fn send_text(&self, text: String) -> Result<(), FeedError> {
        let mut sink = self.sink.lock().await;
        let sink = sink.as_mut().ok_or(FeedError::NotConnected)?;
        sink.send_text(text).await.map_err(Into::into)
    }

    // -------------------------------------------------------------------------
    // Receive Loop
    // -------------------------------------------------------------------------

    /// Spawn the receive loop. Returns `None` if one is already running.
    pub fn start_receiving(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if self.running.swap(true, Ordering::SeqCst) {
            return None;
        }

        let token = self.shutdown.child_token();
        *self.run_token.lock() = token.clone();

        let client = Arc::clone(self);
        Some(tokio::spawn(async move { client.receive_loop(token).await }))
    }

    async fn receive_loop(&self, token: CancellationToken) {
        tracing::info!("Upstream receive loop started");

        while self.is_running() && !token.is_cancelled() {
            let source = self.source.lock().await.take();
            let Some(mut source) = source else {
                if self.reconnect(&token).await {
                    continue;
                }
                break;
            };

            match self.drain(source.as_mut(), &token).await {
                DrainOutcome::Cancelled => break,
                DrainOutcome::Dropped(reason) => {
                    drop(source);
                    self.mark_dropped(&reason).await;
                    if !self.reconnect(&token).await {
                        break;
                    }
                }
            }
        }

        tracing::info!("Upstream receive loop stopped");
    }

    async fn drain(&self, source: &mut dyn FeedSource, token: &CancellationToken) -> DrainOutcome {
        loop {
            if !self.is_running() {
                return DrainOutcome::Cancelled;
            }

            let next = tokio::select! {
                () = token.cancelled() => return DrainOutcome::Cancelled,
                next = tokio::time::timeout(self.config.idle_timeout, source.next_frame()) => next,
            };

            let frame = match next {
                Err(_) => {
                    tracing::debug!(
                        idle_secs = self.config.idle_timeout.as_secs(),
                        "No upstream traffic within idle timeout"
                    );
                    continue;
                }
                Ok(None) => return DrainOutcome::Dropped("stream ended".to_string()),
                Ok(Some(Err(e))) => return DrainOutcome::Dropped(e.to_string()),
                Ok(Some(Ok(frame))) => frame,
            };

            match frame {
                FeedFrame::Text(text) => self.handle_text(&text),
                FeedFrame::Binary(bytes) => match String::from_utf8(bytes) {
                    Ok(text) => self.handle_text(&text),
                    Err(_) => self.protocol_error(&CodecError::InvalidFormat(
                        "binary frame is not UTF-8".to_string(),
                    )),
                },
                FeedFrame::Ping(payload) => {
                    let mut sink = self.sink.lock().await;
                    if let Some(sink) = sink.as_mut() {
                        if let Err(e) = sink.send_pong(payload).await {
                            return DrainOutcome::Dropped(e.to_string());
                        }
                    }
                }
                FeedFrame::Pong(_) => {}
                FeedFrame::Close(reason) => {
                    return DrainOutcome::Dropped(
                        reason.unwrap_or_else(|| "closed by peer".to_string()),
                    );
                }
            }
        }
    }

    fn handle_text(&self, text: &str) {
        self.status.messages_received.fetch_add(1, Ordering::Relaxed);

        match self.codec.decode(text) {
            Ok(UpstreamFrame::Data(frame)) => self.ingest(frame),
            Ok(UpstreamFrame::Batch(items)) => {
                for item in items {
                    match item {
                        Ok(frame) => self.ingest(frame),
                        Err(e) => self.protocol_error(&e),
                    }
                }
            }
            Ok(UpstreamFrame::LoginAck(ack)) => {
                metrics::record_upstream_message(UpstreamKind::LoginAck);
                tracing::debug!(status = ?ack.status, "Ignoring late login acknowledgement");
            }
            Ok(UpstreamFrame::ControlEvent(event)) => {
                metrics::record_upstream_message(UpstreamKind::Control);
                tracing::debug!(
                    event = %event.event,
                    status = ?event.status,
                    message = ?event.message,
                    "Upstream control event"
                );
            }
            Err(e) => self.protocol_error(&e),
        }
    }

    fn ingest(&self, frame: DataFrame) {
        let record = match frame.into_record(Utc::now()) {
            Ok(record) => Arc::new(record),
            Err(e) => {
                self.protocol_error(&e);
                return;
            }
        };

        metrics::record_upstream_message(UpstreamKind::Record(record.kind));
        self.cache.put(Arc::clone(&record));

        let listeners = self.listeners.read().clone();
        for listener in &listeners {
            listener.on_record(&record);
        }
    }

    fn protocol_error(&self, error: &CodecError) {
        self.status.protocol_errors.fetch_add(1, Ordering::Relaxed);
        metrics::record_protocol_error();
        tracing::warn!(error = %error, "Dropping malformed upstream frame");
    }

    // -------------------------------------------------------------------------
    // Reconnect / Disconnect
    // -------------------------------------------------------------------------

    async fn mark_dropped(&self, reason: &str) {
        tracing::warn!(reason, "Upstream connection lost");
        let sink = self.sink.lock().await.take();
        if let Some(mut sink) = sink {
            let _ = sink.close().await;
        }
        self.status.set_state(UpstreamConnectionState::Disconnected);
        self.status.set_error(reason.to_string());
        metrics::set_upstream_connected(false);
    }

    /// Backoff loop. Returns `true` once connected again.
    async fn reconnect(&self, token: &CancellationToken) -> bool {
        let mut policy = ReconnectPolicy::new(self.config.reconnect.clone());

        while let Some(delay) = policy.next_delay() {
            let attempt = policy.attempt_count();
            self.status.reconnect_attempts.store(attempt, Ordering::Relaxed);
            metrics::record_reconnect();
            tracing::info!(
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "Reconnecting to upstream feed"
            );

            tokio::select! {
                () = token.cancelled() => return false,
                () = tokio::time::sleep(delay) => {}
            }
            if !self.is_running() {
                return false;
            }

            let connected = tokio::select! {
                biased;
                () = token.cancelled() => return false,
                connected = self.connect() => connected,
            };

            match connected {
                Ok(()) => {
                    // A disconnect that raced this attempt cleans up after it.
                    if token.is_cancelled() {
                        return false;
                    }
                    if let Err(e) = self.restore_subscriptions().await {
                        tracing::warn!(error = %e, "Failed to restore upstream subscriptions");
                    }
                    return true;
                }
                Err(e) if e.is_fatal() => {
                    tracing::error!(error = %e, "Upstream reconnect aborted");
                    self.running.store(false, Ordering::SeqCst);
                    return false;
                }
                Err(e) => tracing::warn!(attempt, error = %e, "Reconnect attempt failed"),
            }
        }

        tracing::error!(
            attempts = policy.attempt_count(),
            "Giving up on upstream feed until restarted"
        );
        self.running.store(false, Ordering::SeqCst);
        self.status
            .set_error(format!("gave up after {} reconnect attempts", policy.attempt_count()));
        false
    }

    /// Stop the receive loop and close the transport. Safe to call repeatedly.
    ///
    /// A connect attempt still in flight is allowed to finish or unwind
    /// first, so nothing it opened survives the call.
    pub async fn disconnect(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.run_token.lock().cancel();
        let _guard = self.connect_lock.lock().await;

        let sink = self.sink.lock().await.take();
        if let Some(mut sink) = sink {
            if let Err(e) = sink.close().await {
                tracing::debug!(error = %e, "Error closing upstream transport");
            }
        }
        self.source.lock().await.take();

        if self.status.state() != UpstreamConnectionState::Disconnected {
            tracing::info!("Disconnected from upstream feed");
        }
        self.status.set_state(UpstreamConnectionState::Disconnected);
        metrics::set_upstream_connected(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ports::MockRecordListener;
    use crate::domain::cache::LatestValueCache;

    struct Unreachable;

    #[async_trait::async_trait]
    impl FeedConnector for Unreachable {
        async fn connect(&self, _url: &str) -> Result<FeedConnection, TransportError> {
            Err(TransportError::Connect("unreachable".into()))
        }
    }

    fn client(cache: SharedCache) -> FeedClient {
        FeedClient::new(
            FeedClientConfig::default(),
            Arc::new(Unreachable),
            cache,
            CancellationToken::new(),
        )
    }

    #[test]
    fn ingest_caches_before_notifying_listeners_in_order() {
        let cache: SharedCache = Arc::new(LatestValueCache::new());
        let client = client(Arc::clone(&cache));
        let mut seq = mockall::Sequence::new();

        let mut first = MockRecordListener::new();
        let seen = Arc::clone(&cache);
        first
            .expect_on_record()
            .withf(move |record| {
                record.symbol.as_str() == "AAPL" && seen.get(&record.symbol).is_some()
            })
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());
        let mut second = MockRecordListener::new();
        second
            .expect_on_record()
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());
        client.add_listener(Arc::new(first));
        client.add_listener(Arc::new(second));

        client.handle_text(r#"{"s":"aapl","t":1700000000000,"type":"T","lp":185.25,"ls":100}"#);

        let status = client.status();
        assert_eq!(status.messages_received, 1);
        assert_eq!(status.protocol_errors, 0);
    }

    #[test]
    fn bad_batch_element_is_counted_and_skipped() {
        let cache: SharedCache = Arc::new(LatestValueCache::new());
        let client = client(Arc::clone(&cache));

        client.handle_text(r#"[{"s":"MSFT","type":"Q","bp":1,"bs":2,"ap":3,"as":4},{"x":1},{"s":"IBM","type":"Z"}]"#);

        assert_eq!(client.status().protocol_errors, 2);
        assert_eq!(cache.len(), 1);
        assert!(cache.get(&Symbol::parse("msft").unwrap()).is_some());
    }

    #[test]
    fn fractional_event_time_is_carried_through() {
        let cache: SharedCache = Arc::new(LatestValueCache::new());
        let client = client(Arc::clone(&cache));

        client.handle_text(r#"{"s":"AAPL","t":1700000000000.25,"type":"T","lp":185.25,"ls":1}"#);

        assert_eq!(client.status().protocol_errors, 0);
        let record = cache.get(&Symbol::parse("AAPL").unwrap()).unwrap();
        assert!(matches!(
            record.event_timestamp,
            Some(crate::domain::market::EventTimestamp::Number(_))
        ));
    }

    #[test]
    fn garbage_text_is_a_protocol_error() {
        let client = client(Arc::new(LatestValueCache::new()));
        client.handle_text("hello");
        client.handle_text(r#"{"foo":"bar"}"#);
        assert_eq!(client.status().protocol_errors, 2);
        assert_eq!(client.status().messages_received, 2);
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let client = client(Arc::new(LatestValueCache::new()));
        client.disconnect().await;
        client.disconnect().await;
        assert_eq!(client.connection_state(), UpstreamConnectionState::Disconnected);
        assert!(!client.is_running());
    }

    #[test]
    fn configuration_errors_are_fatal() {
        assert!(FeedError::Configuration("missing".into()).is_fatal());
        assert!(FeedError::Authentication(AuthError::MissingCredential).is_fatal());
        assert!(!FeedError::Transport(TransportError::Closed).is_fatal());
        assert!(!FeedError::Authentication(AuthError::Rejected("no".into())).is_fatal());
        assert!(!FeedError::NotConnected.is_fatal());
    }

    #[test]
    fn connected_state_resets_attempts_and_error() {
        let status = FeedStatus::default();
        status.reconnect_attempts.store(3, Ordering::Relaxed);
        status.set_error("boom".to_string());

        status.set_state(UpstreamConnectionState::Connected);

        let snapshot = status.snapshot(true);
        assert_eq!(snapshot.reconnect_attempts, 0);
        assert!(snapshot.last_error.is_none());
        assert!(snapshot.last_connected_at.is_some());
        assert!(snapshot.connection_id.is_some());

        status.set_state(UpstreamConnectionState::Disconnected);
        assert!(status.snapshot(false).connection_id.is_none());
    }

    #[test]
    fn state_labels() {
        assert_eq!(UpstreamConnectionState::Authenticating.as_str(), "authenticating");
        assert_eq!(
            serde_json::to_string(&UpstreamConnectionState::Connected).unwrap(),
            "\"connected\""
        );
    }
}
