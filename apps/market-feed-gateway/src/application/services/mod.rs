//! Application Services
//!
//! The [`Gateway`] owns every long-lived component and is the single entry
//! point for the control plane and the session sockets.
//!
//! ```text
//! FeedClient ──▶ LatestValueCache
//!     │
//!     └──▶ DispatchHub ──▶ Session mailboxes ──▶ session writer tasks
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::application::ports::FeedConnector;
use crate::domain::cache::{LatestValueCache, SharedCache};
use crate::domain::market::{Symbol, normalize_symbols};
use crate::domain::session::{
    OverflowPolicy, ServerMessage, Session, SessionCommand, SessionId, SessionRegistry,
    SubscriptionAction,
};
use crate::infrastructure::dispatch::{DispatchHub, SharedDispatchHub};
use crate::infrastructure::feed::{
    FeedClient, FeedClientConfig, FeedError, UpstreamConnectionState,
};
use crate::infrastructure::metrics;

/// Bound on waiting for the receive loop to exit during shutdown.
const RECEIVE_LOOP_STOP_TIMEOUT: Duration = Duration::from_secs(5);

// =============================================================================
// Settings
// =============================================================================

/// Gateway-level settings.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    /// Maximum symbols in one subscribe request.
    pub max_symbols_per_request: usize,
    /// Outbound mailbox capacity per session.
    pub session_capacity: usize,
    /// Mailbox overflow policy.
    pub overflow: OverflowPolicy,
    /// Bound on writing one frame to a session socket.
    pub write_timeout: Duration,
    /// Connect upstream during [`Gateway::start`].
    pub auto_connect: bool,
    /// Symbols subscribed during [`Gateway::start`].
    pub initial_symbols: Vec<String>,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            max_symbols_per_request: 50,
            session_capacity: 256,
            overflow: OverflowPolicy::DropNewest,
            write_timeout: Duration::from_secs(10),
            auto_connect: true,
            initial_symbols: Vec::new(),
        }
    }
}

/// Gateway status, as reported by `GET /status`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayStatus {
    /// Upstream authenticated.
    pub upstream_connected: bool,
    /// Receive loop running.
    pub running: bool,
    /// Upstream connection state.
    pub connection_state: UpstreamConnectionState,
    /// Attempts in the current outage.
    pub reconnect_attempts: u32,
    /// Upstream text frames received.
    pub messages_received: u64,
    /// Upstream frames dropped as malformed.
    pub protocol_errors: u64,
    /// Last successful upstream login.
    pub last_connected_at: Option<DateTime<Utc>>,
    /// Last upstream failure.
    pub last_error: Option<String>,
    /// Upstream subscription set, sorted.
    pub subscribed_symbols: Vec<Symbol>,
    /// Registered downstream sessions.
    pub active_session_count: usize,
    /// Symbols with a cached record.
    pub cached_symbol_count: usize,
}

// =============================================================================
// Gateway
// =============================================================================

/// Owns the feed client, cache, session registry and dispatch hub.
#[derive(Debug)]
pub struct Gateway {
    settings: GatewaySettings,
    cache: SharedCache,
    registry: Arc<SessionRegistry>,
    hub: SharedDispatchHub,
    feed: Arc<FeedClient>,
    shutdown: CancellationToken,
    receive_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Gateway {
    /// Build every component and register the dispatch hub as the first
    /// feed listener.
    #[must_use]
    pub fn new(
        feed_config: FeedClientConfig,
        settings: GatewaySettings,
        connector: Arc<dyn FeedConnector>,
        shutdown: CancellationToken,
    ) -> Self {
        let cache: SharedCache = Arc::new(LatestValueCache::new());
        let registry = Arc::new(SessionRegistry::new());
        let hub = Arc::new(DispatchHub::new(Arc::clone(&registry)));
        let feed = Arc::new(FeedClient::new(
            feed_config,
            connector,
            Arc::clone(&cache),
            shutdown.clone(),
        ));
        feed.add_listener(hub.clone());

        Self {
            settings,
            cache,
            registry,
            hub,
            feed,
            shutdown,
            receive_task: parking_lot::Mutex::new(None),
        }
    }

    /// Connect upstream, subscribe the initial symbols and start receiving.
    ///
    /// Does nothing when auto-connect is off or no API key is configured; the
    /// first subscribe request will connect instead.
    ///
    /// # Errors
    ///
    /// Returns the connect or subscribe failure.
    pub async fn start(&self) -> Result<(), FeedError> {
        if !self.settings.auto_connect {
            tracing::info!("Upstream auto-connect disabled");
            return Ok(());
        }
        if !self.feed.has_credentials() {
            tracing::warn!("FEED_API_KEY not set, upstream feed stays disconnected");
            return Ok(());
        }

        self.feed.connect().await?;
        if !self.settings.initial_symbols.is_empty() {
            self.feed.subscribe(&self.settings.initial_symbols).await?;
        }
        self.start_receiving();
        Ok(())
    }

    /// Connect upstream if needed and make sure the receive loop runs.
    ///
    /// # Errors
    ///
    /// Returns the connect failure.
    pub async fn ensure_upstream(&self) -> Result<(), FeedError> {
        if !self.feed.is_connected() {
            self.feed.connect().await?;
        }
        self.start_receiving();
        Ok(())
    }

    fn start_receiving(&self) {
        if let Some(handle) = self.feed.start_receiving() {
            if let Some(previous) = self.receive_task.lock().replace(handle) {
                previous.abort();
            }
        }
    }

    /// Subscribe upstream, connecting first if needed.
    ///
    /// # Errors
    ///
    /// Connect or send failures.
    pub async fn subscribe_upstream<S: AsRef<str> + Sync>(
        &self,
        symbols: &[S],
    ) -> Result<Vec<Symbol>, FeedError> {
        self.ensure_upstream().await?;
        self.feed.subscribe(symbols).await
    }

    /// Unsubscribe upstream.
    ///
    /// # Errors
    ///
    /// [`FeedError::NotConnected`] when upstream is down.
    pub async fn unsubscribe_upstream<S: AsRef<str> + Sync>(
        &self,
        symbols: &[S],
    ) -> Result<Vec<Symbol>, FeedError> {
        self.feed.unsubscribe(symbols).await
    }

    // -------------------------------------------------------------------------
    // Sessions
    // -------------------------------------------------------------------------

    /// Register a new downstream session and queue its greeting.
    ///
    /// The returned receiver belongs to the session's writer task.
    #[must_use]
    pub fn open_session(&self) -> (Arc<Session>, mpsc::Receiver<ServerMessage>) {
        let (session, outbox) =
            Session::channel(self.settings.session_capacity, self.settings.overflow);
        let session = self.registry.register(session);
        metrics::set_sessions_active(self.registry.len());

        if let Err(e) = session.push(ServerMessage::connected(session.id().as_u64())) {
            tracing::warn!(session = %session.id(), error = %e, "Failed to queue greeting");
        }
        tracing::info!(session = %session.id(), sessions = self.registry.len(), "Session opened");
        (session, outbox)
    }

    /// Unregister a session. Safe to call more than once.
    pub fn close_session(&self, id: SessionId) {
        if let Some(session) = self.registry.unregister(id) {
            metrics::set_sessions_active(self.registry.len());
            tracing::info!(
                session = %id,
                dropped_frames = session.dropped_frames(),
                sessions = self.registry.len(),
                "Session closed"
            );
        }
    }

    /// Apply one session command and build the reply.
    ///
    /// Subscribing also subscribes upstream; an upstream failure is logged
    /// and does not fail the command. Unsubscribing only narrows the
    /// session's own filter.
    pub async fn handle_command(&self, session: &Session, command: SessionCommand) -> ServerMessage {
        match command {
            SessionCommand::Subscribe { symbols } => self.session_subscribe(session, &symbols).await,
            SessionCommand::Unsubscribe { symbols } => self.session_unsubscribe(session, &symbols),
            SessionCommand::Ping => ServerMessage::Pong,
            SessionCommand::GetSubscriptions => ServerMessage::Subscriptions {
                symbols: session.subscriptions(),
            },
        }
    }

    async fn session_subscribe(&self, session: &Session, raw: &[String]) -> ServerMessage {
        if raw.len() > self.settings.max_symbols_per_request {
            return ServerMessage::error(format!(
                "at most {} symbols per request",
                self.settings.max_symbols_per_request
            ));
        }
        let symbols = normalize_symbols(raw);
        if symbols.is_empty() {
            return ServerMessage::error("symbols must not be empty");
        }

        let total = match self.registry.add_subscriptions(session.id(), &symbols) {
            Ok(total) => total,
            Err(e) => return ServerMessage::error(e.to_string()),
        };

        let upstream = self.feed.subscribed_symbols();
        let fresh: Vec<&Symbol> = symbols.iter().filter(|s| !upstream.contains(s)).collect();
        if !fresh.is_empty() {
            if let Err(e) = self.subscribe_upstream(&fresh).await {
                tracing::warn!(
                    session = %session.id(),
                    error = %e,
                    "Upstream subscribe failed for session request"
                );
            }
        }

        ServerMessage::Subscription {
            action: SubscriptionAction::Subscribed,
            symbols,
            subscribed_total: total,
        }
    }

    fn session_unsubscribe(&self, session: &Session, raw: &[String]) -> ServerMessage {
        let symbols = normalize_symbols(raw);
        if symbols.is_empty() {
            return ServerMessage::error("symbols must not be empty");
        }

        match self.registry.remove_subscriptions(session.id(), &symbols) {
            Ok(total) => ServerMessage::Subscription {
                action: SubscriptionAction::Unsubscribed,
                symbols,
                subscribed_total: total,
            },
            Err(e) => ServerMessage::error(e.to_string()),
        }
    }

    // -------------------------------------------------------------------------
    // Status / Shutdown
    // -------------------------------------------------------------------------

    /// Point-in-time status.
    #[must_use]
    pub fn status(&self) -> GatewayStatus {
        let feed = self.feed.status();
        GatewayStatus {
            upstream_connected: feed.state == UpstreamConnectionState::Connected,
            running: feed.running,
            connection_state: feed.state,
            reconnect_attempts: feed.reconnect_attempts,
            messages_received: feed.messages_received,
            protocol_errors: feed.protocol_errors,
            last_connected_at: feed.last_connected_at,
            last_error: feed.last_error,
            subscribed_symbols: self.feed.subscribed_symbols(),
            active_session_count: self.registry.len(),
            cached_symbol_count: self.cache.len(),
        }
    }

    /// Stop the feed and close every session.
    pub async fn shutdown(&self) {
        tracing::info!("Gateway shutting down");
        self.shutdown.cancel();
        self.feed.disconnect().await;

        let closed = self.registry.close_all();
        metrics::set_sessions_active(0);

        let task = self.receive_task.lock().take();
        if let Some(task) = task {
            if tokio::time::timeout(RECEIVE_LOOP_STOP_TIMEOUT, task)
                .await
                .is_err()
            {
                tracing::warn!("Receive loop did not stop in time");
            }
        }
        tracing::info!(closed_sessions = closed, "Gateway stopped");
    }

    /// Root cancellation token.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Upstream feed client.
    #[must_use]
    pub const fn feed(&self) -> &Arc<FeedClient> {
        &self.feed
    }

    /// Latest-value cache.
    #[must_use]
    pub const fn cache(&self) -> &SharedCache {
        &self.cache
    }

    /// Session registry.
    #[must_use]
    pub const fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Dispatch hub.
    #[must_use]
    pub const fn hub(&self) -> &SharedDispatchHub {
        &self.hub
    }

    /// Settings in effect.
    #[must_use]
    pub const fn settings(&self) -> &GatewaySettings {
        &self.settings
    }
}
