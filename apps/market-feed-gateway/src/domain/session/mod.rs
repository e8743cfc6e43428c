//! Downstream Session Management
//!
//! Tracks connected downstream sessions and the symbols each one wants.
//!
//! # Design
//!
//! - Each [`Session`] owns its subscription filter behind its own lock and a
//!   bounded outbound mailbox. A single writer task drains the mailbox, so
//!   frames from the command loop and from fan-out never interleave.
//! - The [`SessionRegistry`] is a sharded map of `Arc<Session>`. Fan-out
//!   iterates over a [`SessionRegistry::snapshot`], which stays valid while
//!   sessions are registered or removed concurrently.
//! - Session filters are independent of the upstream subscription set;
//!   nothing here ever shrinks what is subscribed upstream.
//!
//! # State Machine
//!
//! ```text
//! Connecting ──register──► Active ──close/overflow──► Closing ──unregister──► Closed
//! ```

mod protocol;

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

pub use protocol::{PriceUpdate, ServerMessage, SessionCommand, SubscriptionAction};

use crate::domain::market::Symbol;

// =============================================================================
// Identifiers and State
// =============================================================================

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    /// Allocate the next identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// Transport accepted, not yet registered.
    #[default]
    Connecting,
    /// Registered and eligible for fan-out.
    Active,
    /// Close requested; waiting for unregister.
    Closing,
    /// Terminal.
    Closed,
}

impl SessionState {
    /// Lowercase name for logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Active => "active",
            Self::Closing => "closing",
            Self::Closed => "closed",
        }
    }
}

/// What to do when a session's mailbox is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Drop the frame being pushed; the session stays open.
    #[default]
    DropNewest,
    /// Close the session.
    Disconnect,
}

impl OverflowPolicy {
    /// Parse a policy name, falling back to [`OverflowPolicy::DropNewest`].
    #[must_use]
    pub fn from_str_case_insensitive(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "disconnect" => Self::Disconnect,
            _ => Self::DropNewest,
        }
    }

    /// Configuration name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::DropNewest => "drop_newest",
            Self::Disconnect => "disconnect",
        }
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Failures delivering to, or looking up, a session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// Mailbox full; the frame was dropped.
    #[error("{0} mailbox is full, frame dropped")]
    MailboxFull(SessionId),

    /// Mailbox full under the disconnect policy; the session is closing.
    #[error("{0} mailbox overflowed, session closing")]
    Overflowed(SessionId),

    /// The writer side is gone.
    #[error("{0} is closed")]
    Closed(SessionId),

    /// No such session in the registry.
    #[error("{0} is not registered")]
    UnknownSession(SessionId),
}

impl SessionError {
    /// Short label for metrics.
    #[must_use]
    pub const fn reason(&self) -> &'static str {
        match self {
            Self::MailboxFull(_) => "mailbox_full",
            Self::Overflowed(_) => "overflow_disconnect",
            Self::Closed(_) => "closed",
            Self::UnknownSession(_) => "unknown_session",
        }
    }
}

// =============================================================================
// Session
// =============================================================================

/// One downstream consumer.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    state: RwLock<SessionState>,
    subscriptions: RwLock<HashSet<Symbol>>,
    outbox: mpsc::Sender<ServerMessage>,
    overflow: OverflowPolicy,
    closing: CancellationToken,
    dropped: AtomicU64,
}

impl Session {
    /// Create a session and the receiving end of its mailbox.
    ///
    /// The receiver belongs to the session's single writer task.
    #[must_use]
    pub fn channel(
        capacity: usize,
        overflow: OverflowPolicy,
    ) -> (Self, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let session = Self {
            id: SessionId::generate(),
            state: RwLock::new(SessionState::Connecting),
            subscriptions: RwLock::new(HashSet::new()),
            outbox: tx,
            overflow,
            closing: CancellationToken::new(),
            dropped: AtomicU64::new(0),
        };
        (session, rx)
    }

    /// Session identifier.
    #[must_use]
    pub const fn id(&self) -> SessionId {
        self.id
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    /// Whether fan-out should deliver to this session.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    /// Whether the filter contains `symbol`.
    #[must_use]
    pub fn is_subscribed(&self, symbol: &Symbol) -> bool {
        self.subscriptions.read().contains(symbol)
    }

    /// Sorted copy of the filter.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<Symbol> {
        let mut symbols: Vec<Symbol> = self.subscriptions.read().iter().cloned().collect();
        symbols.sort();
        symbols
    }

    /// Frames dropped because the mailbox was full.
    #[must_use]
    pub fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Overflow policy in effect.
    #[must_use]
    pub const fn overflow_policy(&self) -> OverflowPolicy {
        self.overflow
    }

    /// Token cancelled once the session starts closing.
    #[must_use]
    pub fn closing_token(&self) -> CancellationToken {
        self.closing.clone()
    }

    /// Push a frame without waiting.
    ///
    /// # Errors
    ///
    /// - [`SessionError::MailboxFull`] when the frame was dropped
    /// - [`SessionError::Overflowed`] when the disconnect policy closed the session
    /// - [`SessionError::Closed`] when the writer is gone
    pub fn push(&self, message: ServerMessage) -> Result<(), SessionError> {
        match self.outbox.try_send(message) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                match self.overflow {
                    OverflowPolicy::DropNewest => Err(SessionError::MailboxFull(self.id)),
                    OverflowPolicy::Disconnect => {
                        self.begin_close();
                        Err(SessionError::Overflowed(self.id))
                    }
                }
            }
            Err(TrySendError::Closed(_)) => Err(SessionError::Closed(self.id)),
        }
    }

    /// Queue a reply, waiting for mailbox space until the session closes.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Closed`] if the writer is gone or the session
    /// started closing while the reply was waiting.
    pub async fn reply(&self, message: ServerMessage) -> Result<(), SessionError> {
        tokio::select! {
            biased;
            () = self.closing.cancelled() => Err(SessionError::Closed(self.id)),
            sent = self.outbox.send(message) => sent.map_err(|_| SessionError::Closed(self.id)),
        }
    }

    /// Move to `Closing` and wake the session's loops.
    pub fn begin_close(&self) {
        {
            let mut state = self.state.write();
            if *state != SessionState::Closed {
                *state = SessionState::Closing;
            }
        }
        self.closing.cancel();
    }

    fn set_state(&self, state: SessionState) {
        *self.state.write() = state;
    }

    fn add(&self, symbols: &[Symbol]) -> usize {
        let mut set = self.subscriptions.write();
        set.extend(symbols.iter().cloned());
        set.len()
    }

    fn remove(&self, symbols: &[Symbol]) -> usize {
        let mut set = self.subscriptions.write();
        for symbol in symbols {
            set.remove(symbol);
        }
        set.len()
    }
}

// =============================================================================
// Registry
// =============================================================================

/// All live downstream sessions.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<Session>>,
}

impl SessionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session with an empty filter and mark it `Active`.
    pub fn register(&self, session: Session) -> Arc<Session> {
        session.subscriptions.write().clear();
        session.set_state(SessionState::Active);

        let session = Arc::new(session);
        self.sessions.insert(session.id(), Arc::clone(&session));
        tracing::debug!(session_id = %session.id(), sessions = self.sessions.len(), "Session registered");
        session
    }

    /// Remove a session and mark it `Closed`.
    ///
    /// Idempotent: a second call returns `None`. Fan-out snapshots taken
    /// earlier keep their `Arc` and simply see a closed session.
    pub fn unregister(&self, id: SessionId) -> Option<Arc<Session>> {
        let (_, session) = self.sessions.remove(&id)?;
        session.begin_close();
        session.set_state(SessionState::Closed);
        tracing::debug!(session_id = %id, sessions = self.sessions.len(), "Session unregistered");
        Some(session)
    }

    /// Add symbols to one session's filter.
    ///
    /// Returns the filter size afterwards.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::UnknownSession`] if `id` is not registered.
    pub fn add_subscriptions(&self, id: SessionId, symbols: &[Symbol]) -> Result<usize, SessionError> {
        self.sessions
            .get(&id)
            .map(|session| session.add(symbols))
            .ok_or(SessionError::UnknownSession(id))
    }

    /// Remove symbols from one session's filter.
    ///
    /// Returns the filter size afterwards.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::UnknownSession`] if `id` is not registered.
    pub fn remove_subscriptions(
        &self,
        id: SessionId,
        symbols: &[Symbol],
    ) -> Result<usize, SessionError> {
        self.sessions
            .get(&id)
            .map(|session| session.remove(symbols))
            .ok_or(SessionError::UnknownSession(id))
    }

    /// Sorted filter of one session.
    #[must_use]
    pub fn session_symbols(&self, id: SessionId) -> Option<Vec<Symbol>> {
        self.sessions.get(&id).map(|session| session.subscriptions())
    }

    /// Look up a session.
    #[must_use]
    pub fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// Stable copy of every registered session.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Number of registered sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no sessions are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Unregister every session. Used at shutdown.
    pub fn close_all(&self) -> usize {
        let ids: Vec<SessionId> = self.sessions.iter().map(|entry| *entry.key()).collect();
        ids.into_iter()
            .filter_map(|id| self.unregister(id))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::market::normalize_symbols;

    fn symbols(raw: &[&str]) -> Vec<Symbol> {
        normalize_symbols(raw)
    }

    #[test]
    fn session_ids_are_unique() {
        let a = SessionId::generate();
        let b = SessionId::generate();
        assert_ne!(a, b);
        assert!(b.as_u64() > a.as_u64());
    }

    #[test]
    fn register_activates_with_empty_filter() {
        let registry = SessionRegistry::new();
        let (session, _rx) = Session::channel(8, OverflowPolicy::DropNewest);
        assert_eq!(session.state(), SessionState::Connecting);

        let session = registry.register(session);
        assert_eq!(session.state(), SessionState::Active);
        assert!(session.subscriptions().is_empty());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn subscriptions_are_per_session() {
        let registry = SessionRegistry::new();
        let a = registry.register(Session::channel(8, OverflowPolicy::DropNewest).0);
        let b = registry.register(Session::channel(8, OverflowPolicy::DropNewest).0);

        assert_eq!(registry.add_subscriptions(a.id(), &symbols(&["AAPL"])), Ok(1));
        assert_eq!(
            registry.add_subscriptions(b.id(), &symbols(&["AAPL", "MSFT"])),
            Ok(2)
        );
        assert_eq!(registry.remove_subscriptions(b.id(), &symbols(&["AAPL"])), Ok(1));

        assert!(a.is_subscribed(&Symbol::parse("AAPL").unwrap()));
        assert!(!b.is_subscribed(&Symbol::parse("AAPL").unwrap()));
        assert_eq!(
            registry.session_symbols(b.id()).unwrap(),
            symbols(&["MSFT"])
        );
    }

    #[test]
    fn mutating_unknown_session_fails() {
        let registry = SessionRegistry::new();
        let id = SessionId::generate();
        assert_eq!(
            registry.add_subscriptions(id, &symbols(&["AAPL"])),
            Err(SessionError::UnknownSession(id))
        );
        assert!(registry.session_symbols(id).is_none());
    }

    #[test]
    fn unregister_is_idempotent() {
        let registry = SessionRegistry::new();
        let session = registry.register(Session::channel(8, OverflowPolicy::DropNewest).0);
        let id = session.id();

        assert!(registry.unregister(id).is_some());
        assert!(registry.unregister(id).is_none());
        assert_eq!(session.state(), SessionState::Closed);
        assert!(session.closing_token().is_cancelled());
        assert!(registry.is_empty());
    }

    #[test]
    fn snapshot_survives_concurrent_unregister() {
        let registry = SessionRegistry::new();
        let (session, mut rx) = Session::channel(8, OverflowPolicy::DropNewest);
        let session = registry.register(session);

        let snapshot = registry.snapshot();
        registry.unregister(session.id());

        assert_eq!(snapshot.len(), 1);
        assert!(!snapshot[0].is_active());
        assert!(snapshot[0].push(ServerMessage::Pong).is_ok());
        assert_eq!(rx.try_recv().unwrap(), ServerMessage::Pong);
    }

    #[test]
    fn drop_newest_keeps_session_open() {
        let (session, mut rx) = Session::channel(2, OverflowPolicy::DropNewest);
        assert!(session.push(ServerMessage::Pong).is_ok());
        assert!(session.push(ServerMessage::Pong).is_ok());

        let err = session.push(ServerMessage::error("late")).unwrap_err();
        assert_eq!(err, SessionError::MailboxFull(session.id()));
        assert_eq!(err.reason(), "mailbox_full");
        assert_eq!(session.dropped_frames(), 1);
        assert!(!session.closing_token().is_cancelled());

        assert_eq!(rx.try_recv().unwrap(), ServerMessage::Pong);
        assert_eq!(rx.try_recv().unwrap(), ServerMessage::Pong);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn disconnect_policy_closes_on_overflow() {
        let registry = SessionRegistry::new();
        let (session, _rx) = Session::channel(1, OverflowPolicy::Disconnect);
        let session = registry.register(session);

        assert!(session.push(ServerMessage::Pong).is_ok());
        let err = session.push(ServerMessage::Pong).unwrap_err();

        assert_eq!(err, SessionError::Overflowed(session.id()));
        assert_eq!(session.state(), SessionState::Closing);
        assert!(session.closing_token().is_cancelled());
    }

    #[tokio::test]
    async fn waiting_reply_gives_up_when_session_closes() {
        let (session, _rx) = Session::channel(1, OverflowPolicy::Disconnect);
        let session = Arc::new(session);
        session.reply(ServerMessage::Pong).await.unwrap();

        let waiting = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.reply(ServerMessage::Pong).await }
        });
        tokio::task::yield_now().await;
        assert!(!waiting.is_finished());

        assert_eq!(
            session.push(ServerMessage::Pong),
            Err(SessionError::Overflowed(session.id()))
        );
        assert_eq!(waiting.await.unwrap(), Err(SessionError::Closed(session.id())));
    }

    #[test]
    fn push_after_receiver_dropped_is_closed() {
        let (session, rx) = Session::channel(4, OverflowPolicy::DropNewest);
        drop(rx);
        assert_eq!(
            session.push(ServerMessage::Pong),
            Err(SessionError::Closed(session.id()))
        );
    }

    #[test]
    fn overflow_policy_parsing() {
        assert_eq!(
            OverflowPolicy::from_str_case_insensitive("DISCONNECT"),
            OverflowPolicy::Disconnect
        );
        assert_eq!(
            OverflowPolicy::from_str_case_insensitive("drop_newest"),
            OverflowPolicy::DropNewest
        );
        assert_eq!(
            OverflowPolicy::from_str_case_insensitive("whatever"),
            OverflowPolicy::DropNewest
        );
    }

    #[test]
    fn close_all_unregisters_everything() {
        let registry = SessionRegistry::new();
        for _ in 0..3 {
            registry.register(Session::channel(4, OverflowPolicy::DropNewest).0);
        }
        assert_eq!(registry.close_all(), 3);
        assert!(registry.is_empty());
    }

    #[test]
    fn thread_safety_concurrent_registration() {
        use std::thread;

        let registry = Arc::new(SessionRegistry::new());
        let handles: Vec<_> = (0..10)
            .map(|i| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    let session =
                        registry.register(Session::channel(4, OverflowPolicy::DropNewest).0);
                    let own = format!("SYM{i}");
                    registry
                        .add_subscriptions(session.id(), &symbols(&[own.as_str(), "SHARED"]))
                        .unwrap();
                    if i % 2 == 0 {
                        registry.unregister(session.id());
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(registry.len(), 5);
        let shared = Symbol::parse("SHARED").unwrap();
        assert!(registry.snapshot().iter().all(|s| s.is_subscribed(&shared)));
    }
}
