//! Upstream Login
//!
//! The provider expects a login frame right after the socket opens and
//! answers with an acknowledgement whose shape is not strictly documented.
//!
//! # Acceptance Rules
//!
//! An acknowledgement is accepted when any of these hold:
//!
//! - `status` is the number 200 or the text `success`
//! - `message` contains `authenticated` or `success` (case-insensitive)
//! - `event` is `login`
//!
//! A numeric status of 400 or above always rejects, even on a `login` echo.
//!
//! # Timeout
//!
//! Without an acknowledgement inside the ack window the attempt fails unless
//! lenient mode is on, in which case the connection is kept and a warning is
//! logged.

use std::time::Duration;

use thiserror::Error;

use super::messages::{AckStatus, LoginAck, LoginRequest};

// =============================================================================
// Error Types
// =============================================================================

/// Login failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// No API key configured. Fatal; never retried.
    #[error("no feed API key configured")]
    MissingCredential,

    /// The provider answered with a rejection.
    #[error("login rejected: {0}")]
    Rejected(String),

    /// No acknowledgement arrived in time.
    #[error("no login acknowledgement within {0:?}")]
    AckTimeout(Duration),
}

// =============================================================================
// Credentials
// =============================================================================

/// Provider API key. `Debug` never prints it.
#[derive(Clone)]
pub struct Credentials {
    api_key: String,
}

impl Credentials {
    /// Wrap an API key.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::MissingCredential`] for a blank key.
    pub fn new(api_key: impl Into<String>) -> Result<Self, AuthError> {
        let api_key = api_key.into().trim().to_string();
        if api_key.is_empty() {
            return Err(AuthError::MissingCredential);
        }
        Ok(Self { api_key })
    }

    /// The raw key.
    #[must_use]
    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    /// Login frame for this key.
    #[must_use]
    pub fn to_login_request(&self) -> LoginRequest {
        LoginRequest::new(self.api_key.clone())
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &"[REDACTED]")
            .finish()
    }
}

// =============================================================================
// Authentication Handler
// =============================================================================

/// Login progress for one connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthState {
    /// Nothing sent yet.
    #[default]
    Idle,
    /// Login sent, waiting for the ack.
    Pending,
    /// Ack accepted (or timed out in lenient mode).
    Authenticated,
    /// Rejected or timed out.
    Failed,
}

/// Tracks one login exchange.
#[derive(Debug)]
pub struct AuthHandler {
    credentials: Credentials,
    state: AuthState,
}

impl AuthHandler {
    /// Create a handler for a fresh connection.
    #[must_use]
    pub const fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            state: AuthState::Idle,
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> AuthState {
        self.state
    }

    /// Whether the exchange finished successfully.
    #[must_use]
    pub const fn is_authenticated(&self) -> bool {
        matches!(self.state, AuthState::Authenticated)
    }

    /// Build the login frame and move to `Pending`.
    #[must_use]
    pub fn create_login_request(&mut self) -> LoginRequest {
        self.state = AuthState::Pending;
        self.credentials.to_login_request()
    }

    /// Apply the acceptance rules to an acknowledgement.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Rejected`] when the ack does not qualify.
    pub fn on_ack(&mut self, ack: &LoginAck) -> Result<(), AuthError> {
        if is_accepted(ack) {
            self.state = AuthState::Authenticated;
            Ok(())
        } else {
            self.state = AuthState::Failed;
            Err(AuthError::Rejected(describe(ack)))
        }
    }

    /// Resolve a missing acknowledgement.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::AckTimeout`] unless `lenient` is set.
    pub fn on_timeout(&mut self, waited: Duration, lenient: bool) -> Result<(), AuthError> {
        if lenient {
            tracing::warn!(
                waited_ms = u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
                "No login acknowledgement received, continuing in lenient mode"
            );
            self.state = AuthState::Authenticated;
            Ok(())
        } else {
            self.state = AuthState::Failed;
            Err(AuthError::AckTimeout(waited))
        }
    }
}

fn is_accepted(ack: &LoginAck) -> bool {
    if let Some(AckStatus::Code(code)) = ack.status {
        if code >= 400 {
            return false;
        }
    }

    let status_ok = match &ack.status {
        Some(AckStatus::Code(code)) => *code == 200,
        Some(AckStatus::Text(text)) => text.eq_ignore_ascii_case("success"),
        None => false,
    };
    let message_ok = ack.message.as_deref().is_some_and(|m| {
        let lower = m.to_ascii_lowercase();
        lower.contains("authenticated") || lower.contains("success")
    });
    let event_ok = ack.event.as_deref() == Some("login");

    status_ok || message_ok || event_ok
}

fn describe(ack: &LoginAck) -> String {
    let status = match &ack.status {
        Some(AckStatus::Code(code)) => code.to_string(),
        Some(AckStatus::Text(text)) => text.clone(),
        None => "none".to_string(),
    };
    format!(
        "status={status} message={}",
        ack.message.as_deref().unwrap_or("none")
    )
}
