//! Gateway Configuration Settings
//!
//! Configuration types for the gateway, loaded from environment variables.
//! Numeric values that fail to parse fall back to their defaults; only a
//! malformed feed URL is rejected outright.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::application::services::GatewaySettings;
use crate::domain::session::OverflowPolicy;
use crate::infrastructure::feed::{
    Credentials, DEFAULT_FEED_URL, FeedClientConfig, ReconnectConfig,
};

/// Upstream feed settings.
#[derive(Debug, Clone)]
pub struct FeedSettings {
    /// Provider API key.
    pub credentials: Option<Credentials>,
    /// Provider WebSocket URL.
    pub url: String,
    /// Transport open timeout.
    pub connect_timeout: Duration,
    /// Login acknowledgement timeout.
    pub login_ack_timeout: Duration,
    /// Accept a missing login acknowledgement.
    pub lenient_login_ack: bool,
    /// Receive idle timeout.
    pub idle_timeout: Duration,
    /// Initial reconnection delay.
    pub reconnect_delay_initial: Duration,
    /// Maximum reconnection delay.
    pub reconnect_delay_max: Duration,
    /// Reconnection delay multiplier for exponential backoff.
    pub reconnect_delay_multiplier: f64,
    /// Reconnection attempts before giving up (0 = unlimited).
    pub max_reconnect_attempts: u32,
    /// Connect at startup when a key is configured.
    pub auto_connect: bool,
    /// Symbols subscribed at startup.
    pub initial_symbols: Vec<String>,
}

impl Default for FeedSettings {
    fn default() -> Self {
        let reconnect = ReconnectConfig::default();
        Self {
            credentials: None,
            url: DEFAULT_FEED_URL.to_string(),
            connect_timeout: Duration::from_secs(10),
            login_ack_timeout: Duration::from_secs(10),
            lenient_login_ack: false,
            idle_timeout: Duration::from_secs(30),
            reconnect_delay_initial: reconnect.initial_delay,
            reconnect_delay_max: reconnect.max_delay,
            reconnect_delay_multiplier: reconnect.multiplier,
            max_reconnect_attempts: reconnect.max_attempts,
            auto_connect: true,
            initial_symbols: Vec::new(),
        }
    }
}

/// Downstream session settings.
#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    /// Outbound mailbox capacity per session.
    pub outbound_capacity: usize,
    /// What happens when a mailbox is full.
    pub overflow_policy: OverflowPolicy,
    /// Maximum symbols in one subscribe request.
    pub max_symbols_per_request: usize,
    /// Bound on writing one frame to a session socket.
    pub write_timeout: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            outbound_capacity: 256,
            overflow_policy: OverflowPolicy::DropNewest,
            max_symbols_per_request: 50,
            write_timeout: Duration::from_secs(10),
        }
    }
}

/// HTTP server settings.
#[derive(Debug, Clone, Copy)]
pub struct ServerSettings {
    /// Control plane and session WebSocket port.
    pub http_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { http_port: 8000 }
    }
}

/// Complete gateway configuration.
#[derive(Debug, Clone, Default)]
pub struct GatewayConfig {
    /// Upstream feed settings.
    pub feed: FeedSettings,
    /// Downstream session settings.
    pub sessions: SessionSettings,
    /// HTTP server settings.
    pub server: ServerSettings,
}

impl GatewayConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if `FEED_URL` is not a WebSocket URL.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if `FEED_URL` is not a WebSocket URL.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env(&lookup);
        let defaults = FeedSettings::default();

        let credentials = env
            .get("FEED_API_KEY")
            .and_then(|key| Credentials::new(key).ok());

        let url = env.get("FEED_URL").unwrap_or(defaults.url);
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(ConfigError::InvalidValue {
                key: "FEED_URL".to_string(),
                reason: format!("expected a ws:// or wss:// URL, got {url:?}"),
            });
        }

        let initial_symbols = env
            .get("FEED_INITIAL_SYMBOLS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let feed = FeedSettings {
            credentials,
            url,
            connect_timeout: env.secs("FEED_CONNECT_TIMEOUT_SECS", defaults.connect_timeout),
            login_ack_timeout: env
                .secs("FEED_LOGIN_ACK_TIMEOUT_SECS", defaults.login_ack_timeout),
            lenient_login_ack: env.flag("FEED_LENIENT_LOGIN_ACK", defaults.lenient_login_ack),
            idle_timeout: env.secs("FEED_IDLE_TIMEOUT_SECS", defaults.idle_timeout),
            reconnect_delay_initial: env.secs(
                "FEED_RECONNECT_DELAY_INITIAL_SECS",
                defaults.reconnect_delay_initial,
            ),
            reconnect_delay_max: env
                .secs("FEED_RECONNECT_DELAY_MAX_SECS", defaults.reconnect_delay_max),
            reconnect_delay_multiplier: env
                .parse::<f64>("FEED_RECONNECT_DELAY_MULTIPLIER")
                .filter(|m| m.is_finite() && *m >= 1.0)
                .unwrap_or(defaults.reconnect_delay_multiplier),
            max_reconnect_attempts: env
                .parse("FEED_MAX_RECONNECT_ATTEMPTS")
                .unwrap_or(defaults.max_reconnect_attempts),
            auto_connect: env.flag("FEED_AUTO_CONNECT", defaults.auto_connect),
            initial_symbols,
        };

        let session_defaults = SessionSettings::default();
        let sessions = SessionSettings {
            outbound_capacity: env
                .positive("SESSION_OUTBOUND_CAPACITY")
                .unwrap_or(session_defaults.outbound_capacity),
            overflow_policy: env
                .get("SESSION_OVERFLOW_POLICY")
                .map_or(session_defaults.overflow_policy, |s| {
                    OverflowPolicy::from_str_case_insensitive(&s)
                }),
            max_symbols_per_request: env
                .positive("CONTROL_MAX_SYMBOLS")
                .unwrap_or(session_defaults.max_symbols_per_request),
            write_timeout: env.secs("SESSION_WRITE_TIMEOUT_SECS", session_defaults.write_timeout),
        };

        let server = ServerSettings {
            http_port: env
                .parse("GATEWAY_HTTP_PORT")
                .unwrap_or(ServerSettings::default().http_port),
        };

        Ok(Self {
            feed,
            sessions,
            server,
        })
    }

    /// Feed client configuration.
    #[must_use]
    pub fn feed_client_config(&self) -> FeedClientConfig {
        FeedClientConfig {
            url: self.feed.url.clone(),
            credentials: self.feed.credentials.clone(),
            connect_timeout: self.feed.connect_timeout,
            login_ack_timeout: self.feed.login_ack_timeout,
            lenient_login_ack: self.feed.lenient_login_ack,
            idle_timeout: self.feed.idle_timeout,
            reconnect: ReconnectConfig {
                initial_delay: self.feed.reconnect_delay_initial,
                max_delay: self.feed.reconnect_delay_max,
                multiplier: self.feed.reconnect_delay_multiplier,
                jitter_factor: 0.0,
                max_attempts: self.feed.max_reconnect_attempts,
            },
        }
    }

    /// Gateway service settings.
    #[must_use]
    pub fn gateway_settings(&self) -> GatewaySettings {
        GatewaySettings {
            max_symbols_per_request: self.sessions.max_symbols_per_request,
            session_capacity: self.sessions.outbound_capacity,
            overflow: self.sessions.overflow_policy,
            write_timeout: self.sessions.write_timeout,
            auto_connect: self.feed.auto_connect,
            initial_symbols: self.feed.initial_symbols.clone(),
        }
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A value is present but unusable.
    #[error("invalid value for {key}: {reason}")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// What is wrong with it.
        reason: String,
    },
}

struct Env<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T: std::str::FromStr>(&self, key: &str) -> Option<T> {
        let raw = self.get(key)?;
        let parsed = raw.parse().ok();
        if parsed.is_none() {
            tracing::warn!(key, value = %raw, "Ignoring unparseable setting, using default");
        }
        parsed
    }

    fn positive(&self, key: &str) -> Option<usize> {
        self.parse::<usize>(key).filter(|v| *v > 0)
    }

    fn secs(&self, key: &str, default: Duration) -> Duration {
        self.parse::<u64>(key)
            .filter(|v| *v > 0)
            .map_or(default, Duration::from_secs)
    }

    fn flag(&self, key: &str, default: bool) -> bool {
        match self.get(key).map(|v| v.to_ascii_lowercase()).as_deref() {
            Some("true" | "1" | "yes" | "on") => true,
            Some("false" | "0" | "no" | "off") => false,
            _ => default,
        }
    }
}

// =============================================================================
// .env Loading
// =============================================================================

/// Load `.env` from the working directory or the nearest ancestor that has one.
///
/// Variables already set in the process environment win.
pub fn load_dotenv() -> Option<PathBuf> {
    if let Ok(path) = dotenvy::dotenv() {
        return Some(path);
    }

    let cwd = std::env::current_dir().ok()?;
    let path = find_dotenv_from(&cwd)?;
    dotenvy::from_path(&path).ok()?;
    Some(path)
}

/// Nearest `.env` file at or above `start`.
#[must_use]
pub fn find_dotenv_from(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .map(|dir| dir.join(".env"))
        .find(|candidate| candidate.is_file())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use test_case::test_case;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> Result<GatewayConfig, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        GatewayConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_without_variables() {
        let config = config(&[]).unwrap();

        assert!(config.feed.credentials.is_none());
        assert_eq!(config.feed.url, DEFAULT_FEED_URL);
        assert_eq!(config.feed.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.feed.login_ack_timeout, Duration::from_secs(10));
        assert_eq!(config.feed.idle_timeout, Duration::from_secs(30));
        assert!(!config.feed.lenient_login_ack);
        assert!(config.feed.auto_connect);
        assert_eq!(config.feed.max_reconnect_attempts, 5);
        assert_eq!(config.sessions.outbound_capacity, 256);
        assert_eq!(config.sessions.overflow_policy, OverflowPolicy::DropNewest);
        assert_eq!(config.sessions.max_symbols_per_request, 50);
        assert_eq!(config.server.http_port, 8000);
    }

    #[test]
    fn reads_overrides() {
        let config = config(&[
            ("FEED_API_KEY", "abc"),
            ("FEED_URL", "ws://localhost:9000"),
            ("FEED_LENIENT_LOGIN_ACK", "TRUE"),
            ("FEED_INITIAL_SYMBOLS", "aapl, msft,,"),
            ("FEED_MAX_RECONNECT_ATTEMPTS", "0"),
            ("SESSION_OVERFLOW_POLICY", "disconnect"),
            ("SESSION_OUTBOUND_CAPACITY", "16"),
            ("SESSION_WRITE_TIMEOUT_SECS", "3"),
            ("GATEWAY_HTTP_PORT", "9001"),
        ])
        .unwrap();

        assert_eq!(config.feed.credentials.as_ref().map(Credentials::api_key), Some("abc"));
        assert_eq!(config.feed.url, "ws://localhost:9000");
        assert!(config.feed.lenient_login_ack);
        assert_eq!(config.feed.initial_symbols, vec!["aapl", "msft"]);
        assert_eq!(config.feed.max_reconnect_attempts, 0);
        assert_eq!(config.sessions.overflow_policy, OverflowPolicy::Disconnect);
        assert_eq!(config.sessions.outbound_capacity, 16);
        assert_eq!(config.sessions.write_timeout, Duration::from_secs(3));
        assert_eq!(config.server.http_port, 9001);
    }

    #[test_case("FEED_CONNECT_TIMEOUT_SECS", "soon" ; "non numeric timeout")]
    #[test_case("SESSION_OUTBOUND_CAPACITY", "0" ; "zero capacity")]
    #[test_case("CONTROL_MAX_SYMBOLS", "-3" ; "negative limit")]
    #[test_case("GATEWAY_HTTP_PORT", "70000" ; "port out of range")]
    #[test_case("FEED_RECONNECT_DELAY_MULTIPLIER", "NaN" ; "nan multiplier")]
    fn invalid_numbers_fall_back(key: &str, value: &str) {
        let parsed = config(&[(key, value)]).unwrap();
        let defaults = GatewayConfig::default();

        assert_eq!(parsed.feed.connect_timeout, defaults.feed.connect_timeout);
        assert_eq!(parsed.sessions.outbound_capacity, defaults.sessions.outbound_capacity);
        assert_eq!(
            parsed.sessions.max_symbols_per_request,
            defaults.sessions.max_symbols_per_request
        );
        assert_eq!(parsed.server.http_port, defaults.server.http_port);
        assert!((parsed.feed.reconnect_delay_multiplier - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn rejects_non_websocket_url() {
        let err = config(&[("FEED_URL", "https://example.com")]).unwrap_err();
        assert!(err.to_string().contains("FEED_URL"));
    }

    #[test]
    fn blank_key_means_no_credentials() {
        assert!(config(&[("FEED_API_KEY", "   ")]).unwrap().feed.credentials.is_none());
    }

    #[test]
    fn derived_configs_carry_values() {
        let config = config(&[
            ("FEED_API_KEY", "abc"),
            ("FEED_RECONNECT_DELAY_INITIAL_SECS", "1"),
            ("CONTROL_MAX_SYMBOLS", "10"),
        ])
        .unwrap();

        let feed = config.feed_client_config();
        assert!(feed.credentials.is_some());
        assert_eq!(feed.reconnect.initial_delay, Duration::from_secs(1));
        assert_eq!(feed.reconnect.max_attempts, 5);

        let settings = config.gateway_settings();
        assert_eq!(settings.max_symbols_per_request, 10);
        assert_eq!(settings.session_capacity, 256);
    }

    #[test]
    fn finds_dotenv_in_ancestor() {
        let root = tempfile::tempdir().unwrap();
        let nested = root.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(root.path().join(".env"), "FEED_API_KEY=x\n").unwrap();

        assert_eq!(find_dotenv_from(&nested), Some(root.path().join(".env")));
    }

    #[test]
    fn no_dotenv_found() {
        let root = tempfile::tempdir().unwrap();
        let found = find_dotenv_from(root.path());
        assert!(found.is_none_or(|path| !path.starts_with(root.path())));
    }
}
