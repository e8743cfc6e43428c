//! Downstream Session Protocol
//!
//! JSON frames exchanged with downstream sessions.
//!
//! Inbound commands are tagged by `action`, outbound frames by `type`:
//!
//! ```json
//! {"action":"subscribe","symbols":["AAPL","MSFT"]}
//! {"type":"price_update","symbol":"AAPL","data_type":"T","last_price":185.25,...}
//! ```

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::market::{EventTimestamp, MarketRecord, RecordKind, Symbol};

// =============================================================================
// Inbound
// =============================================================================

/// Command sent by a downstream session.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum SessionCommand {
    /// Add symbols to this session's filter.
    Subscribe {
        /// Raw symbols, normalized by the handler.
        #[serde(default)]
        symbols: Vec<String>,
    },
    /// Remove symbols from this session's filter.
    Unsubscribe {
        /// Raw symbols, normalized by the handler.
        #[serde(default)]
        symbols: Vec<String>,
    },
    /// Liveness probe.
    Ping,
    /// List this session's subscriptions.
    GetSubscriptions,
}

impl SessionCommand {
    /// Parse a text frame.
    ///
    /// # Errors
    ///
    /// Returns the serde error for malformed JSON or an unknown `action`.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

// =============================================================================
// Outbound
// =============================================================================

/// Direction of a subscription change acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionAction {
    /// Symbols were added.
    Subscribed,
    /// Symbols were removed.
    Unsubscribed,
}

/// Price update pushed to sessions, also the cache read shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PriceUpdate {
    /// Normalized symbol.
    pub symbol: Symbol,
    /// Provider event time, verbatim.
    pub timestamp: Option<EventTimestamp>,
    /// `T`, `Q` or `B`.
    pub data_type: RecordKind,
    /// Last trade price.
    #[serde(with = "rust_decimal::serde::float_option")]
    pub last_price: Option<Decimal>,
    /// Last trade size.
    #[serde(with = "rust_decimal::serde::float_option")]
    pub last_size: Option<Decimal>,
    /// Best ask price.
    #[serde(with = "rust_decimal::serde::float_option")]
    pub ask_price: Option<Decimal>,
    /// Best ask size.
    #[serde(with = "rust_decimal::serde::float_option")]
    pub ask_size: Option<Decimal>,
    /// Best bid price.
    #[serde(with = "rust_decimal::serde::float_option")]
    pub bid_price: Option<Decimal>,
    /// Best bid size.
    #[serde(with = "rust_decimal::serde::float_option")]
    pub bid_size: Option<Decimal>,
    /// When the gateway received the record.
    pub cached_at: DateTime<Utc>,
}

impl From<&MarketRecord> for PriceUpdate {
    fn from(record: &MarketRecord) -> Self {
        Self {
            symbol: record.symbol.clone(),
            timestamp: record.event_timestamp.clone(),
            data_type: record.kind,
            last_price: record.last_price,
            last_size: record.last_size,
            ask_price: record.ask_price,
            ask_size: record.ask_size,
            bid_price: record.bid_price,
            bid_size: record.bid_size,
            cached_at: record.observed_at,
        }
    }
}

/// Frame sent to a downstream session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Greeting sent once the session is registered.
    Connected {
        /// Session identifier.
        session_id: u64,
        /// Human-readable greeting.
        message: String,
    },
    /// Market data for a subscribed symbol.
    PriceUpdate(PriceUpdate),
    /// Acknowledges a subscribe or unsubscribe command.
    Subscription {
        /// Which change was applied.
        action: SubscriptionAction,
        /// Symbols named in the command, normalized.
        symbols: Vec<Symbol>,
        /// Size of the session's filter after the change.
        subscribed_total: usize,
    },
    /// Reply to `ping`.
    Pong,
    /// Reply to `get_subscriptions`.
    Subscriptions {
        /// Sorted symbols in the session's filter.
        symbols: Vec<Symbol>,
    },
    /// Validation or protocol failure.
    Error {
        /// What went wrong.
        message: String,
    },
}

impl ServerMessage {
    /// Greeting frame.
    #[must_use]
    pub fn connected(session_id: u64) -> Self {
        Self::Connected {
            session_id,
            message: "Connected to market feed gateway".to_string(),
        }
    }

    /// Price update frame for a record.
    #[must_use]
    pub fn price_update(record: &MarketRecord) -> Self {
        Self::PriceUpdate(PriceUpdate::from(record))
    }

    /// Error frame.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Frame type tag, as serialized.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::PriceUpdate(_) => "price_update",
            Self::Subscription { .. } => "subscription",
            Self::Pong => "pong",
            Self::Subscriptions { .. } => "subscriptions",
            Self::Error { .. } => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;
    use serde_json::{Value, json};

    use super::*;

    #[test]
    fn parses_each_command() {
        assert_eq!(
            SessionCommand::parse(r#"{"action":"subscribe","symbols":["aapl"]}"#).unwrap(),
            SessionCommand::Subscribe {
                symbols: vec!["aapl".to_string()]
            }
        );
        assert_eq!(
            SessionCommand::parse(r#"{"action":"unsubscribe","symbols":[]}"#).unwrap(),
            SessionCommand::Unsubscribe { symbols: vec![] }
        );
        assert_eq!(
            SessionCommand::parse(r#"{"action":"ping"}"#).unwrap(),
            SessionCommand::Ping
        );
        assert_eq!(
            SessionCommand::parse(r#"{"action":"get_subscriptions"}"#).unwrap(),
            SessionCommand::GetSubscriptions
        );
    }

    #[test]
    fn subscribe_without_symbols_defaults_to_empty() {
        assert_eq!(
            SessionCommand::parse(r#"{"action":"subscribe"}"#).unwrap(),
            SessionCommand::Subscribe { symbols: vec![] }
        );
    }

    #[test]
    fn unknown_action_is_rejected() {
        assert!(SessionCommand::parse(r#"{"action":"teleport"}"#).is_err());
        assert!(SessionCommand::parse(r#"{"symbols":["AAPL"]}"#).is_err());
        assert!(SessionCommand::parse("not json").is_err());
    }

    #[test]
    fn price_update_wire_shape() {
        let record = MarketRecord::new(
            Symbol::parse("aapl").unwrap(),
            RecordKind::Trade,
            "2024-01-02T15:04:05Z".parse().unwrap(),
        )
        .with_last(Decimal::new(18_525, 2), Decimal::from(100))
        .with_event_timestamp(EventTimestamp::Epoch(1_704_207_845_000));

        let value: Value =
            serde_json::to_value(ServerMessage::price_update(&record)).unwrap();

        assert_eq!(value["type"], "price_update");
        assert_eq!(value["symbol"], "AAPL");
        assert_eq!(value["data_type"], "T");
        assert_eq!(value["timestamp"], 1_704_207_845_000_i64);
        assert_eq!(value["last_price"], json!(185.25));
        assert_eq!(value["last_size"], json!(100.0));
        assert!(value["ask_price"].is_null());
        assert_eq!(value["cached_at"], "2024-01-02T15:04:05Z");
    }

    #[test]
    fn control_frames_wire_shape() {
        let ack = ServerMessage::Subscription {
            action: SubscriptionAction::Subscribed,
            symbols: vec![Symbol::parse("MSFT").unwrap()],
            subscribed_total: 2,
        };
        assert_eq!(
            serde_json::to_value(&ack).unwrap(),
            json!({"type":"subscription","action":"subscribed","symbols":["MSFT"],"subscribed_total":2})
        );
        assert_eq!(
            serde_json::to_value(ServerMessage::Pong).unwrap(),
            json!({"type":"pong"})
        );
        assert_eq!(
            serde_json::to_value(ServerMessage::error("bad")).unwrap(),
            json!({"type":"error","message":"bad"})
        );
        assert_eq!(ServerMessage::connected(7).kind(), "connected");
    }
}
