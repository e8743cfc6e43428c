//! Upstream Wire Messages
//!
//! Serde types for the provider's JSON WebSocket protocol.
//!
//! # Outbound
//!
//! ```json
//! {"event":"login","data":{"apiKey":"..."}}
//! {"event":"subscribe","data":{"ticker":"aapl"}}
//! {"event":"subscribe","data":{"ticker":["aapl","msft"]}}
//! {"event":"unsubscribe","data":{"ticker":["aapl"]}}
//! ```
//!
//! # Inbound
//!
//! ```json
//! {"event":"login","status":200,"message":"Authenticated"}
//! {"s":"aapl","t":1700000000000,"type":"T","lp":185.25,"ls":100}
//! [{"s":"msft","type":"Q","ap":401.1,"as":2,"bp":401.0,"bs":3}, ...]
//! ```

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::codec::CodecError;
use crate::domain::market::{EventTimestamp, MarketRecord, RecordKind, Symbol};

// =============================================================================
// Outbound Messages
// =============================================================================

/// Login request sent right after the transport opens.
#[derive(Debug, Clone, Serialize)]
pub struct LoginRequest {
    event: &'static str,
    data: LoginData,
}

#[derive(Debug, Clone, Serialize)]
struct LoginData {
    #[serde(rename = "apiKey")]
    api_key: String,
}

impl LoginRequest {
    /// Create a login request for an API key.
    #[must_use]
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            event: "login",
            data: LoginData {
                api_key: api_key.into(),
            },
        }
    }
}

/// Subscribe or unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionEvent {
    /// Start receiving symbols.
    Subscribe,
    /// Stop receiving symbols.
    Unsubscribe,
}

/// One symbol as a plain string, several as an array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum TickerList {
    /// Single ticker.
    One(String),
    /// Several tickers.
    Many(Vec<String>),
}

/// Subscription control frame.
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionRequest {
    /// Subscribe or unsubscribe.
    pub event: SubscriptionEvent,
    /// Ticker payload.
    pub data: TickerData,
}

/// Payload of a [`SubscriptionRequest`].
#[derive(Debug, Clone, Serialize)]
pub struct TickerData {
    /// Tickers to change.
    pub ticker: TickerList,
}

impl SubscriptionRequest {
    /// Subscribe frame. A single symbol is sent as a bare string.
    #[must_use]
    pub fn subscribe(symbols: &[Symbol]) -> Self {
        let ticker = match symbols {
            [only] => TickerList::One(only.to_string()),
            many => TickerList::Many(many.iter().map(ToString::to_string).collect()),
        };
        Self {
            event: SubscriptionEvent::Subscribe,
            data: TickerData { ticker },
        }
    }

    /// Unsubscribe frame. Always an array.
    #[must_use]
    pub fn unsubscribe(symbols: &[Symbol]) -> Self {
        Self {
            event: SubscriptionEvent::Unsubscribe,
            data: TickerData {
                ticker: TickerList::Many(symbols.iter().map(ToString::to_string).collect()),
            },
        }
    }

    /// Tickers carried by this frame.
    #[must_use]
    pub fn tickers(&self) -> Vec<&str> {
        match &self.data.ticker {
            TickerList::One(one) => vec![one.as_str()],
            TickerList::Many(many) => many.iter().map(String::as_str).collect(),
        }
    }
}

// =============================================================================
// Inbound Messages
// =============================================================================

/// Status field of a login acknowledgement: numeric code or text.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum AckStatus {
    /// HTTP-style status code.
    Code(i64),
    /// Free-form status text.
    Text(String),
}

/// Login acknowledgement.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct LoginAck {
    /// Status code or text.
    #[serde(default)]
    pub status: Option<AckStatus>,
    /// Echoed event name.
    #[serde(default)]
    pub event: Option<String>,
    /// Human-readable message.
    #[serde(default)]
    pub message: Option<String>,
}

/// Non-data control frame (subscription confirmations, heartbeats, notices).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ControlEvent {
    /// Event name.
    pub event: String,
    /// Status, if present.
    #[serde(default)]
    pub status: Option<AckStatus>,
    /// Message, if present.
    #[serde(default)]
    pub message: Option<String>,
}

/// One trade/quote/cancel as sent by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DataFrame {
    /// Raw symbol.
    #[serde(rename = "s")]
    pub symbol: String,
    /// Event timestamp.
    #[serde(rename = "t", default)]
    pub timestamp: Option<EventTimestamp>,
    /// Type code (`T`, `Q`, `B`).
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    /// Last price.
    #[serde(rename = "lp", default)]
    pub last_price: Option<Decimal>,
    /// Last size.
    #[serde(rename = "ls", default)]
    pub last_size: Option<Decimal>,
    /// Ask price.
    #[serde(rename = "ap", default)]
    pub ask_price: Option<Decimal>,
    /// Ask size.
    #[serde(rename = "as", default)]
    pub ask_size: Option<Decimal>,
    /// Bid price.
    #[serde(rename = "bp", default)]
    pub bid_price: Option<Decimal>,
    /// Bid size.
    #[serde(rename = "bs", default)]
    pub bid_size: Option<Decimal>,
}

impl DataFrame {
    /// Convert into a domain record stamped with the receive time.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::InvalidRecord`] for a blank symbol or a missing
    /// or unknown type code.
    pub fn into_record(self, observed_at: DateTime<Utc>) -> Result<MarketRecord, CodecError> {
        let symbol = Symbol::parse(&self.symbol)
            .map_err(|e| CodecError::InvalidRecord(e.to_string()))?;
        let code = self
            .kind
            .ok_or_else(|| CodecError::InvalidRecord(format!("{symbol}: missing type")))?;
        let kind = RecordKind::from_code(&code)
            .ok_or_else(|| CodecError::InvalidRecord(format!("{symbol}: unknown type {code:?}")))?;

        Ok(MarketRecord {
            symbol,
            event_timestamp: self.timestamp,
            kind,
            last_price: self.last_price,
            last_size: self.last_size,
            ask_price: self.ask_price,
            ask_size: self.ask_size,
            bid_price: self.bid_price,
            bid_size: self.bid_size,
            observed_at,
        })
    }
}

/// Every inbound shape the client understands.
#[derive(Debug)]
pub enum UpstreamFrame {
    /// Reply to the login request.
    LoginAck(LoginAck),
    /// Single data object.
    Data(DataFrame),
    /// Array of data objects; bad elements are reported individually.
    Batch(Vec<Result<DataFrame, CodecError>>),
    /// Any other event.
    ControlEvent(ControlEvent),
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::domain::market::normalize_symbols;

    #[test]
    fn login_request_shape() {
        let json = serde_json::to_value(LoginRequest::new("k3y")).unwrap();
        assert_eq!(json, json!({"event":"login","data":{"apiKey":"k3y"}}));
    }

    #[test]
    fn single_symbol_subscribe_is_a_string() {
        let request = SubscriptionRequest::subscribe(&normalize_symbols(&["aapl"]));
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({"event":"subscribe","data":{"ticker":"AAPL"}})
        );
    }

    #[test]
    fn multi_symbol_subscribe_is_an_array() {
        let request = SubscriptionRequest::subscribe(&normalize_symbols(&["aapl", "msft"]));
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({"event":"subscribe","data":{"ticker":["AAPL","MSFT"]}})
        );
        assert_eq!(request.tickers(), vec!["AAPL", "MSFT"]);
    }

    #[test]
    fn unsubscribe_is_always_an_array() {
        let request = SubscriptionRequest::unsubscribe(&normalize_symbols(&["aapl"]));
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({"event":"unsubscribe","data":{"ticker":["AAPL"]}})
        );
    }

    #[test]
    fn data_frame_into_record() {
        let frame: DataFrame = serde_json::from_value(json!({
            "s": "aapl", "t": 1_700_000_000_000_i64, "type": "Q",
            "ap": 185.3, "as": 2, "bp": "185.20", "bs": 5
        }))
        .unwrap();

        let record = frame.into_record(Utc::now()).unwrap();
        assert_eq!(record.symbol.as_str(), "AAPL");
        assert_eq!(record.kind, RecordKind::Quote);
        assert_eq!(record.ask_price, Some(Decimal::new(1853, 1)));
        assert_eq!(record.bid_price, Some(Decimal::new(18520, 2)));
        assert!(record.last_price.is_none());
        assert_eq!(record.event_timestamp, Some(EventTimestamp::Epoch(1_700_000_000_000)));
    }

    #[test]
    fn data_frame_with_unknown_type_is_invalid() {
        let frame: DataFrame = serde_json::from_value(json!({"s":"aapl","type":"Z"})).unwrap();
        assert!(matches!(
            frame.into_record(Utc::now()),
            Err(CodecError::InvalidRecord(_))
        ));

        let frame: DataFrame = serde_json::from_value(json!({"s":"  ","type":"T"})).unwrap();
        assert!(frame.into_record(Utc::now()).is_err());
    }
}
