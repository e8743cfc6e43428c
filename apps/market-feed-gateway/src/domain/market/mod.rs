//! Market Data Types
//!
//! Core value types shared by every layer of the gateway:
//!
//! - [`Symbol`]: normalized ticker identifier used as the key everywhere
//! - [`MarketRecord`]: immutable snapshot of one upstream trade/quote event
//! - [`RecordKind`]: trade, quote, or cancel
//!
//! Records are produced only by the upstream feed client and are shared as
//! `Arc<MarketRecord>` between the cache and the dispatch hub.

use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// =============================================================================
// Symbol
// =============================================================================

/// Error returned when a raw string cannot become a [`Symbol`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("symbol cannot be empty")]
pub struct EmptySymbol;

/// Ticker identifier, trimmed and uppercased.
///
/// Two symbols compare equal only after normalization, so `" aapl "` and
/// `"AAPL"` are the same key in the cache, the session filters, and the
/// upstream subscription set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Symbol(String);

impl Symbol {
    /// Normalize a raw ticker.
    ///
    /// # Errors
    ///
    /// Returns [`EmptySymbol`] if nothing is left after trimming.
    pub fn parse(raw: &str) -> Result<Self, EmptySymbol> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(EmptySymbol);
        }
        Ok(Self(trimmed.to_uppercase()))
    }

    /// Get the symbol as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Symbol {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Symbol {
    type Error = EmptySymbol;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Symbol> for String {
    fn from(symbol: Symbol) -> Self {
        symbol.0
    }
}

/// Normalize a list of raw tickers.
///
/// Blank entries are dropped and duplicates removed; the first occurrence
/// of each symbol keeps its position.
pub fn normalize_symbols<S: AsRef<str>>(raw: &[S]) -> Vec<Symbol> {
    let mut seen = HashSet::with_capacity(raw.len());
    raw.iter()
        .filter_map(|s| Symbol::parse(s.as_ref()).ok())
        .filter(|symbol| seen.insert(symbol.clone()))
        .collect()
}

// =============================================================================
// Record Kind
// =============================================================================

/// Kind of upstream event. Serialized as the provider's one-letter code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordKind {
    /// Executed trade (`T`).
    #[serde(rename = "T")]
    Trade,
    /// Top-of-book quote (`Q`).
    #[serde(rename = "Q")]
    Quote,
    /// Trade cancel / break (`B`).
    #[serde(rename = "B")]
    Cancel,
}

impl RecordKind {
    /// Parse the provider's type code, case-insensitively.
    #[must_use]
    pub fn from_code(code: &str) -> Option<Self> {
        match code.trim() {
            "T" | "t" => Some(Self::Trade),
            "Q" | "q" => Some(Self::Quote),
            "B" | "b" => Some(Self::Cancel),
            _ => None,
        }
    }

    /// One-letter wire code.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::Trade => "T",
            Self::Quote => "Q",
            Self::Cancel => "B",
        }
    }

    /// Lowercase name, used as a metrics label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Trade => "trade",
            Self::Quote => "quote",
            Self::Cancel => "cancel",
        }
    }
}

// =============================================================================
// Market Record
// =============================================================================

/// Provider event timestamp, carried through verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventTimestamp {
    /// Integer epoch value (the provider sends milliseconds or nanoseconds).
    Epoch(i64),
    /// Any other number: fractional, or beyond `i64`.
    Number(serde_json::Number),
    /// Any textual timestamp.
    Text(String),
}

/// Immutable snapshot of one upstream event.
///
/// Trades carry `last_*` fields, quotes carry the `ask_*`/`bid_*` sides;
/// whatever the provider omits stays `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarketRecord {
    /// Normalized symbol.
    pub symbol: Symbol,
    /// Provider event time (`t`).
    pub event_timestamp: Option<EventTimestamp>,
    /// Trade, quote, or cancel.
    pub kind: RecordKind,
    /// Last trade price.
    pub last_price: Option<Decimal>,
    /// Last trade size.
    pub last_size: Option<Decimal>,
    /// Best ask price.
    pub ask_price: Option<Decimal>,
    /// Best ask size.
    pub ask_size: Option<Decimal>,
    /// Best bid price.
    pub bid_price: Option<Decimal>,
    /// Best bid size.
    pub bid_size: Option<Decimal>,
    /// Gateway receive time.
    pub observed_at: DateTime<Utc>,
}

impl MarketRecord {
    /// Create a record with no price fields set.
    #[must_use]
    pub const fn new(symbol: Symbol, kind: RecordKind, observed_at: DateTime<Utc>) -> Self {
        Self {
            symbol,
            event_timestamp: None,
            kind,
            last_price: None,
            last_size: None,
            ask_price: None,
            ask_size: None,
            bid_price: None,
            bid_size: None,
            observed_at,
        }
    }

    /// Set the last trade price and size.
    #[must_use]
    pub fn with_last(mut self, price: Decimal, size: Decimal) -> Self {
        self.last_price = Some(price);
        self.last_size = Some(size);
        self
    }

    /// Set both sides of the book.
    #[must_use]
    pub fn with_quote(
        mut self,
        bid_price: Decimal,
        bid_size: Decimal,
        ask_price: Decimal,
        ask_size: Decimal,
    ) -> Self {
        self.bid_price = Some(bid_price);
        self.bid_size = Some(bid_size);
        self.ask_price = Some(ask_price);
        self.ask_size = Some(ask_size);
        self
    }

    /// Set the provider event timestamp.
    #[must_use]
    pub fn with_event_timestamp(mut self, timestamp: EventTimestamp) -> Self {
        self.event_timestamp = Some(timestamp);
        self
    }
}
