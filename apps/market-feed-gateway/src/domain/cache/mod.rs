//! Latest-Value Cache
//!
//! Holds the most recent [`MarketRecord`] per symbol. Last write wins and no
//! history is kept. The map is sharded, so readers and writers working on
//! different symbols never contend.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;

use crate::domain::market::{MarketRecord, Symbol};

/// Concurrent map from symbol to its most recent record.
#[derive(Debug, Default)]
pub struct LatestValueCache {
    entries: DashMap<Symbol, Arc<MarketRecord>>,
}

/// Shared cache handle.
pub type SharedCache = Arc<LatestValueCache>;

impl LatestValueCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the latest record for a symbol.
    #[must_use]
    pub fn get(&self, symbol: &Symbol) -> Option<Arc<MarketRecord>> {
        self.entries.get(symbol).map(|entry| Arc::clone(entry.value()))
    }

    /// Store a record under its own symbol, replacing any previous one.
    ///
    /// Returns the replaced record, if any.
    pub fn put(&self, record: Arc<MarketRecord>) -> Option<Arc<MarketRecord>> {
        self.entries.insert(record.symbol.clone(), record)
    }

    /// Point-in-time copy of every entry.
    #[must_use]
    pub fn get_all(&self) -> HashMap<Symbol, Arc<MarketRecord>> {
        self.entries
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect()
    }

    /// Up to `limit` records, ordered by symbol.
    #[must_use]
    pub fn entries(&self, limit: usize) -> Vec<Arc<MarketRecord>> {
        let mut records: Vec<Arc<MarketRecord>> = self
            .entries
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        records.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        records.truncate(limit);
        records
    }

    /// Number of cached symbols.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds no symbols.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
