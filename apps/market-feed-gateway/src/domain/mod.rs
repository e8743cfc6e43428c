//! Domain Layer - Core market data and session types.
//!
//! Pure data structures and concurrent stores with no I/O. Everything here
//! is shared across the upstream feed client, the dispatch hub and the
//! control plane.

/// Symbols and market records.
pub mod market;

/// Latest-value-per-symbol cache.
pub mod cache;

/// Downstream sessions, their filters and wire protocol.
pub mod session;
