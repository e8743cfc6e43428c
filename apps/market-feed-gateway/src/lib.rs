#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::needless_pass_by_value,
        clippy::items_after_statements,
        clippy::default_trait_access
    )
)]

//! Market Feed Gateway - Real-time Quote Fan-out
//!
//! Holds a single authenticated WebSocket connection to an upstream
//! market-data provider, keeps the latest record per symbol, and pushes
//! matching records to many downstream WebSocket sessions, each filtered by
//! its own subscription set.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Core data types and concurrent stores
//!   - `market`: Symbols and normalized market records
//!   - `cache`: Latest value per symbol
//!   - `session`: Downstream sessions, registry and wire protocol
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: Upstream transport and record listener interfaces
//!   - `services`: The `Gateway` service object
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `feed`: Upstream client (login, codec, backoff, tungstenite transport)
//!   - `dispatch`: Per-session filtered fan-out
//!   - `http`: Control plane REST endpoints and session sockets
//!   - `config`: Environment configuration
//!   - `metrics`, `telemetry`: Observability
//!
//! # Data Flow
//!
//! ```text
//!                  ┌──────────────┐     ┌──────────────┐     ┌──────────────┐
//! Provider WS ───► │  FeedClient  │ ──► │ DispatchHub  │ ──► │  Session 1   │
//!                  └──────┬───────┘     └──────────────┘ ──► │  Session N   │
//!                         ▼                                  └──────────────┘
//!                  ┌──────────────┐
//!                  │ Latest cache │ ◄── GET /cache
//!                  └──────────────┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core market data and session types.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::cache::{LatestValueCache, SharedCache};
pub use domain::market::{EventTimestamp, MarketRecord, RecordKind, Symbol, normalize_symbols};
pub use domain::session::{
    OverflowPolicy, PriceUpdate, ServerMessage, Session, SessionCommand, SessionError, SessionId,
    SessionRegistry, SessionState,
};

// Application
pub use application::ports::{
    FeedConnection, FeedConnector, FeedFrame, FeedSink, FeedSource, RecordListener,
    SharedListener, TransportError,
};
pub use application::services::{Gateway, GatewaySettings, GatewayStatus};

// Upstream feed
pub use infrastructure::feed::{
    Credentials, FeedClient, FeedClientConfig, FeedError, FeedStatusSnapshot, ReconnectConfig,
    TungsteniteConnector, UpstreamConnectionState,
};

// Dispatch
pub use infrastructure::dispatch::{DispatchHub, DispatchReport, DispatchStats};

// Configuration
pub use infrastructure::config::{ConfigError, GatewayConfig};

// Control plane
pub use infrastructure::http::{
    ApiError, ControlPlaneServer, ControlPlaneServerError, ControlPlaneState, router,
};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
