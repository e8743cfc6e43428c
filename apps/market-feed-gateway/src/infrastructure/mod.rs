//! Infrastructure Layer - Adapters and external integrations.
//!
//! Concrete implementations behind the application ports, plus the HTTP
//! surface and process-wide observability.

/// Upstream WebSocket feed client.
pub mod feed;

/// Filtered fan-out of records to downstream sessions.
pub mod dispatch;

/// Environment configuration.
pub mod config;

/// Control plane REST endpoints and session WebSocket.
pub mod http;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Tracing subscriber and OpenTelemetry export.
pub mod telemetry;
