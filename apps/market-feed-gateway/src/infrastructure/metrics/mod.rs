//! Prometheus Metrics Module
//!
//! Exposes gateway metrics in Prometheus format at `GET /metrics`.
//!
//! # Metrics Categories
//!
//! - **Upstream**: frames received by kind, protocol errors, reconnects,
//!   connection state and the size of the upstream subscription set
//! - **Sessions**: active downstream sessions
//! - **Fan-out**: frames pushed and dropped, dispatch latency
//!
//! Recording functions are no-ops until [`init_metrics`] installs a recorder,
//! so library code and tests can call them freely.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

use crate::domain::market::RecordKind;

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder, or return the handle if already installed.
///
/// # Errors
///
/// Returns an error if another global recorder was installed first.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Handle for rendering, or `None` before [`init_metrics`].
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    describe_counter!(
        "gateway_upstream_messages_total",
        "Upstream frames received, by kind"
    );
    describe_counter!(
        "gateway_protocol_errors_total",
        "Upstream frames dropped as malformed or unrecognized"
    );
    describe_counter!(
        "gateway_reconnects_total",
        "Upstream reconnection attempts"
    );
    describe_gauge!(
        "gateway_upstream_connected",
        "1 while the upstream feed is connected and authenticated"
    );
    describe_gauge!(
        "gateway_subscribed_symbols",
        "Symbols in the upstream subscription set"
    );
    describe_gauge!("gateway_sessions_active", "Registered downstream sessions");
    describe_counter!(
        "gateway_frames_pushed_total",
        "price_update frames queued to sessions"
    );
    describe_counter!(
        "gateway_frames_dropped_total",
        "price_update frames not delivered, by reason"
    );
    describe_histogram!(
        "gateway_dispatch_seconds",
        "Time to fan one record out to all matching sessions"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Label for non-record upstream frames.
#[derive(Debug, Clone, Copy)]
pub enum UpstreamKind {
    /// A market record of the given kind.
    Record(RecordKind),
    /// Login acknowledgement.
    LoginAck,
    /// Any other control event.
    Control,
}

impl UpstreamKind {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Record(RecordKind::Trade) => "trade",
            Self::Record(RecordKind::Quote) => "quote",
            Self::Record(RecordKind::Cancel) => "cancel",
            Self::LoginAck => "login_ack",
            Self::Control => "control",
        }
    }
}

/// Record one upstream frame.
pub fn record_upstream_message(kind: UpstreamKind) {
    counter!("gateway_upstream_messages_total", "kind" => kind.as_str()).increment(1);
}

/// Record one dropped malformed frame.
pub fn record_protocol_error() {
    counter!("gateway_protocol_errors_total").increment(1);
}

/// Record one reconnection attempt.
pub fn record_reconnect() {
    counter!("gateway_reconnects_total").increment(1);
}

/// Set the upstream connected gauge.
pub fn set_upstream_connected(connected: bool) {
    gauge!("gateway_upstream_connected").set(if connected { 1.0 } else { 0.0 });
}

/// Set the upstream subscription set size.
#[allow(clippy::cast_precision_loss)]
pub fn set_subscribed_symbols(count: usize) {
    gauge!("gateway_subscribed_symbols").set(count as f64);
}

/// Set the active session count.
#[allow(clippy::cast_precision_loss)]
pub fn set_sessions_active(count: usize) {
    gauge!("gateway_sessions_active").set(count as f64);
}

/// Record frames queued to sessions.
pub fn record_frames_pushed(count: u64) {
    if count > 0 {
        counter!("gateway_frames_pushed_total").increment(count);
    }
}

/// Record one frame that could not be queued.
pub fn record_frame_dropped(reason: &'static str) {
    counter!("gateway_frames_dropped_total", "reason" => reason).increment(1);
}

/// Record fan-out duration.
pub fn record_dispatch_duration(duration: Duration) {
    histogram!("gateway_dispatch_seconds").record(duration.as_secs_f64());
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_kind_labels() {
        assert_eq!(UpstreamKind::Record(RecordKind::Trade).as_str(), "trade");
        assert_eq!(UpstreamKind::Record(RecordKind::Quote).as_str(), "quote");
        assert_eq!(UpstreamKind::Record(RecordKind::Cancel).as_str(), "cancel");
        assert_eq!(UpstreamKind::LoginAck.as_str(), "login_ack");
        assert_eq!(UpstreamKind::Control.as_str(), "control");
    }

    #[test]
    fn recording_without_recorder_is_harmless() {
        record_upstream_message(UpstreamKind::Control);
        record_frames_pushed(3);
        record_frame_dropped("mailbox_full");
        set_sessions_active(2);
        record_dispatch_duration(Duration::from_micros(5));
    }
}
