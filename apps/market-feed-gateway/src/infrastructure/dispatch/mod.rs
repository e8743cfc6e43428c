//! Dispatch Hub
//!
//! Fans each upstream record out to the downstream sessions that asked for
//! its symbol.
//!
//! # Delivery
//!
//! For every record the hub takes a snapshot of the session registry and
//! pushes a `price_update` frame into the mailbox of each `Active` session
//! whose filter contains the symbol. Pushes never wait: a full or closed
//! mailbox affects only that session, and the hub moves on.
//!
//! The hub runs on the upstream receive loop's task, so per-symbol ordering
//! follows upstream arrival order.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::application::ports::RecordListener;
use crate::domain::market::MarketRecord;
use crate::domain::session::{ServerMessage, SessionRegistry};
use crate::infrastructure::metrics;

/// Outcome of dispatching one record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Active sessions subscribed to the symbol.
    pub matched: usize,
    /// Frames queued.
    pub delivered: usize,
    /// Frames dropped (mailbox full, overflow disconnect, or closed).
    pub dropped: usize,
}

/// Cumulative hub counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Records dispatched.
    pub records: u64,
    /// Frames queued across all sessions.
    pub delivered: u64,
    /// Frames dropped across all sessions.
    pub dropped: u64,
}

/// Per-session filtered fan-out.
#[derive(Debug)]
pub struct DispatchHub {
    registry: Arc<SessionRegistry>,
    records: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

/// Shared hub handle.
pub type SharedDispatchHub = Arc<DispatchHub>;

impl DispatchHub {
    /// Create a hub over a registry.
    #[must_use]
    pub const fn new(registry: Arc<SessionRegistry>) -> Self {
        Self {
            registry,
            records: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Push one record to every matching session.
    pub fn dispatch(&self, record: &MarketRecord) -> DispatchReport {
        let started = Instant::now();
        let mut report = DispatchReport::default();
        let mut frame: Option<ServerMessage> = None;

        for session in self.registry.snapshot() {
            if !session.is_active() || !session.is_subscribed(&record.symbol) {
                continue;
            }
            report.matched += 1;

            let message = frame
                .get_or_insert_with(|| ServerMessage::price_update(record))
                .clone();

            match session.push(message) {
                Ok(()) => report.delivered += 1,
                Err(error) => {
                    report.dropped += 1;
                    metrics::record_frame_dropped(error.reason());
                    tracing::warn!(
                        session = %session.id(),
                        symbol = %record.symbol,
                        reason = error.reason(),
                        "Dropped price update"
                    );
                }
            }
        }

        self.records.fetch_add(1, Ordering::Relaxed);
        self.delivered
            .fetch_add(report.delivered as u64, Ordering::Relaxed);
        self.dropped.fetch_add(report.dropped as u64, Ordering::Relaxed);
        metrics::record_frames_pushed(report.delivered as u64);
        metrics::record_dispatch_duration(started.elapsed());

        tracing::trace!(
            symbol = %record.symbol,
            matched = report.matched,
            delivered = report.delivered,
            dropped = report.dropped,
            "Dispatched record"
        );
        report
    }

    /// Cumulative counters.
    #[must_use]
    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            records: self.records.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

impl RecordListener for DispatchHub {
    fn on_record(&self, record: &Arc<MarketRecord>) {
        let _ = self.dispatch(record);
    }
}
