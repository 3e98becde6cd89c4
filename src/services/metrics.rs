//! Metrics collection for the alert pipeline

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Point-in-time copy of the pipeline counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    /// Trades handed to the dispatcher
    pub trades_received: u64,
    pub trades_processed: u64,
    /// Skip counters
    pub skipped_low_notional: u64,
    pub skipped_missing_wallet: u64,
    pub skipped_unmonitored: u64,
    pub skipped_obvious_price: u64,
    /// Alert outcomes
    pub alerts_emitted: u64,
    pub alerts_deduplicated: u64,
    pub sink_failures: u64,
    /// Venue calls made by detectors
    pub venue_calls: u64,
    pub venue_errors: u64,
    pub rate_limited: u64,
    /// Updates dropped on full channels
    pub dropped_updates: u64,
    /// Persistence
    pub saves_ok: u64,
    pub saves_failed: u64,
}

/// Thread-safe metrics collector
#[derive(Debug, Clone, Default)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug, Default)]
struct MetricsInner {
    trades_received: AtomicU64,
    trades_processed: AtomicU64,
    skipped_low_notional: AtomicU64,
    skipped_missing_wallet: AtomicU64,
    skipped_unmonitored: AtomicU64,
    skipped_obvious_price: AtomicU64,
    alerts_emitted: AtomicU64,
    alerts_deduplicated: AtomicU64,
    sink_failures: AtomicU64,
    venue_calls: AtomicU64,
    venue_errors: AtomicU64,
    rate_limited: AtomicU64,
    dropped_updates: AtomicU64,
    saves_ok: AtomicU64,
    saves_failed: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_trades_received(&self) {
        self.inner.trades_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_trades_processed(&self) {
        self.inner.trades_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_skipped_low_notional(&self) {
        self.inner.skipped_low_notional.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_skipped_missing_wallet(&self) {
        self.inner.skipped_missing_wallet.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_skipped_unmonitored(&self) {
        self.inner.skipped_unmonitored.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_skipped_obvious_price(&self) {
        self.inner.skipped_obvious_price.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_alerts_emitted(&self) {
        self.inner.alerts_emitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_alerts_deduplicated(&self) {
        self.inner.alerts_deduplicated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_sink_failures(&self) {
        self.inner.sink_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_venue_calls(&self) {
        self.inner.venue_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_venue_errors(&self) {
        self.inner.venue_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_rate_limited(&self) {
        self.inner.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_dropped_updates(&self) {
        self.inner.dropped_updates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_saves_ok(&self) {
        self.inner.saves_ok.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_saves_failed(&self) {
        self.inner.saves_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            trades_received: self.inner.trades_received.load(Ordering::Relaxed),
            trades_processed: self.inner.trades_processed.load(Ordering::Relaxed),
            skipped_low_notional: self.inner.skipped_low_notional.load(Ordering::Relaxed),
            skipped_missing_wallet: self.inner.skipped_missing_wallet.load(Ordering::Relaxed),
            skipped_unmonitored: self.inner.skipped_unmonitored.load(Ordering::Relaxed),
            skipped_obvious_price: self.inner.skipped_obvious_price.load(Ordering::Relaxed),
            alerts_emitted: self.inner.alerts_emitted.load(Ordering::Relaxed),
            alerts_deduplicated: self.inner.alerts_deduplicated.load(Ordering::Relaxed),
            sink_failures: self.inner.sink_failures.load(Ordering::Relaxed),
            venue_calls: self.inner.venue_calls.load(Ordering::Relaxed),
            venue_errors: self.inner.venue_errors.load(Ordering::Relaxed),
            rate_limited: self.inner.rate_limited.load(Ordering::Relaxed),
            dropped_updates: self.inner.dropped_updates.load(Ordering::Relaxed),
            saves_ok: self.inner.saves_ok.load(Ordering::Relaxed),
            saves_failed: self.inner.saves_failed.load(Ordering::Relaxed),
        }
    }
}
