//! Stealth accumulation: many sub-threshold buys adding up to a large position

use super::types::{AccumulationEntry, AccumulationRecord};
use crate::config::PatternConfig;
use crate::types::{AlertDetails, TradeEvent};
use chrono::{DateTime, Duration, Utc};

/// Accumulations are tracked per wallet, market and outcome
pub fn accumulation_key(trade: &TradeEvent) -> String {
    format!(
        "{}:{}:{}",
        trade.wallet,
        trade.market_id,
        trade.outcome.trim().to_lowercase()
    )
}

impl AccumulationRecord {
    /// Append a buy and drop entries that fell out of the window
    pub fn add(&mut self, trade: &TradeEvent, window: Duration) {
        self.entries.push_back(AccumulationEntry {
            size: trade.size,
            price: trade.price,
            value: trade.notional(),
            timestamp: trade.timestamp,
        });
        self.prune(trade.timestamp, window);
    }

    pub fn prune(&mut self, now: DateTime<Utc>, window: Duration) {
        let cutoff = now - window;
        while self.entries.front().map(|e| e.timestamp < cutoff).unwrap_or(false) {
            self.entries.pop_front();
        }
    }

    pub fn total_size(&self) -> f64 {
        self.entries.iter().map(|e| e.size).sum()
    }

    pub fn total_value(&self) -> f64 {
        self.entries.iter().map(|e| e.value).sum()
    }

    /// Minutes between the first and last retained buy
    pub fn spread_mins(&self) -> f64 {
        match (self.entries.front(), self.entries.back()) {
            (Some(first), Some(last)) => (last.timestamp - first.timestamp).num_seconds() as f64 / 60.0,
            _ => 0.0,
        }
    }

    /// Alert payload when the accumulation crosses every threshold and has not
    /// alerted within the last window. Stamps the alert time when it fires.
    pub fn evaluate(&mut self, now: DateTime<Utc>, config: &PatternConfig) -> Option<AlertDetails> {
        let window = Duration::seconds(config.stealth_window_secs);
        if let Some(last) = self.last_alert {
            if now - last < window {
                return None;
            }
        }

        let trade_count = self.entries.len();
        let total_size = self.total_size();
        let total_value = self.total_value();
        let spread_mins = self.spread_mins();

        if trade_count < config.stealth_min_trades
            || total_size < config.stealth_min_total_size
            || total_value < config.stealth_min_total_value
            || spread_mins < config.stealth_min_spread_mins
        {
            return None;
        }

        self.last_alert = Some(now);
        Some(AlertDetails::StealthAccumulation {
            trade_count,
            total_size,
            total_value,
            avg_price: if total_size > 0.0 { total_value / total_size } else { 0.0 },
            spread_mins,
        })
    }
}
