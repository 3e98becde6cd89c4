//! Perfect exit timing: selling at or near the best price the outcome reached afterwards

use super::types::PendingExit;
use crate::types::{outcome_eq, MarketTrade, TradeEvent};
use chrono::{DateTime, Duration, Utc};

impl PendingExit {
    pub fn from_trade(trade: &TradeEvent) -> Self {
        Self {
            id: format!("{}:{}:{}", trade.wallet, trade.market_id, trade.id),
            wallet: trade.wallet.clone(),
            market_id: trade.market_id.clone(),
            market_title: trade.market_title.clone(),
            market_slug: trade.market_slug.clone(),
            outcome: trade.outcome.clone(),
            exit_price: trade.price,
            size: trade.size,
            exited_at: trade.timestamp,
            price_after: None,
            checked_at: None,
            timing_score: None,
            verified: false,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>, delay: Duration) -> bool {
        !self.verified && now - self.exited_at >= delay
    }

    /// Record the verification result and return the score
    pub fn verify(&mut self, price_after: f64, now: DateTime<Utc>) -> f64 {
        let score = timing_score(self.exit_price, price_after);
        self.price_after = Some(price_after);
        self.checked_at = Some(now);
        self.timing_score = Some(score);
        self.verified = true;
        score
    }
}

/// 1.0 when nothing after the exit beat the exit price, lower the more was left on the table
pub fn timing_score(exit_price: f64, best_after: f64) -> f64 {
    if exit_price <= 0.0 {
        return 0.0;
    }
    exit_price / best_after.max(exit_price)
}

/// Highest traded price for `outcome` within [from, to]
pub fn best_price_after(
    trades: &[MarketTrade],
    outcome: &str,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Option<f64> {
    let (from, to) = (from.timestamp(), to.timestamp());
    trades
        .iter()
        .filter(|t| t.timestamp >= from && t.timestamp <= to && outcome_eq(&t.outcome, outcome))
        .map(|t| t.price)
        .fold(None, |best: Option<f64>, p| Some(best.map_or(p, |b| b.max(p))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TradeSide;

    fn market_trade(outcome: &str, price: f64, ts: i64) -> MarketTrade {
        MarketTrade {
            outcome: outcome.into(),
            price,
            timestamp: ts,
            ..Default::default()
        }
    }

    #[test]
    fn test_timing_score() {
        assert!((timing_score(0.80, 0.75) - 1.0).abs() < 1e-6);
        assert!((timing_score(0.60, 0.80) - 0.75).abs() < 1e-6);
        assert_eq!(timing_score(0.0, 0.5), 0.0);
    }

    #[test]
    fn test_best_price_in_window_for_outcome() {
        let from = Utc::now();
        let to = from + Duration::hours(1);
        let base = from.timestamp();
        let trades = vec![
            market_trade("Yes", 0.90, base - 10),
            market_trade("Yes", 0.70, base + 60),
            market_trade("No", 0.95, base + 60),
            market_trade("yes", 0.72, base + 600),
            market_trade("Yes", 0.99, base + 7200),
        ];
        let best = best_price_after(&trades, "YES", from, to).unwrap();
        assert!((best - 0.72).abs() < 1e-6);
        assert!(best_price_after(&trades, "Maybe", from, to).is_none());
    }

    #[test]
    fn test_pending_exit_lifecycle() {
        let t0 = Utc::now();
        let trade = TradeEvent::new("tx1", "0xw", "m1", "Yes", TradeSide::Sell, 100.0, 0.8, t0);
        let mut exit = PendingExit::from_trade(&trade);
        assert!(!exit.is_due(t0 + Duration::minutes(30), Duration::hours(1)));
        assert!(exit.is_due(t0 + Duration::hours(1), Duration::hours(1)));

        let score = exit.verify(0.85, t0 + Duration::hours(1));
        assert!(exit.verified);
        assert!((score - 0.8 / 0.85).abs() < 1e-6);
        assert!(!exit.is_due(t0 + Duration::hours(2), Duration::hours(1)));
    }
}
