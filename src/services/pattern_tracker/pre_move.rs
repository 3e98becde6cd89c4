//! Pre-move positioning: trading in the direction the price later moves

use super::types::{PreMoveRecord, PreMoveStats};
use crate::types::{TradeEvent, TradeSide};
use chrono::{DateTime, Duration, Utc};

impl PreMoveRecord {
    pub fn from_trade(trade: &TradeEvent) -> Self {
        Self {
            id: format!("{}:{}:{}", trade.wallet, trade.market_id, trade.id),
            wallet: trade.wallet.clone(),
            market_id: trade.market_id.clone(),
            market_title: trade.market_title.clone(),
            market_slug: trade.market_slug.clone(),
            outcome: trade.outcome.clone(),
            side: trade.side,
            trade_price: trade.price,
            trade_size: trade.size,
            trade_value: trade.notional(),
            trade_time: trade.timestamp,
            price_after: None,
            checked_at: None,
            move_percent: None,
            favorable: false,
            verified: false,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>, delay: Duration) -> bool {
        !self.verified && now - self.trade_time >= delay
    }

    /// Apply the later price. Returns (move, favorable) or None when the trade price is unusable.
    pub fn verify(&mut self, price_after: f64, now: DateTime<Utc>) -> Option<(f64, bool)> {
        if self.trade_price <= 0.0 {
            return None;
        }
        let move_percent = (price_after - self.trade_price) / self.trade_price;
        let favorable = match self.side {
            TradeSide::Buy => move_percent > 0.0,
            TradeSide::Sell => move_percent < 0.0,
        };
        self.price_after = Some(price_after);
        self.checked_at = Some(now);
        self.move_percent = Some(move_percent);
        self.favorable = favorable;
        self.verified = true;
        Some((move_percent, favorable))
    }
}

impl PreMoveStats {
    /// Fold in one verified trade. A move is successful when favorable and at least `min_move`.
    pub fn record(&mut self, move_percent: f64, favorable: bool, min_move: f64, now: DateTime<Utc>) {
        self.total_trades += 1;
        if favorable {
            self.favorable_moves += 1;
            self.total_move_size += move_percent.abs();
            if move_percent.abs() >= min_move {
                self.successful_moves += 1;
            }
        }
        self.alpha_score = self.successful_moves as f64 / self.total_trades as f64;
        self.avg_move_size = if self.favorable_moves > 0 {
            self.total_move_size / self.favorable_moves as f64
        } else {
            0.0
        };
        self.last_updated = Some(now);
    }

    pub fn qualifies(&self, min_trades: u32, min_alpha: f64) -> bool {
        self.total_trades >= min_trades && self.alpha_score >= min_alpha
    }

    pub fn cooled_down(&self, now: DateTime<Utc>, cooldown: Duration) -> bool {
        self.last_alert_time.map(|t| now - t >= cooldown).unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(side: TradeSide, price: f64, at: DateTime<Utc>) -> PreMoveRecord {
        let trade = TradeEvent::new("tx", "0xw", "m1", "Yes", side, 5000.0, price, at);
        PreMoveRecord::from_trade(&trade)
    }

    #[test]
    fn test_buy_before_rise_is_successful() {
        let now = Utc::now();
        let mut r = record(TradeSide::Buy, 0.50, now - Duration::hours(2));
        assert!(r.is_due(now, Duration::hours(1)));

        let (move_percent, favorable) = r.verify(0.60, now).unwrap();
        assert!((move_percent - 0.20).abs() < 1e-6);
        assert!(favorable);

        let mut stats = PreMoveStats::default();
        stats.record(move_percent, favorable, 0.10, now);
        assert_eq!(stats.total_trades, 1);
        assert_eq!(stats.successful_moves, 1);
        assert!((stats.alpha_score - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_sell_before_drop_is_favorable() {
        let now = Utc::now();
        let mut r = record(TradeSide::Sell, 0.50, now);
        let (move_percent, favorable) = r.verify(0.40, now).unwrap();
        assert!(move_percent < 0.0);
        assert!(favorable);

        let mut r = record(TradeSide::Sell, 0.50, now);
        let (_, favorable) = r.verify(0.55, now).unwrap();
        assert!(!favorable);
    }

    #[test]
    fn test_alpha_tracks_success_ratio() {
        let now = Utc::now();
        let mut stats = PreMoveStats::default();
        stats.record(0.20, true, 0.10, now);
        stats.record(0.05, true, 0.10, now);
        stats.record(-0.30, false, 0.10, now);
        stats.record(0.15, true, 0.10, now);
        assert_eq!(stats.total_trades, 4);
        assert_eq!(stats.successful_moves, 2);
        assert!((stats.alpha_score - stats.successful_moves as f64 / stats.total_trades as f64).abs() < 1e-6);
        assert!((stats.avg_move_size - 0.40 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_zero_price_is_not_verified() {
        let now = Utc::now();
        let mut r = record(TradeSide::Buy, 0.0, now);
        assert!(r.verify(0.5, now).is_none());
        assert!(!r.verified);
    }
}
