//! Conviction doubling: buying more of a position that is underwater

use crate::config::PatternConfig;
use crate::types::{outcome_eq, AlertDetails, Position, TradeEvent};

/// Trade-only preconditions, checked before spending a positions fetch
pub fn qualifies(trade: &TradeEvent, config: &PatternConfig) -> bool {
    trade.is_buy()
        && trade.size >= config.conviction_min_add_size
        && trade.notional() >= config.conviction_min_add_value
}

/// Alert payload when the fetched position shows the buy added to a loser.
///
/// `positions` already include the trade, so the prior size is the reported
/// size minus the trade size.
pub fn evaluate(trade: &TradeEvent, positions: &[Position], config: &PatternConfig) -> Option<AlertDetails> {
    let position = positions.iter().find(|p| outcome_eq(&p.outcome, &trade.outcome))?;

    let existing_size = position.size - trade.size;
    if existing_size <= 0.0 {
        return None;
    }
    let avg_price = position.avg_price;
    let cur_price = position.cur_price;
    if avg_price <= 0.0 || cur_price >= avg_price {
        return None;
    }
    let loss_pct = (avg_price - cur_price) / avg_price;
    if loss_pct < config.conviction_min_loss_pct {
        return None;
    }

    Some(AlertDetails::ConvictionDoubling {
        existing_size,
        avg_price,
        cur_price,
        loss_pct,
        added_size: trade.size,
        added_value: trade.notional(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TradeSide;
    use chrono::Utc;

    fn buy(size: f64, price: f64) -> TradeEvent {
        TradeEvent::new("t", "0xw", "m1", "Yes", TradeSide::Buy, size, price, Utc::now())
    }

    #[test]
    fn test_underwater_add_fires() {
        let config = PatternConfig::default();
        let positions = vec![Position::new("YES", 3000.0, 0.50, 0.40)];
        let details = evaluate(&buy(1000.0, 0.40), &positions, &config).unwrap();
        match details {
            AlertDetails::ConvictionDoubling { existing_size, loss_pct, .. } => {
                assert!((existing_size - 2000.0).abs() < 1e-6);
                assert!((loss_pct - 0.20).abs() < 1e-6);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_no_prior_position_or_in_profit() {
        let config = PatternConfig::default();
        // Fresh position: everything held came from this trade
        let positions = vec![Position::new("Yes", 1000.0, 0.40, 0.40)];
        assert!(evaluate(&buy(1000.0, 0.40), &positions, &config).is_none());

        let positions = vec![Position::new("Yes", 3000.0, 0.40, 0.55)];
        assert!(evaluate(&buy(1000.0, 0.55), &positions, &config).is_none());

        // Only 4% down
        let positions = vec![Position::new("Yes", 3000.0, 0.50, 0.48)];
        assert!(evaluate(&buy(1000.0, 0.48), &positions, &config).is_none());
    }

    #[test]
    fn test_trade_preconditions() {
        let config = PatternConfig::default();
        assert!(qualifies(&buy(2500.0, 0.40), &config));
        assert!(!qualifies(&buy(400.0, 0.90), &config));
        assert!(!qualifies(&buy(600.0, 0.10), &config));
    }
}
