//! Asymmetric exit detection: wallets that cut winners fast and sit on losers

use super::types::{AsymmetricExitStats, ExitRecord, HedgePosition};
use crate::types::TradeEvent;

/// Ratio of average loss hold to average win hold when the pattern holds
pub fn asymmetric_ratio(stats: &AsymmetricExitStats, min_exits: u32, threshold: f64) -> Option<f64> {
    if stats.total_exits() < min_exits || stats.winning_exits < 2 || stats.losing_exits < 2 {
        return None;
    }
    let ratio = stats.ratio()?;
    (ratio >= threshold).then_some(ratio)
}

/// Exit record for the shares a SELL took off `prior`'s sold side.
///
/// Needs a known open time for that side; `entry_price` overrides the prior
/// average when the venue reports one.
pub fn exit_from_sell(
    trade: &TradeEvent,
    prior: &HedgePosition,
    remaining_size: f64,
    entry_price: Option<f64>,
) -> Option<ExitRecord> {
    let opened_at = prior.opened_at(&trade.outcome)?;
    let sold = (prior.size(&trade.outcome) - remaining_size).max(0.0);
    if sold <= 0.0 {
        return None;
    }
    let avg_entry = entry_price
        .filter(|p| *p > 0.0)
        .unwrap_or_else(|| prior.avg_price(&trade.outcome));
    let realized_pnl = (trade.price - avg_entry) * sold;

    Some(ExitRecord {
        market_id: trade.market_id.clone(),
        outcome: trade.outcome.clone(),
        exit_price: trade.price,
        avg_entry_price: avg_entry,
        size: sold,
        realized_pnl,
        is_winner: realized_pnl > 0.0,
        hold_duration_secs: (trade.timestamp - opened_at).num_seconds().max(0),
        exited_at: trade.timestamp,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TradeSide;
    use chrono::{Duration, Utc};

    fn exit(is_winner: bool, hold: i64) -> ExitRecord {
        ExitRecord {
            market_id: "m".into(),
            outcome: "Yes".into(),
            exit_price: 0.5,
            avg_entry_price: 0.4,
            size: 10.0,
            realized_pnl: if is_winner { 1.0 } else { -1.0 },
            is_winner,
            hold_duration_secs: hold,
            exited_at: Utc::now(),
        }
    }

    fn stats(wins: &[i64], losses: &[i64]) -> AsymmetricExitStats {
        let mut stats = AsymmetricExitStats::default();
        for hold in wins {
            stats.record(exit(true, *hold));
        }
        for hold in losses {
            stats.record(exit(false, *hold));
        }
        stats
    }

    #[test]
    fn test_ratio_fires_over_threshold() {
        let s = stats(&[1000, 1000, 1000], &[5000, 5000, 5000]);
        let ratio = asymmetric_ratio(&s, 2, 2.0).unwrap();
        assert!((ratio - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_needs_two_of_each_side() {
        let s = stats(&[1000], &[5000, 5000, 5000, 5000, 5000]);
        assert!(asymmetric_ratio(&s, 2, 2.0).is_none());
        let s = stats(&[1000, 1000], &[1500, 1500]);
        assert!(asymmetric_ratio(&s, 2, 2.0).is_none());
        let s = stats(&[1000, 1000], &[5000, 5000]);
        assert!(asymmetric_ratio(&s, 6, 2.0).is_none());
    }

    #[test]
    fn test_averages_match_totals() {
        let s = stats(&[100, 250, 400], &[900, 1300]);
        assert!((s.avg_win_hold * s.winning_exits as f64 - s.total_win_hold).abs() < 1e-6);
        assert!((s.avg_loss_hold * s.losing_exits as f64 - s.total_loss_hold).abs() < 1e-6);
    }

    #[test]
    fn test_recent_exits_bounded() {
        let holds: Vec<i64> = (0..30).collect();
        let s = stats(&holds, &[]);
        assert_eq!(s.recent_exits.len(), 20);
        assert_eq!(s.winning_exits, 30);
    }

    #[test]
    fn test_exit_from_sell() {
        let now = Utc::now();
        let prior = HedgePosition {
            yes_size: 1000.0,
            no_size: 800.0,
            yes_avg_price: 0.5,
            no_avg_price: 0.5,
            last_updated: now,
            is_hedged: true,
            yes_opened_at: Some(now - Duration::hours(2)),
            no_opened_at: Some(now - Duration::hours(1)),
        };
        let trade = TradeEvent::new("t", "0xw", "m1", "No", TradeSide::Sell, 700.0, 0.3, now);

        let record = exit_from_sell(&trade, &prior, 100.0, None).unwrap();
        assert!((record.size - 700.0).abs() < 1e-6);
        assert!(!record.is_winner);
        assert_eq!(record.hold_duration_secs, 3600);

        let unopened = HedgePosition { no_opened_at: None, ..prior };
        assert!(exit_from_sell(&trade, &unopened, 100.0, None).is_none());
    }
}
