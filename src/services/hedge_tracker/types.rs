//! Hedge tracker state and its persisted snapshot

use crate::types::outcome_eq;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

pub const SNAPSHOT_VERSION: u32 = 1;

/// Exits kept per wallet for display
pub const MAX_RECENT_EXITS: usize = 20;

/// Last known Yes/No holdings of a wallet in one market
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HedgePosition {
    pub yes_size: f64,
    pub no_size: f64,
    pub yes_avg_price: f64,
    pub no_avg_price: f64,
    pub last_updated: DateTime<Utc>,
    pub is_hedged: bool,
    /// First time each side was seen open; drives hold durations
    #[serde(default)]
    pub yes_opened_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub no_opened_at: Option<DateTime<Utc>>,
}

impl HedgePosition {
    /// Both sides material in size and value
    pub fn hedged(&self, min_size: f64, min_value: f64) -> bool {
        self.yes_size >= min_size
            && self.no_size >= min_size
            && self.yes_size * self.yes_avg_price >= min_value
            && self.no_size * self.no_avg_price >= min_value
    }

    pub fn size(&self, outcome: &str) -> f64 {
        if outcome_eq(outcome, "yes") {
            self.yes_size
        } else {
            self.no_size
        }
    }

    pub fn avg_price(&self, outcome: &str) -> f64 {
        if outcome_eq(outcome, "yes") {
            self.yes_avg_price
        } else {
            self.no_avg_price
        }
    }

    pub fn opened_at(&self, outcome: &str) -> Option<DateTime<Utc>> {
        if outcome_eq(outcome, "yes") {
            self.yes_opened_at
        } else {
            self.no_opened_at
        }
    }
}

/// A significant sale out of a hedged position, awaiting market resolution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HedgeRemovalEvent {
    /// `wallet:market:unix_secs`
    pub id: String,
    pub wallet: String,
    pub market_id: String,
    #[serde(default)]
    pub market_title: String,
    #[serde(default)]
    pub market_slug: String,
    pub yes_size_before: f64,
    pub no_size_before: f64,
    pub yes_price_before: f64,
    pub no_price_before: f64,
    pub sold_side: String,
    pub sold_size: f64,
    pub sold_price: f64,
    pub yes_size_after: f64,
    pub no_size_after: f64,
    pub removed_at: DateTime<Utc>,
    pub alerted_at: Option<DateTime<Utc>>,
    pub resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
    pub winning_outcome: Option<String>,
    pub removed_loser: bool,
    pub followup_alerted: bool,
}

impl HedgeRemovalEvent {
    /// Unique per sell: several removals can land in the same second
    pub fn event_id(wallet: &str, market_id: &str, trade_id: &str, at: DateTime<Utc>) -> String {
        format!("{}:{}:{}:{}", wallet, market_id, trade_id, at.timestamp_millis())
    }

    /// Record the market result. The sale "removed the loser" when the sold side lost.
    pub fn resolve(&mut self, winning_outcome: &str, at: DateTime<Utc>) {
        self.resolved = true;
        self.resolved_at = Some(at);
        self.removed_loser = !outcome_eq(&self.sold_side, winning_outcome);
        self.winning_outcome = Some(winning_outcome.to_string());
    }

    pub fn needs_follow_up(&self) -> bool {
        self.resolved && self.removed_loser && !self.followup_alerted
    }
}

/// A closed (or partly closed) side of a position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitRecord {
    pub market_id: String,
    pub outcome: String,
    pub exit_price: f64,
    pub avg_entry_price: f64,
    pub size: f64,
    pub realized_pnl: f64,
    pub is_winner: bool,
    pub hold_duration_secs: i64,
    pub exited_at: DateTime<Utc>,
}

/// Per-wallet hold-time comparison of winning and losing exits
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AsymmetricExitStats {
    pub winning_exits: u32,
    pub losing_exits: u32,
    pub avg_win_hold: f64,
    pub avg_loss_hold: f64,
    pub total_win_hold: f64,
    pub total_loss_hold: f64,
    pub recent_exits: VecDeque<ExitRecord>,
    #[serde(default)]
    pub last_alert: Option<DateTime<Utc>>,
}

impl AsymmetricExitStats {
    pub fn record(&mut self, exit: ExitRecord) {
        let hold = exit.hold_duration_secs.max(0) as f64;
        if exit.is_winner {
            self.winning_exits += 1;
            self.total_win_hold += hold;
            self.avg_win_hold = self.total_win_hold / self.winning_exits as f64;
        } else {
            self.losing_exits += 1;
            self.total_loss_hold += hold;
            self.avg_loss_hold = self.total_loss_hold / self.losing_exits as f64;
        }
        self.recent_exits.push_back(exit);
        while self.recent_exits.len() > MAX_RECENT_EXITS {
            self.recent_exits.pop_front();
        }
    }

    pub fn total_exits(&self) -> u32 {
        self.winning_exits + self.losing_exits
    }

    /// Loss hold over win hold; None until a winning hold exists
    pub fn ratio(&self) -> Option<f64> {
        if self.avg_win_hold > 0.0 {
            Some(self.avg_loss_hold / self.avg_win_hold)
        } else {
            None
        }
    }
}

/// Slow-path state mutations queued by the trade path
#[derive(Debug, Clone)]
pub enum HedgeUpdate {
    Exit { wallet: String, record: ExitRecord },
}

/// Persisted form of the tracker (`hedge_tracker.json`)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HedgeSnapshot {
    pub version: u32,
    pub timestamp: DateTime<Utc>,
    /// wallet -> market -> position
    pub hedge_states: HashMap<String, HashMap<String, HedgePosition>>,
    pub pending_events: HashMap<String, HedgeRemovalEvent>,
    pub exit_stats: HashMap<String, AsymmetricExitStats>,
}
