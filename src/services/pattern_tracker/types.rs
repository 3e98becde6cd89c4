//! Pattern tracker records and persisted snapshot

use crate::types::TradeSide;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

pub const SNAPSHOT_VERSION: u32 = 1;

/// Timing score at or above which an exit counts as perfect
pub const PERFECT_EXIT_SCORE: f64 = 0.95;

/// A SELL waiting for the post-exit price to be known
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingExit {
    pub id: String,
    pub wallet: String,
    pub market_id: String,
    #[serde(default)]
    pub market_title: String,
    #[serde(default)]
    pub market_slug: String,
    pub outcome: String,
    pub exit_price: f64,
    pub size: f64,
    pub exited_at: DateTime<Utc>,
    pub price_after: Option<f64>,
    pub checked_at: Option<DateTime<Utc>>,
    pub timing_score: Option<f64>,
    pub verified: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExitTimingStats {
    pub verified_exits: u32,
    pub total_score: f64,
    pub avg_score: f64,
    pub perfect_exits: u32,
    #[serde(default)]
    pub last_alert: Option<DateTime<Utc>>,
}

impl ExitTimingStats {
    pub fn record(&mut self, score: f64) {
        self.verified_exits += 1;
        self.total_score += score;
        self.avg_score = self.total_score / self.verified_exits as f64;
        if score >= PERFECT_EXIT_SCORE {
            self.perfect_exits += 1;
        }
    }

    pub fn qualifies(&self, min_exits: u32, min_score: f64) -> bool {
        self.verified_exits >= min_exits && self.avg_score >= min_score
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccumulationEntry {
    pub size: f64,
    pub price: f64,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

/// Small buys of one outcome by one wallet, oldest first
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccumulationRecord {
    pub entries: VecDeque<AccumulationEntry>,
    pub last_alert: Option<DateTime<Utc>>,
}

/// A sizable trade waiting for the later price
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreMoveRecord {
    pub id: String,
    pub wallet: String,
    pub market_id: String,
    #[serde(default)]
    pub market_title: String,
    #[serde(default)]
    pub market_slug: String,
    pub outcome: String,
    pub side: TradeSide,
    pub trade_price: f64,
    pub trade_size: f64,
    pub trade_value: f64,
    pub trade_time: DateTime<Utc>,
    pub price_after: Option<f64>,
    pub checked_at: Option<DateTime<Utc>>,
    pub move_percent: Option<f64>,
    pub favorable: bool,
    pub verified: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PreMoveStats {
    pub total_trades: u32,
    pub successful_moves: u32,
    pub favorable_moves: u32,
    /// Sum of |move| over favorable moves
    pub total_move_size: f64,
    pub alpha_score: f64,
    pub avg_move_size: f64,
    pub last_updated: Option<DateTime<Utc>>,
    pub last_alert_time: Option<DateTime<Utc>>,
}

/// Persisted form of the tracker (`pattern_tracker.json`)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatternSnapshot {
    pub version: u32,
    pub timestamp: DateTime<Utc>,
    pub pending_exits: HashMap<String, PendingExit>,
    pub exit_timing_stats: HashMap<String, ExitTimingStats>,
    pub accumulations: HashMap<String, AccumulationRecord>,
    pub pending_moves: HashMap<String, PreMoveRecord>,
    pub pre_move_stats: HashMap<String, PreMoveStats>,
}
