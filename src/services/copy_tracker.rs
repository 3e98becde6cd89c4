//! Copy-trade detection
//!
//! Recent trades by proven wallets ("leaders") sit in a sliding window. A trade
//! by any other wallet that replays a leader's (market, token, side) inside the
//! window counts as a copy for that follower.

use crate::config::CopyConfig;
use crate::services::contrarian::ContrarianCache;
use crate::types::{normalize_wallet, TradeSide, WalletStats};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LeaderTrade {
    pub leader: String,
    pub market_id: String,
    pub token_id: String,
    pub side: TradeSide,
    pub timestamp: DateTime<Utc>,
}

pub struct CopyTracker {
    config: RwLock<CopyConfig>,
    leader_trades: RwLock<VecDeque<LeaderTrade>>,
    copy_counts: RwLock<HashMap<String, u32>>,
    contrarian: Arc<ContrarianCache>,
}

impl CopyTracker {
    pub fn new(config: CopyConfig, contrarian: Arc<ContrarianCache>) -> Self {
        Self {
            config: RwLock::new(config),
            leader_trades: RwLock::new(VecDeque::new()),
            copy_counts: RwLock::new(HashMap::new()),
            contrarian,
        }
    }

    pub async fn update_config(&self, config: CopyConfig) {
        *self.config.write().await = config;
    }

    /// A wallet leads when its resolved record is strong or it is a proven contrarian
    pub async fn is_leader(&self, wallet: &str, stats: Option<&WalletStats>) -> bool {
        let (min_resolved, min_win_rate) = {
            let config = self.config.read().await;
            (config.leader_min_resolved, config.leader_min_win_rate)
        };
        if let Some(stats) = stats {
            if stats.resolved() >= min_resolved && stats.win_rate().unwrap_or(0.0) >= min_win_rate {
                return true;
            }
        }
        self.contrarian.should_alert(wallet).await
    }

    pub async fn record_leader_trade(
        &self,
        leader: &str,
        market_id: &str,
        token_id: &str,
        side: TradeSide,
        timestamp: DateTime<Utc>,
    ) {
        let max = self.config.read().await.max_leader_trades.max(1);
        let mut trades = self.leader_trades.write().await;
        if trades.len() >= max {
            trades.pop_front();
        }
        trades.push_back(LeaderTrade {
            leader: normalize_wallet(leader),
            market_id: market_id.to_lowercase(),
            token_id: token_id.to_string(),
            side,
            timestamp,
        });
    }

    /// Returns the leader being copied, earliest matching leader trade first.
    /// A match bumps the follower's copy count.
    pub async fn check_for_copy(
        &self,
        follower: &str,
        market_id: &str,
        token_id: &str,
        side: TradeSide,
        now: DateTime<Utc>,
    ) -> Option<String> {
        let follower = normalize_wallet(follower);
        let market_id = market_id.to_lowercase();
        let window = Duration::seconds(self.config.read().await.window_secs);

        let leader = {
            let trades = self.leader_trades.read().await;
            trades
                .iter()
                .find(|t| {
                    let age = now - t.timestamp;
                    t.leader != follower
                        && t.market_id == market_id
                        && t.token_id == token_id
                        && t.side == side
                        && age >= Duration::zero()
                        && age <= window
                })
                .map(|t| t.leader.clone())
        }?;

        let count = {
            let mut counts = self.copy_counts.write().await;
            let count = counts.entry(follower.clone()).or_insert(0);
            *count += 1;
            *count
        };
        debug!("[CopyTracker] {} copied {} ({} copies)", follower, leader, count);
        Some(leader)
    }

    pub async fn should_alert(&self, follower: &str) -> bool {
        let min = self.config.read().await.min_copy_count;
        self.copy_count(follower).await >= min
    }

    pub async fn copy_count(&self, wallet: &str) -> u32 {
        self.copy_counts
            .read()
            .await
            .get(&normalize_wallet(wallet))
            .copied()
            .unwrap_or(0)
    }

    /// Drop leader trades older than the window. Returns the number removed.
    pub async fn prune_old_trades(&self, now: DateTime<Utc>) -> usize {
        let window = Duration::seconds(self.config.read().await.window_secs);
        let mut trades = self.leader_trades.write().await;
        let before = trades.len();
        trades.retain(|t| now - t.timestamp <= window);
        before - trades.len()
    }

    /// Followers with the most copies, highest first
    pub async fn get_top_copiers(&self, n: usize) -> Vec<(String, u32)> {
        let counts = self.copy_counts.read().await;
        let mut top: Vec<(String, u32)> = counts.iter().map(|(w, c)| (w.clone(), *c)).collect();
        top.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        top.truncate(n);
        top
    }

    pub async fn reset_copy_count(&self, wallet: &str) {
        self.copy_counts.write().await.remove(&normalize_wallet(wallet));
    }

    pub async fn leader_trade_count(&self) -> usize {
        self.leader_trades.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ContrarianConfig;
    use crate::services::metrics::Metrics;
    use crate::storage::BlobStorage;
    use crate::venue::StaticVenue;

    fn tracker() -> CopyTracker {
        let contrarian = Arc::new(ContrarianCache::new(
            Arc::new(BlobStorage::disabled()),
            Arc::new(StaticVenue::new()),
            ContrarianConfig::default(),
            Metrics::new(),
        ));
        CopyTracker::new(CopyConfig::default(), contrarian)
    }

    #[tokio::test]
    async fn test_follower_replay_is_a_copy() {
        let tracker = tracker();
        let now = Utc::now();
        tracker
            .record_leader_trade("0xL", "m1", "token1", TradeSide::Buy, now - Duration::seconds(30))
            .await;

        let leader = tracker
            .check_for_copy("0xF", "m1", "token1", TradeSide::Buy, now)
            .await;
        assert_eq!(leader.as_deref(), Some("0xl"));
        assert_eq!(tracker.copy_count("0xf").await, 1);
        assert!(!tracker.should_alert("0xf").await);
    }

    #[tokio::test]
    async fn test_self_match_and_mismatches_rejected() {
        let tracker = tracker();
        let now = Utc::now();
        tracker.record_leader_trade("0xl", "m1", "token1", TradeSide::Buy, now).await;

        assert!(tracker.check_for_copy("0xL", "m1", "token1", TradeSide::Buy, now).await.is_none());
        assert!(tracker.check_for_copy("0xf", "m1", "token1", TradeSide::Sell, now).await.is_none());
        assert!(tracker.check_for_copy("0xf", "m1", "token2", TradeSide::Buy, now).await.is_none());
        assert!(tracker
            .check_for_copy("0xf", "m1", "token1", TradeSide::Buy, now + Duration::seconds(301))
            .await
            .is_none());
        assert_eq!(tracker.copy_count("0xf").await, 0);
    }

    #[tokio::test]
    async fn test_earliest_leader_wins_tie() {
        let tracker = tracker();
        let now = Utc::now();
        tracker
            .record_leader_trade("0xa", "m1", "t", TradeSide::Buy, now - Duration::seconds(60))
            .await;
        tracker
            .record_leader_trade("0xb", "m1", "t", TradeSide::Buy, now - Duration::seconds(10))
            .await;
        let leader = tracker.check_for_copy("0xf", "m1", "t", TradeSide::Buy, now).await;
        assert_eq!(leader.as_deref(), Some("0xa"));
    }

    #[tokio::test]
    async fn test_alert_threshold_and_reset() {
        let tracker = tracker();
        let now = Utc::now();
        tracker.record_leader_trade("0xl", "m1", "t", TradeSide::Buy, now).await;
        for _ in 0..3 {
            tracker.check_for_copy("0xf", "m1", "t", TradeSide::Buy, now).await;
        }
        assert!(tracker.should_alert("0xf").await);
        assert_eq!(tracker.get_top_copiers(5).await, vec![("0xf".to_string(), 3)]);

        tracker.reset_copy_count("0xF").await;
        assert!(!tracker.should_alert("0xf").await);
    }

    #[tokio::test]
    async fn test_prune_old_trades() {
        let tracker = tracker();
        let now = Utc::now();
        tracker
            .record_leader_trade("0xl", "m1", "t", TradeSide::Buy, now - Duration::seconds(600))
            .await;
        tracker.record_leader_trade("0xl", "m2", "t", TradeSide::Buy, now).await;
        assert_eq!(tracker.prune_old_trades(now).await, 1);
        assert_eq!(tracker.leader_trade_count().await, 1);
    }

    #[tokio::test]
    async fn test_leader_predicate() {
        let tracker = tracker();
        let strong = WalletStats {
            wallet: "0xl".into(),
            wins: 8,
            losses: 2,
            unique_markets: 12,
            last_refresh: Utc::now(),
        };
        assert!(tracker.is_leader("0xl", Some(&strong)).await);

        let weak = WalletStats { wins: 5, losses: 5, ..strong };
        assert!(!tracker.is_leader("0xl", Some(&weak)).await);
        assert!(!tracker.is_leader("0xl", None).await);
    }
}
