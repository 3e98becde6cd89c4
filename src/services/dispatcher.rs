//! Trade Dispatcher - evaluates every trade against the alert catalog
//!
//! Inline rules read wallet stats and contrarian records; the stateful
//! detectors (copy, hedge, pattern) are called for every trade that passes the
//! wallet filters. Candidates are emitted in `AlertKind` order.

use crate::config::DispatcherConfig;
use crate::services::alerts::AlertEmitter;
use crate::services::contrarian::ContrarianCache;
use crate::services::copy_tracker::CopyTracker;
use crate::services::hedge_tracker::HedgeTracker;
use crate::services::metrics::Metrics;
use crate::services::pattern_tracker::PatternTracker;
use crate::services::wallet_stats::WalletStatsCache;
use crate::types::{Alert, AlertDetails, AlertKind, TradeEvent, WalletStats};
use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, info, warn};

const WALLET_PATTERN: &str = "^0x[0-9a-f]{40}$";

/// Recent trades kept per wallet for the rapid and low-activity rules
const MAX_RECENT_PER_WALLET: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq)]
struct RecentActivity {
    /// Trades inside the rapid window, this one included
    rapid_trades: usize,
    rapid_markets: usize,
    /// Earlier trades inside the low-activity window
    prior_trades: usize,
}

pub struct TradeDispatcher {
    config: RwLock<DispatcherConfig>,
    wallet_stats: Arc<WalletStatsCache>,
    contrarian: Arc<ContrarianCache>,
    copy: Arc<CopyTracker>,
    hedge: Arc<HedgeTracker>,
    pattern: Arc<PatternTracker>,
    emitter: Arc<AlertEmitter>,
    recent: RwLock<HashMap<String, VecDeque<(DateTime<Utc>, String)>>>,
    wallet_re: Option<Regex>,
    metrics: Metrics,
}

impl TradeDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: DispatcherConfig,
        wallet_stats: Arc<WalletStatsCache>,
        contrarian: Arc<ContrarianCache>,
        copy: Arc<CopyTracker>,
        hedge: Arc<HedgeTracker>,
        pattern: Arc<PatternTracker>,
        emitter: Arc<AlertEmitter>,
        metrics: Metrics,
    ) -> Self {
        Self {
            config: RwLock::new(config),
            wallet_stats,
            contrarian,
            copy,
            hedge,
            pattern,
            emitter,
            recent: RwLock::new(HashMap::new()),
            wallet_re: Regex::new(WALLET_PATTERN).ok(),
            metrics,
        }
    }

    pub async fn update_config(&self, config: DispatcherConfig) {
        *self.config.write().await = config;
    }

    fn valid_wallet(&self, wallet: &str) -> bool {
        match &self.wallet_re {
            Some(re) => re.is_match(wallet),
            None => !wallet.is_empty(),
        }
    }

    /// Evaluate a trade and emit its alerts. Returns the alerts that survived dedup.
    pub async fn process_trade(&self, trade: &TradeEvent) -> Vec<Alert> {
        let candidates = self.evaluate(trade).await;
        let mut emitted = Vec::with_capacity(candidates.len());
        for alert in candidates {
            if self.emitter.emit(alert.clone()).await {
                emitted.push(alert);
            }
        }
        emitted
    }

    /// Alert candidates for a trade in emission order, without emitting them
    pub async fn evaluate(&self, trade: &TradeEvent) -> Vec<Alert> {
        self.metrics.inc_trades_received();
        let config = self.config.read().await.clone();

        if !self.valid_wallet(&trade.wallet) {
            self.metrics.inc_skipped_missing_wallet();
            debug!("[Dispatcher] Skipping trade {} without a usable wallet", trade.id);
            return Vec::new();
        }
        if config.monitored_only && !config.monitored_wallets.iter().any(|w| w == &trade.wallet) {
            self.metrics.inc_skipped_unmonitored();
            return Vec::new();
        }

        let activity = self.record_recent(trade, &config).await;

        let leader = self
            .copy
            .check_for_copy(&trade.wallet, &trade.market_id, &trade.token_id, trade.side, trade.timestamp)
            .await;

        let mut alerts = self.hedge.process_trade(trade).await;
        alerts.extend(self.pattern.process_trade(trade).await);

        let notional = trade.notional();
        if notional < config.min_notional {
            self.metrics.inc_skipped_low_notional();
            return self.finish(alerts);
        }

        let stats = if notional >= config.stats_min_notional {
            self.wallet_stats.get_stats(&trade.wallet).await
        } else {
            self.wallet_stats.peek(&trade.wallet).await
        };

        if self.copy.is_leader(&trade.wallet, stats.as_ref()).await {
            self.copy
                .record_leader_trade(&trade.wallet, &trade.market_id, &trade.token_id, trade.side, trade.timestamp)
                .await;
        }

        let mut inline = self.inline_rules(trade, stats.as_ref(), activity, &config).await;

        if let Some(leader) = leader {
            if self.copy.should_alert(&trade.wallet).await {
                let copy_count = self.copy.copy_count(&trade.wallet).await;
                inline.push(Alert::from_trade(trade, AlertDetails::CopyTrader { leader, copy_count }));
            }
        }

        // Buying the favorite at an obvious price is only interesting when something else fired
        if trade.price >= config.obvious_price && inline.iter().all(|a| a.kind == AlertKind::ExtremeBet) {
            self.metrics.inc_skipped_obvious_price();
            inline.clear();
        }

        alerts.extend(inline);
        self.finish(alerts)
    }

    fn finish(&self, mut alerts: Vec<Alert>) -> Vec<Alert> {
        alerts.sort_by_key(|a| a.kind);
        self.metrics.inc_trades_processed();
        alerts
    }

    async fn inline_rules(
        &self,
        trade: &TradeEvent,
        stats: Option<&WalletStats>,
        activity: RecentActivity,
        config: &DispatcherConfig,
    ) -> Vec<Alert> {
        let mut alerts = Vec::new();
        let price = trade.price;
        let notional = trade.notional();
        let low = config.extreme_low_price;
        let at_edge = price <= low || price >= 1.0 - low;

        if let Some(stats) = stats {
            if let Some(win_rate) = stats.win_rate() {
                if trade.is_buy()
                    && stats.resolved() >= config.high_win_rate_min_resolved
                    && win_rate >= config.high_win_rate_threshold
                    && price <= config.high_win_rate_max_entry_price
                {
                    alerts.push(Alert::from_trade(
                        trade,
                        AlertDetails::HighWinRate {
                            win_rate,
                            resolved: stats.resolved(),
                        },
                    ));
                }
            }
        }

        if self.contrarian.should_alert(&trade.wallet).await {
            if let Some(record) = self.contrarian.get_stats(&trade.wallet).await {
                alerts.push(Alert::from_trade(
                    trade,
                    AlertDetails::ContrarianWinner {
                        wins: record.wins,
                        losses: record.losses,
                        rate: record.rate(),
                    },
                ));
            }
        }

        if notional >= config.massive_trade_threshold && price <= config.massive_trade_max_price {
            alerts.push(Alert::from_trade(trade, AlertDetails::MassiveTrade { notional }));
        }

        let minority_side = (trade.is_buy() && price <= low) || (trade.is_sell() && price >= 1.0 - low);
        if minority_side && notional >= config.contrarian_min_notional {
            self.contrarian.track_bet(trade).await;
            alerts.push(Alert::from_trade(trade, AlertDetails::ContrarianBet { price, notional }));
        }

        if at_edge && notional >= config.extreme_min_notional {
            alerts.push(Alert::from_trade(trade, AlertDetails::ExtremeBet { price, notional }));
        }

        if let Some(stats) = stats {
            if stats.unique_markets <= config.new_wallet_max_markets && notional >= config.new_wallet_min_notional {
                alerts.push(Alert::from_trade(
                    trade,
                    AlertDetails::NewWallet {
                        unique_markets: stats.unique_markets,
                        notional,
                    },
                ));
            }

            if activity.prior_trades <= config.low_activity_max_trades
                && stats.unique_markets <= config.low_activity_max_markets
                && notional >= config.low_activity_min_notional
            {
                alerts.push(Alert::from_trade(
                    trade,
                    AlertDetails::LowActivity {
                        recent_trades: activity.prior_trades,
                        unique_markets: stats.unique_markets,
                        notional,
                    },
                ));
            }
        }

        if activity.rapid_trades >= config.rapid_trade_threshold {
            alerts.push(Alert::from_trade(
                trade,
                AlertDetails::RapidTrading {
                    trades_in_window: activity.rapid_trades,
                    markets_in_window: activity.rapid_markets,
                    window_secs: config.rapid_window_secs,
                },
            ));
        }

        alerts
    }

    /// Append the trade to the wallet's ring and summarize the windows around it
    async fn record_recent(&self, trade: &TradeEvent, config: &DispatcherConfig) -> RecentActivity {
        let retention = Duration::seconds(config.rapid_window_secs.max(config.low_activity_window_secs));
        let rapid_cutoff = trade.timestamp - Duration::seconds(config.rapid_window_secs);
        let low_cutoff = trade.timestamp - Duration::seconds(config.low_activity_window_secs);

        let mut recent = self.recent.write().await;
        if !recent.contains_key(&trade.wallet) && recent.len() >= config.max_tracked_wallets.max(1) {
            let oldest = recent
                .iter()
                .min_by_key(|(_, ring)| ring.back().map(|(at, _)| *at))
                .map(|(w, _)| w.clone());
            if let Some(wallet) = oldest {
                recent.remove(&wallet);
            }
        }

        let ring = recent.entry(trade.wallet.clone()).or_default();
        while ring.front().map(|(at, _)| trade.timestamp - *at > retention).unwrap_or(false) {
            ring.pop_front();
        }

        let prior_trades = ring.iter().filter(|(at, _)| *at >= low_cutoff).count();

        if ring.len() >= MAX_RECENT_PER_WALLET {
            ring.pop_front();
        }
        ring.push_back((trade.timestamp, trade.market_id.clone()));

        let mut markets = HashSet::new();
        let rapid_trades = ring
            .iter()
            .filter(|(at, _)| *at >= rapid_cutoff)
            .inspect(|(_, market)| {
                markets.insert(market.as_str());
            })
            .count();

        RecentActivity {
            rapid_trades,
            rapid_markets: markets.len(),
            prior_trades,
        }
    }

    /// Drop ring entries past every window. Returns the number of wallets removed.
    pub async fn prune_recent(&self, now: DateTime<Utc>) -> usize {
        let retention = {
            let config = self.config.read().await;
            Duration::seconds(config.rapid_window_secs.max(config.low_activity_window_secs))
        };
        let mut recent = self.recent.write().await;
        let before = recent.len();
        for ring in recent.values_mut() {
            ring.retain(|(at, _)| now - *at <= retention);
        }
        recent.retain(|_, ring| !ring.is_empty());
        before - recent.len()
    }

    pub async fn tracked_wallets(&self) -> usize {
        self.recent.read().await.len()
    }

    /// Consume trades until shutdown, then process whatever is still queued
    pub async fn run(
        self: Arc<Self>,
        mut trade_rx: mpsc::Receiver<TradeEvent>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        info!("[Dispatcher] Started");
        loop {
            tokio::select! {
                maybe_trade = trade_rx.recv() => {
                    let Some(trade) = maybe_trade else {
                        warn!("[Dispatcher] Trade channel closed");
                        break;
                    };
                    let emitted = self.process_trade(&trade).await;
                    if !emitted.is_empty() {
                        debug!(
                            "[Dispatcher] {} alerts for {} in {}",
                            emitted.len(), trade.wallet, trade.market_id
                        );
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        trade_rx.close();
        let mut drained = 0;
        while let Some(trade) = trade_rx.recv().await {
            self.process_trade(&trade).await;
            drained += 1;
        }
        if drained > 0 {
            debug!("[Dispatcher] Processed {} queued trades on shutdown", drained);
        }
        info!("[Dispatcher] Stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AlertConfig, ContrarianConfig, CopyConfig, HedgeConfig, PatternConfig, WalletStatsConfig};
    use crate::services::dashboard::Dashboard;
    use crate::storage::BlobStorage;
    use crate::types::{Position, TradeSide, UserActivity};
    use crate::venue::StaticVenue;

    const WALLET: &str = "0x1111111111111111111111111111111111111111";
    const LEADER: &str = "0x2222222222222222222222222222222222222222";

    struct Fixture {
        venue: Arc<StaticVenue>,
        contrarian: Arc<ContrarianCache>,
        copy: Arc<CopyTracker>,
        dispatcher: TradeDispatcher,
        metrics: Metrics,
    }

    fn fixture(config: DispatcherConfig) -> Fixture {
        let metrics = Metrics::new();
        let storage = Arc::new(BlobStorage::disabled());
        let venue = Arc::new(StaticVenue::new());
        let wallet_stats = Arc::new(WalletStatsCache::new(venue.clone(), WalletStatsConfig::default(), metrics.clone()));
        let contrarian = Arc::new(ContrarianCache::new(
            storage.clone(),
            venue.clone(),
            ContrarianConfig::default(),
            metrics.clone(),
        ));
        let copy = Arc::new(CopyTracker::new(
            CopyConfig {
                min_copy_count: 1,
                ..Default::default()
            },
            contrarian.clone(),
        ));
        let hedge = Arc::new(HedgeTracker::new(storage.clone(), venue.clone(), HedgeConfig::default(), metrics.clone()));
        let pattern = Arc::new(PatternTracker::new(
            storage,
            venue.clone(),
            PatternConfig {
                enabled: false,
                ..Default::default()
            },
            metrics.clone(),
        ));
        let emitter = Arc::new(AlertEmitter::new(
            AlertConfig::default(),
            Arc::new(Dashboard::new(&AlertConfig::default())),
            metrics.clone(),
        ));
        let dispatcher = TradeDispatcher::new(
            config,
            wallet_stats,
            contrarian.clone(),
            copy.clone(),
            hedge,
            pattern,
            emitter,
            metrics.clone(),
        );
        Fixture {
            venue,
            contrarian,
            copy,
            dispatcher,
            metrics,
        }
    }

    fn trade(wallet: &str, side: TradeSide, size: f64, price: f64) -> TradeEvent {
        TradeEvent::new("t1", wallet, "m1", "Yes", side, size, price, Utc::now()).with_token("tok1")
    }

    fn activity(wins: usize, markets: usize) -> Vec<UserActivity> {
        let mut items: Vec<UserActivity> = (0..markets)
            .map(|i| UserActivity {
                activity_type: "TRADE".into(),
                condition_id: format!("c{}", i),
                ..Default::default()
            })
            .collect();
        items.extend((0..wins).map(|i| UserActivity {
            activity_type: "REDEEM".into(),
            condition_id: format!("c{}", i),
            usdc_size: 100.0,
            ..Default::default()
        }));
        items
    }

    fn kinds(alerts: &[Alert]) -> Vec<AlertKind> {
        alerts.iter().map(|a| a.kind).collect()
    }

    #[tokio::test]
    async fn test_invalid_wallet_is_skipped() {
        let f = fixture(DispatcherConfig::default());
        let alerts = f.dispatcher.evaluate(&trade("", TradeSide::Buy, 100_000.0, 0.5)).await;
        assert!(alerts.is_empty());
        let alerts = f.dispatcher.evaluate(&trade("not-a-wallet", TradeSide::Buy, 100_000.0, 0.5)).await;
        assert!(alerts.is_empty());
        assert_eq!(f.metrics.snapshot().skipped_missing_wallet, 2);
    }

    #[tokio::test]
    async fn test_monitored_filter() {
        let f = fixture(DispatcherConfig {
            monitored_only: true,
            monitored_wallets: vec![LEADER.to_string()],
            ..Default::default()
        });
        let alerts = f.dispatcher.evaluate(&trade(WALLET, TradeSide::Buy, 100_000.0, 0.5)).await;
        assert!(alerts.is_empty());
        assert_eq!(f.metrics.snapshot().skipped_unmonitored, 1);
    }

    #[tokio::test]
    async fn test_low_notional_skips_inline_rules() {
        let f = fixture(DispatcherConfig::default());
        let alerts = f.dispatcher.evaluate(&trade(WALLET, TradeSide::Buy, 100.0, 0.5)).await;
        assert!(alerts.is_empty());
        assert_eq!(f.metrics.snapshot().skipped_low_notional, 1);
    }

    #[tokio::test]
    async fn test_massive_trade_and_new_wallet() {
        let f = fixture(DispatcherConfig::default());
        f.venue.set_activity(WALLET, activity(0, 1));
        let alerts = f.dispatcher.evaluate(&trade(WALLET, TradeSide::Buy, 60_000.0, 0.5)).await;
        assert_eq!(
            kinds(&alerts),
            vec![AlertKind::MassiveTrade, AlertKind::NewWallet, AlertKind::LowActivity]
        );
    }

    #[tokio::test]
    async fn test_high_win_rate_requires_buy_below_max_entry() {
        let f = fixture(DispatcherConfig::default());
        f.venue.set_activity(WALLET, activity(9, 12));
        // One settled loss on top of nine redeemed wins
        let lost = Position {
            condition_id: "c20".into(),
            ..Position::new("Yes", 10.0, 0.5, 0.0).redeemable()
        };
        f.venue.set_wallet_positions(WALLET, vec![lost]);

        let alerts = f.dispatcher.evaluate(&trade(WALLET, TradeSide::Buy, 2_000.0, 0.5)).await;
        assert_eq!(kinds(&alerts), vec![AlertKind::HighWinRate]);
        match &alerts[0].details {
            AlertDetails::HighWinRate { win_rate, resolved } => {
                assert_eq!(*resolved, 10);
                assert!((win_rate - 0.9).abs() < 1e-6);
            }
            other => panic!("unexpected {:?}", other),
        }

        let alerts = f.dispatcher.evaluate(&trade(WALLET, TradeSide::Sell, 2_000.0, 0.5)).await;
        assert!(alerts.is_empty());
    }

    #[tokio::test]
    async fn test_contrarian_bet_registers_pending_bet() {
        let f = fixture(DispatcherConfig::default());
        let alerts = f.dispatcher.evaluate(&trade(WALLET, TradeSide::Buy, 100_000.0, 0.03)).await;
        assert_eq!(kinds(&alerts), vec![AlertKind::ContrarianBet, AlertKind::ExtremeBet]);
        assert_eq!(f.contrarian.pending_bets().await, 1);
    }

    #[tokio::test]
    async fn test_contrarian_winner_from_record() {
        let f = fixture(DispatcherConfig::default());
        for _ in 0..4 {
            f.contrarian.apply_result(WALLET, true).await;
        }
        let alerts = f.dispatcher.evaluate(&trade(WALLET, TradeSide::Buy, 400.0, 0.5)).await;
        assert_eq!(kinds(&alerts), vec![AlertKind::ContrarianWinner]);
    }

    #[tokio::test]
    async fn test_obvious_price_without_other_signal_is_skipped() {
        let f = fixture(DispatcherConfig::default());
        let alerts = f.dispatcher.evaluate(&trade(WALLET, TradeSide::Buy, 2_000.0, 0.98)).await;
        assert!(alerts.is_empty());
        assert_eq!(f.metrics.snapshot().skipped_obvious_price, 1);

        // Selling the favorite at the same price is a contrarian bet
        let alerts = f.dispatcher.evaluate(&trade(WALLET, TradeSide::Sell, 5_000.0, 0.98)).await;
        assert_eq!(kinds(&alerts), vec![AlertKind::ContrarianBet, AlertKind::ExtremeBet]);
    }

    #[tokio::test]
    async fn test_rapid_trading_counts_markets() {
        let f = fixture(DispatcherConfig {
            rapid_trade_threshold: 3,
            ..Default::default()
        });
        let now = Utc::now();
        let mut last = Vec::new();
        for i in 0..3 {
            let t = TradeEvent::new(
                format!("t{}", i),
                WALLET,
                &format!("m{}", i % 2),
                "Yes",
                TradeSide::Buy,
                400.0,
                0.5,
                now + Duration::seconds(i),
            );
            last = f.dispatcher.evaluate(&t).await;
        }
        match last.iter().find(|a| a.kind == AlertKind::RapidTrading).map(|a| &a.details) {
            Some(AlertDetails::RapidTrading { trades_in_window, markets_in_window, .. }) => {
                assert_eq!(*trades_in_window, 3);
                assert_eq!(*markets_in_window, 2);
            }
            other => panic!("expected rapid trading, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_copy_trader_alert() {
        let f = fixture(DispatcherConfig::default());
        for _ in 0..4 {
            f.contrarian.apply_result(LEADER, true).await;
        }
        f.copy
            .record_leader_trade(LEADER, "m1", "tok1", TradeSide::Buy, Utc::now() - Duration::seconds(30))
            .await;

        let alerts = f.dispatcher.evaluate(&trade(WALLET, TradeSide::Buy, 400.0, 0.5)).await;
        match alerts.iter().find(|a| a.kind == AlertKind::CopyTrader).map(|a| &a.details) {
            Some(AlertDetails::CopyTrader { leader, copy_count }) => {
                assert_eq!(leader, LEADER);
                assert_eq!(*copy_count, 1);
            }
            other => panic!("expected copy alert, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_prune_recent() {
        let f = fixture(DispatcherConfig::default());
        f.dispatcher.evaluate(&trade(WALLET, TradeSide::Buy, 10.0, 0.5)).await;
        assert_eq!(f.dispatcher.tracked_wallets().await, 1);
        assert_eq!(f.dispatcher.prune_recent(Utc::now()).await, 0);
        assert_eq!(f.dispatcher.prune_recent(Utc::now() + Duration::days(2)).await, 1);
    }

    #[tokio::test]
    async fn test_run_processes_queued_trades_on_shutdown() {
        let f = fixture(DispatcherConfig::default());
        let dispatcher = Arc::new(f.dispatcher);
        let (trade_tx, trade_rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        for i in 0..3 {
            let mut t = trade(WALLET, TradeSide::Buy, 10.0, 0.5);
            t.id = format!("t{}", i);
            trade_tx.send(t).await.unwrap();
        }
        shutdown_tx.send_replace(true);
        dispatcher.run(trade_rx, shutdown_rx).await;

        assert_eq!(f.metrics.snapshot().trades_received, 3);
        assert!(trade_tx.try_send(trade(WALLET, TradeSide::Buy, 10.0, 0.5)).is_err());
    }
}
