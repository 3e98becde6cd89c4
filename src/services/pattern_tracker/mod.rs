//! Pattern Tracker - behavioral detectors that need memory or a second look
//!
//! - Conviction doubling and stealth accumulation fire inline on BUYs.
//! - Perfect exit timing and pre-move positioning record trades into
//!   reservoirs that are verified once the check delay has passed; verified
//!   results build per-wallet scores that alert when they cross thresholds.
//!
//! All four share one state lock, one dirty flag and one save loop.

pub mod conviction;
pub mod exit_timing;
pub mod pre_move;
pub mod stealth;
pub mod types;

use crate::config::PatternConfig;
use crate::services::metrics::Metrics;
use crate::services::rate_limiter::RateLimiter;
use crate::services::FINAL_SAVE_TIMEOUT;
use crate::storage::BlobStorage;
use crate::types::{normalize_wallet, outcome_eq, Alert, AlertDetails, TradeEvent};
use crate::venue::{VenueClient, TRADES_PAGE_SIZE};
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::time::interval;
use tracing::{debug, error, info, warn};

pub use exit_timing::{best_price_after, timing_score};
pub use stealth::accumulation_key;
pub use types::{
    AccumulationEntry, AccumulationRecord, ExitTimingStats, PatternSnapshot, PendingExit, PreMoveRecord,
    PreMoveStats, PERFECT_EXIT_SCORE, SNAPSHOT_VERSION,
};

pub const PATTERN_FILE: &str = "pattern_tracker.json";

#[derive(Debug, Default)]
struct PatternState {
    pending_exits: HashMap<String, PendingExit>,
    exit_stats: HashMap<String, ExitTimingStats>,
    accumulations: HashMap<String, AccumulationRecord>,
    pending_moves: HashMap<String, PreMoveRecord>,
    pre_move_stats: HashMap<String, PreMoveStats>,
}

/// Remove the entry with the smallest sort key
fn evict_oldest<V, K: Ord>(map: &mut HashMap<String, V>, key_of: impl Fn(&V) -> K) {
    let oldest = map
        .iter()
        .min_by_key(|(_, v)| key_of(v))
        .map(|(k, _)| k.clone());
    if let Some(k) = oldest {
        map.remove(&k);
    }
}

pub struct PatternTracker {
    storage: Arc<BlobStorage>,
    venue: Arc<dyn VenueClient>,
    config: RwLock<PatternConfig>,
    state: RwLock<PatternState>,
    limiter: RateLimiter,
    dirty: AtomicBool,
    metrics: Metrics,
}

impl PatternTracker {
    pub fn new(
        storage: Arc<BlobStorage>,
        venue: Arc<dyn VenueClient>,
        config: PatternConfig,
        metrics: Metrics,
    ) -> Self {
        let limiter = RateLimiter::new(
            "PatternTracker",
            config.max_checks_per_minute,
            config.check_cooldown_secs,
        );
        Self {
            storage,
            venue,
            config: RwLock::new(config),
            state: RwLock::new(PatternState::default()),
            limiter,
            dirty: AtomicBool::new(false),
            metrics,
        }
    }

    pub async fn update_config(&self, config: PatternConfig) {
        self.limiter
            .set_limits(config.max_checks_per_minute, config.check_cooldown_secs)
            .await;
        *self.config.write().await = config;
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    pub async fn process_trade(&self, trade: &TradeEvent) -> Vec<Alert> {
        let config = self.config.read().await.clone();
        if !config.enabled {
            return Vec::new();
        }
        let mut alerts = Vec::new();

        if trade.is_buy() {
            if let Some(alert) = self.check_conviction(trade, &config).await {
                alerts.push(alert);
            }
            if let Some(alert) = self.check_stealth(trade, &config).await {
                alerts.push(alert);
            }
        } else {
            self.record_exit(trade, &config).await;
            if let Some(stats) = self.perfect_timing_alert(&trade.wallet, trade.timestamp, &config).await {
                alerts.push(Alert::from_trade(trade, perfect_timing_details(&stats)));
            }
        }

        if trade.notional() >= config.pre_move_min_notional {
            self.record_pre_move(trade, &config).await;
            if let Some(stats) = self.pre_move_alert(&trade.wallet, trade.timestamp, &config).await {
                alerts.push(Alert::from_trade(trade, pre_move_details(&stats)));
            }
        }

        alerts
    }

    async fn check_conviction(&self, trade: &TradeEvent, config: &PatternConfig) -> Option<Alert> {
        if !conviction::qualifies(trade, config) {
            return None;
        }
        if !self.limiter.try_acquire(&trade.wallet_market_key()).await {
            self.metrics.inc_rate_limited();
            return None;
        }

        self.metrics.inc_venue_calls();
        let positions = match self
            .venue
            .get_positions(&trade.wallet, Some(&trade.market_id), 10)
            .await
        {
            Ok(p) => p,
            Err(e) => {
                self.metrics.inc_venue_errors();
                warn!("[PatternTracker] Position fetch failed for {}: {}", trade.wallet, e);
                return None;
            }
        };

        let details = conviction::evaluate(trade, &positions, config)?;
        info!(
            "[PatternTracker] {} doubled down on {} in {}",
            trade.wallet, trade.outcome, trade.market_id
        );
        Some(Alert::from_trade(trade, details))
    }

    async fn check_stealth(&self, trade: &TradeEvent, config: &PatternConfig) -> Option<Alert> {
        if trade.notional() > config.stealth_max_single_trade {
            return None;
        }
        let window = Duration::seconds(config.stealth_window_secs);
        let key = accumulation_key(trade);

        let mut state = self.state.write().await;
        if !state.accumulations.contains_key(&key)
            && state.accumulations.len() >= config.max_pending_records.max(1)
        {
            evict_oldest(&mut state.accumulations, |r| r.entries.back().map(|e| e.timestamp));
        }
        let record = state.accumulations.entry(key).or_default();
        record.add(trade, window);
        let details = record.evaluate(trade.timestamp, config);
        self.mark_dirty();
        drop(state);

        let details = details?;
        info!(
            "[PatternTracker] {} accumulating {} in {}",
            trade.wallet, trade.outcome, trade.market_id
        );
        Some(Alert::from_trade(trade, details))
    }

    async fn record_exit(&self, trade: &TradeEvent, config: &PatternConfig) {
        let exit = PendingExit::from_trade(trade);
        let mut state = self.state.write().await;
        if !state.pending_exits.contains_key(&exit.id)
            && state.pending_exits.len() >= config.max_pending_records.max(1)
        {
            evict_oldest(&mut state.pending_exits, |e| e.exited_at);
        }
        state.pending_exits.insert(exit.id.clone(), exit);
        self.mark_dirty();
    }

    async fn record_pre_move(&self, trade: &TradeEvent, config: &PatternConfig) {
        let record = PreMoveRecord::from_trade(trade);
        let mut state = self.state.write().await;
        if !state.pending_moves.contains_key(&record.id)
            && state.pending_moves.len() >= config.max_pending_records.max(1)
        {
            evict_oldest(&mut state.pending_moves, |r| r.trade_time);
        }
        state.pending_moves.insert(record.id.clone(), record);
        self.mark_dirty();
    }

    pub async fn should_alert_perfect_timing(&self, wallet: &str) -> bool {
        let (min_exits, min_score) = {
            let config = self.config.read().await;
            (config.exit_min_exits, config.exit_min_score)
        };
        let state = self.state.read().await;
        state
            .exit_stats
            .get(&normalize_wallet(wallet))
            .map(|s| s.qualifies(min_exits, min_score))
            .unwrap_or(false)
    }

    /// Qualifying stats outside the cooldown; stamps the alert time
    async fn perfect_timing_alert(
        &self,
        wallet: &str,
        now: DateTime<Utc>,
        config: &PatternConfig,
    ) -> Option<ExitTimingStats> {
        let cooldown = Duration::seconds(config.exit_alert_cooldown_secs);
        let mut state = self.state.write().await;
        let stats = state.exit_stats.get_mut(wallet)?;
        if !stats.qualifies(config.exit_min_exits, config.exit_min_score) {
            return None;
        }
        if stats.last_alert.map(|t| now - t < cooldown).unwrap_or(false) {
            return None;
        }
        stats.last_alert = Some(now);
        self.mark_dirty();
        Some(stats.clone())
    }

    async fn pre_move_alert(&self, wallet: &str, now: DateTime<Utc>, config: &PatternConfig) -> Option<PreMoveStats> {
        let cooldown = Duration::seconds(config.pre_move_alert_cooldown_secs);
        let mut state = self.state.write().await;
        let stats = state.pre_move_stats.get_mut(wallet)?;
        if !stats.qualifies(config.pre_move_min_trades, config.pre_move_min_alpha) || !stats.cooled_down(now, cooldown) {
            return None;
        }
        stats.last_alert_time = Some(now);
        self.mark_dirty();
        Some(stats.clone())
    }

    /// Verify due exits against the prices traded after them. Returns alerts for
    /// wallets whose timing record now qualifies.
    pub async fn verify_exits_at(&self, now: DateTime<Utc>) -> Vec<Alert> {
        let config = self.config.read().await.clone();
        let delay = Duration::seconds(config.exit_check_delay_secs);

        let mut due: Vec<PendingExit> = {
            let state = self.state.read().await;
            state
                .pending_exits
                .values()
                .filter(|e| e.is_due(now, delay))
                .cloned()
                .collect()
        };
        due.sort_by_key(|e| e.exited_at);

        let mut budget = config.max_verifications_per_cycle;
        let mut prices = Vec::new();
        for exit in &due {
            if budget == 0 {
                break;
            }
            budget -= 1;
            self.metrics.inc_venue_calls();
            let mut price = match self.venue.get_market_trades(&exit.market_id, TRADES_PAGE_SIZE, 0).await {
                Ok(trades) => best_price_after(&trades, &exit.outcome, exit.exited_at, exit.exited_at + delay),
                Err(e) => {
                    self.metrics.inc_venue_errors();
                    warn!("[PatternTracker] Trade history fetch failed for {}: {}", exit.market_id, e);
                    None
                }
            };

            // No trades in the window: fall back to the current price
            if price.is_none() && budget > 0 {
                budget -= 1;
                self.metrics.inc_venue_calls();
                price = match self.venue.get_positions(&exit.wallet, Some(&exit.market_id), 10).await {
                    Ok(positions) => positions
                        .iter()
                        .find(|p| outcome_eq(&p.outcome, &exit.outcome))
                        .map(|p| p.cur_price)
                        .filter(|p| *p > 0.0),
                    Err(e) => {
                        self.metrics.inc_venue_errors();
                        debug!("[PatternTracker] Position fallback failed for {}: {}", exit.wallet, e);
                        None
                    }
                };
            }

            if let Some(price) = price {
                prices.push((exit.id.clone(), price));
            }
        }

        let mut touched: HashMap<String, (String, String, String)> = HashMap::new();
        {
            let mut state = self.state.write().await;
            for (id, price) in prices {
                let Some(exit) = state.pending_exits.get_mut(&id) else {
                    continue;
                };
                let score = exit.verify(price, now);
                let wallet = exit.wallet.clone();
                touched.insert(
                    wallet.clone(),
                    (exit.market_id.clone(), exit.market_title.clone(), exit.market_slug.clone()),
                );
                state.exit_stats.entry(wallet).or_default().record(score);
            }
            if !touched.is_empty() {
                self.mark_dirty();
            }
        }

        let mut alerts = Vec::new();
        for (wallet, (market_id, title, slug)) in touched {
            if let Some(stats) = self.perfect_timing_alert(&wallet, now, &config).await {
                info!(
                    "[PatternTracker] {} exits near the top: avg score {:.2} over {} exits",
                    wallet, stats.avg_score, stats.verified_exits
                );
                alerts.push(Alert::for_market(
                    &wallet,
                    &market_id,
                    &title,
                    &slug,
                    now,
                    perfect_timing_details(&stats),
                ));
            }
        }
        alerts
    }

    /// Verify due pre-move records against the current price. Returns alerts for
    /// wallets whose record now qualifies.
    pub async fn verify_pre_moves_at(&self, now: DateTime<Utc>) -> Vec<Alert> {
        let config = self.config.read().await.clone();
        let delay = Duration::seconds(config.pre_move_check_delay_secs);

        let mut due: Vec<PreMoveRecord> = {
            let state = self.state.read().await;
            state
                .pending_moves
                .values()
                .filter(|r| r.is_due(now, delay))
                .cloned()
                .collect()
        };
        due.sort_by_key(|r| r.trade_time);

        let mut budget = config.max_verifications_per_cycle;
        let mut prices = Vec::new();
        for record in &due {
            if budget == 0 {
                break;
            }
            budget -= 1;
            self.metrics.inc_venue_calls();
            let mut price = match self.venue.get_positions(&record.wallet, Some(&record.market_id), 10).await {
                Ok(positions) => positions
                    .iter()
                    .find(|p| outcome_eq(&p.outcome, &record.outcome))
                    .map(|p| p.cur_price)
                    .filter(|p| *p > 0.0),
                Err(e) => {
                    self.metrics.inc_venue_errors();
                    warn!("[PatternTracker] Position fetch failed for {}: {}", record.wallet, e);
                    None
                }
            };

            // Wallet no longer holds the outcome: use the last traded price
            if price.is_none() && budget > 0 {
                budget -= 1;
                self.metrics.inc_venue_calls();
                price = match self.venue.get_market_trades(&record.market_id, 100, 0).await {
                    Ok(trades) => trades
                        .iter()
                        .find(|t| outcome_eq(&t.outcome, &record.outcome))
                        .map(|t| t.price),
                    Err(e) => {
                        self.metrics.inc_venue_errors();
                        debug!("[PatternTracker] Trade fallback failed for {}: {}", record.market_id, e);
                        None
                    }
                };
            }

            if let Some(price) = price {
                prices.push((record.id.clone(), price));
            }
        }

        let mut touched: HashMap<String, (String, String, String)> = HashMap::new();
        {
            let mut state = self.state.write().await;
            for (id, price) in prices {
                let Some(record) = state.pending_moves.get_mut(&id) else {
                    continue;
                };
                let Some((move_percent, favorable)) = record.verify(price, now) else {
                    continue;
                };
                let wallet = record.wallet.clone();
                touched.insert(
                    wallet.clone(),
                    (record.market_id.clone(), record.market_title.clone(), record.market_slug.clone()),
                );
                state
                    .pre_move_stats
                    .entry(wallet)
                    .or_default()
                    .record(move_percent, favorable, config.pre_move_min_move, now);
            }
            if !touched.is_empty() {
                self.mark_dirty();
            }
        }

        let mut alerts = Vec::new();
        for (wallet, (market_id, title, slug)) in touched {
            if let Some(stats) = self.pre_move_alert(&wallet, now, &config).await {
                info!(
                    "[PatternTracker] {} positions ahead of moves: alpha {:.2} over {} trades",
                    wallet, stats.alpha_score, stats.total_trades
                );
                alerts.push(Alert::for_market(
                    &wallet,
                    &market_id,
                    &title,
                    &slug,
                    now,
                    pre_move_details(&stats),
                ));
            }
        }
        alerts
    }

    /// Drop old verified records, stale unverified ones and expired accumulations
    pub async fn gc(&self, now: DateTime<Utc>) -> usize {
        let config = self.config.read().await.clone();
        let retention = Duration::days(config.verified_retention_days);
        let window = Duration::seconds(config.stealth_window_secs);
        let mut state = self.state.write().await;

        let before = state.pending_exits.len() + state.pending_moves.len() + state.accumulations.len();

        state.pending_exits.retain(|_, e| match e.checked_at {
            Some(checked) if e.verified => now - checked <= retention,
            _ => now - e.exited_at <= retention,
        });
        state.pending_moves.retain(|_, r| match r.checked_at {
            Some(checked) if r.verified => now - checked <= retention,
            _ => now - r.trade_time <= retention,
        });
        for record in state.accumulations.values_mut() {
            record.prune(now, window);
        }
        state.accumulations.retain(|_, r| {
            !r.entries.is_empty() || r.last_alert.map(|t| now - t < window).unwrap_or(false)
        });

        let removed =
            before - (state.pending_exits.len() + state.pending_moves.len() + state.accumulations.len());
        if removed > 0 {
            self.mark_dirty();
        }
        removed
    }

    pub async fn get_exit_timing_stats(&self, wallet: &str) -> Option<ExitTimingStats> {
        self.state.read().await.exit_stats.get(&normalize_wallet(wallet)).cloned()
    }

    pub async fn get_pre_move_stats(&self, wallet: &str) -> Option<PreMoveStats> {
        self.state.read().await.pre_move_stats.get(&normalize_wallet(wallet)).cloned()
    }

    pub async fn get_pre_move_record(&self, id: &str) -> Option<PreMoveRecord> {
        self.state.read().await.pending_moves.get(id).cloned()
    }

    /// (pending exits, pending moves, accumulations)
    pub async fn counts(&self) -> (usize, usize, usize) {
        let state = self.state.read().await;
        (
            state.pending_exits.values().filter(|e| !e.verified).count(),
            state.pending_moves.values().filter(|r| !r.verified).count(),
            state.accumulations.len(),
        )
    }

    pub async fn snapshot(&self) -> PatternSnapshot {
        let state = self.state.read().await;
        PatternSnapshot {
            version: SNAPSHOT_VERSION,
            timestamp: Utc::now(),
            pending_exits: state.pending_exits.clone(),
            exit_timing_stats: state.exit_stats.clone(),
            accumulations: state.accumulations.clone(),
            pending_moves: state.pending_moves.clone(),
            pre_move_stats: state.pre_move_stats.clone(),
        }
    }

    pub async fn restore(&self, snapshot: PatternSnapshot) {
        let mut state = self.state.write().await;
        state.pending_exits = snapshot.pending_exits;
        state.exit_stats = snapshot.exit_timing_stats;
        state.accumulations = snapshot.accumulations;
        state.pending_moves = snapshot.pending_moves;
        state.pre_move_stats = snapshot.pre_move_stats;
    }

    /// Load persisted state. Missing, malformed or foreign-version files start empty.
    pub async fn load(&self) -> Result<usize> {
        if !self.storage.is_enabled() {
            return Ok(0);
        }
        let content = self.storage.load(PATTERN_FILE).await?;
        if content.trim().is_empty() {
            return Ok(0);
        }
        let snapshot: PatternSnapshot = match serde_json::from_str(&content) {
            Ok(s) => s,
            Err(e) => {
                warn!("[PatternTracker] Ignoring unreadable {}: {}", PATTERN_FILE, e);
                return Ok(0);
            }
        };
        if snapshot.version != SNAPSHOT_VERSION {
            warn!(
                "[PatternTracker] Ignoring {} with unknown version {}",
                PATTERN_FILE, snapshot.version
            );
            return Ok(0);
        }
        let count = snapshot.pending_exits.len() + snapshot.pending_moves.len() + snapshot.accumulations.len();
        self.restore(snapshot).await;
        info!("[PatternTracker] Loaded {} records", count);
        Ok(count)
    }

    /// Persist when dirty. Returns true if a write happened.
    pub async fn save(&self) -> Result<bool> {
        if !self.storage.is_enabled() {
            return Ok(false);
        }
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return Ok(false);
        }
        let snapshot = self.snapshot().await;
        let content = match serde_json::to_string(&snapshot) {
            Ok(c) => c,
            Err(e) => {
                self.mark_dirty();
                return Err(e.into());
            }
        };

        match self.storage.save(PATTERN_FILE, &content).await {
            Ok(()) => {
                self.metrics.inc_saves_ok();
                debug!("[PatternTracker] Saved {} bytes", content.len());
                Ok(true)
            }
            Err(e) => {
                self.mark_dirty();
                self.metrics.inc_saves_failed();
                Err(e.into())
            }
        }
    }

    /// Background loop: periodic save plus the two verification passes.
    /// Verification alerts are forwarded on `alert_tx`.
    pub async fn run(self: Arc<Self>, alert_tx: mpsc::Sender<Alert>, mut shutdown_rx: watch::Receiver<bool>) {
        let (save_every, verify_every) = {
            let config = self.config.read().await;
            (config.save_interval(), config.verify_interval())
        };
        let mut save_tick = interval(save_every);
        let mut exit_tick = interval(verify_every);
        let mut move_tick = interval(verify_every);
        save_tick.tick().await;
        exit_tick.tick().await;
        move_tick.tick().await;

        info!("[PatternTracker] Started");

        loop {
            tokio::select! {
                _ = save_tick.tick() => {
                    if let Err(e) = self.save().await {
                        warn!("[PatternTracker] Save failed, will retry: {}", e);
                    }
                }
                _ = exit_tick.tick() => {
                    let now = Utc::now();
                    let alerts = self.verify_exits_at(now).await;
                    let removed = self.gc(now).await;
                    if removed > 0 {
                        debug!("[PatternTracker] Expired {} records", removed);
                    }
                    forward(&alert_tx, alerts).await;
                }
                _ = move_tick.tick() => {
                    let alerts = self.verify_pre_moves_at(Utc::now()).await;
                    forward(&alert_tx, alerts).await;
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        match tokio::time::timeout(FINAL_SAVE_TIMEOUT, self.save()).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => error!("[PatternTracker] Final save failed: {}", e),
            Err(_) => error!("[PatternTracker] Final save timed out"),
        }
        info!("[PatternTracker] Stopped");
    }
}

async fn forward(alert_tx: &mpsc::Sender<Alert>, alerts: Vec<Alert>) {
    for alert in alerts {
        if alert_tx.send(alert).await.is_err() {
            debug!("[PatternTracker] Alert receiver closed");
            return;
        }
    }
}

fn perfect_timing_details(stats: &ExitTimingStats) -> AlertDetails {
    AlertDetails::PerfectExitTiming {
        verified_exits: stats.verified_exits,
        avg_score: stats.avg_score,
        perfect_exits: stats.perfect_exits,
    }
}

fn pre_move_details(stats: &PreMoveStats) -> AlertDetails {
    AlertDetails::PreMovePositioning {
        total_trades: stats.total_trades,
        successful_moves: stats.successful_moves,
        alpha_score: stats.alpha_score,
        avg_move_size: stats.avg_move_size,
    }
}
