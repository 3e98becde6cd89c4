//! Hedge Tracker - detects wallets unwinding one side of a Yes/No hedge
//!
//! Every qualifying SELL triggers a positions fetch for the (wallet, market).
//! The fetched sizes are compared against the last snapshot: when a hedged
//! position loses a significant share of one side, a removal event is
//! recorded and later checked against the market result. Exits feed per-wallet
//! hold-time stats used by the asymmetric-exit detector.

pub mod asymmetric;
pub mod types;

use crate::config::HedgeConfig;
use crate::services::metrics::Metrics;
use crate::services::rate_limiter::RateLimiter;
use crate::services::FINAL_SAVE_TIMEOUT;
use crate::storage::BlobStorage;
use crate::types::{
    normalize_wallet, opposite_outcome, outcome_eq, Alert, AlertDetails, Position, TradeEvent,
};
use crate::venue::VenueClient;
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::time::interval;
use tracing::{debug, error, info, warn};

pub use asymmetric::{asymmetric_ratio, exit_from_sell};
pub use types::{
    AsymmetricExitStats, ExitRecord, HedgePosition, HedgeRemovalEvent, HedgeSnapshot, HedgeUpdate,
    SNAPSHOT_VERSION,
};

pub const HEDGE_FILE: &str = "hedge_tracker.json";

#[derive(Debug, Default)]
struct HedgeState {
    positions: HashMap<String, HashMap<String, HedgePosition>>,
    events: HashMap<String, HedgeRemovalEvent>,
    exit_stats: HashMap<String, AsymmetricExitStats>,
}

impl HedgeState {
    fn position_count(&self) -> usize {
        self.positions.values().map(|m| m.len()).sum()
    }

    /// Remove the least recently updated position
    fn evict_stalest(&mut self) {
        let stalest = self
            .positions
            .iter()
            .flat_map(|(w, markets)| markets.iter().map(move |(m, p)| (w, m, p.last_updated)))
            .min_by_key(|(_, _, at)| *at)
            .map(|(w, m, _)| (w.clone(), m.clone()));
        if let Some((wallet, market)) = stalest {
            if let Some(markets) = self.positions.get_mut(&wallet) {
                markets.remove(&market);
                if markets.is_empty() {
                    self.positions.remove(&wallet);
                }
            }
        }
    }
}

/// Yes/No holdings pulled out of a positions response
fn split_positions(positions: &[Position]) -> (Option<&Position>, Option<&Position>) {
    let yes = positions.iter().find(|p| outcome_eq(&p.outcome, "yes"));
    let no = positions.iter().find(|p| outcome_eq(&p.outcome, "no"));
    (yes, no)
}

/// Winning outcome implied by settled positions, if any
pub(crate) fn winning_outcome(positions: &[Position]) -> Option<String> {
    positions.iter().filter(|p| p.redeemable).find_map(|p| {
        if p.cur_price > 0.5 {
            Some(p.outcome.clone())
        } else if p.cur_price < 0.5 {
            opposite_outcome(&p.outcome).map(str::to_string)
        } else {
            None
        }
    })
}

pub struct HedgeTracker {
    storage: Arc<BlobStorage>,
    venue: Arc<dyn VenueClient>,
    config: RwLock<HedgeConfig>,
    state: RwLock<HedgeState>,
    limiter: RateLimiter,
    tx: mpsc::Sender<HedgeUpdate>,
    rx: Mutex<Option<mpsc::Receiver<HedgeUpdate>>>,
    dirty: AtomicBool,
    metrics: Metrics,
}

impl HedgeTracker {
    pub fn new(
        storage: Arc<BlobStorage>,
        venue: Arc<dyn VenueClient>,
        config: HedgeConfig,
        metrics: Metrics,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
        let limiter = RateLimiter::new(
            "HedgeTracker",
            config.max_checks_per_minute,
            config.check_cooldown_secs,
        );
        Self {
            storage,
            venue,
            config: RwLock::new(config),
            state: RwLock::new(HedgeState::default()),
            limiter,
            tx,
            rx: Mutex::new(Some(rx)),
            dirty: AtomicBool::new(false),
            metrics,
        }
    }

    pub async fn update_config(&self, config: HedgeConfig) {
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

    /// Inspect a SELL for hedge removal and asymmetric exits
    pub async fn process_trade(&self, trade: &TradeEvent) -> Vec<Alert> {
        let config = self.config.read().await.clone();
        if !config.enabled || !trade.is_sell() {
            return Vec::new();
        }
        if opposite_outcome(&trade.outcome).is_none() {
            return Vec::new();
        }
        if !self.limiter.try_acquire(&trade.wallet_market_key()).await {
            self.metrics.inc_rate_limited();
            return Vec::new();
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
                warn!("[HedgeTracker] Position fetch failed for {}: {}", trade.wallet, e);
                return Vec::new();
            }
        };

        let mut alerts = Vec::new();
        let (yes, no) = split_positions(&positions);
        let now = trade.timestamp;

        let exit = {
            let mut state = self.state.write().await;
            let prior = state
                .positions
                .get(&trade.wallet)
                .and_then(|m| m.get(&trade.market_id))
                .cloned();

            let mut current = HedgePosition {
                yes_size: yes.map(|p| p.size).unwrap_or(0.0),
                no_size: no.map(|p| p.size).unwrap_or(0.0),
                yes_avg_price: yes.map(|p| p.avg_price).unwrap_or(0.0),
                no_avg_price: no.map(|p| p.avg_price).unwrap_or(0.0),
                last_updated: now,
                is_hedged: false,
                yes_opened_at: None,
                no_opened_at: None,
            };
            current.is_hedged = current.hedged(config.min_hedge_size, config.min_hedge_value);
            if current.yes_size > 0.0 {
                current.yes_opened_at = prior.as_ref().and_then(|p| p.yes_opened_at).or(Some(now));
            }
            if current.no_size > 0.0 {
                current.no_opened_at = prior.as_ref().and_then(|p| p.no_opened_at).or(Some(now));
            }

            let mut exit = None;
            if let Some(prior) = &prior {
                let prior_size = prior.size(&trade.outcome);
                let current_size = current.size(&trade.outcome);

                if prior.is_hedged && prior_size > 0.0 {
                    let reduction = (prior_size - current_size) / prior_size;
                    if reduction >= config.significant_sell_pct {
                        let event = HedgeRemovalEvent {
                            id: HedgeRemovalEvent::event_id(&trade.wallet, &trade.market_id, &trade.id, now),
                            wallet: trade.wallet.clone(),
                            market_id: trade.market_id.clone(),
                            market_title: trade.market_title.clone(),
                            market_slug: trade.market_slug.clone(),
                            yes_size_before: prior.yes_size,
                            no_size_before: prior.no_size,
                            yes_price_before: prior.yes_avg_price,
                            no_price_before: prior.no_avg_price,
                            sold_side: trade.outcome.clone(),
                            sold_size: trade.size,
                            sold_price: trade.price,
                            yes_size_after: current.yes_size,
                            no_size_after: current.no_size,
                            removed_at: now,
                            alerted_at: Some(Utc::now()),
                            resolved: false,
                            resolved_at: None,
                            winning_outcome: None,
                            removed_loser: false,
                            followup_alerted: false,
                        };
                        info!(
                            "[HedgeTracker] {} removed {:.0}% of {} hedge side in {}",
                            trade.wallet,
                            reduction * 100.0,
                            trade.outcome,
                            trade.market_id
                        );
                        alerts.push(Alert::from_trade(
                            trade,
                            AlertDetails::HedgeRemoval {
                                sold_side: trade.outcome.clone(),
                                sold_size: trade.size,
                                sold_price: trade.price,
                                reduction,
                                yes_size_before: prior.yes_size,
                                no_size_before: prior.no_size,
                                yes_size_after: current.yes_size,
                                no_size_after: current.no_size,
                            },
                        ));
                        state.events.insert(event.id.clone(), event);
                    }
                }

                let sold_position = if outcome_eq(&trade.outcome, "yes") { yes } else { no };
                let entry_price = sold_position.map(|p| p.avg_price);
                exit = exit_from_sell(trade, prior, current_size, entry_price);
            }

            let is_new = prior.is_none();
            if is_new && state.position_count() >= config.max_tracked_positions.max(1) {
                state.evict_stalest();
            }
            state
                .positions
                .entry(trade.wallet.clone())
                .or_default()
                .insert(trade.market_id.clone(), current);
            self.dirty.store(true, Ordering::SeqCst);
            exit
        };

        if let Some(record) = exit {
            let update = HedgeUpdate::Exit {
                wallet: trade.wallet.clone(),
                record,
            };
            if let Err(e) = self.tx.try_send(update) {
                self.metrics.inc_dropped_updates();
                debug!("[HedgeTracker] Dropped exit record: {}", e);
            }
        }

        if let Some((stats, ratio)) = self.check_asymmetric(&trade.wallet, now).await {
            info!("[HedgeTracker] {} holds losers {:.1}x longer than winners", trade.wallet, ratio);
            alerts.push(Alert::from_trade(
                trade,
                AlertDetails::AsymmetricExit {
                    winning_exits: stats.winning_exits,
                    losing_exits: stats.losing_exits,
                    avg_win_hold_secs: stats.avg_win_hold,
                    avg_loss_hold_secs: stats.avg_loss_hold,
                    ratio,
                },
            ));
        }

        alerts
    }

    /// Ratio when the asymmetric pattern holds; pure read
    pub async fn should_alert_asymmetric(&self, wallet: &str) -> Option<f64> {
        let (min_exits, threshold) = {
            let config = self.config.read().await;
            (config.min_exits_for_asymmetric, config.asymmetric_threshold)
        };
        let state = self.state.read().await;
        let stats = state.exit_stats.get(&normalize_wallet(wallet))?;
        asymmetric_ratio(stats, min_exits, threshold)
    }

    /// Predicate plus per-wallet cooldown; stamps the alert time when it fires
    async fn check_asymmetric(&self, wallet: &str, now: DateTime<Utc>) -> Option<(AsymmetricExitStats, f64)> {
        let (min_exits, threshold, cooldown) = {
            let config = self.config.read().await;
            (
                config.min_exits_for_asymmetric,
                config.asymmetric_threshold,
                Duration::seconds(config.asymmetric_cooldown_secs),
            )
        };
        let mut state = self.state.write().await;
        let stats = state.exit_stats.get_mut(wallet)?;
        let ratio = asymmetric_ratio(stats, min_exits, threshold)?;
        if let Some(last) = stats.last_alert {
            if now - last < cooldown {
                return None;
            }
        }
        stats.last_alert = Some(now);
        self.dirty.store(true, Ordering::SeqCst);
        Some((stats.clone(), ratio))
    }

    /// Apply an exit record directly, bypassing the queue
    pub async fn record_exit(&self, wallet: &str, record: ExitRecord) {
        let mut state = self.state.write().await;
        state
            .exit_stats
            .entry(normalize_wallet(wallet))
            .or_default()
            .record(record);
        self.dirty.store(true, Ordering::SeqCst);
    }

    async fn apply_update(&self, update: HedgeUpdate) {
        match update {
            HedgeUpdate::Exit { wallet, record } => self.record_exit(&wallet, record).await,
        }
    }

    /// Apply everything currently queued. Only effective while the run loop is not running.
    pub async fn drain_updates(&self) -> usize {
        let mut guard = self.rx.lock().await;
        let Some(rx) = guard.as_mut() else {
            return 0;
        };
        let mut applied = 0;
        while let Ok(update) = rx.try_recv() {
            self.apply_update(update).await;
            applied += 1;
        }
        applied
    }

    /// Check unresolved removal events against settled positions. Returns the number resolved.
    pub async fn check_resolutions_at(&self, now: DateTime<Utc>) -> usize {
        let max_checks = self.config.read().await.max_resolution_checks;
        let mut batch: Vec<(String, String, String)> = {
            let state = self.state.read().await;
            let mut pending: Vec<&HedgeRemovalEvent> =
                state.events.values().filter(|e| !e.resolved).collect();
            pending.sort_by_key(|e| e.removed_at);
            pending
                .into_iter()
                .map(|e| (e.id.clone(), e.wallet.clone(), e.market_id.clone()))
                .collect()
        };
        batch.truncate(max_checks);

        let mut resolved = 0;
        for (id, wallet, market_id) in batch {
            self.metrics.inc_venue_calls();
            let positions = match self.venue.get_positions(&wallet, Some(&market_id), 10).await {
                Ok(p) => p,
                Err(e) => {
                    self.metrics.inc_venue_errors();
                    warn!("[HedgeTracker] Resolution check failed for {}: {}", id, e);
                    continue;
                }
            };
            let Some(winner) = winning_outcome(&positions) else {
                continue;
            };

            let mut state = self.state.write().await;
            if let Some(event) = state.events.get_mut(&id) {
                event.resolve(&winner, now);
                debug!(
                    "[HedgeTracker] {} resolved: {} won, removed loser = {}",
                    id, winner, event.removed_loser
                );
                resolved += 1;
                self.dirty.store(true, Ordering::SeqCst);
            }
        }
        resolved
    }

    /// Follow-up alerts for removals that dumped the losing side. Each event alerts once.
    pub async fn get_pending_follow_up_alerts(&self) -> Vec<Alert> {
        let mut state = self.state.write().await;
        let mut alerts = Vec::new();
        for event in state.events.values_mut().filter(|e| e.needs_follow_up()) {
            event.followup_alerted = true;
            let winning_outcome = event.winning_outcome.clone().unwrap_or_default();
            alerts.push(Alert::for_market(
                &event.wallet,
                &event.market_id,
                &event.market_title,
                &event.market_slug,
                event.resolved_at.unwrap_or(event.removed_at),
                AlertDetails::HedgeRemovalLoser {
                    sold_side: event.sold_side.clone(),
                    winning_outcome,
                    removed_at: event.removed_at,
                },
            ));
        }
        if !alerts.is_empty() {
            self.dirty.store(true, Ordering::SeqCst);
        }
        alerts
    }

    /// Drop finished or expired events and stale positions. Returns (events, positions) removed.
    pub async fn gc(&self, now: DateTime<Utc>) -> (usize, usize) {
        let (event_retention, state_retention) = {
            let config = self.config.read().await;
            (
                Duration::days(config.event_retention_days),
                Duration::days(config.state_retention_days),
            )
        };
        let mut state = self.state.write().await;

        let events_before = state.events.len();
        state.events.retain(|_, e| {
            let finished = e.resolved && e.followup_alerted;
            !finished && now - e.removed_at <= event_retention
        });
        let events_removed = events_before - state.events.len();

        let positions_before = state.position_count();
        for markets in state.positions.values_mut() {
            markets.retain(|_, p| now - p.last_updated <= state_retention);
        }
        state.positions.retain(|_, markets| !markets.is_empty());
        let positions_removed = positions_before - state.position_count();

        if events_removed + positions_removed > 0 {
            self.dirty.store(true, Ordering::SeqCst);
        }
        (events_removed, positions_removed)
    }

    pub async fn get_position(&self, wallet: &str, market_id: &str) -> Option<HedgePosition> {
        let state = self.state.read().await;
        state
            .positions
            .get(&normalize_wallet(wallet))
            .and_then(|m| m.get(&market_id.to_lowercase()))
            .cloned()
    }

    pub async fn get_exit_stats(&self, wallet: &str) -> Option<AsymmetricExitStats> {
        self.state.read().await.exit_stats.get(&normalize_wallet(wallet)).cloned()
    }

    pub async fn events_for(&self, wallet: &str) -> Vec<HedgeRemovalEvent> {
        let wallet = normalize_wallet(wallet);
        let state = self.state.read().await;
        let mut events: Vec<_> = state.events.values().filter(|e| e.wallet == wallet).cloned().collect();
        events.sort_by_key(|e| e.removed_at);
        events
    }

    pub async fn pending_event_count(&self) -> usize {
        self.state.read().await.events.values().filter(|e| !e.resolved).count()
    }

    pub async fn snapshot(&self) -> HedgeSnapshot {
        let state = self.state.read().await;
        HedgeSnapshot {
            version: SNAPSHOT_VERSION,
            timestamp: Utc::now(),
            hedge_states: state.positions.clone(),
            pending_events: state.events.clone(),
            exit_stats: state.exit_stats.clone(),
        }
    }

    /// Replace state from a snapshot
    pub async fn restore(&self, snapshot: HedgeSnapshot) {
        let mut state = self.state.write().await;
        state.positions = snapshot.hedge_states;
        state.events = snapshot.pending_events;
        state.exit_stats = snapshot.exit_stats;
    }

    /// Load persisted state. Missing, malformed or foreign-version files start empty.
    pub async fn load(&self) -> Result<usize> {
        if !self.storage.is_enabled() {
            return Ok(0);
        }
        let content = self.storage.load(HEDGE_FILE).await?;
        if content.trim().is_empty() {
            return Ok(0);
        }
        let snapshot: HedgeSnapshot = match serde_json::from_str(&content) {
            Ok(s) => s,
            Err(e) => {
                warn!("[HedgeTracker] Ignoring unreadable {}: {}", HEDGE_FILE, e);
                return Ok(0);
            }
        };
        if snapshot.version != SNAPSHOT_VERSION {
            warn!(
                "[HedgeTracker] Ignoring {} with unknown version {}",
                HEDGE_FILE, snapshot.version
            );
            return Ok(0);
        }
        let count = snapshot.pending_events.len();
        let positions: usize = snapshot.hedge_states.values().map(|m| m.len()).sum();
        self.restore(snapshot).await;
        info!(
            "[HedgeTracker] Loaded {} positions and {} removal events",
            positions, count
        );
        Ok(positions + count)
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
                self.dirty.store(true, Ordering::SeqCst);
                return Err(e.into());
            }
        };

        match self.storage.save(HEDGE_FILE, &content).await {
            Ok(()) => {
                self.metrics.inc_saves_ok();
                debug!("[HedgeTracker] Saved {} bytes", content.len());
                Ok(true)
            }
            Err(e) => {
                self.dirty.store(true, Ordering::SeqCst);
                self.metrics.inc_saves_failed();
                Err(e.into())
            }
        }
    }

    /// Background loop: exit updates, periodic save, resolution checks and GC
    pub async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let Some(mut rx) = self.rx.lock().await.take() else {
            warn!("[HedgeTracker] Already running");
            return;
        };

        let (save_every, resolve_every) = {
            let config = self.config.read().await;
            (config.save_interval(), config.resolution_interval())
        };
        let mut save_tick = interval(save_every);
        let mut resolve_tick = interval(resolve_every);
        save_tick.tick().await;
        resolve_tick.tick().await;

        info!("[HedgeTracker] Started");

        loop {
            tokio::select! {
                Some(update) = rx.recv() => {
                    self.apply_update(update).await;
                }
                _ = save_tick.tick() => {
                    if let Err(e) = self.save().await {
                        warn!("[HedgeTracker] Save failed, will retry: {}", e);
                    }
                }
                _ = resolve_tick.tick() => {
                    let now = Utc::now();
                    let resolved = self.check_resolutions_at(now).await;
                    let (events, positions) = self.gc(now).await;
                    if resolved + events + positions > 0 {
                        info!(
                            "[HedgeTracker] {} events resolved, {} events and {} positions expired",
                            resolved, events, positions
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

        while let Ok(update) = rx.try_recv() {
            self.apply_update(update).await;
        }

        match tokio::time::timeout(FINAL_SAVE_TIMEOUT, self.save()).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => error!("[HedgeTracker] Final save failed: {}", e),
            Err(_) => error!("[HedgeTracker] Final save timed out"),
        }
        info!("[HedgeTracker] Stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::retry::RetryConfig;
    use crate::storage::MemoryStore;
    use crate::types::{AlertKind, TradeSide};
    use crate::venue::StaticVenue;

    struct Fixture {
        store: Arc<MemoryStore>,
        venue: Arc<StaticVenue>,
        tracker: HedgeTracker,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let storage = Arc::new(BlobStorage::new(store.clone(), "doc", RetryConfig::with_max_retries(0)));
        let venue = Arc::new(StaticVenue::new());
        let config = HedgeConfig {
            check_cooldown_secs: 0,
            ..Default::default()
        };
        let tracker = HedgeTracker::new(storage, venue.clone(), config, Metrics::new());
        Fixture { store, venue, tracker }
    }

    fn sell(outcome: &str, size: f64, at: DateTime<Utc>) -> TradeEvent {
        TradeEvent::new("t", "0xw", "m1", outcome, TradeSide::Sell, size, 0.5, at)
    }

    fn set_sizes(venue: &StaticVenue, yes: f64, no: f64) {
        venue.set_positions(
            "0xw",
            "m1",
            vec![Position::new("Yes", yes, 0.5, 0.5), Position::new("No", no, 0.5, 0.5)],
        );
    }

    #[tokio::test]
    async fn test_hedge_removal_detected() {
        let f = fixture();
        let t0 = Utc::now();

        set_sizes(&f.venue, 1000.0, 800.0);
        assert!(f.tracker.process_trade(&sell("No", 1.0, t0)).await.is_empty());
        assert!(f.tracker.get_position("0xw", "m1").await.unwrap().is_hedged);

        set_sizes(&f.venue, 1000.0, 100.0);
        let alerts = f.tracker.process_trade(&sell("No", 700.0, t0 + Duration::seconds(5))).await;
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::HedgeRemoval);
        match &alerts[0].details {
            AlertDetails::HedgeRemoval { sold_side, reduction, .. } => {
                assert_eq!(sold_side, "No");
                assert!((reduction - 0.875).abs() < 1e-6);
            }
            other => panic!("unexpected details {:?}", other),
        }
        assert_eq!(f.tracker.pending_event_count().await, 1);
        let after = f.tracker.get_position("0xw", "m1").await.unwrap();
        assert!((after.no_size - 100.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_small_reduction_is_not_removal() {
        let f = fixture();
        let t0 = Utc::now();
        set_sizes(&f.venue, 1000.0, 800.0);
        f.tracker.process_trade(&sell("No", 1.0, t0)).await;
        set_sizes(&f.venue, 1000.0, 600.0);
        assert!(f.tracker.process_trade(&sell("No", 200.0, t0)).await.is_empty());
        assert_eq!(f.tracker.pending_event_count().await, 0);
    }

    #[tokio::test]
    async fn test_removals_in_same_second_keep_separate_events() {
        let f = fixture();
        let t0 = Utc::now();
        let sell_with_id = |id: &str, outcome: &str, size: f64| {
            let mut trade = sell(outcome, size, t0);
            trade.id = id.to_string();
            trade
        };

        set_sizes(&f.venue, 1000.0, 800.0);
        f.tracker.process_trade(&sell_with_id("a", "No", 1.0)).await;
        set_sizes(&f.venue, 1000.0, 100.0);
        assert_eq!(f.tracker.process_trade(&sell_with_id("b", "No", 700.0)).await.len(), 1);

        // Hedge rebuilt, then removed again at the same timestamp
        set_sizes(&f.venue, 990.0, 800.0);
        f.tracker.process_trade(&sell_with_id("c", "Yes", 10.0)).await;
        set_sizes(&f.venue, 990.0, 100.0);
        assert_eq!(f.tracker.process_trade(&sell_with_id("d", "No", 700.0)).await.len(), 1);

        assert_eq!(f.tracker.pending_event_count().await, 2);
        let ids: Vec<String> = f.tracker.events_for("0xw").await.into_iter().map(|e| e.id).collect();
        assert_eq!(ids.len(), 2);
        assert_ne!(ids[0], ids[1]);
    }

    #[tokio::test]
    async fn test_buys_and_venue_errors_are_ignored() {
        let f = fixture();
        let buy = TradeEvent::new("t", "0xw", "m1", "Yes", TradeSide::Buy, 10.0, 0.5, Utc::now());
        assert!(f.tracker.process_trade(&buy).await.is_empty());
        assert_eq!(f.venue.call_count(), 0);

        f.venue.set_failing(true);
        assert!(f.tracker.process_trade(&sell("No", 1.0, Utc::now())).await.is_empty());
        assert!(f.tracker.get_position("0xw", "m1").await.is_none());
    }

    #[tokio::test]
    async fn test_cooldown_skips_repeat_checks() {
        let f = fixture();
        f.tracker
            .update_config(HedgeConfig {
                check_cooldown_secs: 300,
                ..Default::default()
            })
            .await;
        set_sizes(&f.venue, 1000.0, 800.0);
        f.tracker.process_trade(&sell("No", 1.0, Utc::now())).await;
        f.tracker.process_trade(&sell("No", 1.0, Utc::now())).await;
        assert_eq!(f.venue.call_count(), 1);
    }

    #[tokio::test]
    async fn test_resolution_and_follow_up_once() {
        let f = fixture();
        let t0 = Utc::now();
        set_sizes(&f.venue, 1000.0, 800.0);
        f.tracker.process_trade(&sell("No", 1.0, t0)).await;
        set_sizes(&f.venue, 1000.0, 100.0);
        f.tracker.process_trade(&sell("No", 700.0, t0)).await;

        // Not settled yet
        assert_eq!(f.tracker.check_resolutions_at(t0).await, 0);

        f.venue.set_positions(
            "0xw",
            "m1",
            vec![
                Position::new("YES", 1000.0, 0.5, 1.0).redeemable(),
                Position::new("No", 100.0, 0.5, 0.0).redeemable(),
            ],
        );
        assert_eq!(f.tracker.check_resolutions_at(t0).await, 1);

        let events = f.tracker.events_for("0xw").await;
        assert!(events[0].resolved);
        assert!(events[0].removed_loser);
        assert_eq!(events[0].winning_outcome.as_deref(), Some("YES"));

        let alerts = f.tracker.get_pending_follow_up_alerts().await;
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::HedgeRemovalLoser);
        assert!(f.tracker.get_pending_follow_up_alerts().await.is_empty());

        let (events_removed, _) = f.tracker.gc(t0).await;
        assert_eq!(events_removed, 1);
    }

    #[test]
    fn test_removed_loser_is_case_insensitive() {
        let mut event = HedgeRemovalEvent {
            id: "x".into(),
            wallet: "0xw".into(),
            market_id: "m1".into(),
            market_title: String::new(),
            market_slug: String::new(),
            yes_size_before: 1.0,
            no_size_before: 1.0,
            yes_price_before: 0.5,
            no_price_before: 0.5,
            sold_side: "Yes".into(),
            sold_size: 1.0,
            sold_price: 0.5,
            yes_size_after: 0.0,
            no_size_after: 1.0,
            removed_at: Utc::now(),
            alerted_at: None,
            resolved: false,
            resolved_at: None,
            winning_outcome: None,
            removed_loser: false,
            followup_alerted: false,
        };
        event.resolve("YES", Utc::now());
        assert!(!event.removed_loser);
        event.resolve("no", Utc::now());
        assert!(event.removed_loser);
    }

    #[tokio::test]
    async fn test_asymmetric_exit_alert() {
        let f = fixture();
        f.tracker
            .update_config(HedgeConfig {
                check_cooldown_secs: 0,
                min_exits_for_asymmetric: 2,
                ..Default::default()
            })
            .await;
        let now = Utc::now();
        for (winner, hold) in [(true, 1000), (true, 1000), (true, 1000), (false, 5000), (false, 5000), (false, 5000)] {
            f.tracker
                .record_exit(
                    "0xw",
                    ExitRecord {
                        market_id: "mx".into(),
                        outcome: "Yes".into(),
                        exit_price: 0.5,
                        avg_entry_price: 0.5,
                        size: 1.0,
                        realized_pnl: if winner { 1.0 } else { -1.0 },
                        is_winner: winner,
                        hold_duration_secs: hold,
                        exited_at: now,
                    },
                )
                .await;
        }
        let ratio = f.tracker.should_alert_asymmetric("0xW").await.unwrap();
        assert!((ratio - 5.0).abs() < 1e-6);

        set_sizes(&f.venue, 10.0, 10.0);
        let alerts = f.tracker.process_trade(&sell("Yes", 1.0, now)).await;
        assert!(alerts.iter().any(|a| a.kind == AlertKind::AsymmetricExit));

        // Cooldown suppresses the next one
        let alerts = f.tracker.process_trade(&sell("Yes", 1.0, now)).await;
        assert!(alerts.is_empty());
    }

    #[tokio::test]
    async fn test_exit_records_flow_through_queue() {
        let f = fixture();
        let t0 = Utc::now();
        set_sizes(&f.venue, 1000.0, 800.0);
        f.tracker.process_trade(&sell("No", 1.0, t0)).await;
        set_sizes(&f.venue, 1000.0, 100.0);
        f.tracker.process_trade(&sell("No", 700.0, t0 + Duration::seconds(600))).await;

        assert_eq!(f.tracker.drain_updates().await, 1);
        let stats = f.tracker.get_exit_stats("0xw").await.unwrap();
        assert_eq!(stats.total_exits(), 1);
        assert_eq!(stats.recent_exits[0].hold_duration_secs, 600);
    }

    #[tokio::test]
    async fn test_save_round_trip_and_dirty_gate() {
        let f = fixture();
        let t0 = Utc::now();
        set_sizes(&f.venue, 1000.0, 800.0);
        f.tracker.process_trade(&sell("No", 1.0, t0)).await;
        set_sizes(&f.venue, 1000.0, 100.0);
        f.tracker.process_trade(&sell("No", 700.0, t0)).await;

        assert!(f.tracker.save().await.unwrap());
        assert!(!f.tracker.save().await.unwrap());
        assert_eq!(f.store.save_count(), 1);

        let saved = f.tracker.snapshot().await;
        let json = serde_json::to_string(&saved).unwrap();
        let parsed: HedgeSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.hedge_states, saved.hedge_states);
        assert_eq!(parsed.pending_events, saved.pending_events);

        let restored = HedgeTracker::new(
            Arc::new(BlobStorage::new(f.store.clone(), "doc", RetryConfig::with_max_retries(0))),
            f.venue.clone(),
            HedgeConfig::default(),
            Metrics::new(),
        );
        assert_eq!(restored.load().await.unwrap(), 2);
        assert_eq!(restored.pending_event_count().await, 1);
        assert!(!restored.is_dirty());
    }

    #[tokio::test]
    async fn test_failed_save_stays_dirty() {
        let f = fixture();
        set_sizes(&f.venue, 1000.0, 800.0);
        f.tracker.process_trade(&sell("No", 1.0, Utc::now())).await;
        f.store.set_fail_saves(true);
        assert!(f.tracker.save().await.is_err());
        assert!(f.tracker.is_dirty());
    }
}
