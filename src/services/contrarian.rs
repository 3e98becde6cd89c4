//! Contrarian reputation cache
//!
//! Tracks how often a wallet's bets against consensus paid off. Results arrive
//! on a bounded channel and are applied by a single consumer, so application
//! order matches send order. The table persists as compact text, one
//! `address:wins:losses` line per wallet, and is pruned toward the most active
//! wallets when it grows past the size budget.

use crate::config::ContrarianConfig;
use crate::services::metrics::Metrics;
use crate::services::FINAL_SAVE_TIMEOUT;
use crate::storage::BlobStorage;
use crate::types::{normalize_wallet, opposite_outcome, outcome_eq, TradeEvent, TradeSide};
use crate::venue::VenueClient;
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::time::interval;
use tracing::{debug, error, info, warn};

pub const CONTRARIAN_FILE: &str = "contrarian.txt";

/// Estimated serialized bytes per wallet line
const BYTES_PER_ENTRY: usize = 50;

/// Pending bets older than this are dropped unverified
const PENDING_BET_MAX_AGE_DAYS: i64 = 30;

/// Saturating win/loss counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ContrarianStats {
    pub wins: u16,
    pub losses: u16,
}

impl ContrarianStats {
    pub fn total(&self) -> u32 {
        self.wins as u32 + self.losses as u32
    }

    /// 0 when nothing has resolved yet
    pub fn rate(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            0.0
        } else {
            self.wins as f64 / total as f64
        }
    }

    fn record(&mut self, win: bool) {
        if win {
            self.wins = self.wins.saturating_add(1);
        } else {
            self.losses = self.losses.saturating_add(1);
        }
    }
}

#[derive(Debug, Clone)]
struct ContrarianUpdate {
    wallet: String,
    win: bool,
}

/// A contrarian bet waiting for its market to settle
#[derive(Debug, Clone, PartialEq)]
pub struct PendingBet {
    pub wallet: String,
    pub market_id: String,
    pub outcome: String,
    pub side: TradeSide,
    pub placed_at: DateTime<Utc>,
}

pub struct ContrarianCache {
    storage: Arc<BlobStorage>,
    venue: Arc<dyn VenueClient>,
    config: RwLock<ContrarianConfig>,
    stats: RwLock<HashMap<String, ContrarianStats>>,
    pending: Mutex<VecDeque<PendingBet>>,
    tx: mpsc::Sender<ContrarianUpdate>,
    rx: Mutex<Option<mpsc::Receiver<ContrarianUpdate>>>,
    dirty: AtomicBool,
    metrics: Metrics,
}

impl ContrarianCache {
    pub fn new(
        storage: Arc<BlobStorage>,
        venue: Arc<dyn VenueClient>,
        config: ContrarianConfig,
        metrics: Metrics,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
        Self {
            storage,
            venue,
            config: RwLock::new(config),
            stats: RwLock::new(HashMap::new()),
            pending: Mutex::new(VecDeque::new()),
            tx,
            rx: Mutex::new(Some(rx)),
            dirty: AtomicBool::new(false),
            metrics,
        }
    }

    /// Channel capacity is fixed at construction; everything else applies immediately
    pub async fn update_config(&self, config: ContrarianConfig) {
        *self.config.write().await = config;
    }

    /// Queue a result without blocking. Dropped when the queue is full.
    pub fn record_result(&self, wallet: &str, win: bool) {
        let update = ContrarianUpdate {
            wallet: normalize_wallet(wallet),
            win,
        };
        if let Err(e) = self.tx.try_send(update) {
            self.metrics.inc_dropped_updates();
            debug!("[Contrarian] Dropped result update: {}", e);
        }
    }

    pub async fn get_stats(&self, wallet: &str) -> Option<ContrarianStats> {
        self.stats.read().await.get(&normalize_wallet(wallet)).copied()
    }

    pub async fn should_alert(&self, wallet: &str) -> bool {
        let (min_wins, min_rate) = {
            let config = self.config.read().await;
            (config.min_wins, config.min_rate)
        };
        match self.get_stats(wallet).await {
            Some(stats) => stats.wins >= min_wins && stats.rate() >= min_rate,
            None => false,
        }
    }

    pub async fn len(&self) -> usize {
        self.stats.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.stats.read().await.is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    /// Apply one result directly, bypassing the queue
    pub async fn apply_result(&self, wallet: &str, win: bool) {
        let wallet = normalize_wallet(wallet);
        if wallet.is_empty() {
            return;
        }
        self.stats.write().await.entry(wallet).or_default().record(win);
        self.dirty.store(true, Ordering::SeqCst);
    }

    /// Apply everything currently queued. Only effective while the run loop is not running.
    pub async fn drain_updates(&self) -> usize {
        let mut guard = self.rx.lock().await;
        let Some(rx) = guard.as_mut() else {
            return 0;
        };
        let mut applied = 0;
        while let Ok(update) = rx.try_recv() {
            self.apply_result(&update.wallet, update.win).await;
            applied += 1;
        }
        applied
    }

    /// Register a contrarian bet for later verification
    pub async fn track_bet(&self, trade: &TradeEvent) {
        let max_pending = self.config.read().await.max_pending_bets.max(1);
        let mut pending = self.pending.lock().await;
        let duplicate = pending.iter().any(|b| {
            b.wallet == trade.wallet
                && b.market_id == trade.market_id
                && b.side == trade.side
                && outcome_eq(&b.outcome, &trade.outcome)
        });
        if duplicate {
            return;
        }
        if pending.len() >= max_pending {
            pending.pop_front();
        }
        pending.push_back(PendingBet {
            wallet: trade.wallet.clone(),
            market_id: trade.market_id.clone(),
            outcome: trade.outcome.clone(),
            side: trade.side,
            placed_at: trade.timestamp,
        });
    }

    pub async fn pending_bets(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Check the oldest pending bets against settled positions. Returns the number resolved.
    pub async fn verify_bets(&self, now: DateTime<Utc>) -> usize {
        let max_checks = self.config.read().await.max_checks_per_cycle;
        let batch: Vec<PendingBet> = {
            let mut pending = self.pending.lock().await;
            let cutoff = now - Duration::days(PENDING_BET_MAX_AGE_DAYS);
            pending.retain(|b| b.placed_at > cutoff);
            pending.iter().take(max_checks).cloned().collect()
        };

        let mut resolved = Vec::new();
        for bet in &batch {
            self.metrics.inc_venue_calls();
            let positions = match self.venue.get_positions(&bet.wallet, Some(&bet.market_id), 10).await {
                Ok(p) => p,
                Err(e) => {
                    self.metrics.inc_venue_errors();
                    warn!("[Contrarian] Position check failed for {}: {}", bet.wallet, e);
                    continue;
                }
            };

            let winner = positions.iter().filter(|p| p.redeemable).find_map(|p| {
                if p.cur_price > 0.5 {
                    Some(p.outcome.clone())
                } else if p.cur_price < 0.5 {
                    opposite_outcome(&p.outcome).map(str::to_string)
                } else {
                    None
                }
            });

            if let Some(winner) = winner {
                let outcome_won = outcome_eq(&bet.outcome, &winner);
                let win = match bet.side {
                    TradeSide::Buy => outcome_won,
                    TradeSide::Sell => !outcome_won,
                };
                debug!(
                    "[Contrarian] {} bet on {} settled ({} won): {}",
                    bet.wallet,
                    bet.market_id,
                    winner,
                    if win { "win" } else { "loss" }
                );
                self.record_result(&bet.wallet, win);
                resolved.push(bet.clone());
            }
        }

        if !resolved.is_empty() {
            self.pending.lock().await.retain(|b| !resolved.contains(b));
        }
        resolved.len()
    }

    /// Load the table. A missing file starts empty.
    pub async fn load(&self) -> Result<usize> {
        if !self.storage.is_enabled() {
            return Ok(0);
        }
        let content = self.storage.load(CONTRARIAN_FILE).await?;
        let loaded = decode(&content);
        let count = loaded.len();
        *self.stats.write().await = loaded;
        info!("[Contrarian] Loaded {} wallets", count);
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

        let content = {
            let (max_size, target_size) = {
                let config = self.config.read().await;
                (config.max_size_bytes, config.target_size_bytes)
            };
            let mut stats = self.stats.write().await;
            let pruned = prune(&mut stats, max_size, target_size);
            if pruned > 0 {
                info!("[Contrarian] Pruned {} low-activity wallets", pruned);
            }
            encode(&stats)
        };

        match self.storage.save(CONTRARIAN_FILE, &content).await {
            Ok(()) => {
                self.metrics.inc_saves_ok();
                debug!("[Contrarian] Saved {} bytes", content.len());
                Ok(true)
            }
            Err(e) => {
                self.dirty.store(true, Ordering::SeqCst);
                self.metrics.inc_saves_failed();
                Err(e.into())
            }
        }
    }

    /// Consumer loop: applies queued results, flushes and verifies on interval
    pub async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let Some(mut rx) = self.rx.lock().await.take() else {
            warn!("[Contrarian] Consumer already running");
            return;
        };

        let (flush_secs, verify_secs) = {
            let config = self.config.read().await;
            (config.flush_interval_secs.max(1), config.verify_interval_secs.max(1))
        };
        let mut flush = interval(std::time::Duration::from_secs(flush_secs));
        let mut verify = interval(std::time::Duration::from_secs(verify_secs));
        flush.tick().await;
        verify.tick().await;

        info!("[Contrarian] Consumer started");

        loop {
            tokio::select! {
                Some(update) = rx.recv() => {
                    self.apply_result(&update.wallet, update.win).await;
                }
                _ = flush.tick() => {
                    if let Err(e) = self.save().await {
                        warn!("[Contrarian] Save failed, will retry: {}", e);
                    }
                }
                _ = verify.tick() => {
                    let resolved = self.verify_bets(Utc::now()).await;
                    if resolved > 0 {
                        info!("[Contrarian] {} contrarian bets settled", resolved);
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        let mut drained = 0;
        while let Ok(update) = rx.try_recv() {
            self.apply_result(&update.wallet, update.win).await;
            drained += 1;
        }
        if drained > 0 {
            debug!("[Contrarian] Applied {} queued results on shutdown", drained);
        }

        match tokio::time::timeout(FINAL_SAVE_TIMEOUT, self.save()).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => error!("[Contrarian] Final save failed: {}", e),
            Err(_) => error!("[Contrarian] Final save timed out"),
        }
        info!("[Contrarian] Consumer stopped");
    }
}

/// One `address:wins:losses` line per wallet, sorted by address
pub fn encode(stats: &HashMap<String, ContrarianStats>) -> String {
    let mut wallets: Vec<_> = stats.iter().collect();
    wallets.sort_by(|a, b| a.0.cmp(b.0));
    let mut out = String::with_capacity(wallets.len() * BYTES_PER_ENTRY);
    for (wallet, s) in wallets {
        out.push_str(&format!("{}:{}:{}\n", wallet, s.wins, s.losses));
    }
    out
}

/// Parse the compact table. Malformed lines are skipped.
pub fn decode(content: &str) -> HashMap<String, ContrarianStats> {
    let mut stats = HashMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut parts = line.split(':');
        let parsed = match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(wallet), Some(wins), Some(losses), None) if !wallet.is_empty() => {
                match (wins.parse::<u16>(), losses.parse::<u16>()) {
                    (Ok(wins), Ok(losses)) => Some((normalize_wallet(wallet), ContrarianStats { wins, losses })),
                    _ => None,
                }
            }
            _ => None,
        };
        match parsed {
            Some((wallet, s)) => {
                stats.insert(wallet, s);
            }
            None => debug!("[Contrarian] Skipping malformed line: {}", line),
        }
    }
    stats
}

/// Drop low-activity wallets until the estimated size fits the target.
/// Returns the number of wallets removed.
pub fn prune(stats: &mut HashMap<String, ContrarianStats>, max_size: usize, target_size: usize) -> usize {
    let estimate = |n: usize| n * BYTES_PER_ENTRY;
    if estimate(stats.len()) <= max_size {
        return 0;
    }
    let before = stats.len();
    for threshold in 2..100u32 {
        stats.retain(|_, s| s.total() >= threshold);
        if estimate(stats.len()) <= target_size {
            break;
        }
    }
    before - stats.len()
}
