//! Wallet stats cache
//!
//! Lazily builds a wallet's resolved-market record from the venue's activity
//! feed and positions, caches it for a TTL and caps the number of entries.
//! Concurrent requests for the same wallet share one upstream fetch, and a
//! failed fetch is not retried until the error backoff passes.

use crate::config::WalletStatsConfig;
use crate::services::metrics::Metrics;
use crate::types::{normalize_wallet, WalletStats};
use crate::venue::{VenueClient, VenueError};
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

pub struct WalletStatsCache {
    venue: Arc<dyn VenueClient>,
    config: RwLock<WalletStatsConfig>,
    entries: RwLock<HashMap<String, WalletStats>>,
    /// One refresh lock per wallet currently being fetched
    inflight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    /// Time of the last failed refresh per wallet
    failures: RwLock<HashMap<String, DateTime<Utc>>>,
    metrics: Metrics,
}

impl WalletStatsCache {
    pub fn new(venue: Arc<dyn VenueClient>, config: WalletStatsConfig, metrics: Metrics) -> Self {
        Self {
            venue,
            config: RwLock::new(config),
            entries: RwLock::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
            failures: RwLock::new(HashMap::new()),
            metrics,
        }
    }

    pub async fn update_config(&self, config: WalletStatsConfig) {
        *self.config.write().await = config;
    }

    /// Cached stats, refreshed when missing or older than the TTL.
    ///
    /// Returns the last known value (or `None`) when the venue fails or a
    /// recent refresh of this wallet failed.
    pub async fn get_stats(&self, wallet: &str) -> Option<WalletStats> {
        let key = normalize_wallet(wallet);
        if key.is_empty() {
            return None;
        }
        let config = self.config.read().await.clone();

        if let Some(stats) = self.fresh(&key, &config, Utc::now()).await {
            return Some(stats);
        }
        if self.backing_off(&key, &config, Utc::now()).await {
            return self.peek(&key).await;
        }

        let lock = {
            let mut inflight = self.inflight.lock().await;
            inflight
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _guard = lock.lock().await;

        // Another caller may have refreshed, or failed to, while we waited
        let now = Utc::now();
        if let Some(stats) = self.fresh(&key, &config, now).await {
            return Some(stats);
        }
        if self.backing_off(&key, &config, now).await {
            return self.peek(&key).await;
        }

        let stats = match self.fetch(&key, &config).await {
            Ok(stats) => {
                self.failures.write().await.remove(&key);
                self.insert(stats.clone(), config.max_entries).await;
                Some(stats)
            }
            Err(e) => {
                self.metrics.inc_venue_errors();
                warn!("[WalletStats] Failed to refresh {}: {}", key, e);
                self.record_failure(&key, &config, Utc::now()).await;
                self.peek(&key).await
            }
        };

        self.inflight.lock().await.remove(&key);
        stats
    }

    /// Cached value without triggering a fetch
    pub async fn peek(&self, wallet: &str) -> Option<WalletStats> {
        self.entries.read().await.get(&normalize_wallet(wallet)).cloned()
    }

    pub async fn invalidate(&self, wallet: &str) {
        self.entries.write().await.remove(&normalize_wallet(wallet));
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    async fn fresh(&self, key: &str, config: &WalletStatsConfig, now: DateTime<Utc>) -> Option<WalletStats> {
        let entries = self.entries.read().await;
        entries
            .get(key)
            .filter(|s| now - s.last_refresh < Duration::seconds(config.ttl_secs))
            .cloned()
    }

    async fn backing_off(&self, key: &str, config: &WalletStatsConfig, now: DateTime<Utc>) -> bool {
        self.failures
            .read()
            .await
            .get(key)
            .is_some_and(|at| now - *at < Duration::seconds(config.error_backoff_secs))
    }

    async fn record_failure(&self, key: &str, config: &WalletStatsConfig, now: DateTime<Utc>) {
        let backoff = Duration::seconds(config.error_backoff_secs);
        let mut failures = self.failures.write().await;
        failures.retain(|_, at| now - *at < backoff);
        failures.insert(key.to_string(), now);
    }

    async fn insert(&self, stats: WalletStats, max_entries: usize) {
        let mut entries = self.entries.write().await;
        let key = stats.wallet.clone();
        entries.insert(key.clone(), stats);

        while entries.len() > max_entries.max(1) {
            let oldest = entries
                .iter()
                .filter(|(k, _)| **k != key)
                .min_by_key(|(_, s)| s.last_refresh)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(k) => {
                    entries.remove(&k);
                }
                None => break,
            }
        }
    }

    async fn fetch(&self, wallet: &str, config: &WalletStatsConfig) -> Result<WalletStats, VenueError> {
        let mut markets: HashSet<String> = HashSet::new();
        // Per-market result; a market counts once even if redeemed in several fills
        let mut results: HashMap<String, bool> = HashMap::new();
        let page_size = config.page_size.max(1);

        for page in 0..config.max_activity_pages.max(1) {
            self.metrics.inc_venue_calls();
            let activity = self
                .venue
                .get_user_activity(wallet, page_size, page * page_size, None)
                .await?;

            for item in &activity {
                if item.condition_id.is_empty() {
                    continue;
                }
                match item.activity_type.to_uppercase().as_str() {
                    "TRADE" => {
                        markets.insert(item.condition_id.to_lowercase());
                    }
                    "REDEEM" => {
                        let won = item.usdc_size > 0.0;
                        let entry = results.entry(item.condition_id.to_lowercase()).or_insert(won);
                        *entry = *entry || won;
                    }
                    _ => {}
                }
            }

            if (activity.len() as u32) < page_size {
                break;
            }
        }

        // Settled but unredeemed positions
        self.metrics.inc_venue_calls();
        let positions = self.venue.get_positions(wallet, None, 500).await?;
        for position in positions.iter().filter(|p| p.redeemable) {
            let market = position.condition_id.to_lowercase();
            if market.is_empty() {
                continue;
            }
            markets.insert(market.clone());
            if position.cur_price > 0.5 {
                results.insert(market, true);
            } else if position.cur_price < 0.5 {
                results.entry(market).or_insert(false);
            }
        }

        for market in results.keys() {
            markets.insert(market.clone());
        }

        let wins = results.values().filter(|won| **won).count() as u32;
        let losses = results.len() as u32 - wins;

        debug!(
            "[WalletStats] {} refreshed: {}W/{}L over {} markets",
            wallet,
            wins,
            losses,
            markets.len()
        );

        Ok(WalletStats {
            wallet: wallet.to_string(),
            wins,
            losses,
            unique_markets: markets.len() as u32,
            last_refresh: Utc::now(),
        })
    }
}
