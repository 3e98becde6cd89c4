//! Trade Poller - turns venue trade history into a live trade stream
//!
//! A refresh loop keeps the set of watched markets current (static list plus
//! gamma search results). The poll loop reads the newest trades of every
//! watched market, drops ids it has already seen and forwards the rest to the
//! dispatcher. The first poll of a market only primes the seen-set.

use crate::config::PollerConfig;
use crate::services::metrics::Metrics;
use crate::types::TradeEvent;
use crate::venue::{MarketQuery, VenueClient};
use anyhow::Result;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::time::interval;
use tracing::{debug, info, warn};

/// Bounded set of trade ids, oldest evicted first
struct SeenSet {
    order: VecDeque<String>,
    ids: HashSet<String>,
    capacity: usize,
}

impl SeenSet {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            ids: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    /// Returns true if the id was not seen before
    fn insert(&mut self, id: &str) -> bool {
        if self.ids.contains(id) {
            return false;
        }
        while self.order.len() >= self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.ids.remove(&old);
            }
        }
        self.ids.insert(id.to_string());
        self.order.push_back(id.to_string());
        true
    }
}

struct PollState {
    seen: SeenSet,
    primed: HashSet<String>,
}

pub struct TradePoller {
    venue: Arc<dyn VenueClient>,
    config: RwLock<PollerConfig>,
    markets: RwLock<Vec<String>>,
    state: Mutex<PollState>,
    metrics: Metrics,
}

impl TradePoller {
    pub fn new(venue: Arc<dyn VenueClient>, config: PollerConfig, metrics: Metrics) -> Self {
        let seen = SeenSet::new(config.seen_capacity);
        Self {
            venue,
            markets: RwLock::new(config.markets.clone()),
            config: RwLock::new(config),
            state: Mutex::new(PollState {
                seen,
                primed: HashSet::new(),
            }),
            metrics,
        }
    }

    pub async fn update_config(&self, config: PollerConfig) {
        *self.config.write().await = config;
    }

    pub async fn markets(&self) -> Vec<String> {
        self.markets.read().await.clone()
    }

    /// Rebuild the watched-market list. Returns the number of markets watched.
    pub async fn refresh_markets(&self) -> Result<usize> {
        let config = self.config.read().await.clone();
        let mut markets: Vec<String> = config.markets.iter().map(|m| m.to_lowercase()).collect();

        let mut found = Vec::new();
        for term in &config.search_terms {
            self.metrics.inc_venue_calls();
            let query = MarketQuery {
                text: term.clone(),
                closed_between: None,
                limit: config.max_markets as u32,
            };
            match self.venue.search_markets(&query).await {
                Ok(results) => found.extend(results.into_iter().filter(|m| !m.closed)),
                Err(e) => {
                    self.metrics.inc_venue_errors();
                    warn!("[TradePoller] Market search '{}' failed: {}", term, e);
                }
            }
        }
        found.sort_by(|a, b| b.volume.partial_cmp(&a.volume).unwrap_or(std::cmp::Ordering::Equal));
        for market in found {
            if !markets.contains(&market.condition_id) {
                markets.push(market.condition_id);
            }
        }
        markets.truncate(config.max_markets.max(1));

        let count = markets.len();
        *self.markets.write().await = markets;
        Ok(count)
    }

    /// Poll every watched market once. Returns the number of trades forwarded.
    pub async fn poll_once(&self, trade_tx: &mpsc::Sender<TradeEvent>) -> usize {
        let limit = self.config.read().await.trades_per_poll;
        let markets = self.markets().await;
        let mut forwarded = 0;

        for market in markets {
            self.metrics.inc_venue_calls();
            let trades = match self.venue.get_market_trades(&market, limit, 0).await {
                Ok(t) => t,
                Err(e) => {
                    self.metrics.inc_venue_errors();
                    warn!("[TradePoller] Poll failed for {}: {}", market, e);
                    continue;
                }
            };

            // Oldest first so the dispatcher sees trades in order
            let events: Vec<TradeEvent> = trades.iter().rev().filter_map(TradeEvent::from_market_trade).collect();

            let fresh: Vec<TradeEvent> = {
                let mut state = self.state.lock().await;
                let priming = state.primed.insert(market.clone());
                let fresh: Vec<TradeEvent> = events.into_iter().filter(|e| state.seen.insert(&e.id)).collect();
                if priming {
                    debug!("[TradePoller] Primed {} with {} trades", market, fresh.len());
                    continue;
                }
                fresh
            };

            for event in fresh {
                match trade_tx.try_send(event) {
                    Ok(()) => forwarded += 1,
                    Err(e) => {
                        self.metrics.inc_dropped_updates();
                        debug!("[TradePoller] Dropped trade: {}", e);
                    }
                }
            }
        }
        forwarded
    }

    pub async fn run(self: Arc<Self>, trade_tx: mpsc::Sender<TradeEvent>, mut shutdown_rx: watch::Receiver<bool>) {
        let (poll_every, refresh_every) = {
            let config = self.config.read().await;
            (
                Duration::from_secs(config.poll_interval_secs.max(1)),
                Duration::from_secs(config.refresh_interval_secs.max(1)),
            )
        };
        let mut poll_tick = interval(poll_every);
        let mut refresh_tick = interval(refresh_every);

        match self.refresh_markets().await {
            Ok(count) => info!("[TradePoller] Watching {} markets", count),
            Err(e) => warn!("[TradePoller] Initial market refresh failed: {}", e),
        }
        refresh_tick.tick().await;

        loop {
            tokio::select! {
                _ = poll_tick.tick() => {
                    let forwarded = self.poll_once(&trade_tx).await;
                    if forwarded > 0 {
                        debug!("[TradePoller] Forwarded {} trades", forwarded);
                    }
                }
                _ = refresh_tick.tick() => {
                    match self.refresh_markets().await {
                        Ok(count) => debug!("[TradePoller] Watching {} markets", count),
                        Err(e) => warn!("[TradePoller] Market refresh failed: {}", e),
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
        info!("[TradePoller] Stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MarketInfo, MarketTrade};
    use crate::venue::StaticVenue;

    fn raw(hash: &str, ts: i64) -> MarketTrade {
        MarketTrade {
            transaction_hash: hash.into(),
            proxy_wallet: "0x1111111111111111111111111111111111111111".into(),
            condition_id: "m1".into(),
            asset: "tok".into(),
            outcome: "Yes".into(),
            side: "BUY".into(),
            size: 100.0,
            price: 0.5,
            timestamp: ts,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_first_poll_primes_then_forwards_new_trades() {
        let venue = Arc::new(StaticVenue::new());
        venue.set_market_trades("m1", vec![raw("0xa", 1), raw("0xb", 2)]);
        let poller = TradePoller::new(
            venue.clone(),
            PollerConfig {
                markets: vec!["m1".into()],
                ..Default::default()
            },
            Metrics::new(),
        );
        let (tx, mut rx) = mpsc::channel(10);

        assert_eq!(poller.poll_once(&tx).await, 0);

        venue.set_market_trades("m1", vec![raw("0xa", 1), raw("0xb", 2), raw("0xc", 3), raw("0xd", 4)]);
        assert_eq!(poller.poll_once(&tx).await, 2);
        assert_eq!(rx.recv().await.unwrap().timestamp.timestamp(), 3);
        assert_eq!(rx.recv().await.unwrap().timestamp.timestamp(), 4);

        assert_eq!(poller.poll_once(&tx).await, 0);
    }

    #[tokio::test]
    async fn test_full_channel_drops() {
        let venue = Arc::new(StaticVenue::new());
        venue.set_market_trades("m1", vec![]);
        let metrics = Metrics::new();
        let poller = TradePoller::new(
            venue.clone(),
            PollerConfig {
                markets: vec!["m1".into()],
                ..Default::default()
            },
            metrics.clone(),
        );
        let (tx, _rx) = mpsc::channel(1);
        poller.poll_once(&tx).await;

        venue.set_market_trades("m1", vec![raw("0xa", 1), raw("0xb", 2), raw("0xc", 3)]);
        assert_eq!(poller.poll_once(&tx).await, 1);
        assert_eq!(metrics.snapshot().dropped_updates, 2);
    }

    #[tokio::test]
    async fn test_refresh_merges_static_and_searched_markets() {
        let venue = Arc::new(StaticVenue::new());
        venue.set_markets(vec![
            MarketInfo {
                condition_id: "0xsmall".into(),
                question: "Will BTC hit 100k?".into(),
                volume: 10.0,
                ..Default::default()
            },
            MarketInfo {
                condition_id: "0xbig".into(),
                question: "Will BTC hit 150k?".into(),
                volume: 1000.0,
                ..Default::default()
            },
            MarketInfo {
                condition_id: "0xother".into(),
                question: "Election winner".into(),
                volume: 5000.0,
                ..Default::default()
            },
        ]);
        let poller = TradePoller::new(
            venue,
            PollerConfig {
                markets: vec!["0xstatic".into()],
                search_terms: vec!["btc".into()],
                max_markets: 2,
                ..Default::default()
            },
            Metrics::new(),
        );
        assert_eq!(poller.refresh_markets().await.unwrap(), 2);
        assert_eq!(poller.markets().await, vec!["0xstatic".to_string(), "0xbig".to_string()]);
    }
}
