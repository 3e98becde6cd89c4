//! Venue client: positions, trades, activity and market metadata
//!
//! Detectors only see the `VenueClient` trait. `PolymarketClient` talks to the
//! public data and gamma APIs; `StaticVenue` serves canned data for tests and
//! offline runs.

use crate::config::VenueConfig;
use crate::services::retry::{with_retry, RetryConfig, Retryable};
use crate::types::{normalize_wallet, MarketInfo, MarketTrade, Position, UserActivity};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Page size convention of the trades endpoint
pub const TRADES_PAGE_SIZE: u32 = 1000;

/// Errors returned by venue calls
#[derive(Debug, Error)]
pub enum VenueError {
    #[error("venue request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("venue returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("failed to decode venue response: {0}")]
    Decode(String),
}

impl Retryable for VenueError {
    fn is_retryable(&self) -> bool {
        match self {
            VenueError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            VenueError::Status { status, .. } => *status == 429 || *status >= 500,
            VenueError::Decode(_) => false,
        }
    }
}

/// Market metadata search
#[derive(Debug, Clone, Default)]
pub struct MarketQuery {
    /// Case-insensitive substring of the market question
    pub text: String,
    /// Only markets closed within this range
    pub closed_between: Option<(DateTime<Utc>, DateTime<Utc>)>,
    pub limit: u32,
}

/// Read-only view of the venue consumed by the detectors
#[async_trait]
pub trait VenueClient: Send + Sync {
    /// Positions for a wallet, optionally restricted to one market
    async fn get_positions(
        &self,
        wallet: &str,
        market: Option<&str>,
        limit: u32,
    ) -> Result<Vec<Position>, VenueError>;

    /// Newest-first trades for a market; `offset` is the pagination cursor
    async fn get_market_trades(
        &self,
        market: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<MarketTrade>, VenueError>;

    async fn get_user_activity(
        &self,
        wallet: &str,
        limit: u32,
        offset: u32,
        start: Option<i64>,
    ) -> Result<Vec<UserActivity>, VenueError>;

    async fn search_markets(&self, query: &MarketQuery) -> Result<Vec<MarketInfo>, VenueError>;
}

/// Page through a market's trades until an empty page or `max_pages`
pub async fn fetch_all_market_trades(
    venue: &dyn VenueClient,
    market: &str,
    max_pages: u32,
) -> Result<Vec<MarketTrade>, VenueError> {
    let mut all = Vec::new();
    let mut offset = 0;

    for _ in 0..max_pages {
        let page = venue.get_market_trades(market, TRADES_PAGE_SIZE, offset).await?;
        if page.is_empty() {
            break;
        }
        offset += page.len() as u32;
        all.extend(page);
    }

    debug!("Fetched {} trades for market {}", all.len(), market);
    Ok(all)
}

/// Gamma market record, only the fields we need
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GammaMarket {
    #[serde(default)]
    condition_id: Option<String>,
    #[serde(default)]
    question: Option<String>,
    #[serde(default)]
    slug: Option<String>,
    #[serde(default)]
    closed: Option<bool>,
    #[serde(default)]
    end_date: Option<DateTime<Utc>>,
    #[serde(default)]
    closed_time: Option<String>,
    #[serde(default)]
    volume_num: Option<f64>,
}

/// Polymarket data-api / gamma-api client
pub struct PolymarketClient {
    client: reqwest::Client,
    data_api_url: String,
    gamma_api_url: String,
    timeout: Duration,
    retry: RetryConfig,
    calls: AtomicU64,
    errors: AtomicU64,
}

impl PolymarketClient {
    pub fn new(config: &VenueConfig) -> Self {
        let client = reqwest::Client::builder()
            .user_agent("Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36")
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            client,
            data_api_url: config.data_api_url.trim_end_matches('/').to_string(),
            gamma_api_url: config.gamma_api_url.trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(config.request_timeout_secs.max(1)),
            retry: RetryConfig {
                max_retries: config.max_retries,
                initial_delay_ms: 500,
                ..Default::default()
            },
            calls: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    /// (calls, errors) since startup
    pub fn call_stats(&self) -> (u64, u64) {
        (self.calls.load(Ordering::Relaxed), self.errors.load(Ordering::Relaxed))
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        operation: &str,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T, VenueError> {
        let result = with_retry(&self.retry, operation, || {
            let this = self;
            async move {
                this.calls.fetch_add(1, Ordering::Relaxed);
                // Timeout is per request, never shared with a caller's deadline
                let response = this
                    .client
                    .get(url)
                    .query(query)
                    .timeout(this.timeout)
                    .send()
                    .await?;

                if !response.status().is_success() {
                    let status = response.status().as_u16();
                    let body = response.text().await.unwrap_or_default();
                    return Err(VenueError::Status { status, body });
                }

                let bytes = response.bytes().await?;
                serde_json::from_slice::<T>(&bytes).map_err(|e| VenueError::Decode(e.to_string()))
            }
        })
        .await;

        if result.is_err() {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
        result
    }
}

#[async_trait]
impl VenueClient for PolymarketClient {
    async fn get_positions(
        &self,
        wallet: &str,
        market: Option<&str>,
        limit: u32,
    ) -> Result<Vec<Position>, VenueError> {
        let url = format!("{}/positions", self.data_api_url);
        let mut query = vec![
            ("user", normalize_wallet(wallet)),
            ("limit", limit.to_string()),
            ("sizeThreshold", "0".to_string()),
        ];
        if let Some(market) = market {
            query.push(("market", market.to_string()));
        }
        self.get_json("get_positions", &url, &query).await
    }

    async fn get_market_trades(
        &self,
        market: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<MarketTrade>, VenueError> {
        let url = format!("{}/trades", self.data_api_url);
        let query = vec![
            ("market", market.to_string()),
            ("limit", limit.to_string()),
            ("offset", offset.to_string()),
            ("takerOnly", "false".to_string()),
        ];
        self.get_json("get_market_trades", &url, &query).await
    }

    async fn get_user_activity(
        &self,
        wallet: &str,
        limit: u32,
        offset: u32,
        start: Option<i64>,
    ) -> Result<Vec<UserActivity>, VenueError> {
        let url = format!("{}/activity", self.data_api_url);
        let mut query = vec![
            ("user", normalize_wallet(wallet)),
            ("limit", limit.to_string()),
            ("offset", offset.to_string()),
        ];
        if let Some(start) = start {
            query.push(("start", start.to_string()));
        }
        self.get_json("get_user_activity", &url, &query).await
    }

    async fn search_markets(&self, query: &MarketQuery) -> Result<Vec<MarketInfo>, VenueError> {
        let url = format!("{}/markets", self.gamma_api_url);
        let limit = if query.limit == 0 { 100 } else { query.limit };
        let mut params = vec![("limit", limit.to_string()), ("order", "volumeNum".to_string()), ("ascending", "false".to_string())];
        match query.closed_between {
            Some((from, to)) => {
                params.push(("closed", "true".to_string()));
                params.push(("end_date_min", from.to_rfc3339()));
                params.push(("end_date_max", to.to_rfc3339()));
            }
            None => {
                params.push(("closed", "false".to_string()));
                params.push(("active", "true".to_string()));
            }
        }

        let markets: Vec<GammaMarket> = self.get_json("search_markets", &url, &params).await?;
        let needle = query.text.to_lowercase();

        let results = markets
            .into_iter()
            .filter_map(|m| {
                let condition_id = m.condition_id?.to_lowercase();
                let question = m.question.unwrap_or_default();
                if !needle.is_empty() && !question.to_lowercase().contains(&needle) {
                    return None;
                }
                Some(MarketInfo {
                    condition_id,
                    question,
                    slug: m.slug.unwrap_or_default(),
                    closed: m.closed.unwrap_or(false) || m.closed_time.is_some(),
                    end_date: m.end_date,
                    volume: m.volume_num.unwrap_or(0.0),
                })
            })
            .collect();

        Ok(results)
    }
}

/// In-memory venue serving canned responses
#[derive(Default)]
pub struct StaticVenue {
    positions: Mutex<HashMap<(String, String), Vec<Position>>>,
    wallet_positions: Mutex<HashMap<String, Vec<Position>>>,
    trades: Mutex<HashMap<String, Vec<MarketTrade>>>,
    activity: Mutex<HashMap<String, Vec<UserActivity>>>,
    markets: Mutex<Vec<MarketInfo>>,
    calls: AtomicU64,
    failing: AtomicBool,
}

impl StaticVenue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_positions(&self, wallet: &str, market: &str, positions: Vec<Position>) {
        if let Ok(mut map) = self.positions.lock() {
            map.insert((normalize_wallet(wallet), market.to_lowercase()), positions);
        }
    }

    /// Positions returned when no market filter is given
    pub fn set_wallet_positions(&self, wallet: &str, positions: Vec<Position>) {
        if let Ok(mut map) = self.wallet_positions.lock() {
            map.insert(normalize_wallet(wallet), positions);
        }
    }

    /// Trades are stored as given and served newest-first
    pub fn set_market_trades(&self, market: &str, mut trades: Vec<MarketTrade>) {
        trades.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        if let Ok(mut map) = self.trades.lock() {
            map.insert(market.to_lowercase(), trades);
        }
    }

    pub fn set_activity(&self, wallet: &str, activity: Vec<UserActivity>) {
        if let Ok(mut map) = self.activity.lock() {
            map.insert(normalize_wallet(wallet), activity);
        }
    }

    pub fn set_markets(&self, markets: Vec<MarketInfo>) {
        if let Ok(mut list) = self.markets.lock() {
            *list = markets;
        }
    }

    /// Make every call fail with a 503
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    fn begin_call(&self) -> Result<(), VenueError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(VenueError::Status {
                status: 503,
                body: "unavailable".to_string(),
            });
        }
        Ok(())
    }
}

fn page<T: Clone>(items: &[T], limit: u32, offset: u32) -> Vec<T> {
    items
        .iter()
        .skip(offset as usize)
        .take(limit as usize)
        .cloned()
        .collect()
}

#[async_trait]
impl VenueClient for StaticVenue {
    async fn get_positions(
        &self,
        wallet: &str,
        market: Option<&str>,
        limit: u32,
    ) -> Result<Vec<Position>, VenueError> {
        self.begin_call()?;
        let wallet = normalize_wallet(wallet);
        let positions = match market {
            Some(market) => self
                .positions
                .lock()
                .ok()
                .and_then(|map| map.get(&(wallet, market.to_lowercase())).cloned()),
            None => self
                .wallet_positions
                .lock()
                .ok()
                .and_then(|map| map.get(&wallet).cloned()),
        };
        Ok(page(&positions.unwrap_or_default(), limit, 0))
    }

    async fn get_market_trades(
        &self,
        market: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<MarketTrade>, VenueError> {
        self.begin_call()?;
        let trades = self
            .trades
            .lock()
            .ok()
            .and_then(|map| map.get(&market.to_lowercase()).cloned())
            .unwrap_or_default();
        Ok(page(&trades, limit, offset))
    }

    async fn get_user_activity(
        &self,
        wallet: &str,
        limit: u32,
        offset: u32,
        start: Option<i64>,
    ) -> Result<Vec<UserActivity>, VenueError> {
        self.begin_call()?;
        let activity: Vec<UserActivity> = self
            .activity
            .lock()
            .ok()
            .and_then(|map| map.get(&normalize_wallet(wallet)).cloned())
            .unwrap_or_default()
            .into_iter()
            .filter(|a| start.map(|s| a.timestamp >= s).unwrap_or(true))
            .collect();
        Ok(page(&activity, limit, offset))
    }

    async fn search_markets(&self, query: &MarketQuery) -> Result<Vec<MarketInfo>, VenueError> {
        self.begin_call()?;
        let needle = query.text.to_lowercase();
        let markets = self.markets.lock().map(|m| m.clone()).unwrap_or_default();
        Ok(markets
            .into_iter()
            .filter(|m| needle.is_empty() || m.question.to_lowercase().contains(&needle))
            .filter(|m| match query.closed_between {
                Some((from, to)) => m.closed && m.end_date.map(|d| d >= from && d <= to).unwrap_or(false),
                None => !m.closed,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trade(ts: i64) -> MarketTrade {
        MarketTrade {
            transaction_hash: format!("0x{}", ts),
            proxy_wallet: "0xw".into(),
            condition_id: "m1".into(),
            side: "BUY".into(),
            timestamp: ts,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_fetch_all_market_trades_stops_on_empty_page() {
        let venue = StaticVenue::new();
        venue.set_market_trades("m1", (0..2500).map(trade).collect());

        let all = fetch_all_market_trades(&venue, "m1", 10).await.unwrap();
        assert_eq!(all.len(), 2500);
        // 3 full or partial pages plus the terminating empty page
        assert_eq!(venue.call_count(), 4);
        assert_eq!(all[0].timestamp, 2499);
    }

    #[tokio::test]
    async fn test_positions_are_keyed_case_insensitively() {
        let venue = StaticVenue::new();
        venue.set_positions("0xABC", "M1", vec![Position::new("Yes", 10.0, 0.5, 0.5)]);
        let positions = venue.get_positions("0xabc", Some("m1"), 10).await.unwrap();
        assert_eq!(positions.len(), 1);
        assert!(venue.get_positions("0xabc", Some("m2"), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failing_venue_returns_retryable_error() {
        let venue = StaticVenue::new();
        venue.set_failing(true);
        let err = venue.get_positions("0xabc", None, 10).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_gamma_market_decodes() {
        let raw = r#"[{"conditionId":"0xABC","question":"Will it rain?","slug":"rain","closed":false,"volumeNum":1234.5}]"#;
        let markets: Vec<GammaMarket> = serde_json::from_str(raw).unwrap();
        assert_eq!(markets[0].condition_id.as_deref(), Some("0xABC"));
        assert_eq!(markets[0].volume_num, Some(1234.5));
    }
}
