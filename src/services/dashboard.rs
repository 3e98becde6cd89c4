//! Dashboard aggregates over emitted alerts
//!
//! Totals, per-kind counters, a ring of recent alerts, bounded top-wallet and
//! top-market counters and a 24-slot hourly sparkline.

use crate::config::AlertConfig;
use crate::services::metrics::MetricsSnapshot;
use crate::types::{Alert, AlertKind};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use tokio::sync::RwLock;

const HOURS: usize = 24;

#[derive(Debug, Clone, Serialize)]
pub struct TopEntry {
    pub key: String,
    pub label: String,
    pub count: u64,
}

/// Delivery status of one notifier sink
#[derive(Debug, Clone, Default, Serialize)]
pub struct SinkStatus {
    pub name: String,
    pub enabled: bool,
    pub sent: u64,
    pub failed: u64,
    pub last_error: Option<String>,
    pub last_success: Option<DateTime<Utc>>,
}

/// Detector state sizes, filled in by the runner
#[derive(Debug, Clone, Default, Serialize)]
pub struct DetectorSummary {
    pub wallet_stats_cached: usize,
    pub contrarian_wallets: usize,
    pub contrarian_pending_bets: usize,
    pub leader_trades: usize,
    pub top_copiers: Vec<(String, u32)>,
    pub hedge_pending_events: usize,
    pub pattern_pending_exits: usize,
    pub pattern_pending_moves: usize,
    pub pattern_accumulations: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct DashboardSnapshot {
    pub started_at: DateTime<Utc>,
    pub uptime_secs: i64,
    pub total_alerts: u64,
    pub by_kind: BTreeMap<String, u64>,
    pub recent: Vec<Alert>,
    pub top_wallets: Vec<TopEntry>,
    pub top_markets: Vec<TopEntry>,
    /// Alerts per hour, oldest first, ending with the current hour
    pub hourly: Vec<u64>,
    pub sinks: Vec<SinkStatus>,
    pub metrics: MetricsSnapshot,
    pub detectors: DetectorSummary,
}

#[derive(Debug, Clone, Default)]
struct Counted {
    label: String,
    count: u64,
}

#[derive(Debug)]
struct DashboardState {
    total: u64,
    by_kind: HashMap<AlertKind, u64>,
    recent: VecDeque<Alert>,
    wallets: HashMap<String, Counted>,
    markets: HashMap<String, Counted>,
    /// (hour since epoch, count) per slot
    hourly: [(i64, u64); HOURS],
}

pub struct Dashboard {
    started_at: DateTime<Utc>,
    recent_capacity: usize,
    top_capacity: usize,
    state: RwLock<DashboardState>,
}

fn hour_of(ts: DateTime<Utc>) -> i64 {
    ts.timestamp().div_euclid(3600)
}

/// Bump a key, evicting the smallest counter when the map is full
fn bump(map: &mut HashMap<String, Counted>, key: &str, label: &str, capacity: usize) {
    if !map.contains_key(key) && map.len() >= capacity.max(1) {
        let smallest = map.iter().min_by_key(|(_, c)| c.count).map(|(k, _)| k.clone());
        if let Some(k) = smallest {
            map.remove(&k);
        }
    }
    let entry = map.entry(key.to_string()).or_default();
    entry.count += 1;
    if !label.is_empty() {
        entry.label = label.to_string();
    }
}

fn top(map: &HashMap<String, Counted>, n: usize) -> Vec<TopEntry> {
    let mut entries: Vec<TopEntry> = map
        .iter()
        .map(|(k, c)| TopEntry {
            key: k.clone(),
            label: c.label.clone(),
            count: c.count,
        })
        .collect();
    entries.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.key.cmp(&b.key)));
    entries.truncate(n);
    entries
}

impl Dashboard {
    pub fn new(config: &AlertConfig) -> Self {
        Self {
            started_at: Utc::now(),
            recent_capacity: config.recent_capacity.max(1),
            top_capacity: config.top_k_capacity.max(1),
            state: RwLock::new(DashboardState {
                total: 0,
                by_kind: HashMap::new(),
                recent: VecDeque::new(),
                wallets: HashMap::new(),
                markets: HashMap::new(),
                hourly: [(0, 0); HOURS],
            }),
        }
    }

    pub async fn record(&self, alert: &Alert) {
        let mut state = self.state.write().await;
        state.total += 1;
        *state.by_kind.entry(alert.kind).or_insert(0) += 1;

        if state.recent.len() >= self.recent_capacity {
            state.recent.pop_back();
        }
        state.recent.push_front(alert.clone());

        bump(&mut state.wallets, &alert.wallet, &alert.wallet, self.top_capacity);
        bump(&mut state.markets, &alert.market_id, &alert.market_title, self.top_capacity);

        let hour = hour_of(alert.timestamp);
        let slot = &mut state.hourly[hour.rem_euclid(HOURS as i64) as usize];
        if slot.0 == hour {
            slot.1 += 1;
        } else if slot.0 < hour {
            *slot = (hour, 1);
        }
    }

    pub async fn total(&self) -> u64 {
        self.state.read().await.total
    }

    /// Most recent first
    pub async fn recent(&self, limit: usize) -> Vec<Alert> {
        self.state.read().await.recent.iter().take(limit).cloned().collect()
    }

    /// Aggregates as of `now`. Sinks, metrics and detector sizes are left empty.
    pub async fn snapshot_at(&self, now: DateTime<Utc>, top_n: usize) -> DashboardSnapshot {
        let state = self.state.read().await;
        let current = hour_of(now);
        let hourly = (0..HOURS as i64)
            .rev()
            .map(|back| {
                let hour = current - back;
                let slot = state.hourly[hour.rem_euclid(HOURS as i64) as usize];
                if slot.0 == hour {
                    slot.1
                } else {
                    0
                }
            })
            .collect();

        DashboardSnapshot {
            started_at: self.started_at,
            uptime_secs: (now - self.started_at).num_seconds().max(0),
            total_alerts: state.total,
            by_kind: AlertKind::ALL
                .iter()
                .map(|k| (k.as_str().to_string(), state.by_kind.get(k).copied().unwrap_or(0)))
                .collect(),
            recent: state.recent.iter().cloned().collect(),
            top_wallets: top(&state.wallets, top_n),
            top_markets: top(&state.markets, top_n),
            hourly,
            sinks: Vec::new(),
            metrics: MetricsSnapshot::default(),
            detectors: DetectorSummary::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AlertDetails;
    use chrono::Duration;

    fn alert(wallet: &str, market: &str, at: DateTime<Utc>) -> Alert {
        Alert::for_market(wallet, market, "Title", "slug", at, AlertDetails::MassiveTrade { notional: 1.0 })
    }

    #[tokio::test]
    async fn test_counts_and_recent_ring() {
        let dashboard = Dashboard::new(&AlertConfig {
            recent_capacity: 2,
            ..Default::default()
        });
        let now = Utc::now();
        dashboard.record(&alert("0xa", "m1", now)).await;
        dashboard.record(&alert("0xb", "m1", now)).await;
        dashboard.record(&alert("0xa", "m2", now)).await;

        let snap = dashboard.snapshot_at(now, 10).await;
        assert_eq!(snap.total_alerts, 3);
        assert_eq!(snap.by_kind["massive_trade"], 3);
        assert_eq!(snap.by_kind["high_win_rate"], 0);
        assert_eq!(snap.recent.len(), 2);
        assert_eq!(snap.recent[0].market_id, "m2");
        assert_eq!(snap.top_wallets[0].key, "0xa");
        assert_eq!(snap.top_wallets[0].count, 2);
        assert_eq!(snap.top_markets[0].key, "m1");
    }

    #[tokio::test]
    async fn test_top_maps_are_bounded() {
        let dashboard = Dashboard::new(&AlertConfig {
            top_k_capacity: 2,
            ..Default::default()
        });
        let now = Utc::now();
        dashboard.record(&alert("0xa", "m1", now)).await;
        dashboard.record(&alert("0xa", "m1", now)).await;
        dashboard.record(&alert("0xb", "m1", now)).await;
        dashboard.record(&alert("0xc", "m1", now)).await;

        let snap = dashboard.snapshot_at(now, 10).await;
        assert_eq!(snap.top_wallets.len(), 2);
        assert_eq!(snap.top_wallets[0].key, "0xa");
    }

    #[tokio::test]
    async fn test_hourly_sparkline() {
        let dashboard = Dashboard::new(&AlertConfig::default());
        let now = Utc::now();
        dashboard.record(&alert("0xa", "m1", now)).await;
        dashboard.record(&alert("0xa", "m2", now - Duration::hours(2))).await;
        dashboard.record(&alert("0xa", "m3", now - Duration::hours(30))).await;

        let snap = dashboard.snapshot_at(now, 10).await;
        assert_eq!(snap.hourly.len(), 24);
        assert_eq!(snap.hourly[23], 1);
        assert_eq!(snap.hourly[21], 1);
        assert_eq!(snap.hourly.iter().sum::<u64>(), 2);
    }
}
