//! Alert Emitter - fingerprint dedup, dashboard telemetry and sink fan-out
//!
//! An alert is identified by (wallet, market, kind, time bucket). The first
//! alert with a given fingerprint is recorded on the dashboard, broadcast to
//! live subscribers and delivered to every sink concurrently. Each sink gets
//! its own timeout so a slow or failing sink never holds up the others.

use crate::config::AlertConfig;
use crate::services::dashboard::{Dashboard, DashboardSnapshot, SinkStatus};
use crate::services::metrics::Metrics;
use crate::types::Alert;
use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, info, warn};

/// Live alert stream capacity for dashboard subscribers
const BROADCAST_CAPACITY: usize = 256;

/// Downstream notifier
#[async_trait]
pub trait AlertSink: Send + Sync {
    fn name(&self) -> &str;
    async fn send(&self, alert: &Alert) -> anyhow::Result<()>;
}

/// Writes alerts to the log. Always configured.
pub struct LogSink;

#[async_trait]
impl AlertSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, alert: &Alert) -> anyhow::Result<()> {
        info!(
            "[Alert] {} {} {}: {}",
            alert.kind.title(),
            alert.wallet,
            alert.short_title(60),
            alert.details.summary()
        );
        Ok(())
    }
}

/// Deterministic identity of an alert within its time bucket
pub fn fingerprint(alert: &Alert, bucket_secs: i64) -> String {
    let bucket = alert.timestamp.timestamp().div_euclid(bucket_secs.max(1));
    let key = format!(
        "{}|{}|{}|{}",
        alert.wallet.to_lowercase(),
        alert.market_id.to_lowercase(),
        alert.kind.as_str(),
        bucket
    );
    hex::encode(Sha256::digest(key.as_bytes()))
}

/// Bounded set of recently seen fingerprints, oldest evicted first
struct FingerprintRing {
    order: VecDeque<String>,
    seen: HashSet<String>,
    capacity: usize,
}

impl FingerprintRing {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            seen: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    /// Returns false if the fingerprint was already present
    fn insert(&mut self, fp: String) -> bool {
        if self.seen.contains(&fp) {
            return false;
        }
        while self.order.len() >= self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }
        self.seen.insert(fp.clone());
        self.order.push_back(fp);
        true
    }

    fn len(&self) -> usize {
        self.order.len()
    }
}

pub struct AlertEmitter {
    config: RwLock<AlertConfig>,
    sinks: RwLock<Vec<Arc<dyn AlertSink>>>,
    status: RwLock<HashMap<String, SinkStatus>>,
    fingerprints: Mutex<FingerprintRing>,
    dashboard: Arc<Dashboard>,
    alert_tx: broadcast::Sender<Alert>,
    metrics: Metrics,
}

impl AlertEmitter {
    pub fn new(config: AlertConfig, dashboard: Arc<Dashboard>, metrics: Metrics) -> Self {
        let (alert_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            fingerprints: Mutex::new(FingerprintRing::new(config.fingerprint_capacity)),
            config: RwLock::new(config),
            sinks: RwLock::new(Vec::new()),
            status: RwLock::new(HashMap::new()),
            dashboard,
            alert_tx,
            metrics,
        }
    }

    /// Bucket size and sink timeout apply to the next alert; ring capacity is fixed
    pub async fn update_config(&self, config: AlertConfig) {
        *self.config.write().await = config;
    }

    pub async fn add_sink(&self, sink: Arc<dyn AlertSink>) {
        let name = sink.name().to_string();
        self.status.write().await.insert(
            name.clone(),
            SinkStatus {
                name,
                enabled: true,
                ..Default::default()
            },
        );
        self.sinks.write().await.push(sink);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Alert> {
        self.alert_tx.subscribe()
    }

    pub fn dashboard(&self) -> &Arc<Dashboard> {
        &self.dashboard
    }

    /// Emit an alert unless its fingerprint was seen in the current bucket.
    /// Returns true if the alert went out.
    pub async fn emit(&self, alert: Alert) -> bool {
        let (bucket_secs, sink_timeout) = {
            let config = self.config.read().await;
            (config.bucket_secs, Duration::from_secs(config.sink_timeout_secs.max(1)))
        };

        let fp = fingerprint(&alert, bucket_secs);
        if !self.fingerprints.lock().await.insert(fp) {
            self.metrics.inc_alerts_deduplicated();
            debug!(
                "[Alerts] Duplicate {} for {} in {}",
                alert.kind, alert.wallet, alert.market_id
            );
            return false;
        }

        self.dashboard.record(&alert).await;
        self.metrics.inc_alerts_emitted();
        // No subscribers is fine
        let _ = self.alert_tx.send(alert.clone());

        let sinks = self.sinks.read().await.clone();
        let results = join_all(sinks.iter().map(|sink| {
            let alert = &alert;
            async move {
                let result = match tokio::time::timeout(sink_timeout, sink.send(alert)).await {
                    Ok(r) => r,
                    Err(_) => Err(anyhow::anyhow!("timed out after {:?}", sink_timeout)),
                };
                (sink.name().to_string(), result)
            }
        }))
        .await;

        let mut status = self.status.write().await;
        for (name, result) in results {
            let entry = status.entry(name.clone()).or_insert_with(|| SinkStatus {
                name: name.clone(),
                enabled: true,
                ..Default::default()
            });
            match result {
                Ok(()) => {
                    entry.sent += 1;
                    entry.last_success = Some(Utc::now());
                }
                Err(e) => {
                    entry.failed += 1;
                    entry.last_error = Some(e.to_string());
                    self.metrics.inc_sink_failures();
                    warn!("[Alerts] Sink {} failed for {}: {}", name, alert.kind, e);
                }
            }
        }
        true
    }

    pub async fn sink_status(&self) -> Vec<SinkStatus> {
        let mut sinks: Vec<SinkStatus> = self.status.read().await.values().cloned().collect();
        sinks.sort_by(|a, b| a.name.cmp(&b.name));
        sinks
    }

    pub async fn fingerprint_count(&self) -> usize {
        self.fingerprints.lock().await.len()
    }

    /// Dashboard aggregates plus sink status and pipeline counters
    pub async fn snapshot(&self, top_n: usize) -> DashboardSnapshot {
        let mut snapshot = self.dashboard.snapshot_at(Utc::now(), top_n).await;
        snapshot.sinks = self.sink_status().await;
        snapshot.metrics = self.metrics.snapshot();
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AlertDetails, AlertKind};
    use chrono::{DateTime, TimeZone};
    use std::sync::atomic::{AtomicU64, Ordering};

    struct CountingSink {
        name: &'static str,
        fail: bool,
        delay: Option<Duration>,
        calls: AtomicU64,
    }

    impl CountingSink {
        fn new(name: &'static str, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                name,
                fail,
                delay: None,
                calls: AtomicU64::new(0),
            })
        }
    }

    #[async_trait]
    impl AlertSink for CountingSink {
        fn name(&self) -> &str {
            self.name
        }

        async fn send(&self, _alert: &Alert) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail {
                anyhow::bail!("boom");
            }
            Ok(())
        }
    }

    fn alert_at(wallet: &str, kind_notional: f64, at: DateTime<Utc>) -> Alert {
        Alert::for_market(wallet, "m1", "Title", "slug", at, AlertDetails::MassiveTrade { notional: kind_notional })
    }

    fn emitter() -> AlertEmitter {
        let config = AlertConfig::default();
        AlertEmitter::new(config.clone(), Arc::new(Dashboard::new(&config)), Metrics::new())
    }

    #[test]
    fn test_fingerprint_is_case_insensitive_and_bucketed() {
        let t0 = Utc.timestamp_opt(1_700_000_000 - 1_700_000_000 % 3600, 0).unwrap();
        let a = alert_at("0xABC", 1.0, t0);
        let mut b = alert_at("0xabc", 2.0, t0 + chrono::Duration::minutes(59));
        b.wallet = "0xABC".into();
        assert_eq!(fingerprint(&a, 3600), fingerprint(&b, 3600));

        let c = alert_at("0xabc", 1.0, t0 + chrono::Duration::minutes(61));
        assert_ne!(fingerprint(&a, 3600), fingerprint(&c, 3600));

        let mut d = a.clone();
        d.kind = AlertKind::ExtremeBet;
        assert_ne!(fingerprint(&a, 3600), fingerprint(&d, 3600));
    }

    #[tokio::test]
    async fn test_duplicate_alert_is_dropped() {
        let emitter = emitter();
        let sink = CountingSink::new("counting", false);
        emitter.add_sink(sink.clone()).await;

        let now = Utc::now();
        assert!(emitter.emit(alert_at("0xa", 1.0, now)).await);
        assert!(!emitter.emit(alert_at("0xa", 5.0, now)).await);
        assert!(emitter.emit(alert_at("0xb", 1.0, now)).await);

        assert_eq!(sink.calls.load(Ordering::SeqCst), 2);
        let snap = emitter.snapshot(10).await;
        assert_eq!(snap.total_alerts, 2);
        assert_eq!(snap.metrics.alerts_deduplicated, 1);
    }

    #[tokio::test]
    async fn test_failing_sink_is_isolated() {
        let emitter = emitter();
        let bad = CountingSink::new("bad", true);
        let good = CountingSink::new("good", false);
        emitter.add_sink(bad.clone()).await;
        emitter.add_sink(good.clone()).await;

        assert!(emitter.emit(alert_at("0xa", 1.0, Utc::now())).await);
        assert_eq!(good.calls.load(Ordering::SeqCst), 1);

        let status = emitter.sink_status().await;
        let bad_status = status.iter().find(|s| s.name == "bad").unwrap();
        assert_eq!(bad_status.failed, 1);
        assert_eq!(bad_status.last_error.as_deref(), Some("boom"));
        let good_status = status.iter().find(|s| s.name == "good").unwrap();
        assert_eq!(good_status.sent, 1);
    }

    #[tokio::test]
    async fn test_slow_sink_times_out() {
        let config = AlertConfig {
            sink_timeout_secs: 1,
            ..Default::default()
        };
        let emitter = AlertEmitter::new(config.clone(), Arc::new(Dashboard::new(&config)), Metrics::new());
        let slow = Arc::new(CountingSink {
            name: "slow",
            fail: false,
            delay: Some(Duration::from_secs(5)),
            calls: AtomicU64::new(0),
        });
        emitter.add_sink(slow).await;

        assert!(emitter.emit(alert_at("0xa", 1.0, Utc::now())).await);
        let status = emitter.sink_status().await;
        assert_eq!(status[0].failed, 1);
    }

    #[tokio::test]
    async fn test_ring_evicts_oldest() {
        let config = AlertConfig {
            fingerprint_capacity: 2,
            ..Default::default()
        };
        let emitter = AlertEmitter::new(config.clone(), Arc::new(Dashboard::new(&config)), Metrics::new());
        let now = Utc::now();
        assert!(emitter.emit(alert_at("0xa", 1.0, now)).await);
        assert!(emitter.emit(alert_at("0xb", 1.0, now)).await);
        assert!(emitter.emit(alert_at("0xc", 1.0, now)).await);
        assert_eq!(emitter.fingerprint_count().await, 2);
        // 0xa was evicted and may fire again
        assert!(emitter.emit(alert_at("0xa", 1.0, now)).await);
    }

    #[tokio::test]
    async fn test_broadcast_to_subscribers() {
        let emitter = emitter();
        let mut rx = emitter.subscribe();
        emitter.emit(alert_at("0xa", 1.0, Utc::now())).await;
        let received = rx.recv().await.unwrap();
        assert_eq!(received.wallet, "0xa");
    }
}
