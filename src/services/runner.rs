//! Runner - builds every component from one config, starts the background
//! loops and stops them in order.

use crate::config::Config;
use crate::services::alerts::{AlertEmitter, AlertSink, LogSink};
use crate::services::contrarian::{ContrarianCache, ContrarianStats};
use crate::services::copy_tracker::CopyTracker;
use crate::services::dashboard::{Dashboard, DashboardSnapshot, DetectorSummary};
use crate::services::dispatcher::TradeDispatcher;
use crate::services::hedge_tracker::{AsymmetricExitStats, HedgeTracker};
use crate::services::metrics::Metrics;
use crate::services::pattern_tracker::{ExitTimingStats, PatternTracker, PreMoveStats};
use crate::services::settings::SettingsManager;
use crate::services::trade_poller::TradePoller;
use crate::services::wallet_stats::WalletStatsCache;
use crate::services::FINAL_SAVE_TIMEOUT;
use crate::storage::BlobStorage;
use crate::types::{normalize_wallet, Alert, TradeEvent, WalletStats};
use crate::venue::{PolymarketClient, VenueClient};
use crate::webhook::{DiscordWebhook, TelegramNotifier};
use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

const COOLDOWN_INTERVAL: Duration = Duration::from_secs(60);
const FOLLOW_UP_INTERVAL: Duration = Duration::from_secs(30);
const ALERT_CHANNEL_CAPACITY: usize = 256;
const DASHBOARD_TOP_N: usize = 10;

/// Everything the detectors know about one wallet
#[derive(Debug, Clone, Serialize)]
pub struct WalletSummary {
    pub wallet: String,
    pub stats: Option<WalletStats>,
    pub contrarian: Option<ContrarianStats>,
    pub copy_count: u32,
    pub asymmetric_exits: Option<AsymmetricExitStats>,
    pub exit_timing: Option<ExitTimingStats>,
    pub pre_move: Option<PreMoveStats>,
}

pub struct Runner {
    settings: Arc<SettingsManager>,
    metrics: Metrics,
    wallet_stats: Arc<WalletStatsCache>,
    contrarian: Arc<ContrarianCache>,
    copy: Arc<CopyTracker>,
    hedge: Arc<HedgeTracker>,
    pattern: Arc<PatternTracker>,
    emitter: Arc<AlertEmitter>,
    dispatcher: Arc<TradeDispatcher>,
    poller: Arc<TradePoller>,
    sinks: Vec<Arc<dyn AlertSink>>,
    trade_tx: mpsc::Sender<TradeEvent>,
    trade_rx: Mutex<Option<mpsc::Receiver<TradeEvent>>>,
    stages: Mutex<Vec<Stage>>,
    started: AtomicBool,
}

/// Tasks that stop together. Stages stop in the order they were started,
/// each one finishing before the next is signalled.
struct Stage {
    name: &'static str,
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Stage {
    fn new(name: &'static str) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            name,
            shutdown_tx,
            handles: Vec::new(),
        }
    }

    fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    fn spawn<F>(&mut self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.handles.push(tokio::spawn(task));
    }

    async fn stop(self, deadline: Duration) {
        self.shutdown_tx.send_replace(true);
        match tokio::time::timeout(deadline, futures::future::join_all(self.handles)).await {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result {
                        error!("[Runner] {} task ended abnormally: {}", self.name, e);
                    }
                }
                debug!("[Runner] {} stopped", self.name);
            }
            Err(_) => error!("[Runner] {} shutdown timed out after {:?}", self.name, deadline),
        }
    }
}

impl Runner {
    pub fn new(
        config: Config,
        storage: Arc<BlobStorage>,
        venue: Arc<dyn VenueClient>,
        sinks: Vec<Arc<dyn AlertSink>>,
    ) -> Self {
        let metrics = Metrics::new();

        let wallet_stats = Arc::new(WalletStatsCache::new(
            venue.clone(),
            config.wallet_stats.clone(),
            metrics.clone(),
        ));
        let contrarian = Arc::new(ContrarianCache::new(
            storage.clone(),
            venue.clone(),
            config.contrarian.clone(),
            metrics.clone(),
        ));
        let copy = Arc::new(CopyTracker::new(config.copy.clone(), contrarian.clone()));
        let hedge = Arc::new(HedgeTracker::new(
            storage.clone(),
            venue.clone(),
            config.hedge.clone(),
            metrics.clone(),
        ));
        let pattern = Arc::new(PatternTracker::new(
            storage,
            venue.clone(),
            config.pattern.clone(),
            metrics.clone(),
        ));
        let dashboard = Arc::new(Dashboard::new(&config.alerts));
        let emitter = Arc::new(AlertEmitter::new(
            config.alerts.clone(),
            dashboard,
            metrics.clone(),
        ));
        let dispatcher = Arc::new(TradeDispatcher::new(
            config.dispatcher.clone(),
            wallet_stats.clone(),
            contrarian.clone(),
            copy.clone(),
            hedge.clone(),
            pattern.clone(),
            emitter.clone(),
            metrics.clone(),
        ));
        let poller = Arc::new(TradePoller::new(venue, config.poller.clone(), metrics.clone()));

        let (trade_tx, trade_rx) = mpsc::channel(config.poller.channel_capacity.max(1));

        Self {
            settings: Arc::new(SettingsManager::new(config)),
            metrics,
            wallet_stats,
            contrarian,
            copy,
            hedge,
            pattern,
            emitter,
            dispatcher,
            poller,
            sinks,
            trade_tx,
            trade_rx: Mutex::new(Some(trade_rx)),
            stages: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    /// Production wiring: data/gamma API client, gist storage and every
    /// configured notifier
    pub fn from_config(config: Config) -> Self {
        let storage = Arc::new(BlobStorage::from_config(&config.storage));
        Self::with_storage(config, storage)
    }

    /// Production venue and notifiers over the given storage
    pub fn with_storage(config: Config, storage: Arc<BlobStorage>) -> Self {
        let venue: Arc<dyn VenueClient> = Arc::new(PolymarketClient::new(&config.venue));

        let mut sinks: Vec<Arc<dyn AlertSink>> = vec![Arc::new(LogSink)];
        if let Some(url) = &config.notifier.discord_webhook_url {
            sinks.push(Arc::new(DiscordWebhook::new(url.clone())));
        }
        if let (Some(token), Some(chat)) = (
            &config.notifier.telegram_bot_token,
            &config.notifier.telegram_chat_id,
        ) {
            sinks.push(Arc::new(TelegramNotifier::new(token.clone(), chat.clone())));
        }

        Self::new(config, storage, venue, sinks)
    }

    /// Load persisted state and spawn the background loops. Calling it twice is an error.
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            anyhow::bail!("runner already started");
        }

        let contrarian = self.contrarian.load().await.context("loading contrarian records")?;
        let hedge = self.hedge.load().await.context("loading hedge tracker state")?;
        let pattern = self.pattern.load().await.context("loading pattern tracker state")?;
        info!(
            "[Runner] Restored {} contrarian wallets, {} hedge records, {} pattern records",
            contrarian, hedge, pattern
        );

        for sink in &self.sinks {
            self.emitter.add_sink(sink.clone()).await;
        }

        // Stop order: ingest first so nothing mutates detector state after
        // its final save, then the trackers from the most downstream up.
        let mut ingest = Stage::new("ingest");
        let mut patterns = Stage::new("pattern tracker");
        let mut hedges = Stage::new("hedge tracker");
        let mut contrarian = Stage::new("contrarian");

        contrarian.spawn(self.contrarian.clone().run(contrarian.shutdown_rx()));
        hedges.spawn(self.hedge.clone().run(hedges.shutdown_rx()));

        let (alert_tx, alert_rx) = mpsc::channel(ALERT_CHANNEL_CAPACITY);
        patterns.spawn(self.pattern.clone().run(alert_tx, patterns.shutdown_rx()));
        patterns.spawn(emit_loop(alert_rx, self.emitter.clone()));

        ingest.spawn(follow_up_loop(
            self.hedge.clone(),
            self.emitter.clone(),
            ingest.shutdown_rx(),
        ));
        ingest.spawn(cooldown_loop(
            self.hedge.clone(),
            self.pattern.clone(),
            self.copy.clone(),
            self.dispatcher.clone(),
            ingest.shutdown_rx(),
        ));
        ingest.spawn(settings_loop(
            self.settings.subscribe(),
            self.clone_components(),
            ingest.shutdown_rx(),
        ));

        match self.trade_rx.lock().await.take() {
            Some(trade_rx) => ingest.spawn(self.dispatcher.clone().run(trade_rx, ingest.shutdown_rx())),
            None => warn!("[Runner] Trade receiver already taken"),
        }

        let poller_enabled = self.settings.current().await.poller.enabled;
        if poller_enabled {
            ingest.spawn(self.poller.clone().run(self.trade_tx.clone(), ingest.shutdown_rx()));
        }

        let stages = vec![ingest, patterns, hedges, contrarian];
        info!(
            "[Runner] Started {} tasks ({} sinks, poller {})",
            stages.iter().map(|s| s.handles.len()).sum::<usize>(),
            self.sinks.len(),
            if poller_enabled { "on" } else { "off" }
        );
        *self.stages.lock().await = stages;
        Ok(())
    }

    /// Stop stage by stage: ingest drains its queue, then each tracker
    /// applies queued updates and runs its final save. Safe to call more than once.
    pub async fn stop(&self) {
        let stages: Vec<Stage> = self.stages.lock().await.drain(..).collect();
        if stages.is_empty() {
            debug!("[Runner] Nothing to stop");
            return;
        }

        let deadline = FINAL_SAVE_TIMEOUT + Duration::from_secs(5);
        for stage in stages {
            stage.stop(deadline).await;
        }
        info!("[Runner] Stopped");
    }

    /// Feed a trade into the dispatcher queue. Dropped when the queue is full.
    pub fn submit(&self, trade: TradeEvent) -> bool {
        match self.trade_tx.try_send(trade) {
            Ok(()) => true,
            Err(e) => {
                self.metrics.inc_dropped_updates();
                debug!("[Runner] Dropped trade: {}", e);
                false
            }
        }
    }

    pub fn trade_sender(&self) -> mpsc::Sender<TradeEvent> {
        self.trade_tx.clone()
    }

    pub fn subscribe_alerts(&self) -> broadcast::Receiver<Alert> {
        self.emitter.subscribe()
    }

    pub fn settings(&self) -> &Arc<SettingsManager> {
        &self.settings
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn emitter(&self) -> &Arc<AlertEmitter> {
        &self.emitter
    }

    pub fn dispatcher(&self) -> &Arc<TradeDispatcher> {
        &self.dispatcher
    }

    pub fn contrarian(&self) -> &Arc<ContrarianCache> {
        &self.contrarian
    }

    pub fn copy_tracker(&self) -> &Arc<CopyTracker> {
        &self.copy
    }

    pub fn hedge_tracker(&self) -> &Arc<HedgeTracker> {
        &self.hedge
    }

    pub fn pattern_tracker(&self) -> &Arc<PatternTracker> {
        &self.pattern
    }

    pub fn wallet_stats(&self) -> &Arc<WalletStatsCache> {
        &self.wallet_stats
    }

    pub fn poller(&self) -> &Arc<TradePoller> {
        &self.poller
    }

    /// Dashboard aggregates plus detector sizes
    pub async fn dashboard(&self) -> DashboardSnapshot {
        let mut snapshot = self.emitter.snapshot(DASHBOARD_TOP_N).await;
        let (pending_exits, pending_moves, accumulations) = self.pattern.counts().await;
        snapshot.detectors = DetectorSummary {
            wallet_stats_cached: self.wallet_stats.len().await,
            contrarian_wallets: self.contrarian.len().await,
            contrarian_pending_bets: self.contrarian.pending_bets().await,
            leader_trades: self.copy.leader_trade_count().await,
            top_copiers: self.copy.get_top_copiers(DASHBOARD_TOP_N).await,
            hedge_pending_events: self.hedge.pending_event_count().await,
            pattern_pending_exits: pending_exits,
            pattern_pending_moves: pending_moves,
            pattern_accumulations: accumulations,
        };
        snapshot
    }

    /// Cached knowledge only; never calls the venue
    pub async fn wallet_summary(&self, wallet: &str) -> WalletSummary {
        let wallet = normalize_wallet(wallet);
        WalletSummary {
            stats: self.wallet_stats.peek(&wallet).await,
            contrarian: self.contrarian.get_stats(&wallet).await,
            copy_count: self.copy.copy_count(&wallet).await,
            asymmetric_exits: self.hedge.get_exit_stats(&wallet).await,
            exit_timing: self.pattern.get_exit_timing_stats(&wallet).await,
            pre_move: self.pattern.get_pre_move_stats(&wallet).await,
            wallet,
        }
    }

    fn clone_components(&self) -> Components {
        Components {
            wallet_stats: self.wallet_stats.clone(),
            contrarian: self.contrarian.clone(),
            copy: self.copy.clone(),
            hedge: self.hedge.clone(),
            pattern: self.pattern.clone(),
            dispatcher: self.dispatcher.clone(),
            emitter: self.emitter.clone(),
            poller: self.poller.clone(),
        }
    }
}

/// Components that take live config updates
struct Components {
    wallet_stats: Arc<WalletStatsCache>,
    contrarian: Arc<ContrarianCache>,
    copy: Arc<CopyTracker>,
    hedge: Arc<HedgeTracker>,
    pattern: Arc<PatternTracker>,
    dispatcher: Arc<TradeDispatcher>,
    emitter: Arc<AlertEmitter>,
    poller: Arc<TradePoller>,
}

impl Components {
    async fn apply(&self, config: &Config) {
        self.wallet_stats.update_config(config.wallet_stats.clone()).await;
        self.contrarian.update_config(config.contrarian.clone()).await;
        self.copy.update_config(config.copy.clone()).await;
        self.hedge.update_config(config.hedge.clone()).await;
        self.pattern.update_config(config.pattern.clone()).await;
        self.dispatcher.update_config(config.dispatcher.clone()).await;
        self.emitter.update_config(config.alerts.clone()).await;
        self.poller.update_config(config.poller.clone()).await;
    }
}

async fn follow_up_loop(
    hedge: Arc<HedgeTracker>,
    emitter: Arc<AlertEmitter>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut tick = interval(FOLLOW_UP_INTERVAL);
    loop {
        tokio::select! {
            _ = tick.tick() => {
                for alert in hedge.get_pending_follow_up_alerts().await {
                    emitter.emit(alert).await;
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}

/// Ends when the pattern tracker drops its sender
async fn emit_loop(mut alert_rx: mpsc::Receiver<Alert>, emitter: Arc<AlertEmitter>) {
    while let Some(alert) = alert_rx.recv().await {
        emitter.emit(alert).await;
    }
}

/// Per-minute limiter resets and housekeeping of the in-memory detectors
async fn cooldown_loop(
    hedge: Arc<HedgeTracker>,
    pattern: Arc<PatternTracker>,
    copy: Arc<CopyTracker>,
    dispatcher: Arc<TradeDispatcher>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut tick = interval(COOLDOWN_INTERVAL);
    tick.tick().await;
    loop {
        tokio::select! {
            _ = tick.tick() => {
                let now = Utc::now();
                hedge.limiter().reset_minute().await;
                pattern.limiter().reset_minute().await;
                let swept = hedge.limiter().sweep(now).await + pattern.limiter().sweep(now).await;
                let leader_trades = copy.prune_old_trades(now).await;
                let wallets = dispatcher.prune_recent(now).await;
                if swept + leader_trades + wallets > 0 {
                    debug!(
                        "[Runner] Swept {} cooldowns, {} leader trades, {} idle wallets",
                        swept, leader_trades, wallets
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
}

async fn settings_loop(
    mut config_rx: broadcast::Receiver<Arc<Config>>,
    components: Components,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            received = config_rx.recv() => {
                match received {
                    Ok(config) => {
                        components.apply(&config).await;
                        info!("[Runner] Applied new config");
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("[Runner] Skipped {} config updates", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}
