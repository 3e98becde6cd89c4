//! Background services for the alert pipeline

pub mod alerts;
pub mod contrarian;
pub mod copy_tracker;
pub mod dashboard;
pub mod dispatcher;
pub mod hedge_tracker;
pub mod metrics;
pub mod pattern_tracker;
pub mod rate_limiter;
pub mod retry;
pub mod runner;
pub mod settings;
pub mod trade_poller;
pub mod wallet_stats;

use std::time::Duration;

/// Upper bound on the save a component performs while shutting down
pub const FINAL_SAVE_TIMEOUT: Duration = Duration::from_secs(30);

pub use alerts::{AlertEmitter, AlertSink, LogSink};
pub use contrarian::{ContrarianCache, ContrarianStats};
pub use copy_tracker::CopyTracker;
pub use dashboard::{Dashboard, DashboardSnapshot, DetectorSummary, SinkStatus};
pub use dispatcher::TradeDispatcher;
pub use hedge_tracker::HedgeTracker;
pub use metrics::{Metrics, MetricsSnapshot};
pub use pattern_tracker::PatternTracker;
pub use runner::{Runner, WalletSummary};
pub use settings::SettingsManager;
pub use trade_poller::TradePoller;
pub use wallet_stats::WalletStatsCache;
