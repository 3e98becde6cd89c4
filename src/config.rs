//! Configuration management for the wallet monitor
//!
//! Everything is read from the environment (a `.env` file is honoured). Detector
//! thresholds live in per-component structs so they can be swapped at runtime by
//! the settings manager without touching detector state.

use anyhow::Result;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Bot configuration loaded from environment
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub storage: StorageConfig,
    pub venue: VenueConfig,
    pub wallet_stats: WalletStatsConfig,
    pub contrarian: ContrarianConfig,
    pub copy: CopyConfig,
    pub hedge: HedgeConfig,
    pub pattern: PatternConfig,
    pub dispatcher: DispatcherConfig,
    pub alerts: AlertConfig,
    pub poller: PollerConfig,
    pub notifier: NotifierConfig,
    /// Dashboard HTTP port
    pub port: u16,
}

/// Remote blob store (GitHub gist) settings
#[derive(Debug, Clone, Default)]
pub struct StorageConfig {
    /// Gist id holding the state files. Empty disables persistence.
    pub gist_id: String,
    pub github_token: Option<String>,
    pub max_retries: u32,
}

impl StorageConfig {
    pub fn is_enabled(&self) -> bool {
        !self.gist_id.trim().is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct VenueConfig {
    pub data_api_url: String,
    pub gamma_api_url: String,
    /// Per-request timeout
    pub request_timeout_secs: u64,
    pub max_retries: u32,
}

impl Default for VenueConfig {
    fn default() -> Self {
        Self {
            data_api_url: "https://data-api.polymarket.com".to_string(),
            gamma_api_url: "https://gamma-api.polymarket.com".to_string(),
            request_timeout_secs: 15,
            max_retries: 2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WalletStatsConfig {
    pub ttl_secs: i64,
    pub max_entries: usize,
    /// Activity pages fetched per refresh
    pub max_activity_pages: u32,
    pub page_size: u32,
    /// After a failed refresh, callers get the last known value without
    /// another upstream fetch for this long
    pub error_backoff_secs: i64,
}

impl Default for WalletStatsConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 3600,
            max_entries: 10_000,
            max_activity_pages: 5,
            page_size: 500,
            error_backoff_secs: 30,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ContrarianConfig {
    pub min_wins: u16,
    pub min_rate: f64,
    pub channel_capacity: usize,
    /// Estimated serialized size that triggers pruning
    pub max_size_bytes: usize,
    /// Size pruning stops at
    pub target_size_bytes: usize,
    pub flush_interval_secs: u64,
    pub verify_interval_secs: u64,
    pub max_pending_bets: usize,
    pub max_checks_per_cycle: usize,
}

impl Default for ContrarianConfig {
    fn default() -> Self {
        Self {
            min_wins: 3,
            min_rate: 0.6,
            channel_capacity: 1000,
            max_size_bytes: 900_000,
            target_size_bytes: 700_000,
            flush_interval_secs: 300,
            verify_interval_secs: 900,
            max_pending_bets: 5000,
            max_checks_per_cycle: 20,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CopyConfig {
    /// Max seconds between a leader trade and its replay
    pub window_secs: i64,
    pub min_copy_count: u32,
    pub leader_min_resolved: u32,
    pub leader_min_win_rate: f64,
    pub max_leader_trades: usize,
}

impl Default for CopyConfig {
    fn default() -> Self {
        Self {
            window_secs: 300,
            min_copy_count: 3,
            leader_min_resolved: 10,
            leader_min_win_rate: 0.7,
            max_leader_trades: 5000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HedgeConfig {
    pub enabled: bool,
    pub min_hedge_size: f64,
    pub min_hedge_value: f64,
    /// Fraction of one side that must be sold to count as a removal
    pub significant_sell_pct: f64,
    pub check_cooldown_secs: i64,
    pub max_checks_per_minute: u32,
    pub min_exits_for_asymmetric: u32,
    pub asymmetric_threshold: f64,
    pub asymmetric_cooldown_secs: i64,
    pub resolution_check_interval_secs: u64,
    pub max_resolution_checks: usize,
    pub event_retention_days: i64,
    pub state_retention_days: i64,
    pub max_tracked_positions: usize,
    pub channel_capacity: usize,
    pub save_interval_secs: u64,
}

impl Default for HedgeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_hedge_size: 100.0,
            min_hedge_value: 50.0,
            significant_sell_pct: 0.5,
            check_cooldown_secs: 300,
            max_checks_per_minute: 30,
            min_exits_for_asymmetric: 6,
            asymmetric_threshold: 2.0,
            asymmetric_cooldown_secs: 86_400,
            resolution_check_interval_secs: 900,
            max_resolution_checks: 20,
            event_retention_days: 30,
            state_retention_days: 7,
            max_tracked_positions: 50_000,
            channel_capacity: 1000,
            save_interval_secs: 300,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PatternConfig {
    pub enabled: bool,
    // Conviction doubling
    pub conviction_min_add_size: f64,
    pub conviction_min_add_value: f64,
    pub conviction_min_loss_pct: f64,
    // Stealth accumulation
    pub stealth_max_single_trade: f64,
    pub stealth_min_trades: usize,
    pub stealth_min_total_size: f64,
    pub stealth_min_total_value: f64,
    pub stealth_min_spread_mins: f64,
    pub stealth_window_secs: i64,
    // Perfect exit timing
    pub exit_check_delay_secs: i64,
    pub exit_min_exits: u32,
    pub exit_min_score: f64,
    pub exit_alert_cooldown_secs: i64,
    // Pre-move positioning
    pub pre_move_min_notional: f64,
    pub pre_move_check_delay_secs: i64,
    pub pre_move_min_move: f64,
    pub pre_move_min_trades: u32,
    pub pre_move_min_alpha: f64,
    pub pre_move_alert_cooldown_secs: i64,
    // Shared
    pub verify_interval_secs: u64,
    pub max_verifications_per_cycle: usize,
    pub verified_retention_days: i64,
    pub max_pending_records: usize,
    pub check_cooldown_secs: i64,
    pub max_checks_per_minute: u32,
    pub save_interval_secs: u64,
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            conviction_min_add_size: 500.0,
            conviction_min_add_value: 1000.0,
            conviction_min_loss_pct: 0.10,
            stealth_max_single_trade: 500.0,
            stealth_min_trades: 5,
            stealth_min_total_size: 1000.0,
            stealth_min_total_value: 2000.0,
            stealth_min_spread_mins: 30.0,
            stealth_window_secs: 6 * 3600,
            exit_check_delay_secs: 3600,
            exit_min_exits: 5,
            exit_min_score: 0.9,
            exit_alert_cooldown_secs: 86_400,
            pre_move_min_notional: 1000.0,
            pre_move_check_delay_secs: 3600,
            pre_move_min_move: 0.10,
            pre_move_min_trades: 5,
            pre_move_min_alpha: 0.7,
            pre_move_alert_cooldown_secs: 86_400,
            verify_interval_secs: 600,
            max_verifications_per_cycle: 20,
            verified_retention_days: 7,
            max_pending_records: 20_000,
            check_cooldown_secs: 300,
            max_checks_per_minute: 30,
            save_interval_secs: 300,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Trades below this notional skip the inline heuristics
    pub min_notional: f64,
    /// Wallet stats are only fetched for trades at least this large
    pub stats_min_notional: f64,
    pub high_win_rate_threshold: f64,
    pub high_win_rate_min_resolved: u32,
    pub high_win_rate_max_entry_price: f64,
    pub massive_trade_threshold: f64,
    pub massive_trade_max_price: f64,
    /// Distance from 0 or 1 that counts as an extreme price
    pub extreme_low_price: f64,
    pub extreme_min_notional: f64,
    pub contrarian_min_notional: f64,
    pub new_wallet_max_markets: u32,
    pub new_wallet_min_notional: f64,
    pub rapid_window_secs: i64,
    pub rapid_trade_threshold: usize,
    pub low_activity_window_secs: i64,
    pub low_activity_max_trades: usize,
    pub low_activity_max_markets: u32,
    pub low_activity_min_notional: f64,
    pub obvious_price: f64,
    pub monitored_only: bool,
    pub monitored_wallets: Vec<String>,
    pub max_tracked_wallets: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            min_notional: 100.0,
            stats_min_notional: 500.0,
            high_win_rate_threshold: 0.7,
            high_win_rate_min_resolved: 10,
            high_win_rate_max_entry_price: 0.9,
            massive_trade_threshold: 25_000.0,
            massive_trade_max_price: 0.95,
            extreme_low_price: 0.05,
            extreme_min_notional: 1000.0,
            contrarian_min_notional: 2500.0,
            new_wallet_max_markets: 3,
            new_wallet_min_notional: 5000.0,
            rapid_window_secs: 60,
            rapid_trade_threshold: 10,
            low_activity_window_secs: 86_400,
            low_activity_max_trades: 1,
            low_activity_max_markets: 5,
            low_activity_min_notional: 10_000.0,
            obvious_price: 0.97,
            monitored_only: false,
            monitored_wallets: Vec::new(),
            max_tracked_wallets: 50_000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AlertConfig {
    /// Fingerprint time bucket
    pub bucket_secs: i64,
    pub fingerprint_capacity: usize,
    pub recent_capacity: usize,
    pub top_k_capacity: usize,
    pub sink_timeout_secs: u64,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            bucket_secs: 3600,
            fingerprint_capacity: 10_000,
            recent_capacity: 100,
            top_k_capacity: 1000,
            sink_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub enabled: bool,
    /// Static list of condition ids to watch
    pub markets: Vec<String>,
    /// Gamma search terms used by the market refresh loop
    pub search_terms: Vec<String>,
    pub max_markets: usize,
    pub poll_interval_secs: u64,
    pub refresh_interval_secs: u64,
    pub trades_per_poll: u32,
    pub channel_capacity: usize,
    pub seen_capacity: usize,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            markets: Vec::new(),
            search_terms: Vec::new(),
            max_markets: 50,
            poll_interval_secs: 15,
            refresh_interval_secs: 600,
            trades_per_poll: 100,
            channel_capacity: 1000,
            seen_capacity: 50_000,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct NotifierConfig {
    pub discord_webhook_url: Option<String>,
    pub telegram_bot_token: Option<String>,
    pub telegram_chat_id: Option<String>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present
        dotenvy::dotenv().ok();

        let storage = StorageConfig {
            gist_id: env::var("GIST_ID").unwrap_or_default(),
            github_token: env_opt("GITHUB_TOKEN"),
            max_retries: env_parse("STORAGE_MAX_RETRIES", 3),
        };

        let venue_defaults = VenueConfig::default();
        let venue = VenueConfig {
            data_api_url: env::var("DATA_API_URL").unwrap_or(venue_defaults.data_api_url),
            gamma_api_url: env::var("GAMMA_API_URL").unwrap_or(venue_defaults.gamma_api_url),
            request_timeout_secs: env_parse("VENUE_TIMEOUT_SECS", venue_defaults.request_timeout_secs),
            max_retries: env_parse("VENUE_MAX_RETRIES", venue_defaults.max_retries),
        };

        let w = WalletStatsConfig::default();
        let wallet_stats = WalletStatsConfig {
            ttl_secs: env_parse("WALLET_STATS_TTL_SECS", w.ttl_secs),
            max_entries: env_parse("WALLET_STATS_MAX_ENTRIES", w.max_entries),
            max_activity_pages: env_parse("WALLET_STATS_MAX_PAGES", w.max_activity_pages),
            page_size: w.page_size,
            error_backoff_secs: env_parse("WALLET_STATS_ERROR_BACKOFF_SECS", w.error_backoff_secs),
        };

        let c = ContrarianConfig::default();
        let contrarian = ContrarianConfig {
            min_wins: env_parse("CONTRARIAN_MIN_WINS", c.min_wins),
            min_rate: env_parse("CONTRARIAN_MIN_RATE", c.min_rate),
            max_size_bytes: env_parse("CONTRARIAN_MAX_SIZE_BYTES", c.max_size_bytes),
            target_size_bytes: env_parse("CONTRARIAN_TARGET_SIZE_BYTES", c.target_size_bytes),
            flush_interval_secs: env_parse("CONTRARIAN_FLUSH_INTERVAL_SECS", c.flush_interval_secs),
            ..c
        };

        let cp = CopyConfig::default();
        let copy = CopyConfig {
            window_secs: env_parse("COPY_WINDOW_SECS", cp.window_secs),
            min_copy_count: env_parse("COPY_MIN_COUNT", cp.min_copy_count),
            leader_min_resolved: env_parse("COPY_LEADER_MIN_RESOLVED", cp.leader_min_resolved),
            leader_min_win_rate: env_parse("COPY_LEADER_MIN_WIN_RATE", cp.leader_min_win_rate),
            ..cp
        };

        let h = HedgeConfig::default();
        let hedge = HedgeConfig {
            enabled: env_bool("HEDGE_ENABLED", h.enabled),
            min_hedge_size: env_parse("HEDGE_MIN_SIZE", h.min_hedge_size),
            min_hedge_value: env_parse("HEDGE_MIN_VALUE", h.min_hedge_value),
            significant_sell_pct: env_parse("HEDGE_SIGNIFICANT_SELL_PCT", h.significant_sell_pct),
            check_cooldown_secs: env_parse("HEDGE_CHECK_COOLDOWN_SECS", h.check_cooldown_secs),
            max_checks_per_minute: env_parse("HEDGE_MAX_CHECKS_PER_MINUTE", h.max_checks_per_minute),
            min_exits_for_asymmetric: env_parse("ASYMMETRIC_MIN_EXITS", h.min_exits_for_asymmetric),
            asymmetric_threshold: env_parse("ASYMMETRIC_THRESHOLD", h.asymmetric_threshold),
            resolution_check_interval_secs: env_parse(
                "HEDGE_RESOLUTION_INTERVAL_SECS",
                h.resolution_check_interval_secs,
            ),
            ..h
        };

        let p = PatternConfig::default();
        let pattern = PatternConfig {
            enabled: env_bool("PATTERNS_ENABLED", p.enabled),
            conviction_min_add_size: env_parse("CONVICTION_MIN_ADD_SIZE", p.conviction_min_add_size),
            conviction_min_add_value: env_parse("CONVICTION_MIN_ADD_VALUE", p.conviction_min_add_value),
            conviction_min_loss_pct: env_parse("CONVICTION_MIN_LOSS_PCT", p.conviction_min_loss_pct),
            stealth_max_single_trade: env_parse("STEALTH_MAX_SINGLE_TRADE", p.stealth_max_single_trade),
            stealth_min_trades: env_parse("STEALTH_MIN_TRADES", p.stealth_min_trades),
            stealth_min_total_size: env_parse("STEALTH_MIN_TOTAL_SIZE", p.stealth_min_total_size),
            stealth_min_total_value: env_parse("STEALTH_MIN_TOTAL_VALUE", p.stealth_min_total_value),
            stealth_min_spread_mins: env_parse("STEALTH_MIN_SPREAD_MINS", p.stealth_min_spread_mins),
            stealth_window_secs: env_parse("STEALTH_WINDOW_SECS", p.stealth_window_secs),
            exit_check_delay_secs: env_parse("EXIT_CHECK_DELAY_SECS", p.exit_check_delay_secs),
            exit_min_exits: env_parse("EXIT_MIN_EXITS", p.exit_min_exits),
            exit_min_score: env_parse("EXIT_MIN_SCORE", p.exit_min_score),
            pre_move_min_notional: env_parse("PRE_MOVE_MIN_NOTIONAL", p.pre_move_min_notional),
            pre_move_check_delay_secs: env_parse("PRE_MOVE_CHECK_DELAY_SECS", p.pre_move_check_delay_secs),
            pre_move_min_move: env_parse("PRE_MOVE_MIN_MOVE", p.pre_move_min_move),
            pre_move_min_trades: env_parse("PRE_MOVE_MIN_TRADES", p.pre_move_min_trades),
            pre_move_min_alpha: env_parse("PRE_MOVE_MIN_ALPHA", p.pre_move_min_alpha),
            ..p
        };

        let d = DispatcherConfig::default();
        let dispatcher = DispatcherConfig {
            min_notional: env_parse("MIN_NOTIONAL", d.min_notional),
            high_win_rate_threshold: env_parse("HIGH_WIN_RATE_THRESHOLD", d.high_win_rate_threshold),
            high_win_rate_min_resolved: env_parse("HIGH_WIN_RATE_MIN_RESOLVED", d.high_win_rate_min_resolved),
            high_win_rate_max_entry_price: env_parse("HIGH_WIN_RATE_MAX_ENTRY", d.high_win_rate_max_entry_price),
            massive_trade_threshold: env_parse("MASSIVE_TRADE_THRESHOLD", d.massive_trade_threshold),
            massive_trade_max_price: env_parse("MASSIVE_TRADE_MAX_PRICE", d.massive_trade_max_price),
            extreme_low_price: env_parse("EXTREME_LOW_PRICE", d.extreme_low_price),
            extreme_min_notional: env_parse("EXTREME_MIN_NOTIONAL", d.extreme_min_notional),
            contrarian_min_notional: env_parse("CONTRARIAN_MIN_NOTIONAL", d.contrarian_min_notional),
            new_wallet_max_markets: env_parse("NEW_WALLET_MAX_MARKETS", d.new_wallet_max_markets),
            new_wallet_min_notional: env_parse("NEW_WALLET_MIN_NOTIONAL", d.new_wallet_min_notional),
            rapid_window_secs: env_parse("RAPID_WINDOW_SECS", d.rapid_window_secs),
            rapid_trade_threshold: env_parse("RAPID_TRADE_THRESHOLD", d.rapid_trade_threshold),
            low_activity_window_secs: env_parse("LOW_ACTIVITY_WINDOW_SECS", d.low_activity_window_secs),
            low_activity_max_trades: env_parse("LOW_ACTIVITY_MAX_TRADES", d.low_activity_max_trades),
            low_activity_max_markets: env_parse("LOW_ACTIVITY_MAX_MARKETS", d.low_activity_max_markets),
            low_activity_min_notional: env_parse("LOW_ACTIVITY_MIN_NOTIONAL", d.low_activity_min_notional),
            obvious_price: env_parse("OBVIOUS_PRICE", d.obvious_price),
            monitored_only: env_bool("MONITORED_ONLY", d.monitored_only),
            monitored_wallets: env_list("MONITORED_WALLETS"),
            ..d
        };

        let a = AlertConfig::default();
        let alerts = AlertConfig {
            bucket_secs: env_parse("ALERT_BUCKET_SECS", a.bucket_secs),
            ..a
        };

        let pl = PollerConfig::default();
        let poller = PollerConfig {
            enabled: env_bool("POLLER_ENABLED", pl.enabled),
            markets: env_list("POLL_MARKETS"),
            search_terms: env_list("MARKET_SEARCH_TERMS"),
            max_markets: env_parse("POLL_MAX_MARKETS", pl.max_markets),
            poll_interval_secs: env_parse("POLL_INTERVAL_SECONDS", pl.poll_interval_secs),
            refresh_interval_secs: env_parse("MARKET_REFRESH_SECONDS", pl.refresh_interval_secs),
            ..pl
        };

        let notifier = NotifierConfig {
            discord_webhook_url: env_opt("DISCORD_WEBHOOK_URL"),
            telegram_bot_token: env_opt("TELEGRAM_BOT_TOKEN"),
            telegram_chat_id: env_opt("TELEGRAM_CHAT_ID"),
        };

        let config = Self {
            storage,
            venue,
            wallet_stats,
            contrarian,
            copy,
            hedge,
            pattern,
            dispatcher,
            alerts,
            poller,
            notifier,
            port: env_parse("PORT", 3000),
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject threshold combinations that can never fire or would divide by zero
    pub fn validate(&self) -> Result<()> {
        let prices = [
            ("HIGH_WIN_RATE_MAX_ENTRY", self.dispatcher.high_win_rate_max_entry_price),
            ("MASSIVE_TRADE_MAX_PRICE", self.dispatcher.massive_trade_max_price),
            ("OBVIOUS_PRICE", self.dispatcher.obvious_price),
        ];
        for (name, value) in prices {
            if !(0.0..=1.0).contains(&value) {
                anyhow::bail!("{} must be within 0..1, got {}", name, value);
            }
        }
        if !(0.0..0.5).contains(&self.dispatcher.extreme_low_price) {
            anyhow::bail!(
                "EXTREME_LOW_PRICE must be within 0..0.5, got {}",
                self.dispatcher.extreme_low_price
            );
        }
        if self.hedge.significant_sell_pct <= 0.0 || self.hedge.significant_sell_pct > 1.0 {
            anyhow::bail!("HEDGE_SIGNIFICANT_SELL_PCT must be within (0, 1]");
        }
        if self.alerts.bucket_secs <= 0 {
            anyhow::bail!("ALERT_BUCKET_SECS must be positive");
        }
        if self.pattern.stealth_window_secs <= 0 || self.copy.window_secs <= 0 {
            anyhow::bail!("detector windows must be positive");
        }
        if self.contrarian.target_size_bytes > self.contrarian.max_size_bytes {
            anyhow::bail!("CONTRARIAN_TARGET_SIZE_BYTES must not exceed CONTRARIAN_MAX_SIZE_BYTES");
        }
        Ok(())
    }
}

impl HedgeConfig {
    pub fn save_interval(&self) -> Duration {
        Duration::from_secs(self.save_interval_secs.max(1))
    }

    pub fn resolution_interval(&self) -> Duration {
        Duration::from_secs(self.resolution_check_interval_secs.max(1))
    }
}

impl PatternConfig {
    pub fn save_interval(&self) -> Duration {
        Duration::from_secs(self.save_interval_secs.max(1))
    }

    pub fn verify_interval(&self) -> Duration {
        Duration::from_secs(self.verify_interval_secs.max(1))
    }
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.trim().is_empty())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim().to_lowercase().as_str(), "true" | "1" | "yes"))
        .unwrap_or(default)
}

/// Comma-separated list, lower-cased
fn env_list(key: &str) -> Vec<String> {
    env::var(key)
        .unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_price_bounds() {
        let mut config = Config::default();
        config.dispatcher.obvious_price = 1.5;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.dispatcher.extreme_low_price = 0.6;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_gist_disables_storage() {
        let storage = StorageConfig::default();
        assert!(!storage.is_enabled());
    }
}
