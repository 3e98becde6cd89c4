//! Core types for the wallet monitor: trade events, venue records and alerts

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Profile page base for wallet links
const PROFILE_URL: &str = "https://polymarket.com/profile";

/// Event page base for market links
const EVENT_URL: &str = "https://polymarket.com/event";

/// Lower-case a wallet address. Every cache key, record id and fingerprint goes through this.
pub fn normalize_wallet(wallet: &str) -> String {
    wallet.trim().to_lowercase()
}

/// Case-insensitive outcome comparison ("Yes" vs "YES")
pub fn outcome_eq(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}

/// The other side of a binary market, if the outcome is Yes/No
pub fn opposite_outcome(outcome: &str) -> Option<&'static str> {
    if outcome_eq(outcome, "yes") {
        Some("No")
    } else if outcome_eq(outcome, "no") {
        Some("Yes")
    } else {
        None
    }
}

/// Convert a unix timestamp (seconds) into a UTC datetime, clamping garbage to the epoch
pub fn from_unix(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_default()
}

/// Trade direction as reported by the venue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TradeSide {
    #[serde(rename = "BUY")]
    Buy,
    #[serde(rename = "SELL")]
    Sell,
}

impl TradeSide {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "BUY" => Some(TradeSide::Buy),
            "SELL" => Some(TradeSide::Sell),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TradeSide::Buy => "BUY",
            TradeSide::Sell => "SELL",
        }
    }
}

impl fmt::Display for TradeSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single fill observed on the venue.
///
/// Built once on arrival and only ever read afterwards; detectors take `&TradeEvent`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeEvent {
    /// Venue trade id (transaction hash), used for poll de-duplication
    pub id: String,
    pub wallet: String,
    pub market_id: String,
    pub outcome: String,
    pub side: TradeSide,
    /// Shares
    pub size: f64,
    /// Probability price in 0..1
    pub price: f64,
    pub timestamp: DateTime<Utc>,
    pub market_title: String,
    pub market_slug: String,
    pub token_id: String,
}

impl TradeEvent {
    /// Create a trade event with normalized wallet and market ids
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: impl Into<String>,
        wallet: &str,
        market_id: &str,
        outcome: impl Into<String>,
        side: TradeSide,
        size: f64,
        price: f64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            wallet: normalize_wallet(wallet),
            market_id: market_id.trim().to_lowercase(),
            outcome: outcome.into(),
            side,
            size,
            price,
            timestamp,
            market_title: String::new(),
            market_slug: String::new(),
            token_id: String::new(),
        }
    }

    pub fn with_market(mut self, title: impl Into<String>, slug: impl Into<String>) -> Self {
        self.market_title = title.into();
        self.market_slug = slug.into();
        self
    }

    pub fn with_token(mut self, token_id: impl Into<String>) -> Self {
        self.token_id = token_id.into();
        self
    }

    /// USDC value of the fill
    pub fn notional(&self) -> f64 {
        self.size * self.price
    }

    pub fn is_buy(&self) -> bool {
        self.side == TradeSide::Buy
    }

    pub fn is_sell(&self) -> bool {
        self.side == TradeSide::Sell
    }

    /// Key shared by the per-(wallet, market) rate limiters
    pub fn wallet_market_key(&self) -> String {
        format!("{}:{}", self.wallet, self.market_id)
    }

    /// Build a trade event from a venue market-trade record
    pub fn from_market_trade(trade: &MarketTrade) -> Option<Self> {
        let side = TradeSide::parse(&trade.side)?;
        if trade.proxy_wallet.is_empty() {
            return None;
        }
        let id = if trade.transaction_hash.is_empty() {
            format!(
                "{}:{}:{}:{}",
                trade.proxy_wallet, trade.condition_id, trade.timestamp, trade.size
            )
        } else {
            format!("{}:{}", trade.transaction_hash, trade.asset)
        };
        Some(
            Self::new(
                id,
                &trade.proxy_wallet,
                &trade.condition_id,
                trade.outcome.clone(),
                side,
                trade.size,
                trade.price,
                from_unix(trade.timestamp),
            )
            .with_market(trade.title.clone(), trade.slug.clone())
            .with_token(trade.asset.clone()),
        )
    }
}

/// Open or redeemable position returned by the data API
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    #[serde(default)]
    pub condition_id: String,
    #[serde(default)]
    pub asset: String,
    #[serde(default)]
    pub outcome: String,
    #[serde(default)]
    pub size: f64,
    #[serde(default)]
    pub avg_price: f64,
    #[serde(default)]
    pub cur_price: f64,
    #[serde(default)]
    pub redeemable: bool,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub slug: String,
}

impl Position {
    pub fn new(outcome: &str, size: f64, avg_price: f64, cur_price: f64) -> Self {
        Self {
            outcome: outcome.to_string(),
            size,
            avg_price,
            cur_price,
            ..Default::default()
        }
    }

    pub fn redeemable(mut self) -> Self {
        self.redeemable = true;
        self
    }
}

/// Trade record from the data API `/trades` endpoint
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketTrade {
    #[serde(default)]
    pub transaction_hash: String,
    #[serde(default)]
    pub proxy_wallet: String,
    #[serde(default)]
    pub condition_id: String,
    #[serde(default)]
    pub asset: String,
    #[serde(default)]
    pub outcome: String,
    #[serde(default)]
    pub side: String,
    #[serde(default)]
    pub size: f64,
    #[serde(default)]
    pub price: f64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub slug: String,
    #[serde(default)]
    pub timestamp: i64,
}

/// Activity record from the data API `/activity` endpoint
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserActivity {
    #[serde(rename = "type", default)]
    pub activity_type: String,
    #[serde(default)]
    pub condition_id: String,
    #[serde(default)]
    pub outcome: String,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub usdc_size: f64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub slug: String,
}

/// Market metadata from the gamma API
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MarketInfo {
    pub condition_id: String,
    pub question: String,
    pub slug: String,
    pub closed: bool,
    pub end_date: Option<DateTime<Utc>>,
    pub volume: f64,
}

/// Resolved-market record for a wallet, owned by the wallet stats cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletStats {
    pub wallet: String,
    pub wins: u32,
    pub losses: u32,
    pub unique_markets: u32,
    pub last_refresh: DateTime<Utc>,
}

impl WalletStats {
    /// Markets with a known result
    pub fn resolved(&self) -> u32 {
        self.wins + self.losses
    }

    /// None until at least one market has resolved
    pub fn win_rate(&self) -> Option<f64> {
        let total = self.resolved();
        if total == 0 {
            None
        } else {
            Some(self.wins as f64 / total as f64)
        }
    }
}

/// Reason an alert was raised. Declaration order is the emission priority for a single trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    HighWinRate,
    ContrarianWinner,
    MassiveTrade,
    ContrarianBet,
    ExtremeBet,
    NewWallet,
    LowActivity,
    RapidTrading,
    CopyTrader,
    HedgeRemoval,
    HedgeRemovalLoser,
    AsymmetricExit,
    ConvictionDoubling,
    StealthAccumulation,
    PerfectExitTiming,
    PreMovePositioning,
}

impl AlertKind {
    pub const ALL: [AlertKind; 16] = [
        AlertKind::HighWinRate,
        AlertKind::ContrarianWinner,
        AlertKind::MassiveTrade,
        AlertKind::ContrarianBet,
        AlertKind::ExtremeBet,
        AlertKind::NewWallet,
        AlertKind::LowActivity,
        AlertKind::RapidTrading,
        AlertKind::CopyTrader,
        AlertKind::HedgeRemoval,
        AlertKind::HedgeRemovalLoser,
        AlertKind::AsymmetricExit,
        AlertKind::ConvictionDoubling,
        AlertKind::StealthAccumulation,
        AlertKind::PerfectExitTiming,
        AlertKind::PreMovePositioning,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::HighWinRate => "high_win_rate",
            AlertKind::ContrarianWinner => "contrarian_winner",
            AlertKind::MassiveTrade => "massive_trade",
            AlertKind::ContrarianBet => "contrarian_bet",
            AlertKind::ExtremeBet => "extreme_bet",
            AlertKind::NewWallet => "new_wallet",
            AlertKind::LowActivity => "low_activity",
            AlertKind::RapidTrading => "rapid_trading",
            AlertKind::CopyTrader => "copy_trader",
            AlertKind::HedgeRemoval => "hedge_removal",
            AlertKind::HedgeRemovalLoser => "hedge_removal_loser",
            AlertKind::AsymmetricExit => "asymmetric_exit",
            AlertKind::ConvictionDoubling => "conviction_doubling",
            AlertKind::StealthAccumulation => "stealth_accumulation",
            AlertKind::PerfectExitTiming => "perfect_exit_timing",
            AlertKind::PreMovePositioning => "pre_move_positioning",
        }
    }

    /// Human label used by notifier sinks
    pub fn title(&self) -> &'static str {
        match self {
            AlertKind::HighWinRate => "High Win-Rate Trader",
            AlertKind::ContrarianWinner => "Proven Contrarian",
            AlertKind::MassiveTrade => "Massive Trade",
            AlertKind::ContrarianBet => "Contrarian Bet",
            AlertKind::ExtremeBet => "Extreme-Price Bet",
            AlertKind::NewWallet => "New Wallet",
            AlertKind::LowActivity => "Low-Activity Wallet",
            AlertKind::RapidTrading => "Rapid Trading",
            AlertKind::CopyTrader => "Copy Trader",
            AlertKind::HedgeRemoval => "Hedge Removed",
            AlertKind::HedgeRemovalLoser => "Hedge Removal Called It",
            AlertKind::AsymmetricExit => "Asymmetric Exits",
            AlertKind::ConvictionDoubling => "Conviction Doubling",
            AlertKind::StealthAccumulation => "Stealth Accumulation",
            AlertKind::PerfectExitTiming => "Perfect Exit Timing",
            AlertKind::PreMovePositioning => "Pre-Move Positioning",
        }
    }
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reason-specific numeric payload carried by an alert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AlertDetails {
    HighWinRate {
        win_rate: f64,
        resolved: u32,
    },
    ContrarianWinner {
        wins: u16,
        losses: u16,
        rate: f64,
    },
    MassiveTrade {
        notional: f64,
    },
    ContrarianBet {
        price: f64,
        notional: f64,
    },
    ExtremeBet {
        price: f64,
        notional: f64,
    },
    NewWallet {
        unique_markets: u32,
        notional: f64,
    },
    LowActivity {
        recent_trades: usize,
        unique_markets: u32,
        notional: f64,
    },
    RapidTrading {
        trades_in_window: usize,
        markets_in_window: usize,
        window_secs: i64,
    },
    CopyTrader {
        leader: String,
        copy_count: u32,
    },
    HedgeRemoval {
        sold_side: String,
        sold_size: f64,
        sold_price: f64,
        reduction: f64,
        yes_size_before: f64,
        no_size_before: f64,
        yes_size_after: f64,
        no_size_after: f64,
    },
    HedgeRemovalLoser {
        sold_side: String,
        winning_outcome: String,
        removed_at: DateTime<Utc>,
    },
    AsymmetricExit {
        winning_exits: u32,
        losing_exits: u32,
        avg_win_hold_secs: f64,
        avg_loss_hold_secs: f64,
        ratio: f64,
    },
    ConvictionDoubling {
        existing_size: f64,
        avg_price: f64,
        cur_price: f64,
        loss_pct: f64,
        added_size: f64,
        added_value: f64,
    },
    StealthAccumulation {
        trade_count: usize,
        total_size: f64,
        total_value: f64,
        avg_price: f64,
        spread_mins: f64,
    },
    PerfectExitTiming {
        verified_exits: u32,
        avg_score: f64,
        perfect_exits: u32,
    },
    PreMovePositioning {
        total_trades: u32,
        successful_moves: u32,
        alpha_score: f64,
        avg_move_size: f64,
    },
}

impl AlertDetails {
    pub fn kind(&self) -> AlertKind {
        match self {
            AlertDetails::HighWinRate { .. } => AlertKind::HighWinRate,
            AlertDetails::ContrarianWinner { .. } => AlertKind::ContrarianWinner,
            AlertDetails::MassiveTrade { .. } => AlertKind::MassiveTrade,
            AlertDetails::ContrarianBet { .. } => AlertKind::ContrarianBet,
            AlertDetails::ExtremeBet { .. } => AlertKind::ExtremeBet,
            AlertDetails::NewWallet { .. } => AlertKind::NewWallet,
            AlertDetails::LowActivity { .. } => AlertKind::LowActivity,
            AlertDetails::RapidTrading { .. } => AlertKind::RapidTrading,
            AlertDetails::CopyTrader { .. } => AlertKind::CopyTrader,
            AlertDetails::HedgeRemoval { .. } => AlertKind::HedgeRemoval,
            AlertDetails::HedgeRemovalLoser { .. } => AlertKind::HedgeRemovalLoser,
            AlertDetails::AsymmetricExit { .. } => AlertKind::AsymmetricExit,
            AlertDetails::ConvictionDoubling { .. } => AlertKind::ConvictionDoubling,
            AlertDetails::StealthAccumulation { .. } => AlertKind::StealthAccumulation,
            AlertDetails::PerfectExitTiming { .. } => AlertKind::PerfectExitTiming,
            AlertDetails::PreMovePositioning { .. } => AlertKind::PreMovePositioning,
        }
    }

    /// One-line summary of the payload for logs and plain-text sinks
    pub fn summary(&self) -> String {
        match self {
            AlertDetails::HighWinRate { win_rate, resolved } => {
                format!("{:.0}% win rate over {} resolved markets", win_rate * 100.0, resolved)
            }
            AlertDetails::ContrarianWinner { wins, losses, rate } => {
                format!("contrarian record {}W/{}L ({:.0}%)", wins, losses, rate * 100.0)
            }
            AlertDetails::MassiveTrade { notional } => format!("${:.0} single trade", notional),
            AlertDetails::ContrarianBet { price, notional } => {
                format!("${:.0} against consensus at {:.1}¢", notional, price * 100.0)
            }
            AlertDetails::ExtremeBet { price, notional } => {
                format!("${:.0} at extreme price {:.1}¢", notional, price * 100.0)
            }
            AlertDetails::NewWallet { unique_markets, notional } => {
                format!("${:.0} from a wallet with {} markets", notional, unique_markets)
            }
            AlertDetails::LowActivity { recent_trades, unique_markets, notional } => format!(
                "${:.0} from a quiet wallet ({} recent trades, {} markets)",
                notional, recent_trades, unique_markets
            ),
            AlertDetails::RapidTrading { trades_in_window, markets_in_window, window_secs } => format!(
                "{} trades across {} markets in {}s",
                trades_in_window, markets_in_window, window_secs
            ),
            AlertDetails::CopyTrader { leader, copy_count } => {
                format!("copied {} ({} copies)", leader, copy_count)
            }
            AlertDetails::HedgeRemoval { sold_side, reduction, .. } => {
                format!("sold {:.0}% of {} side of a hedge", reduction * 100.0, sold_side)
            }
            AlertDetails::HedgeRemovalLoser { sold_side, winning_outcome, .. } => {
                format!("dumped {} before {} won", sold_side, winning_outcome)
            }
            AlertDetails::AsymmetricExit { ratio, winning_exits, losing_exits, .. } => format!(
                "holds losers {:.1}x longer ({}W/{}L exits)",
                ratio, winning_exits, losing_exits
            ),
            AlertDetails::ConvictionDoubling { added_value, loss_pct, .. } => format!(
                "added ${:.0} while {:.0}% underwater",
                added_value,
                loss_pct * 100.0
            ),
            AlertDetails::StealthAccumulation { trade_count, total_value, spread_mins, .. } => format!(
                "{} small buys totalling ${:.0} over {:.0}m",
                trade_count, total_value, spread_mins
            ),
            AlertDetails::PerfectExitTiming { verified_exits, avg_score, .. } => format!(
                "avg exit timing {:.2} over {} exits",
                avg_score, verified_exits
            ),
            AlertDetails::PreMovePositioning { alpha_score, total_trades, .. } => format!(
                "{:.0}% of {} trades preceded a move",
                alpha_score * 100.0,
                total_trades
            ),
        }
    }
}

/// Trade context attached to alerts raised inline on a trade
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeSummary {
    pub side: TradeSide,
    pub outcome: String,
    pub size: f64,
    pub price: f64,
    pub notional: f64,
}

impl From<&TradeEvent> for TradeSummary {
    fn from(trade: &TradeEvent) -> Self {
        Self {
            side: trade.side,
            outcome: trade.outcome.clone(),
            size: trade.size,
            price: trade.price,
            notional: trade.notional(),
        }
    }
}

/// An alert as delivered to notifier sinks and the dashboard
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub wallet: String,
    pub wallet_url: String,
    pub market_id: String,
    pub market_title: String,
    pub market_url: String,
    pub timestamp: DateTime<Utc>,
    pub kind: AlertKind,
    pub trade: Option<TradeSummary>,
    pub details: AlertDetails,
}

impl Alert {
    /// Alert raised for a market without a triggering trade (delayed verification)
    pub fn for_market(
        wallet: &str,
        market_id: &str,
        market_title: &str,
        market_slug: &str,
        timestamp: DateTime<Utc>,
        details: AlertDetails,
    ) -> Self {
        let wallet = normalize_wallet(wallet);
        Self {
            wallet_url: format!("{}/{}", PROFILE_URL, wallet),
            wallet,
            market_id: market_id.to_string(),
            market_title: market_title.to_string(),
            market_url: market_url(market_slug),
            timestamp,
            kind: details.kind(),
            trade: None,
            details,
        }
    }

    /// Alert raised inline on a trade
    pub fn from_trade(trade: &TradeEvent, details: AlertDetails) -> Self {
        let mut alert = Self::for_market(
            &trade.wallet,
            &trade.market_id,
            &trade.market_title,
            &trade.market_slug,
            trade.timestamp,
            details,
        );
        alert.trade = Some(TradeSummary::from(trade));
        alert
    }

    pub fn short_title(&self, max_len: usize) -> String {
        if self.market_title.chars().count() <= max_len {
            self.market_title.clone()
        } else {
            let truncated: String = self.market_title.chars().take(max_len).collect();
            format!("{}...", truncated)
        }
    }
}

fn market_url(slug: &str) -> String {
    if slug.is_empty() {
        String::new()
    } else {
        format!("{}/{}", EVENT_URL, slug)
    }
}
