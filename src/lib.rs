//! Polymarket Sentinel Library
//!
//! Watches the Polymarket trade stream and raises alerts on wallet behavior:
//!
//! 1. **Inline rules**: win-rate, size, price and wallet-history checks run on
//!    every trade as it arrives.
//!
//! 2. **Stateful detectors**: copy trading, hedge removal, conviction adds,
//!    stealth accumulation, exit timing and pre-move positioning. Several of
//!    these re-check the venue later and alert only once the outcome is known.
//!
//! Alerts are de-duplicated, counted on a dashboard and fanned out to the
//! configured notifier sinks. Detector state survives restarts in a remote
//! blob store.

pub mod api;
pub mod config;
pub mod services;
pub mod storage;
pub mod types;
pub mod venue;
pub mod webhook;

pub use config::Config;
pub use services::{AlertEmitter, AlertSink, Runner, TradeDispatcher};
pub use storage::{BlobStorage, BlobStore, MemoryStore};
pub use types::{Alert, AlertDetails, AlertKind, TradeEvent, TradeSide};
pub use venue::{PolymarketClient, StaticVenue, VenueClient};
pub use webhook::{DiscordWebhook, TelegramNotifier};
