//! Polymarket Sentinel CLI
//!
//! Runs the alert pipeline in the foreground or inspects cached and persisted
//! wallet state.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use polymarket_sentinel::services::Runner;
use polymarket_sentinel::storage::{BlobStorage, MemoryStore};
use polymarket_sentinel::types::{normalize_wallet, Alert};
use polymarket_sentinel::Config;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "polymarket-sentinel")]
#[command(about = "Wallet behavior alerts for Polymarket")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline and print alerts until Ctrl-C
    Run {
        /// Keep detector state in memory only
        #[arg(long)]
        no_storage: bool,
    },

    /// Fetch and show everything known about one wallet
    Wallet {
        /// Wallet address (0x...)
        address: String,
    },

    /// Show the size of the persisted detector state
    State,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .init();

    let config = Config::from_env()?;

    match cli.command {
        Commands::Run { no_storage } => run(config, no_storage).await?,
        Commands::Wallet { address } => show_wallet(config, &address).await?,
        Commands::State => show_state(config).await?,
    }

    Ok(())
}

async fn run(config: Config, no_storage: bool) -> Result<()> {
    println!("\n{}", "=".repeat(70));
    println!("  POLYMARKET SENTINEL");
    println!(
        "  Storage: {} | Poller: {} | Discord: {} | Telegram: {}",
        on_off(config.storage.is_enabled() && !no_storage),
        on_off(config.poller.enabled),
        on_off(config.notifier.discord_webhook_url.is_some()),
        on_off(config.notifier.telegram_bot_token.is_some()),
    );
    println!("{}\n", "=".repeat(70));

    let runner = if no_storage {
        let storage = BlobStorage::new(Arc::new(MemoryStore::new()), "local", Default::default());
        Runner::with_storage(config, Arc::new(storage))
    } else {
        Runner::from_config(config)
    };

    let mut alerts = runner.subscribe_alerts();
    runner.start().await?;

    loop {
        tokio::select! {
            received = alerts.recv() => match received {
                Ok(alert) => print_alert(&alert),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    println!("{}", format!("  ... skipped {} alerts", n).dimmed());
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                break;
            }
        }
    }

    runner.stop().await;
    Ok(())
}

async fn show_wallet(config: Config, address: &str) -> Result<()> {
    let wallet = normalize_wallet(address);
    let runner = Runner::from_config(config);
    runner.contrarian().load().await.context("loading contrarian records")?;
    runner.hedge_tracker().load().await.context("loading hedge tracker state")?;
    runner.pattern_tracker().load().await.context("loading pattern tracker state")?;

    println!("\n{}", "=".repeat(70));
    println!("  WALLET {}", wallet.bold());
    println!("{}\n", "=".repeat(70));

    match runner.wallet_stats().get_stats(&wallet).await {
        Some(stats) => {
            let rate = stats
                .win_rate()
                .map(|r| format!("{:.1}%", r * 100.0))
                .unwrap_or_else(|| "n/a".to_string());
            println!(
                "  Resolved: {} ({}W / {}L) | Win rate: {} | Markets: {}",
                stats.resolved(),
                stats.wins,
                stats.losses,
                rate.green(),
                stats.unique_markets
            );
        }
        None => println!("  {}", "No activity found".yellow()),
    }

    let summary = runner.wallet_summary(&wallet).await;
    if let Some(c) = summary.contrarian {
        println!(
            "  Contrarian: {}W / {}L ({:.1}%)",
            c.wins,
            c.losses,
            c.rate() * 100.0
        );
    }
    if let Some(exits) = summary.asymmetric_exits {
        println!("  Exits: {}", serde_json::to_string(&exits)?);
    }
    if let Some(timing) = summary.exit_timing {
        println!("  Exit timing: {}", serde_json::to_string(&timing)?);
    }
    if let Some(moves) = summary.pre_move {
        println!("  Pre-move: {}", serde_json::to_string(&moves)?);
    }
    println!();
    Ok(())
}

async fn show_state(config: Config) -> Result<()> {
    if !config.storage.is_enabled() {
        println!("Storage is not configured (set GIST_ID)");
        return Ok(());
    }
    let runner = Runner::from_config(config);
    let contrarian = runner.contrarian().load().await.context("loading contrarian records")?;
    let hedge = runner.hedge_tracker().load().await.context("loading hedge tracker state")?;
    let pattern = runner.pattern_tracker().load().await.context("loading pattern tracker state")?;
    let (exits, moves, accumulations) = runner.pattern_tracker().counts().await;

    println!("\n{}", "=".repeat(70));
    println!("  PERSISTED STATE");
    println!("{}\n", "=".repeat(70));
    println!("  Contrarian wallets:      {}", contrarian);
    println!("  Hedge records:           {}", hedge);
    println!(
        "  Hedge pending events:    {}",
        runner.hedge_tracker().pending_event_count().await
    );
    println!("  Pattern records:         {}", pattern);
    println!("  Unverified exits:        {}", exits);
    println!("  Unverified pre-moves:    {}", moves);
    println!("  Accumulations:           {}", accumulations);
    println!();
    Ok(())
}

fn on_off(enabled: bool) -> &'static str {
    if enabled {
        "ON"
    } else {
        "OFF"
    }
}

fn print_alert(alert: &Alert) {
    println!(
        "{} {} {}",
        alert.timestamp.format("%H:%M:%S").to_string().dimmed(),
        format!("[{}]", alert.kind.title()).yellow().bold(),
        alert.short_title(60)
    );
    println!("    {} {}", alert.wallet.cyan(), alert.details.summary());
    if !alert.market_url.is_empty() {
        println!("    {}", alert.market_url.dimmed());
    }
}
