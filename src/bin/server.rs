//! Polymarket Sentinel Server
//!
//! Runs the alert pipeline with the read-only dashboard API.

use anyhow::Result;
use polymarket_sentinel::api::{create_app, AppState};
use polymarket_sentinel::services::Runner;
use polymarket_sentinel::Config;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Default to warn, info for this crate. Override with RUST_LOG.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,polymarket_sentinel=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let config = Config::from_env()?;
    let port = config.port;

    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║       POLYMARKET SENTINEL - SERVER                            ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Storage: {:<50} ║", if config.storage.is_enabled() { "GIST" } else { "DISABLED (state not persisted)" });
    println!("║  Trade Poller: {:<45} ║", if config.poller.enabled { "ENABLED" } else { "DISABLED" });
    println!("║  Discord Webhook: {:<42} ║", if config.notifier.discord_webhook_url.is_some() { "ENABLED" } else { "DISABLED" });
    println!("║  Telegram: {:<49} ║", if config.notifier.telegram_chat_id.is_some() { "ENABLED" } else { "DISABLED" });
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    info!("Starting alert pipeline...");
    let runner = Arc::new(Runner::from_config(config));
    runner.start().await?;

    #[cfg(unix)]
    {
        let reload_runner = runner.clone();
        tokio::spawn(async move {
            use tokio::signal::unix::{signal, SignalKind};
            let mut hangup = match signal(SignalKind::hangup()) {
                Ok(s) => s,
                Err(e) => {
                    warn!("SIGHUP handler unavailable: {}", e);
                    return;
                }
            };
            while hangup.recv().await.is_some() {
                info!("SIGHUP received, reloading config");
                if let Err(e) = reload_runner.settings().reload_from_env().await {
                    warn!("Config reload rejected: {}", e);
                }
            }
        });
    }

    let app = create_app(AppState::new(runner.clone()));

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;

    info!("Server listening on http://{}", addr);
    println!();
    println!("  Dashboard: http://localhost:{}/api/dashboard", port);
    println!("  WebSocket: ws://localhost:{}/ws", port);
    println!("  Health:    http://localhost:{}/health", port);
    println!();

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await?;

    runner.stop().await;
    Ok(())
}
