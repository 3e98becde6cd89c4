//! Discord and Telegram notifier sinks

use crate::services::alerts::AlertSink;
use crate::types::{Alert, AlertKind};
use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::info;

const TELEGRAM_API: &str = "https://api.telegram.org";

/// Embed colour per alert family
fn color(kind: AlertKind) -> u32 {
    match kind {
        AlertKind::HighWinRate | AlertKind::ContrarianWinner | AlertKind::CopyTrader => 0x00FF00,
        AlertKind::MassiveTrade | AlertKind::ExtremeBet | AlertKind::ContrarianBet => 0xFFA500,
        AlertKind::NewWallet | AlertKind::LowActivity | AlertKind::RapidTrading => 0x3498DB,
        AlertKind::HedgeRemoval | AlertKind::HedgeRemovalLoser | AlertKind::AsymmetricExit => 0xE74C3C,
        _ => 0x9B59B6,
    }
}

fn short_wallet(wallet: &str) -> String {
    match (wallet.get(..6), wallet.get(wallet.len().saturating_sub(4)..)) {
        (Some(head), Some(tail)) if wallet.len() > 10 => format!("{}...{}", head, tail),
        _ => wallet.to_string(),
    }
}

/// Discord embed payload for one alert
pub fn discord_payload(alert: &Alert) -> Value {
    let mut fields = vec![
        json!({
            "name": "Wallet",
            "value": format!("[{}]({})", short_wallet(&alert.wallet), alert.wallet_url),
            "inline": true
        }),
        json!({
            "name": "Signal",
            "value": alert.details.summary(),
            "inline": false
        }),
    ];
    if let Some(trade) = &alert.trade {
        fields.push(json!({
            "name": "Trade",
            "value": format!(
                "{} **{}** {:.0} @ {:.0}¢ (${:.0})",
                trade.side.as_str(),
                trade.outcome,
                trade.size,
                trade.price * 100.0,
                trade.notional
            ),
            "inline": true
        }));
    }

    let mut embed = json!({
        "title": alert.kind.title(),
        "description": alert.short_title(200),
        "color": color(alert.kind),
        "fields": fields,
        "footer": { "text": "Polymarket Sentinel" },
        "timestamp": alert.timestamp.to_rfc3339()
    });
    if !alert.market_url.is_empty() {
        embed["url"] = json!(alert.market_url);
    }
    json!({ "embeds": [embed] })
}

/// Plain-text Telegram message for one alert
pub fn telegram_text(alert: &Alert) -> String {
    let mut text = format!(
        "{}\n{}\nWallet: {}\n{}",
        alert.kind.title(),
        alert.short_title(120),
        alert.wallet,
        alert.details.summary()
    );
    if let Some(trade) = &alert.trade {
        text.push_str(&format!(
            "\n{} {} {:.0} @ {:.2} (${:.0})",
            trade.side.as_str(),
            trade.outcome,
            trade.size,
            trade.price,
            trade.notional
        ));
    }
    if !alert.market_url.is_empty() {
        text.push('\n');
        text.push_str(&alert.market_url);
    }
    text
}

/// Discord webhook sink
#[derive(Clone)]
pub struct DiscordWebhook {
    client: Client,
    webhook_url: String,
}

impl DiscordWebhook {
    pub fn new(webhook_url: String) -> Self {
        Self {
            client: Client::new(),
            webhook_url,
        }
    }
}

#[async_trait]
impl AlertSink for DiscordWebhook {
    fn name(&self) -> &str {
        "discord"
    }

    async fn send(&self, alert: &Alert) -> Result<()> {
        let response = self
            .client
            .post(&self.webhook_url)
            .json(&discord_payload(alert))
            .send()
            .await?;
        if !response.status().is_success() {
            anyhow::bail!("Discord webhook failed: {}", response.status());
        }
        info!("Discord alert sent: {} {}", alert.kind, alert.short_title(50));
        Ok(())
    }
}

/// Telegram bot sink
#[derive(Clone)]
pub struct TelegramNotifier {
    client: Client,
    bot_token: String,
    chat_id: String,
}

impl TelegramNotifier {
    pub fn new(bot_token: String, chat_id: String) -> Self {
        Self {
            client: Client::new(),
            bot_token,
            chat_id,
        }
    }
}

#[async_trait]
impl AlertSink for TelegramNotifier {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn send(&self, alert: &Alert) -> Result<()> {
        let url = format!("{}/bot{}/sendMessage", TELEGRAM_API, self.bot_token);
        let body = json!({
            "chat_id": self.chat_id,
            "text": telegram_text(alert),
            "disable_web_page_preview": true
        });
        let response = self.client.post(&url).json(&body).send().await?;
        if !response.status().is_success() {
            anyhow::bail!("Telegram send failed: {}", response.status());
        }
        info!("Telegram alert sent: {} {}", alert.kind, alert.short_title(50));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AlertDetails, TradeEvent, TradeSide};
    use chrono::Utc;

    fn alert() -> Alert {
        let trade = TradeEvent::new(
            "t1",
            "0x1111111111111111111111111111111111111111",
            "m1",
            "Yes",
            TradeSide::Buy,
            1000.0,
            0.42,
            Utc::now(),
        )
        .with_market("Will it rain?", "will-it-rain");
        Alert::from_trade(&trade, AlertDetails::MassiveTrade { notional: 420.0 })
    }

    #[test]
    fn test_discord_payload_shape() {
        let payload = discord_payload(&alert());
        let embed = &payload["embeds"][0];
        assert_eq!(embed["title"], "Massive Trade");
        assert_eq!(embed["description"], "Will it rain?");
        assert!(embed["url"].as_str().unwrap().ends_with("will-it-rain"));
        assert_eq!(embed["fields"].as_array().unwrap().len(), 3);
        assert!(embed["fields"][0]["value"].as_str().unwrap().contains("0x1111...1111"));
    }

    #[test]
    fn test_telegram_text_includes_trade_and_link() {
        let text = telegram_text(&alert());
        assert!(text.starts_with("Massive Trade\nWill it rain?"));
        assert!(text.contains("BUY Yes 1000 @ 0.42"));
        assert!(text.ends_with("will-it-rain"));
    }
}
